//! Shard ownership of tokens, generations and whole SSTables.
//!
//! Every shard owns one contiguous slice of the 64-bit token ring. A row
//! belongs to the shard whose slice contains the token of its partition key,
//! so an SSTable is owned by the set of shards its token range spans.
//! Generations are spread over shards with a modulo rule, which only decides
//! which shard inspects a file, never where its data finally lives.

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::sstable::Generation;

/// Position of a partition on the token ring.
pub type Token = u64;

/// Newtype wrapper around u32 representing a shard index.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ShardId(u32);

impl ShardId {
    /// Creates a new ShardId from a u32 value.
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the inner u32 value.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the shard as a vector index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "shard:{}", self.0)
    }
}

impl From<u32> for ShardId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Hashes a partition key onto the token ring.
pub fn token_for_key(key: &[u8]) -> Token {
    xxh3_64(key)
}

/// Returns the shard owning `token` when the ring is split into
/// `shard_count` equal contiguous slices.
pub fn shard_for_token(token: Token, shard_count: u32) -> ShardId {
    let count = shard_count.max(1) as u128;
    ShardId::new(((token as u128 * count) >> 64) as u32)
}

/// Returns the shard expected to inspect files of `generation`.
pub fn shard_for_generation(generation: Generation, shard_count: u32) -> ShardId {
    ShardId::new(generation.rem_euclid(shard_count.max(1) as i64) as u32)
}

/// Returns every shard whose slice intersects the token range, in order.
pub fn shards_spanned(range: &RangeInclusive<Token>, shard_count: u32) -> Vec<ShardId> {
    let first = shard_for_token(*range.start(), shard_count).as_u32();
    let last = shard_for_token(*range.end(), shard_count).as_u32();
    if first > last {
        return Vec::new();
    }
    (first..=last).map(ShardId::new).collect()
}

/// Where an SSTable belongs relative to the shard that inspected it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ownership {
    /// Owned by the inspecting shard only.
    UnsharedLocal,
    /// Owned by exactly one other shard.
    UnsharedRemote(ShardId),
    /// Data spans several shards and must be resharded.
    Shared,
}

/// Classifies an SSTable from the token range recorded in its sharding
/// metadata. `None` means the span is unknown, which is treated as shared
/// so data is never routed to a single, possibly wrong, shard.
pub fn classify(
    token_range: Option<&RangeInclusive<Token>>,
    shard_count: u32,
    local: ShardId,
) -> Ownership {
    let Some(range) = token_range else {
        return Ownership::Shared;
    };
    match shards_spanned(range, shard_count).as_slice() {
        [only] if *only == local => Ownership::UnsharedLocal,
        [only] => Ownership::UnsharedRemote(*only),
        _ => Ownership::Shared,
    }
}

/// Token ranges owned by this node, used by cleanup compaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedRanges {
    ranges: Vec<RangeInclusive<Token>>,
}

impl OwnedRanges {
    /// Creates the set from a list of inclusive ranges.
    pub fn new(ranges: Vec<RangeInclusive<Token>>) -> Self {
        Self { ranges }
    }

    /// Returns true if any range contains the token.
    pub fn contains(&self, token: Token) -> bool {
        self.ranges.iter().any(|r| r.contains(&token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_shard_owns_everything() {
        assert_eq!(shard_for_token(0, 1), ShardId::new(0));
        assert_eq!(shard_for_token(u64::MAX, 1), ShardId::new(0));
    }

    #[test]
    fn test_token_slices_are_contiguous() {
        let quarter = u64::MAX / 4;
        assert_eq!(shard_for_token(0, 4), ShardId::new(0));
        assert_eq!(shard_for_token(quarter + 1, 4), ShardId::new(1));
        assert_eq!(shard_for_token(u64::MAX, 4), ShardId::new(3));
    }

    #[test]
    fn test_zero_shards_treated_as_one() {
        assert_eq!(shard_for_token(12345, 0), ShardId::new(0));
        assert_eq!(shard_for_generation(9, 0), ShardId::new(0));
    }

    #[test]
    fn test_generation_modulo() {
        assert_eq!(shard_for_generation(7, 3), ShardId::new(1));
        assert_eq!(shard_for_generation(-1, 3), ShardId::new(2));
    }

    #[test]
    fn test_shards_spanned() {
        let half = u64::MAX / 2;
        let spanned = shards_spanned(&(10..=half + 10), 2);
        assert_eq!(spanned, vec![ShardId::new(0), ShardId::new(1)]);
        assert_eq!(shards_spanned(&(10..=20), 2), vec![ShardId::new(0)]);
    }

    #[test]
    fn test_classify_local_remote_shared() {
        let local = ShardId::new(0);
        let low = 0..=100;
        let high = (u64::MAX - 100)..=u64::MAX;
        let all = 0..=u64::MAX;
        assert_eq!(classify(Some(&low), 2, local), Ownership::UnsharedLocal);
        assert_eq!(
            classify(Some(&high), 2, local),
            Ownership::UnsharedRemote(ShardId::new(1))
        );
        assert_eq!(classify(Some(&all), 2, local), Ownership::Shared);
    }

    #[test]
    fn test_unknown_span_is_shared() {
        assert_eq!(classify(None, 4, ShardId::new(2)), Ownership::Shared);
    }

    #[test]
    fn test_owned_ranges() {
        let owned = OwnedRanges::new(vec![0..=10, 100..=200]);
        assert!(owned.contains(5));
        assert!(owned.contains(150));
        assert!(!owned.contains(50));
        assert!(!OwnedRanges::default().contains(0));
    }

    #[test]
    fn test_token_for_key_is_deterministic() {
        assert_eq!(token_for_key(b"alpha"), token_for_key(b"alpha"));
        assert_ne!(token_for_key(b"alpha"), token_for_key(b"beta"));
    }
}
