//! Expiry and tombstone purge rules.
//!
//! Data may only be dropped when nothing outside the compaction could still
//! be shadowed by it. Two checks implement that: whole SSTables are dropped
//! by [`fully_expired_sstables`] without being read, and single cells are
//! purged by [`PurgeRules`] while rows stream through compaction.

use std::collections::HashSet;

use crate::mutation::{Cell, Row};
use crate::sstable::SharedSstable;

/// Seconds since the epoch before which tombstones may be collected.
pub fn gc_before(compaction_time: i64, gc_grace_seconds: i64) -> i64 {
    compaction_time.saturating_sub(gc_grace_seconds)
}

/// Returns the compacting SSTables that can be dropped without rewriting.
///
/// An SSTable is fully expired iff its max local deletion time precedes
/// `gc_before` and its max timestamp is below the min timestamp of every
/// SSTable that stays around: those outside the compaction, the memtable,
/// and compacting SSTables that still hold unexpired data.
pub fn fully_expired_sstables(
    table_sstables: &[SharedSstable],
    compacting: &[SharedSstable],
    gc_before: i64,
    min_memtable_timestamp: i64,
) -> HashSet<SharedSstable> {
    let compacting_set: HashSet<&SharedSstable> = compacting.iter().collect();

    let mut min_timestamp = min_memtable_timestamp;
    for sst in table_sstables {
        if !compacting_set.contains(sst) {
            min_timestamp = min_timestamp.min(sst.min_timestamp());
        }
    }

    let mut candidates = Vec::new();
    for sst in compacting {
        if sst.max_local_deletion_time() < gc_before {
            candidates.push(sst);
        } else {
            min_timestamp = min_timestamp.min(sst.min_timestamp());
        }
    }

    candidates
        .into_iter()
        .filter(|sst| sst.max_timestamp() < min_timestamp)
        .cloned()
        .collect()
}

/// Smallest timestamp of data that stays outside the compaction; only
/// deletions older than this can be purged.
pub fn max_purgeable_timestamp(
    table_sstables: &[SharedSstable],
    compacting: &[SharedSstable],
    min_memtable_timestamp: i64,
) -> i64 {
    table_sstables
        .iter()
        .filter(|sst| !compacting.contains(sst))
        .map(|sst| sst.min_timestamp())
        .fold(min_memtable_timestamp, i64::min)
}

/// Per-cell purge decisions applied while compacting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgeRules {
    /// Current time in seconds.
    pub now: i64,
    /// Deletions older than this may be collected.
    pub gc_before: i64,
    /// Deletions must also be older than this timestamp.
    pub max_purgeable_timestamp: i64,
}

impl PurgeRules {
    /// Rules that never purge, used when rewriting data verbatim.
    pub fn retain_all(now: i64) -> Self {
        Self {
            now,
            gc_before: i64::MIN,
            max_purgeable_timestamp: i64::MIN,
        }
    }

    /// Returns the row to write, or `None` when it can be dropped. Expired
    /// cells that cannot be dropped yet turn into tombstones.
    pub fn apply(&self, row: Row) -> Option<Row> {
        let Some(ldt) = row.cell.local_deletion_time else {
            return Some(row);
        };
        if row.cell.is_live(self.now) {
            return Some(row);
        }
        if ldt < self.gc_before && row.cell.timestamp < self.max_purgeable_timestamp {
            return None;
        }
        if row.cell.is_tombstone() {
            return Some(row);
        }
        let tombstone = Cell::tombstone(row.cell.timestamp, ldt);
        Some(row.with_cell(tombstone))
    }
}
