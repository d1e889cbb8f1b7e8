//! Validation of partition streams read by compaction.
//!
//! Every partition read from an input passes through a [`StreamValidator`]
//! that checks key order and row checksums. What happens on a failure
//! depends on the [`ScrubMode`]: regular compactions always abort, scrub
//! may skip the damaged data or merely count it.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{SstError, SstResult};
use crate::mutation::{Partition, PartitionKey, Row};
use crate::sstable::Generation;

/// How scrub reacts to corrupted data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ScrubMode {
    /// Fail the compaction on the first invalid row or partition.
    #[default]
    Abort,
    /// Drop invalid rows and out-of-order partitions, keep the rest.
    Skip,
    /// Read everything, count problems and write nothing.
    Validate,
}

impl ScrubMode {
    /// Name used in logs and configuration.
    pub fn as_str(self) -> &'static str {
        match self {
            ScrubMode::Abort => "abort",
            ScrubMode::Skip => "skip",
            ScrubMode::Validate => "validate",
        }
    }
}

impl std::fmt::Display for ScrubMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters of data dropped by validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrubStats {
    /// Rows dropped because their checksum did not match.
    pub skipped_rows: u64,
    /// Partitions dropped because they broke key order.
    pub skipped_partitions: u64,
}

impl std::ops::AddAssign for ScrubStats {
    fn add_assign(&mut self, rhs: Self) {
        self.skipped_rows += rhs.skipped_rows;
        self.skipped_partitions += rhs.skipped_partitions;
    }
}

/// Checks one input's partitions as they are read.
#[derive(Debug)]
pub struct StreamValidator {
    generation: Generation,
    mode: ScrubMode,
    last_key: Option<PartitionKey>,
    stats: ScrubStats,
}

impl StreamValidator {
    /// Creates a validator for the input with the given generation.
    pub fn new(generation: Generation, mode: ScrubMode) -> Self {
        Self {
            generation,
            mode,
            last_key: None,
            stats: ScrubStats::default(),
        }
    }

    /// Returns the partition to feed into the merge, `None` if it was
    /// dropped, or an error in abort mode.
    pub fn check(&mut self, mut partition: Partition) -> SstResult<Option<Partition>> {
        if let Some(last) = &self.last_key {
            if partition.key <= *last {
                self.fail(format!(
                    "partition with token {} out of order after token {}",
                    partition.key.token, last.token
                ))?;
                self.stats.skipped_partitions += 1;
                return Ok(None);
            }
        }

        let bad = partition.rows.iter().filter(|r| !r.verify()).count();
        if bad > 0 {
            self.fail(format!(
                "{} rows with invalid checksum in partition with token {}",
                bad, partition.key.token
            ))?;
            partition.rows.retain(Row::verify);
            self.stats.skipped_rows += bad as u64;
        }

        self.last_key = Some(partition.key.clone());
        if partition.rows.is_empty() && bad > 0 {
            return Ok(None);
        }
        Ok(Some(partition))
    }

    /// Counters accumulated so far.
    pub fn stats(&self) -> ScrubStats {
        self.stats
    }

    fn fail(&self, reason: String) -> SstResult<()> {
        if self.mode == ScrubMode::Abort {
            return Err(SstError::Corrupted {
                generation: self.generation,
                reason,
            });
        }
        warn!(generation = self.generation, mode = %self.mode, "skipping invalid data: {}", reason);
        Ok(())
    }
}
