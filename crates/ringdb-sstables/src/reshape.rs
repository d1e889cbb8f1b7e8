//! Reshaping: rewriting local SSTables that violate layout policy.
//!
//! Ownership never changes here. Each round asks [`reshaping_job`] for the
//! next set of offending SSTables, compacts them, and swaps the outputs in
//! at the position of the inputs.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::compaction::{
    compact_sstables, CompactionDescriptor, CompactionKind, CompactionStopHandle, PrettyDataSize,
};
use crate::component::SstableVersion;
use crate::directory::{DirectoryPhase, SstableDirectory};
use crate::error::SstResult;
use crate::io::{CompactionTable, CreatorRef, SstableIo};
use crate::sstable::{Generation, SharedSstable};

/// Which layout rule triggers a rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ReshapeMode {
    /// SSTables above the size limit are split.
    #[default]
    SplitOversized,
    /// SSTables older than the target version are rewritten.
    UpgradeFormat,
}

/// Reshape policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReshapeConfig {
    /// Trigger (default: split oversized).
    pub mode: ReshapeMode,
    /// Largest acceptable SSTable, also the output size limit (default: 1 GiB).
    pub max_sstable_bytes: u64,
    /// Version every SSTable should have (default: me).
    pub target_version: SstableVersion,
    /// Inputs per job (default: 32).
    pub max_sstables_per_job: usize,
}

impl Default for ReshapeConfig {
    fn default() -> Self {
        Self {
            mode: ReshapeMode::SplitOversized,
            max_sstable_bytes: 1024 * 1024 * 1024,
            target_version: SstableVersion::Me,
            max_sstables_per_job: 32,
        }
    }
}

/// One rewrite chosen by [`reshaping_job`].
#[derive(Debug, Clone)]
pub struct ReshapeJob {
    /// SSTables to rewrite.
    pub sstables: Vec<SharedSstable>,
    /// Level of the outputs.
    pub level: u32,
    /// Output size limit.
    pub max_sstable_bytes: u64,
    /// Compaction flavor.
    pub kind: CompactionKind,
}

/// Picks the next offending SSTables among `candidates`, keeping their order.
pub fn reshaping_job(candidates: &[SharedSstable], config: &ReshapeConfig) -> Option<ReshapeJob> {
    let (offending, kind): (Vec<SharedSstable>, CompactionKind) = match config.mode {
        ReshapeMode::SplitOversized => (
            candidates
                .iter()
                .filter(|s| s.data_size() > config.max_sstable_bytes)
                .take(config.max_sstables_per_job.max(1))
                .cloned()
                .collect(),
            CompactionKind::Reshape,
        ),
        ReshapeMode::UpgradeFormat => (
            candidates
                .iter()
                .filter(|s| s.version() < config.target_version)
                .take(config.max_sstables_per_job.max(1))
                .cloned()
                .collect(),
            CompactionKind::Upgrade,
        ),
    };
    if offending.is_empty() {
        return None;
    }
    let level = offending.iter().map(|s| s.level()).min().unwrap_or(0);
    Some(ReshapeJob {
        sstables: offending,
        level,
        max_sstable_bytes: config.max_sstable_bytes,
        kind,
    })
}

impl<Io: SstableIo> SstableDirectory<Io> {
    /// Rewrites local SSTables until none violates the policy and returns
    /// the input bytes rewritten. A stopped job ends the loop quietly; its
    /// outputs are discarded and its inputs kept.
    pub async fn reshape<T>(
        &mut self,
        table: &T,
        creator: CreatorRef,
        config: &ReshapeConfig,
        stop: &CompactionStopHandle,
    ) -> SstResult<u64>
    where
        T: CompactionTable + ?Sized,
    {
        self.expect_phase(
            &[DirectoryPhase::Classified, DirectoryPhase::Committed],
            "classified",
        )?;
        let mut produced: HashSet<Generation> = HashSet::new();
        let mut rewritten = 0u64;

        loop {
            let candidates: Vec<SharedSstable> = self
                .unshared_local
                .iter()
                .filter(|s| !produced.contains(&s.generation()))
                .cloned()
                .collect();
            let Some(job) = reshaping_job(&candidates, config) else {
                break;
            };

            let mut descriptor = CompactionDescriptor::new(job.sstables.clone(), creator.clone());
            descriptor.kind = job.kind;
            descriptor.level = job.level;
            descriptor.max_sstable_bytes = job.max_sstable_bytes;
            descriptor.stop = stop.clone();
            descriptor.shard_count = self.shard_count;
            descriptor.local_shard = self.shard;
            descriptor.priority = self.priority.clone();
            let record = compact_sstables(descriptor, table, &self.io).await?;

            if record.is_stop_requested() {
                for sst in &record.new_sstables {
                    sst.mark_for_deletion();
                }
                info!(shard = self.shard.as_u32(), "reshape stopped");
                break;
            }

            rewritten += record.start_size;
            produced.extend(record.new_sstables.iter().map(|s| s.generation()));
            self.replace_in_place(&job.sstables, record.new_sstables);
            for sst in &job.sstables {
                sst.mark_for_deletion();
            }
        }

        if rewritten > 0 {
            info!(
                shard = self.shard.as_u32(),
                dir = %self.dir.display(),
                "reshaped {} of sstable data",
                PrettyDataSize(rewritten)
            );
        }
        Ok(rewritten)
    }

    /// Swaps `removed` for `added` in the local set. The outputs take the
    /// position of the first input; unrelated entries keep their order.
    fn replace_in_place(&mut self, removed: &[SharedSstable], added: Vec<SharedSstable>) {
        let position = self
            .unshared_local
            .iter()
            .position(|s| removed.contains(s))
            .unwrap_or(self.unshared_local.len());
        let before = self.unshared_local[..position]
            .iter()
            .filter(|s| !removed.contains(s))
            .count();
        self.unshared_local.retain(|s| !removed.contains(s));
        debug!(removed = removed.len(), added = added.len(), "reshape replaced sstables");
        let tail = self.unshared_local.split_off(before);
        self.unshared_local.extend(added);
        self.unshared_local.extend(tail);
    }
}
