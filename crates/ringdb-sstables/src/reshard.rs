//! Resharding: splitting shared SSTables by owning shard.

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::compaction::{compact_sstables, CompactionConfig, CompactionDescriptor, CompactionKind};
use crate::directory::{DirectoryPhase, SstableDirectory};
use crate::error::{SstError, SstResult};
use crate::io::{CompactionTable, CreatorRef, OutputHandoff, SstableIo};
use crate::ownership::{Ownership, ShardId};
use crate::sstable::{ForeignSstableOpenInfo, SharedSstable, Sstable};

/// Splits `infos` into batches of `n / ceil(n / max_per_job)` inputs, in
/// order; the last batch may be shorter.
pub fn reshard_batches(
    infos: Vec<ForeignSstableOpenInfo>,
    max_per_job: usize,
) -> Vec<Vec<ForeignSstableOpenInfo>> {
    if infos.is_empty() {
        return Vec::new();
    }
    let max_per_job = max_per_job.max(1);
    let num_jobs = infos.len().div_ceil(max_per_job);
    let per_job = (infos.len() / num_jobs).max(1);

    let mut batches: Vec<Vec<ForeignSstableOpenInfo>> = Vec::new();
    let mut current = Vec::with_capacity(per_job);
    for info in infos {
        current.push(info);
        if current.len() >= per_job {
            batches.push(std::mem::replace(&mut current, Vec::with_capacity(per_job)));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// A resharded batch whose inputs stay live until every handed-off output
/// is known to be collected by its owner.
pub(crate) struct ReshardedBatch {
    infos: Vec<ForeignSstableOpenInfo>,
    inputs: Vec<SharedSstable>,
    local: Vec<SharedSstable>,
}

impl<Io: SstableIo> SstableDirectory<Io> {
    /// Reshards the shared set in batches.
    ///
    /// Each batch is compacted into per-shard outputs, and outputs owned
    /// elsewhere are handed to their owners. Finished batches stay pending
    /// until [`complete_reshard`](Self::complete_reshard) retires their
    /// inputs or [`rollback_reshard`](Self::rollback_reshard) returns them
    /// to the shared set. When a batch fails, it and every later batch go
    /// back to the shared set right away; earlier batches stay pending.
    pub async fn reshard<T, H>(
        &mut self,
        table: &T,
        creator: CreatorRef,
        handoff: &H,
        config: &CompactionConfig,
    ) -> SstResult<()>
    where
        T: CompactionTable + ?Sized,
        H: OutputHandoff,
    {
        self.expect_phase(
            &[DirectoryPhase::Classified, DirectoryPhase::Committed],
            "classified",
        )?;
        if !self.resharded.is_empty() {
            return Err(SstError::InvalidPhase {
                expected: "classified",
                actual: "reshard pending",
            });
        }
        let shared = self.retrieve_shared_sstables();
        if shared.is_empty() {
            return Ok(());
        }
        let batches = reshard_batches(shared, config.max_sstables_per_reshard_job);
        let total = batches.len();
        info!(
            shard = self.shard.as_u32(),
            batches = total,
            "resharding shared sstables"
        );

        let mut remaining = batches.into_iter();
        while let Some(batch) = remaining.next() {
            match self.reshard_batch(batch.clone(), table, &creator, handoff, config).await {
                Ok(done) => self.resharded.push(done),
                Err(e) => {
                    warn!(
                        shard = self.shard.as_u32(),
                        completed = self.resharded.len(),
                        total,
                        "reshard batch failed, remaining inputs stay shared: {}",
                        e
                    );
                    self.shared.extend(batch);
                    self.shared.extend(remaining.flatten());
                    return Err(e);
                }
            }
        }
        info!(shard = self.shard.as_u32(), batches = total, "resharding batches handed off");
        Ok(())
    }

    /// Number of resharded batches awaiting completion or rollback.
    pub fn pending_reshard_batches(&self) -> usize {
        self.resharded.len()
    }

    /// Retires the inputs of every pending batch once their owners hold
    /// the outputs; local outputs join the local set.
    pub fn complete_reshard(&mut self) {
        let batches = std::mem::take(&mut self.resharded);
        if batches.is_empty() {
            return;
        }
        info!(shard = self.shard.as_u32(), batches = batches.len(), "resharding finished");
        for batch in batches {
            discard(&batch.inputs);
            self.unshared_local.extend(batch.local);
        }
    }

    /// Undoes every pending batch: local outputs are discarded and the
    /// inputs go back to the shared set, ahead of what is already there.
    /// Outputs an owner failed to collect are discarded by that owner.
    pub fn rollback_reshard(&mut self) {
        let batches = std::mem::take(&mut self.resharded);
        if batches.is_empty() {
            return;
        }
        warn!(
            shard = self.shard.as_u32(),
            batches = batches.len(),
            "resharded output not collected, inputs stay shared"
        );
        let mut restored = Vec::new();
        for batch in batches {
            discard(&batch.local);
            restored.extend(batch.infos);
        }
        restored.append(&mut self.shared);
        self.shared = restored;
    }

    /// Takes over SSTables another shard resharded for this one. They are
    /// loaded and checked again; nothing is accepted unless every SSTable
    /// is owned here, and a rejected delivery is discarded.
    pub async fn collect_resharded_sstables(&mut self, infos: Vec<ForeignSstableOpenInfo>) -> SstResult<()> {
        let sstables: Vec<SharedSstable> = infos.iter().map(Sstable::from_open_info).collect();
        let result = self.accept_resharded(sstables.clone()).await;
        if result.is_err() {
            discard(&sstables);
        }
        result
    }

    async fn accept_resharded(&mut self, sstables: Vec<SharedSstable>) -> SstResult<()> {
        self.expect_phase(
            &[DirectoryPhase::Classified, DirectoryPhase::Committed],
            "classified",
        )?;
        let loaded = self.load_all(sstables).await?;
        for sst in &loaded {
            if sst.ownership(self.shard_count, self.shard) != Ownership::UnsharedLocal {
                return Err(SstError::Classification(format!(
                    "resharded generation {} handed to {} which does not own it",
                    sst.generation(),
                    self.shard
                )));
            }
        }
        info!(shard = self.shard.as_u32(), count = loaded.len(), "collected resharded sstables");
        self.unshared_local.extend(loaded);
        Ok(())
    }

    async fn reshard_batch<T, H>(
        &mut self,
        batch: Vec<ForeignSstableOpenInfo>,
        table: &T,
        creator: &CreatorRef,
        handoff: &H,
        config: &CompactionConfig,
    ) -> SstResult<ReshardedBatch>
    where
        T: CompactionTable + ?Sized,
        H: OutputHandoff,
    {
        let inputs: Vec<SharedSstable> = batch.iter().map(Sstable::from_open_info).collect();
        let inputs = self.load_all(inputs).await?;

        let mut descriptor = CompactionDescriptor::new(inputs.clone(), creator.clone()).with_config(config);
        descriptor.kind = CompactionKind::Reshard;
        descriptor.shard_count = self.shard_count;
        descriptor.local_shard = self.shard;
        descriptor.priority = self.priority.clone();
        descriptor.level = inputs.iter().map(|s| s.level()).max().unwrap_or(0);
        let record = compact_sstables(descriptor, table, &self.io).await?;

        let mut local = Vec::new();
        let mut remote: BTreeMap<ShardId, Vec<SharedSstable>> = BTreeMap::new();
        for sst in &record.new_sstables {
            match sst.ownership(self.shard_count, self.shard) {
                Ownership::UnsharedLocal => local.push(sst.clone()),
                Ownership::UnsharedRemote(owner) => remote.entry(owner).or_default().push(sst.clone()),
                Ownership::Shared => {
                    discard(&record.new_sstables);
                    return Err(SstError::Classification(format!(
                        "reshard output generation {} spans several shards",
                        sst.generation()
                    )));
                }
            }
        }

        let pending: Vec<(ShardId, Vec<SharedSstable>)> = remote.into_iter().collect();
        for (idx, (owner, outputs)) in pending.iter().enumerate() {
            let infos = outputs.iter().map(|s| s.open_info()).collect();
            if let Err(e) = handoff.hand_off(*owner, infos).await {
                discard(&local);
                for (_, unsent) in &pending[idx..] {
                    discard(unsent);
                }
                return Err(e);
            }
        }

        Ok(ReshardedBatch {
            infos: batch,
            inputs,
            local,
        })
    }
}

fn discard(sstables: &[SharedSstable]) {
    for sst in sstables {
        sst.mark_for_deletion();
    }
}
