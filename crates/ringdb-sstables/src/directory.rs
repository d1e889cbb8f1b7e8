//! Per-shard SSTable directory manager.
//!
//! A [`SstableDirectory`] scans one table directory on behalf of one shard,
//! loads and validates the complete SSTables it is responsible for, and
//! sorts them into three disjoint sets: owned by this shard, owned by one
//! other shard, or shared by several. Foreign SSTables travel between shards
//! as [`ForeignSstableOpenInfo`] values and are loaded again by the receiver.
//!
//! Files found to be incomplete are only collected. They are deleted by
//! [`SstableDirectory::commit_directory_changes`] once every participating
//! shard has voted through [`SstableDirectory::prepare_commit`].

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::{stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::component::{ComponentType, SstableVersion};
use crate::error::{SstError, SstResult};
use crate::gate::OperationGuard;
use crate::io::{IoPriority, SstableIo};
use crate::ownership::{Ownership, ShardId};
use crate::reshard::ReshardedBatch;
use crate::scan::{MissingTocPolicy, Scanner};
use crate::sstable::{ForeignSstableOpenInfo, Generation, SharedSstable, Sstable};

/// Behavior of a directory manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// SSTables loaded concurrently (default: 16).
    pub load_parallelism: usize,
    /// Reaction to generations without TOC (default: remove).
    pub missing_toc: MissingTocPolicy,
    /// Reset the level of loaded SSTables to 0 (default: false).
    pub need_mutate_level: bool,
    /// Accept SSTables holding legacy counters (default: false).
    pub allow_legacy_counters: bool,
    /// Accept loading into a materialized view (default: false).
    pub allow_materialized_view: bool,
    /// The directory belongs to a materialized view (default: false).
    pub is_view: bool,
    /// Classify loaded SSTables by owner; otherwise keep them unsorted (default: true).
    pub sort_by_owner: bool,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            load_parallelism: 16,
            missing_toc: MissingTocPolicy::Remove,
            need_mutate_level: false,
            allow_legacy_counters: false,
            allow_materialized_view: false,
            is_view: false,
            sort_by_owner: true,
        }
    }
}

/// Lifecycle phase of a directory manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DirectoryPhase {
    /// Nothing done yet.
    Idle,
    /// Scanning and loading.
    Scanning,
    /// Local classification done, foreign SSTables being exchanged.
    Exchanging,
    /// Sets are final and safe to read.
    Classified,
    /// This shard voted to commit.
    CommitPending,
    /// Removals were applied.
    Committed,
    /// The coordinated commit was abandoned; removals are never applied.
    Aborted,
    /// An operation failed; this shard votes against committing.
    Failed,
}

impl DirectoryPhase {
    /// Name used in errors and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            DirectoryPhase::Idle => "idle",
            DirectoryPhase::Scanning => "scanning",
            DirectoryPhase::Exchanging => "exchanging",
            DirectoryPhase::Classified => "classified",
            DirectoryPhase::CommitPending => "commit-pending",
            DirectoryPhase::Committed => "committed",
            DirectoryPhase::Aborted => "aborted",
            DirectoryPhase::Failed => "failed",
        }
    }
}

impl std::fmt::Display for DirectoryPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of a directory manager's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    /// Shard owning the manager.
    pub shard: ShardId,
    /// Current phase.
    pub phase: DirectoryPhase,
    /// Generations owned by this shard only.
    pub unshared_local: Vec<Generation>,
    /// Generations owned by one other shard, per owner.
    pub unshared_remote: BTreeMap<ShardId, Vec<Generation>>,
    /// Generations spanning several shards.
    pub shared: Vec<Generation>,
    /// Loaded generations kept unsorted.
    pub unsorted: Vec<Generation>,
    /// Files awaiting a committed removal.
    pub files_for_removal: Vec<PathBuf>,
    /// Highest generation found.
    pub highest_generation_seen: Generation,
    /// Highest version found.
    pub highest_version_seen: SstableVersion,
}

/// Scans, classifies and cleans one table directory for one shard.
pub struct SstableDirectory<Io> {
    pub(crate) dir: PathBuf,
    pub(crate) shard: ShardId,
    pub(crate) shard_count: u32,
    pub(crate) config: DirectoryConfig,
    pub(crate) priority: IoPriority,
    pub(crate) io: Io,
    load_limit: Arc<Semaphore>,
    pub(crate) phase: DirectoryPhase,
    pub(crate) unshared_local: Vec<SharedSstable>,
    unshared_remote: BTreeMap<ShardId, Vec<ForeignSstableOpenInfo>>,
    pub(crate) shared: Vec<ForeignSstableOpenInfo>,
    unsorted: Vec<SharedSstable>,
    files_for_removal: BTreeSet<PathBuf>,
    max_generation_seen: Generation,
    max_version_seen: SstableVersion,
    keep_alive: Option<OperationGuard>,
    pub(crate) resharded: Vec<ReshardedBatch>,
}

impl<Io: SstableIo> SstableDirectory<Io> {
    /// Creates a manager for `dir` on `shard` out of `shard_count`.
    pub fn new(
        dir: impl Into<PathBuf>,
        shard: ShardId,
        shard_count: u32,
        config: DirectoryConfig,
        io: Io,
    ) -> Self {
        let load_limit = Arc::new(Semaphore::new(config.load_parallelism.max(1)));
        Self {
            dir: dir.into(),
            shard,
            shard_count: shard_count.max(1),
            config,
            priority: IoPriority::default(),
            io,
            load_limit,
            phase: DirectoryPhase::Idle,
            unshared_local: Vec::new(),
            unshared_remote: BTreeMap::new(),
            shared: Vec::new(),
            unsorted: Vec::new(),
            files_for_removal: BTreeSet::new(),
            max_generation_seen: 0,
            max_version_seen: SstableVersion::default(),
            keep_alive: None,
            resharded: Vec::new(),
        }
    }

    /// Shares a load limiter with other managers, bounding open files
    /// across all of them.
    pub fn with_load_limit(mut self, limit: Arc<Semaphore>) -> Self {
        self.load_limit = limit;
        self
    }

    /// Sets the I/O class used for loads.
    pub fn with_priority(mut self, priority: IoPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Directory being managed.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Shard owning this manager.
    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// Current phase.
    pub fn phase(&self) -> DirectoryPhase {
        self.phase
    }

    /// Storage backend.
    pub fn io(&self) -> &Io {
        &self.io
    }

    pub(crate) fn expect_phase(
        &self,
        allowed: &[DirectoryPhase],
        expected: &'static str,
    ) -> SstResult<()> {
        if allowed.contains(&self.phase) {
            return Ok(());
        }
        Err(SstError::InvalidPhase {
            expected,
            actual: self.phase.as_str(),
        })
    }

    pub(crate) fn track<T>(&mut self, result: SstResult<T>) -> SstResult<T> {
        if let Err(e) = &result {
            warn!(shard = self.shard.as_u32(), dir = %self.dir.display(), "directory operation failed: {}", e);
            self.phase = DirectoryPhase::Failed;
        }
        result
    }

    /// Scans the directory, loads every complete SSTable this shard is
    /// responsible for and classifies it. Removals are only collected.
    pub async fn process_sstable_dir(&mut self) -> SstResult<()> {
        self.expect_phase(
            &[
                DirectoryPhase::Idle,
                DirectoryPhase::Classified,
                DirectoryPhase::Committed,
                DirectoryPhase::Aborted,
                DirectoryPhase::Failed,
            ],
            "idle",
        )?;
        self.reset();
        self.phase = DirectoryPhase::Scanning;
        let result = self.do_process().await;
        self.track(result)?;
        self.phase = DirectoryPhase::Exchanging;
        Ok(())
    }

    fn reset(&mut self) {
        self.unshared_local.clear();
        self.unshared_remote.clear();
        self.shared.clear();
        self.unsorted.clear();
        self.files_for_removal.clear();
        self.max_generation_seen = 0;
        self.max_version_seen = SstableVersion::default();
    }

    async fn do_process(&mut self) -> SstResult<()> {
        let scanner = Scanner::new(&self.dir, self.shard, self.shard_count, self.config.missing_toc);
        let outcome = scanner.scan().await?;
        self.files_for_removal = outcome.files_for_removal;
        self.max_generation_seen = outcome.max_generation_seen;
        self.max_version_seen = outcome.max_version_seen;

        let sstables: Vec<SharedSstable> = outcome
            .descriptors
            .iter()
            .map(Sstable::from_descriptor)
            .collect();
        let loaded = self.load_all(sstables).await?;
        for sst in loaded {
            if self.config.sort_by_owner {
                self.sort_sstable(sst);
            } else {
                self.unsorted.push(sst);
            }
        }
        info!(
            shard = self.shard.as_u32(),
            dir = %self.dir.display(),
            local = self.unshared_local.len(),
            remote = self.unshared_remote.values().map(Vec::len).sum::<usize>(),
            shared = self.shared.len(),
            unsorted = self.unsorted.len(),
            removals = self.files_for_removal.len(),
            "sstable directory processed"
        );
        Ok(())
    }

    /// Loads metadata of `sstables` with bounded concurrency, then
    /// validates them. The result is ordered by generation.
    pub(crate) async fn load_all(&self, sstables: Vec<SharedSstable>) -> SstResult<Vec<SharedSstable>> {
        let io = &self.io;
        let priority = &self.priority;
        let limit = &self.load_limit;
        let mut loaded: Vec<SharedSstable> = stream::iter(sstables)
            .map(|sst| async move {
                let _permit = limit.acquire().await.map_err(|_| SstError::Closing)?;
                let metadata = io.load(&sst, priority).await?;
                sst.set_metadata(metadata);
                Ok::<_, SstError>(sst)
            })
            .buffer_unordered(self.config.load_parallelism.max(1))
            .try_collect()
            .await?;
        loaded.sort_by_key(|s| s.generation());

        for sst in &loaded {
            self.validate(sst)?;
            if self.config.need_mutate_level {
                sst.set_level(0);
            }
        }
        Ok(loaded)
    }

    /// Rejects SSTables this table must not load.
    pub fn validate(&self, sst: &Sstable) -> SstResult<()> {
        if sst.metadata().has_legacy_counters && !self.config.allow_legacy_counters {
            return Err(SstError::Validation {
                generation: sst.generation(),
                reason: "contains counters in a legacy format".to_string(),
            });
        }
        if self.config.is_view && !self.config.allow_materialized_view {
            return Err(SstError::Validation {
                generation: sst.generation(),
                reason: "loading sstables into a materialized view is not allowed".to_string(),
            });
        }
        Ok(())
    }

    /// Puts a loaded SSTable into the set matching its owners.
    pub fn sort_sstable(&mut self, sst: SharedSstable) {
        match sst.ownership(self.shard_count, self.shard) {
            Ownership::UnsharedLocal => {
                debug!(generation = sst.generation(), shard = self.shard.as_u32(), "sstable owned locally");
                self.unshared_local.push(sst);
            }
            Ownership::UnsharedRemote(owner) => {
                debug!(generation = sst.generation(), owner = owner.as_u32(), "sstable owned by another shard");
                self.unshared_remote
                    .entry(owner)
                    .or_default()
                    .push(sst.open_info());
            }
            Ownership::Shared => {
                debug!(generation = sst.generation(), "sstable shared by several shards");
                self.shared.push(sst.open_info());
            }
        }
    }

    /// SSTables loaded while sorting was disabled.
    pub fn unsorted_sstables(&self) -> &[SharedSstable] {
        &self.unsorted
    }

    /// Hands out descriptors of SSTables owned by other shards, per owner.
    pub fn take_remote_sstables(&mut self) -> SstResult<BTreeMap<ShardId, Vec<ForeignSstableOpenInfo>>> {
        self.expect_phase(&[DirectoryPhase::Exchanging], "exchanging")?;
        Ok(std::mem::take(&mut self.unshared_remote))
    }

    /// Loads SSTables another shard found to belong here. Nothing from the
    /// sender is trusted: metadata is loaded and validated again, and the
    /// ownership is recomputed. An SSTable this shard does not own fails the
    /// whole delivery.
    pub async fn load_foreign_sstables(&mut self, infos: Vec<ForeignSstableOpenInfo>) -> SstResult<()> {
        self.expect_phase(&[DirectoryPhase::Exchanging], "exchanging")?;
        let sstables = infos.iter().map(Sstable::from_open_info).collect();
        let result = self.load_all(sstables).await;
        let loaded = self.track(result)?;
        if let Some(sst) = loaded
            .iter()
            .find(|s| s.ownership(self.shard_count, self.shard) != Ownership::UnsharedLocal)
        {
            let err = SstError::Classification(format!(
                "foreign generation {} delivered to {} which does not own it",
                sst.generation(),
                self.shard
            ));
            return self.track(Err(err));
        }
        for sst in loaded {
            self.max_generation_seen = self.max_generation_seen.max(sst.generation());
            self.max_version_seen = self.max_version_seen.max(sst.version());
            self.unshared_local.push(sst);
        }
        Ok(())
    }

    /// Ends the exchange and checks that the sets are disjoint and that no
    /// SSTable is left waiting for another shard.
    pub fn finish_exchange(&mut self) -> SstResult<()> {
        self.expect_phase(&[DirectoryPhase::Exchanging], "exchanging")?;
        let result = self.verify_classification();
        self.track(result)?;
        self.phase = DirectoryPhase::Classified;
        Ok(())
    }

    /// Fails if one generation ended up in more than one set, or if the
    /// remote set was never handed out.
    pub fn verify_classification(&self) -> SstResult<()> {
        if let Some((owner, infos)) = self.unshared_remote.iter().find(|(_, infos)| !infos.is_empty()) {
            return Err(SstError::Classification(format!(
                "{} sstables owned by {} never left {} in {}",
                infos.len(),
                owner,
                self.shard,
                self.dir.display()
            )));
        }
        let mut seen = HashSet::new();
        let generations = self
            .unshared_local
            .iter()
            .chain(self.unsorted.iter())
            .map(|s| s.generation())
            .chain(self.unshared_remote.values().flatten().map(|i| i.generation))
            .chain(self.shared.iter().map(|i| i.generation));
        for generation in generations {
            if !seen.insert(generation) {
                return Err(SstError::Classification(format!(
                    "generation {} classified more than once in {}",
                    generation,
                    self.dir.display()
                )));
            }
        }
        Ok(())
    }

    /// SSTables owned by this shard only.
    pub fn unshared_local_sstables(&self) -> &[SharedSstable] {
        &self.unshared_local
    }

    /// Descriptors of SSTables owned by another shard, per owner.
    pub fn unshared_remote_sstables(&self) -> &BTreeMap<ShardId, Vec<ForeignSstableOpenInfo>> {
        &self.unshared_remote
    }

    /// Descriptors of SSTables spanning several shards.
    pub fn shared_sstables(&self) -> &[ForeignSstableOpenInfo] {
        &self.shared
    }

    /// Returns and clears the shared set.
    pub fn retrieve_shared_sstables(&mut self) -> Vec<ForeignSstableOpenInfo> {
        std::mem::take(&mut self.shared)
    }

    /// Runs `f` over every locally owned SSTable with the load concurrency.
    pub async fn do_for_each_sstable<F, Fut>(&self, f: F) -> SstResult<()>
    where
        F: Fn(SharedSstable) -> Fut,
        Fut: Future<Output = SstResult<()>>,
    {
        stream::iter(self.unshared_local.iter().cloned())
            .map(f)
            .buffer_unordered(self.config.load_parallelism.max(1))
            .try_collect::<()>()
            .await
    }

    /// Highest generation found, including interrupted ones that were kept.
    pub fn highest_generation_seen(&self) -> Generation {
        self.max_generation_seen
    }

    /// Highest version among complete SSTables.
    pub fn highest_version_seen(&self) -> SstableVersion {
        self.max_version_seen
    }

    /// Files a commit would delete.
    pub fn files_for_removal(&self) -> &BTreeSet<PathBuf> {
        &self.files_for_removal
    }

    /// Keeps `guard` alive as long as this manager.
    pub fn store_keep_alive(&mut self, guard: OperationGuard) {
        self.keep_alive = Some(guard);
    }

    /// Votes to commit. Fails unless classification finished cleanly.
    pub fn prepare_commit(&mut self) -> SstResult<()> {
        self.expect_phase(
            &[DirectoryPhase::Classified, DirectoryPhase::CommitPending],
            "classified",
        )?;
        self.phase = DirectoryPhase::CommitPending;
        Ok(())
    }

    /// Deletes the collected files. Safe to call again after success or
    /// after a partial failure.
    pub async fn commit_directory_changes(&mut self) -> SstResult<()> {
        match self.phase {
            DirectoryPhase::Committed => return Ok(()),
            DirectoryPhase::CommitPending => {}
            other => {
                return Err(SstError::InvalidPhase {
                    expected: DirectoryPhase::CommitPending.as_str(),
                    actual: other.as_str(),
                })
            }
        }

        remove_files(&self.files_for_removal).await?;
        self.files_for_removal.clear();
        self.phase = DirectoryPhase::Committed;
        info!(shard = self.shard.as_u32(), dir = %self.dir.display(), "directory changes committed");
        Ok(())
    }

    /// Abandons the commit; collected removals are dropped unapplied.
    pub fn abort(&mut self) {
        if self.phase == DirectoryPhase::Committed {
            return;
        }
        if !self.files_for_removal.is_empty() {
            info!(
                shard = self.shard.as_u32(),
                files = self.files_for_removal.len(),
                "commit aborted, removals not applied"
            );
        }
        self.files_for_removal.clear();
        self.phase = DirectoryPhase::Aborted;
    }

    /// Generations per set.
    pub fn snapshot(&self) -> DirectorySnapshot {
        DirectorySnapshot {
            shard: self.shard,
            phase: self.phase,
            unshared_local: self.unshared_local.iter().map(|s| s.generation()).collect(),
            unshared_remote: self
                .unshared_remote
                .iter()
                .map(|(shard, infos)| (*shard, infos.iter().map(|i| i.generation).collect()))
                .collect(),
            shared: self.shared.iter().map(|i| i.generation).collect(),
            unsorted: self.unsorted.iter().map(|s| s.generation()).collect(),
            files_for_removal: self.files_for_removal.iter().cloned().collect(),
            highest_generation_seen: self.max_generation_seen,
            highest_version_seen: self.max_version_seen,
        }
    }
}

/// Deletes component files, temporary TOCs last. Files already gone are
/// skipped, so an interrupted removal can simply be repeated.
pub async fn remove_files(files: &BTreeSet<PathBuf>) -> SstResult<()> {
    let mut paths: Vec<&PathBuf> = files.iter().collect();
    // A temporary TOC must outlive the rest of its generation.
    paths.sort_by_key(|p| is_temporary_toc(p));
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!(path = %path.display(), "removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(SstError::from_io(path, e)),
        }
    }
    Ok(())
}

fn is_temporary_toc(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(ComponentType::TemporaryToc.suffix()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::SstableFormat;
    use crate::gate::OperationGate;
    use crate::mock::MemoryIo;
    use crate::sstable::SstableMetadata;
    use std::ops::RangeInclusive;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const HALF: u64 = 1 << 63;

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"").unwrap();
    }

    fn add(io: &MemoryIo, dir: &Path, generation: i64, range: Option<RangeInclusive<u64>>) {
        touch(dir, &format!("me-{}-big-Data.db", generation));
        touch(dir, &format!("me-{}-big-TOC.txt", generation));
        let sst = Sstable::new(dir, generation, SstableVersion::Me, SstableFormat::Big);
        let metadata = SstableMetadata {
            data_size: 100,
            token_range: range,
            level: 3,
            ..SstableMetadata::default()
        };
        io.insert_with_metadata(&sst, Vec::new(), metadata);
    }

    fn directory(dir: &Path, io: MemoryIo, shard: u32, count: u32) -> SstableDirectory<MemoryIo> {
        SstableDirectory::new(dir, ShardId::new(shard), count, DirectoryConfig::default(), io)
    }

    #[tokio::test]
    async fn test_classifies_by_token_range() {
        let tmp = TempDir::new().unwrap();
        let io = MemoryIo::new();
        add(&io, tmp.path(), 2, Some(0..=10));
        add(&io, tmp.path(), 4, Some(HALF..=HALF + 10));
        add(&io, tmp.path(), 6, Some(10..=HALF + 10));
        add(&io, tmp.path(), 8, None);

        let mut dir = directory(tmp.path(), io, 0, 2);
        dir.process_sstable_dir().await.unwrap();
        let snap = dir.snapshot();
        assert_eq!(snap.unshared_local, vec![2]);
        assert_eq!(snap.unshared_remote.get(&ShardId::new(1)), Some(&vec![4]));
        assert_eq!(snap.shared, vec![6, 8]);
        assert_eq!(snap.highest_generation_seen, 8);
        assert!(matches!(dir.verify_classification(), Err(SstError::Classification(_))));

        let remote = dir.take_remote_sstables().unwrap();
        assert_eq!(remote[&ShardId::new(1)].len(), 1);
        dir.finish_exchange().unwrap();
        assert_eq!(dir.phase(), DirectoryPhase::Classified);
    }

    #[tokio::test]
    async fn test_finish_exchange_rejects_untaken_remote() {
        let tmp = TempDir::new().unwrap();
        let io = MemoryIo::new();
        add(&io, tmp.path(), 2, Some(HALF..=HALF + 10));

        let mut dir = directory(tmp.path(), io, 0, 2);
        dir.process_sstable_dir().await.unwrap();
        assert!(matches!(dir.finish_exchange(), Err(SstError::Classification(_))));
        assert_eq!(dir.phase(), DirectoryPhase::Failed);
        assert!(dir.prepare_commit().is_err());
    }

    #[tokio::test]
    async fn test_two_phase_removal() {
        let tmp = TempDir::new().unwrap();
        let io = MemoryIo::new();
        add(&io, tmp.path(), 1, Some(0..=10));
        touch(tmp.path(), "me-2-big-Data.db");
        touch(tmp.path(), "me-2-big-TOC.txt.tmp");
        touch(tmp.path(), "me-3-big-Index.db");

        let mut dir = directory(tmp.path(), io, 0, 1);
        dir.process_sstable_dir().await.unwrap();
        assert_eq!(dir.files_for_removal().len(), 3);
        assert!(tmp.path().join("me-2-big-Data.db").exists());

        assert!(dir.commit_directory_changes().await.is_err());
        dir.finish_exchange().unwrap();
        dir.prepare_commit().unwrap();
        dir.commit_directory_changes().await.unwrap();
        dir.commit_directory_changes().await.unwrap();

        assert!(!tmp.path().join("me-2-big-Data.db").exists());
        assert!(!tmp.path().join("me-2-big-TOC.txt.tmp").exists());
        assert!(!tmp.path().join("me-3-big-Index.db").exists());
        assert!(tmp.path().join("me-1-big-TOC.txt").exists());
        assert_eq!(dir.phase(), DirectoryPhase::Committed);
    }

    #[tokio::test]
    async fn test_abort_leaves_files() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "me-5-big-Data.db");
        let mut dir = directory(tmp.path(), MemoryIo::new(), 0, 1);
        dir.process_sstable_dir().await.unwrap();
        dir.abort();
        assert!(dir.files_for_removal().is_empty());
        assert!(dir.prepare_commit().is_err());
        assert!(tmp.path().join("me-5-big-Data.db").exists());
    }

    #[tokio::test]
    async fn test_load_failure_marks_failed() {
        let tmp = TempDir::new().unwrap();
        let io = MemoryIo::new();
        add(&io, tmp.path(), 1, Some(0..=10));
        io.fail_load(1);
        let mut dir = directory(tmp.path(), io, 0, 1);
        assert!(dir.process_sstable_dir().await.unwrap_err().is_storage_fault());
        assert_eq!(dir.phase(), DirectoryPhase::Failed);
        assert!(dir.prepare_commit().is_err());
    }

    #[tokio::test]
    async fn test_validation_rejects_legacy_counters() {
        let tmp = TempDir::new().unwrap();
        let io = MemoryIo::new();
        touch(tmp.path(), "me-1-big-TOC.txt");
        let sst = Sstable::new(tmp.path(), 1, SstableVersion::Me, SstableFormat::Big);
        let metadata = SstableMetadata {
            has_legacy_counters: true,
            ..SstableMetadata::default()
        };
        io.insert_with_metadata(&sst, Vec::new(), metadata);

        let mut dir = directory(tmp.path(), io.clone(), 0, 1);
        let err = dir.process_sstable_dir().await.unwrap_err();
        assert!(matches!(err, SstError::Validation { generation: 1, .. }));

        let config = DirectoryConfig {
            allow_legacy_counters: true,
            ..DirectoryConfig::default()
        };
        let mut lenient = SstableDirectory::new(tmp.path(), ShardId::new(0), 1, config, io);
        lenient.process_sstable_dir().await.unwrap();
    }

    #[tokio::test]
    async fn test_view_rejected_unless_allowed() {
        let tmp = TempDir::new().unwrap();
        let io = MemoryIo::new();
        add(&io, tmp.path(), 1, Some(0..=10));
        let config = DirectoryConfig {
            is_view: true,
            ..DirectoryConfig::default()
        };
        let mut dir = SstableDirectory::new(tmp.path(), ShardId::new(0), 1, config, io);
        assert!(dir.process_sstable_dir().await.is_err());
    }

    #[tokio::test]
    async fn test_unsorted_and_level_reset() {
        let tmp = TempDir::new().unwrap();
        let io = MemoryIo::new();
        add(&io, tmp.path(), 1, Some(0..=10));
        let config = DirectoryConfig {
            sort_by_owner: false,
            need_mutate_level: true,
            ..DirectoryConfig::default()
        };
        let mut dir = SstableDirectory::new(tmp.path(), ShardId::new(0), 1, config, io);
        dir.process_sstable_dir().await.unwrap();
        assert!(dir.unshared_local_sstables().is_empty());
        assert_eq!(dir.unsorted_sstables().len(), 1);
        let sst = Arc::clone(&dir.unsorted_sstables()[0]);
        assert_eq!(sst.level(), 0);
        dir.sort_sstable(sst);
        assert_eq!(dir.unshared_local_sstables().len(), 1);
    }

    #[tokio::test]
    async fn test_foreign_sstables_reloaded() {
        let tmp = TempDir::new().unwrap();
        let io = MemoryIo::new();
        add(&io, tmp.path(), 2, Some(HALF..=HALF + 5));

        let mut shard0 = directory(tmp.path(), io.clone(), 0, 2);
        shard0.process_sstable_dir().await.unwrap();
        let mut info = shard0.take_remote_sstables().unwrap()[&ShardId::new(1)][0].clone();
        info.data_size = 0;

        let mut shard1 = directory(tmp.path(), io.clone(), 1, 2);
        shard1.process_sstable_dir().await.unwrap();
        shard1.load_foreign_sstables(vec![info]).await.unwrap();
        let snap = shard1.snapshot();
        assert_eq!(snap.unshared_local, vec![2]);
        assert_eq!(shard1.unshared_local_sstables()[0].data_size(), 100);
        shard1.finish_exchange().unwrap();
    }

    #[tokio::test]
    async fn test_misrouted_foreign_sstable_rejected() {
        let tmp = TempDir::new().unwrap();
        let io = MemoryIo::new();
        add(&io, tmp.path(), 3, Some(HALF..=HALF + 5));
        let info = Sstable::new(tmp.path(), 3, SstableVersion::Me, SstableFormat::Big).open_info();

        let mut shard0 = directory(tmp.path(), io, 0, 2);
        shard0.process_sstable_dir().await.unwrap();
        let err = shard0.load_foreign_sstables(vec![info]).await.unwrap_err();
        assert!(matches!(err, SstError::Classification(_)));
        assert_eq!(shard0.phase(), DirectoryPhase::Failed);
        assert!(shard0.unshared_local_sstables().is_empty());
        assert!(shard0.finish_exchange().is_err());
    }

    #[tokio::test]
    async fn test_rescan_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let io = MemoryIo::new();
        add(&io, tmp.path(), 1, Some(0..=10));
        add(&io, tmp.path(), 2, None);
        touch(tmp.path(), "me-7-big-Data.db");

        let mut dir = directory(tmp.path(), io, 0, 1);
        dir.process_sstable_dir().await.unwrap();
        dir.finish_exchange().unwrap();
        let first = dir.snapshot();
        dir.process_sstable_dir().await.unwrap();
        dir.finish_exchange().unwrap();
        assert_eq!(dir.snapshot(), first);
    }

    #[tokio::test]
    async fn test_duplicate_generation_detected() {
        let tmp = TempDir::new().unwrap();
        let io = MemoryIo::new();
        add(&io, tmp.path(), 1, Some(0..=10));
        let mut dir = directory(tmp.path(), io, 0, 1);
        dir.process_sstable_dir().await.unwrap();
        let dup = Arc::clone(&dir.unshared_local_sstables()[0]);
        dir.unshared_local.push(dup);
        assert!(matches!(dir.finish_exchange(), Err(SstError::Classification(_))));
    }

    #[tokio::test]
    async fn test_for_each_and_keep_alive() {
        let tmp = TempDir::new().unwrap();
        let io = MemoryIo::new();
        for generation in 1..=5 {
            add(&io, tmp.path(), generation, Some(0..=10));
        }
        let gate = OperationGate::new();
        let mut dir = directory(tmp.path(), io, 0, 1);
        dir.store_keep_alive(gate.enter().unwrap());
        dir.process_sstable_dir().await.unwrap();

        let visited = Arc::new(AtomicUsize::new(0));
        dir.do_for_each_sstable(|_sst| {
            let visited = Arc::clone(&visited);
            async move {
                visited.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();
        assert_eq!(visited.load(Ordering::SeqCst), 5);

        let closer = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.close().await })
        };
        tokio::task::yield_now().await;
        assert!(!closer.is_finished());
        drop(dir);
        closer.await.unwrap();
    }
}
