//! In-memory SSTable storage and table view for tests and tooling.
//!
//! [`MemoryIo`] keeps SSTable contents in a map shared by every handle
//! obtained through [`MemoryIo::fork`], mirroring one disk seen by several
//! shards. When an SSTable's directory exists on the real filesystem the
//! writer also maintains its TOC and Data files there, so directory scans
//! see the same lifecycle a real writer produces.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::component::ComponentType;
use crate::error::{SstError, SstResult};
use crate::io::{
    CompactionTable, IoPriority, PartitionReader, SstableIo, SstableReplacer, SstableWriter,
};
use crate::mutation::Partition;
use crate::sstable::{Generation, MetadataCollector, SharedSstable, Sstable, SstableMetadata};

type StoreKey = (PathBuf, Generation);

#[derive(Debug, Clone)]
struct StoredSstable {
    partitions: Arc<Vec<Partition>>,
    metadata: SstableMetadata,
}

/// Callback invoked with the running count of partitions written.
pub type WriteHook = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Default)]
struct Faults {
    load: HashSet<Generation>,
    read: HashSet<Generation>,
    write_after: Option<u64>,
    write_hook: Option<WriteHook>,
}

/// In-memory implementation of [`SstableIo`].
#[derive(Clone, Default)]
pub struct MemoryIo {
    store: Arc<Mutex<HashMap<StoreKey, StoredSstable>>>,
    faults: Arc<Mutex<Faults>>,
    written: Arc<AtomicU64>,
}

impl MemoryIo {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a handle on the same store with its own fault settings.
    pub fn fork(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            faults: Arc::new(Mutex::new(Faults::default())),
            written: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Stores partitions as a complete SSTable with computed metadata.
    pub fn insert(&self, sst: &SharedSstable, partitions: Vec<Partition>, level: u32) -> SstableMetadata {
        let mut collector = MetadataCollector::new();
        for p in &partitions {
            collector.observe(p);
        }
        let metadata = collector.finish(level);
        self.insert_with_metadata(sst, partitions, metadata.clone());
        metadata
    }

    /// Stores partitions with caller-provided metadata.
    pub fn insert_with_metadata(
        &self,
        sst: &SharedSstable,
        partitions: Vec<Partition>,
        metadata: SstableMetadata,
    ) {
        sst.set_metadata(metadata.clone());
        self.store.lock().insert(
            key_of(sst),
            StoredSstable {
                partitions: Arc::new(partitions),
                metadata,
            },
        );
    }

    /// Returns the stored partitions of an SSTable.
    pub fn partitions(&self, sst: &Sstable) -> Option<Vec<Partition>> {
        self.store
            .lock()
            .get(&key_of(sst))
            .map(|s| s.partitions.as_ref().clone())
    }

    /// Damages one row's value without refreshing its checksum.
    pub fn corrupt_row(&self, sst: &Sstable, partition: usize, row: usize) -> bool {
        let mut store = self.store.lock();
        let Some(stored) = store.get_mut(&key_of(sst)) else {
            return false;
        };
        let partitions = Arc::make_mut(&mut stored.partitions);
        let Some(target) = partitions.get_mut(partition).and_then(|p| p.rows.get_mut(row)) else {
            return false;
        };
        let value = target.cell.value.get_or_insert_with(Vec::new);
        value.push(0xFF);
        true
    }

    /// Makes metadata loads of `generation` fail.
    pub fn fail_load(&self, generation: Generation) {
        self.faults.lock().load.insert(generation);
    }

    /// Makes reads of `generation` fail.
    pub fn fail_read(&self, generation: Generation) {
        self.faults.lock().read.insert(generation);
    }

    /// Makes writes fail once `partitions` partitions were written through this handle.
    pub fn fail_write_after(&self, partitions: u64) {
        self.faults.lock().write_after = Some(partitions);
    }

    /// Clears every injected fault.
    pub fn clear_faults(&self) {
        let mut faults = self.faults.lock();
        faults.load.clear();
        faults.read.clear();
        faults.write_after = None;
    }

    /// Registers a callback run after each partition written.
    pub fn on_partition_written(&self, hook: WriteHook) {
        self.faults.lock().write_hook = Some(hook);
    }
}

fn key_of(sst: &Sstable) -> StoreKey {
    (sst.dir().to_path_buf(), sst.generation())
}

fn io_fault(what: &str, generation: Generation) -> SstError {
    SstError::Io(std::io::Error::other(format!(
        "injected {} failure for generation {}",
        what, generation
    )))
}

impl SstableIo for MemoryIo {
    type Reader = MemoryReader;
    type Writer = MemoryWriter;

    async fn load(&self, sst: &Sstable, _priority: &IoPriority) -> SstResult<SstableMetadata> {
        if self.faults.lock().load.contains(&sst.generation()) {
            return Err(io_fault("load", sst.generation()));
        }
        self.store
            .lock()
            .get(&key_of(sst))
            .map(|s| s.metadata.clone())
            .ok_or_else(|| {
                SstError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no sstable with generation {}", sst.generation()),
                ))
            })
    }

    async fn open_reader(&self, sst: &SharedSstable, _priority: &IoPriority) -> SstResult<MemoryReader> {
        let fail = self.faults.lock().read.contains(&sst.generation());
        let partitions = self
            .store
            .lock()
            .get(&key_of(sst))
            .map(|s| Arc::clone(&s.partitions))
            .ok_or_else(|| io_fault("open", sst.generation()))?;
        Ok(MemoryReader {
            generation: sst.generation(),
            partitions,
            pos: 0,
            fail,
        })
    }

    async fn open_writer(&self, sst: &SharedSstable, _priority: &IoPriority) -> SstResult<MemoryWriter> {
        let on_disk = sst.dir().is_dir();
        if on_disk {
            let temp_toc = sst.component_path(ComponentType::TemporaryToc);
            tokio::fs::write(&temp_toc, b"")
                .await
                .map_err(|e| SstError::from_io(&temp_toc, e))?;
        }
        Ok(MemoryWriter {
            io: self.clone(),
            sst: Arc::clone(sst),
            partitions: Vec::new(),
            collector: MetadataCollector::new(),
            on_disk,
        })
    }
}

/// Reader over stored partitions.
pub struct MemoryReader {
    generation: Generation,
    partitions: Arc<Vec<Partition>>,
    pos: usize,
    fail: bool,
}

impl PartitionReader for MemoryReader {
    async fn next_partition(&mut self) -> SstResult<Option<Partition>> {
        if self.fail && self.pos > 0 {
            return Err(io_fault("read", self.generation));
        }
        let next = self.partitions.get(self.pos).cloned();
        self.pos += 1;
        Ok(next)
    }
}

/// Writer buffering partitions until sealed.
pub struct MemoryWriter {
    io: MemoryIo,
    sst: SharedSstable,
    partitions: Vec<Partition>,
    collector: MetadataCollector,
    on_disk: bool,
}

impl SstableWriter for MemoryWriter {
    async fn consume(&mut self, partition: &Partition) -> SstResult<()> {
        let written = self.io.written.load(Ordering::Acquire);
        let (limit, hook) = {
            let faults = self.io.faults.lock();
            (faults.write_after, faults.write_hook.clone())
        };
        if limit.is_some_and(|limit| written >= limit) {
            return Err(io_fault("write", self.sst.generation()));
        }
        self.collector.observe(partition);
        self.partitions.push(partition.clone());
        let count = self.io.written.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(hook) = hook {
            hook(count);
        }
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.collector.data_size()
    }

    async fn finish(self, level: u32) -> SstResult<SstableMetadata> {
        let metadata = self.collector.finish(level);
        if self.on_disk {
            let data = self.sst.component_path(ComponentType::Data);
            tokio::fs::write(&data, b"")
                .await
                .map_err(|e| SstError::from_io(&data, e))?;
            let temp_toc = self.sst.component_path(ComponentType::TemporaryToc);
            let toc = self.sst.toc_path();
            tokio::fs::rename(&temp_toc, &toc)
                .await
                .map_err(|e| SstError::from_io(&toc, e))?;
        }
        debug!(
            generation = self.sst.generation(),
            partitions = metadata.partitions,
            "memory sstable sealed"
        );
        self.io
            .insert_with_metadata(&self.sst, self.partitions, metadata.clone());
        Ok(metadata)
    }

    async fn abort(self) {
        if self.on_disk {
            let _ = tokio::fs::remove_file(self.sst.component_path(ComponentType::TemporaryToc)).await;
        }
    }
}

/// A table's live SSTable set held in memory.
pub struct MemoryTable {
    keyspace: String,
    name: String,
    sstables: Mutex<Vec<SharedSstable>>,
    min_memtable_timestamp: AtomicI64,
}

impl MemoryTable {
    /// Creates an empty table.
    pub fn new(keyspace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            name: name.into(),
            sstables: Mutex::new(Vec::new()),
            min_memtable_timestamp: AtomicI64::new(i64::MAX),
        }
    }

    /// Adds an SSTable to the live set.
    pub fn add(&self, sst: SharedSstable) {
        self.sstables.lock().push(sst);
    }

    /// Pretends the memtable holds data written at `timestamp`.
    pub fn set_min_memtable_timestamp(&self, timestamp: i64) {
        self.min_memtable_timestamp.store(timestamp, Ordering::Release);
    }
}

impl CompactionTable for MemoryTable {
    fn keyspace(&self) -> &str {
        &self.keyspace
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn live_sstables(&self) -> Vec<SharedSstable> {
        self.sstables.lock().clone()
    }

    fn min_memtable_timestamp(&self) -> i64 {
        self.min_memtable_timestamp.load(Ordering::Acquire)
    }
}

impl SstableReplacer for MemoryTable {
    fn replace(&self, removed: &[SharedSstable], added: &[SharedSstable]) -> SstResult<()> {
        let mut live = self.sstables.lock();
        live.retain(|s| !removed.contains(s));
        live.extend(added.iter().cloned());
        for sst in removed {
            sst.mark_for_deletion();
        }
        Ok(())
    }
}
