//! Capabilities the SSTable lifecycle code consumes but does not implement.
//!
//! The byte layout of SSTables lives behind [`SstableIo`]; the host table
//! supplies [`CompactionTable`], [`SstableCreator`] and [`SstableReplacer`].
//! An in-memory implementation lives in [`crate::mock`].

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::SstResult;
use crate::mutation::Partition;
use crate::ownership::ShardId;
use crate::sstable::{ForeignSstableOpenInfo, SharedSstable, Sstable, SstableMetadata};

/// Opaque I/O scheduling class passed through to readers and writers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IoPriority(String);

impl IoPriority {
    /// Creates a named priority class.
    pub fn new(class: impl Into<String>) -> Self {
        Self(class.into())
    }

    /// Name of the class.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl Default for IoPriority {
    fn default() -> Self {
        Self::new("compaction")
    }
}

/// Lazy stream of partitions from one SSTable, in key order.
pub trait PartitionReader: Send {
    /// Returns the next partition, or `None` at the end.
    fn next_partition(&mut self) -> impl Future<Output = SstResult<Option<Partition>>> + Send;
}

/// Writes partitions into a new SSTable.
pub trait SstableWriter: Send {
    /// Appends one partition; partitions arrive in key order.
    fn consume(&mut self, partition: &Partition) -> impl Future<Output = SstResult<()>> + Send;

    /// Bytes written so far.
    fn bytes_written(&self) -> u64;

    /// Seals the SSTable (TOC written last) and returns its metadata.
    fn finish(self, level: u32) -> impl Future<Output = SstResult<SstableMetadata>> + Send;

    /// Discards everything written; the SSTable never becomes complete.
    fn abort(self) -> impl Future<Output = ()> + Send;
}

/// Access to SSTable contents on storage.
pub trait SstableIo: Send + Sync + 'static {
    /// Reader type.
    type Reader: PartitionReader;
    /// Writer type.
    type Writer: SstableWriter;

    /// Reads the metadata components of an existing SSTable.
    fn load(
        &self,
        sst: &Sstable,
        priority: &IoPriority,
    ) -> impl Future<Output = SstResult<SstableMetadata>> + Send;

    /// Opens a reader over the data component.
    fn open_reader(
        &self,
        sst: &SharedSstable,
        priority: &IoPriority,
    ) -> impl Future<Output = SstResult<Self::Reader>> + Send;

    /// Opens a writer for a freshly created SSTable.
    fn open_writer(
        &self,
        sst: &SharedSstable,
        priority: &IoPriority,
    ) -> impl Future<Output = SstResult<Self::Writer>> + Send;
}

/// Creates handles for new SSTables, choosing generation and version.
pub trait SstableCreator: Send + Sync {
    /// Returns a handle for a new SSTable owned by `shard`.
    fn create(&self, shard: ShardId) -> SharedSstable;
}

impl<F> SstableCreator for F
where
    F: Fn(ShardId) -> SharedSstable + Send + Sync,
{
    fn create(&self, shard: ShardId) -> SharedSstable {
        self(shard)
    }
}

/// Publishes finished compaction output into the table's live set.
pub trait SstableReplacer: Send + Sync {
    /// Replaces `removed` by `added`; nothing is visible to reads before this succeeds.
    fn replace(&self, removed: &[SharedSstable], added: &[SharedSstable]) -> SstResult<()>;
}

impl<F> SstableReplacer for F
where
    F: Fn(&[SharedSstable], &[SharedSstable]) -> SstResult<()> + Send + Sync,
{
    fn replace(&self, removed: &[SharedSstable], added: &[SharedSstable]) -> SstResult<()> {
        self(removed, added)
    }
}

/// The table whose SSTables are being compacted.
pub trait CompactionTable: Send + Sync {
    /// Keyspace name.
    fn keyspace(&self) -> &str;

    /// Table name.
    fn name(&self) -> &str;

    /// Every SSTable currently live in the table.
    fn live_sstables(&self) -> Vec<SharedSstable>;

    /// Smallest timestamp still held in memory, if any.
    fn min_memtable_timestamp(&self) -> i64 {
        i64::MAX
    }
}

/// Hands resharded output to the shard that owns it.
pub trait OutputHandoff: Send + Sync {
    /// Delivers descriptors of sealed SSTables to `shard`. Success means the
    /// owner has them queued; the sender keeps its inputs until the owner
    /// has collected them.
    fn hand_off(
        &self,
        shard: ShardId,
        infos: Vec<ForeignSstableOpenInfo>,
    ) -> impl Future<Output = SstResult<()>> + Send;
}

/// Shared, type-erased creator.
pub type CreatorRef = Arc<dyn SstableCreator>;

/// Shared, type-erased replacer.
pub type ReplacerRef = Arc<dyn SstableReplacer>;
