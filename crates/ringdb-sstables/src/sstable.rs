//! Shared SSTable handles and their metadata.
//!
//! An [`Sstable`] is a handle to one component family on disk. Handles are
//! shared as [`SharedSstable`]; the files are only unlinked once the handle
//! was explicitly marked for deletion and the last reference is dropped.

use std::hash::{Hash, Hasher};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::component::{ComponentType, EntryDescriptor, SstableFormat, SstableVersion};
use crate::error::{SstError, SstResult};
use crate::mutation::Partition;
use crate::ownership::{classify, Ownership, ShardId, Token};

/// Monotonically increasing identifier of an SSTable's component family.
pub type Generation = i64;

/// Reference-counted SSTable handle.
pub type SharedSstable = Arc<Sstable>;

/// Statistics read from an SSTable's metadata components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SstableMetadata {
    /// Size of the data component in bytes.
    pub data_size: u64,
    /// Number of partitions.
    pub partitions: u64,
    /// Number of rows.
    pub rows: u64,
    /// Smallest write timestamp.
    pub min_timestamp: i64,
    /// Largest write timestamp.
    pub max_timestamp: i64,
    /// Largest local deletion time; `i64::MAX` if some data never expires.
    pub max_local_deletion_time: i64,
    /// Compaction tier.
    pub level: u32,
    /// First and last token written; `None` when sharding metadata is absent.
    pub token_range: Option<RangeInclusive<Token>>,
    /// Whether the data holds counters in the legacy shard format.
    pub has_legacy_counters: bool,
}

impl Default for SstableMetadata {
    /// Unknown metadata, shaped so it never makes data look expired.
    fn default() -> Self {
        Self {
            data_size: 0,
            partitions: 0,
            rows: 0,
            min_timestamp: i64::MIN,
            max_timestamp: i64::MAX,
            max_local_deletion_time: i64::MAX,
            level: 0,
            token_range: None,
            has_legacy_counters: false,
        }
    }
}

/// Accumulates metadata while partitions are written.
#[derive(Debug, Clone)]
pub struct MetadataCollector {
    data_size: u64,
    partitions: u64,
    rows: u64,
    min_timestamp: i64,
    max_timestamp: i64,
    max_local_deletion_time: i64,
    first_token: Option<Token>,
    last_token: Option<Token>,
}

impl Default for MetadataCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataCollector {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self {
            data_size: 0,
            partitions: 0,
            rows: 0,
            min_timestamp: i64::MAX,
            max_timestamp: i64::MIN,
            max_local_deletion_time: i64::MIN,
            first_token: None,
            last_token: None,
        }
    }

    /// Records one written partition.
    pub fn observe(&mut self, partition: &Partition) {
        self.data_size += partition.estimated_size();
        self.partitions += 1;
        self.first_token.get_or_insert(partition.key.token);
        self.last_token = Some(partition.key.token);
        for row in &partition.rows {
            self.rows += 1;
            self.min_timestamp = self.min_timestamp.min(row.cell.timestamp);
            self.max_timestamp = self.max_timestamp.max(row.cell.timestamp);
            let ldt = row.cell.local_deletion_time.unwrap_or(i64::MAX);
            self.max_local_deletion_time = self.max_local_deletion_time.max(ldt);
        }
    }

    /// Bytes observed so far.
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    /// Produces the final metadata.
    pub fn finish(&self, level: u32) -> SstableMetadata {
        SstableMetadata {
            data_size: self.data_size,
            partitions: self.partitions,
            rows: self.rows,
            min_timestamp: self.min_timestamp,
            max_timestamp: self.max_timestamp,
            max_local_deletion_time: self.max_local_deletion_time,
            level,
            token_range: self.first_token.zip(self.last_token).map(|(f, l)| f..=l),
            has_legacy_counters: false,
        }
    }
}

/// Handle to one SSTable on disk.
#[derive(Debug)]
pub struct Sstable {
    dir: PathBuf,
    generation: Generation,
    version: SstableVersion,
    format: SstableFormat,
    /// Keyspace and table, only needed to name `ka` components.
    legacy_prefix: Option<(String, String)>,
    metadata: RwLock<Option<SstableMetadata>>,
    marked_for_deletion: AtomicBool,
}

impl Sstable {
    /// Creates a handle; metadata stays unknown until loaded or written.
    pub fn new(
        dir: impl Into<PathBuf>,
        generation: Generation,
        version: SstableVersion,
        format: SstableFormat,
    ) -> SharedSstable {
        Arc::new(Self {
            dir: dir.into(),
            generation,
            version,
            format,
            legacy_prefix: None,
            metadata: RwLock::new(None),
            marked_for_deletion: AtomicBool::new(false),
        })
    }

    /// Creates a handle for the family a scanned component belongs to.
    pub fn from_descriptor(desc: &EntryDescriptor) -> SharedSstable {
        Arc::new(Self {
            dir: desc.dir.clone(),
            generation: desc.generation,
            version: desc.version,
            format: desc.format,
            legacy_prefix: desc.keyspace.clone().zip(desc.table.clone()),
            metadata: RwLock::new(None),
            marked_for_deletion: AtomicBool::new(false),
        })
    }

    /// Re-creates a handle from a descriptor received from another shard.
    /// The metadata is not trusted and must be loaded again.
    pub fn from_open_info(info: &ForeignSstableOpenInfo) -> SharedSstable {
        Arc::new(Self {
            dir: info.dir.clone(),
            generation: info.generation,
            version: info.version,
            format: info.format,
            legacy_prefix: info.legacy_prefix.clone(),
            metadata: RwLock::new(None),
            marked_for_deletion: AtomicBool::new(false),
        })
    }

    /// Directory holding the components.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Generation of this SSTable.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Format version.
    pub fn version(&self) -> SstableVersion {
        self.version
    }

    /// Layout family.
    pub fn format(&self) -> SstableFormat {
        self.format
    }

    /// Path of one component file.
    pub fn component_path(&self, component: ComponentType) -> PathBuf {
        EntryDescriptor {
            dir: self.dir.clone(),
            keyspace: self.legacy_prefix.as_ref().map(|(ks, _)| ks.clone()),
            table: self.legacy_prefix.as_ref().map(|(_, cf)| cf.clone()),
            generation: self.generation,
            version: self.version,
            format: self.format,
            component,
        }
        .path()
    }

    /// Path of the TOC, the durability marker.
    pub fn toc_path(&self) -> PathBuf {
        self.component_path(ComponentType::Toc)
    }

    /// Installs metadata read from disk or produced by a writer.
    pub fn set_metadata(&self, metadata: SstableMetadata) {
        *self.metadata.write() = Some(metadata);
    }

    /// Returns true once metadata has been installed.
    pub fn is_loaded(&self) -> bool {
        self.metadata.read().is_some()
    }

    /// Snapshot of the metadata, or the conservative default if unknown.
    pub fn metadata(&self) -> SstableMetadata {
        self.metadata.read().clone().unwrap_or_default()
    }

    /// Size of the data component.
    pub fn data_size(&self) -> u64 {
        self.metadata.read().as_ref().map_or(0, |m| m.data_size)
    }

    /// Smallest write timestamp.
    pub fn min_timestamp(&self) -> i64 {
        self.metadata.read().as_ref().map_or(i64::MIN, |m| m.min_timestamp)
    }

    /// Largest write timestamp.
    pub fn max_timestamp(&self) -> i64 {
        self.metadata.read().as_ref().map_or(i64::MAX, |m| m.max_timestamp)
    }

    /// Largest local deletion time.
    pub fn max_local_deletion_time(&self) -> i64 {
        self.metadata
            .read()
            .as_ref()
            .map_or(i64::MAX, |m| m.max_local_deletion_time)
    }

    /// Compaction tier.
    pub fn level(&self) -> u32 {
        self.metadata.read().as_ref().map_or(0, |m| m.level)
    }

    /// Moves the SSTable to another tier.
    pub fn set_level(&self, level: u32) {
        if let Some(m) = self.metadata.write().as_mut() {
            m.level = level;
        }
    }

    /// Classifies this SSTable relative to `local`.
    pub fn ownership(&self, shard_count: u32, local: ShardId) -> Ownership {
        let guard = self.metadata.read();
        let range = guard.as_ref().and_then(|m| m.token_range.as_ref());
        classify(range, shard_count, local)
    }

    /// Schedules the files for removal once the last handle is dropped.
    pub fn mark_for_deletion(&self) {
        debug!(generation = self.generation, "marking sstable for deletion");
        self.marked_for_deletion.store(true, Ordering::Release);
    }

    /// Returns true if the SSTable will be unlinked on drop.
    pub fn marked_for_deletion(&self) -> bool {
        self.marked_for_deletion.load(Ordering::Acquire)
    }

    /// Builds the descriptor sent to other shards.
    pub fn open_info(&self) -> ForeignSstableOpenInfo {
        ForeignSstableOpenInfo {
            dir: self.dir.clone(),
            legacy_prefix: self.legacy_prefix.clone(),
            generation: self.generation,
            version: self.version,
            format: self.format,
            data_size: self.data_size(),
        }
    }

    /// Removes every component, TOC first so a crash mid-way leaves a
    /// temporary TOC behind and the next scan finishes the job.
    pub fn unlink(&self) -> SstResult<()> {
        let toc = self.toc_path();
        let temp_toc = self.component_path(ComponentType::TemporaryToc);
        match std::fs::rename(&toc, &temp_toc) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(SstError::from_io(&toc, e)),
        }
        for component in ComponentType::ALL {
            if matches!(component, ComponentType::Toc | ComponentType::TemporaryToc) {
                continue;
            }
            remove_if_exists(&self.component_path(component))?;
        }
        remove_if_exists(&temp_toc)
    }
}

fn remove_if_exists(path: &Path) -> SstResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SstError::from_io(path, e)),
    }
}

// Blocking: the unlink runs on whichever thread drops the last handle, tokio
// workers included, and the files are gone once `drop` returns.
impl Drop for Sstable {
    fn drop(&mut self) {
        if !self.marked_for_deletion() {
            return;
        }
        match self.unlink() {
            Ok(()) => debug!(generation = self.generation, dir = %self.dir.display(), "sstable unlinked"),
            Err(e) => warn!(generation = self.generation, "failed to unlink sstable: {}", e),
        }
    }
}

impl PartialEq for Sstable {
    fn eq(&self, other: &Self) -> bool {
        self.generation == other.generation && self.dir == other.dir
    }
}

impl Eq for Sstable {}

impl Hash for Sstable {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.dir.hash(state);
        self.generation.hash(state);
    }
}

/// Serializable descriptor of an SSTable that another shard should open.
/// No file handles cross shards, only this value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignSstableOpenInfo {
    /// Directory holding the components.
    pub dir: PathBuf,
    /// Keyspace and table for `ka` names.
    pub legacy_prefix: Option<(String, String)>,
    /// Generation.
    pub generation: Generation,
    /// Format version.
    pub version: SstableVersion,
    /// Layout family.
    pub format: SstableFormat,
    /// Data size as seen by the sender, used for batching only.
    pub data_size: u64,
}

/// Encodes descriptors for a cross-shard message.
pub fn encode_open_infos(infos: &[ForeignSstableOpenInfo]) -> SstResult<Vec<u8>> {
    Ok(bincode::serialize(infos)?)
}

/// Decodes descriptors received from another shard.
pub fn decode_open_infos(payload: &[u8]) -> SstResult<Vec<ForeignSstableOpenInfo>> {
    Ok(bincode::deserialize(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::{Cell, PartitionKey, Row};
    use tempfile::TempDir;

    fn touch(path: &Path) {
        std::fs::write(path, b"x").unwrap();
    }

    #[test]
    fn test_metadata_collector() {
        let mut collector = MetadataCollector::new();
        let mut key = PartitionKey::new(b"a".to_vec());
        key.token = 10;
        collector.observe(&Partition::new(
            key.clone(),
            vec![
                Row::new(b"1".to_vec(), Cell::live(5, b"v".to_vec())),
                Row::new(b"2".to_vec(), Cell::tombstone(9, 100)),
            ],
        ));
        key.token = 20;
        collector.observe(&Partition::new(
            key,
            vec![Row::new(b"1".to_vec(), Cell::expiring(7, b"v".to_vec(), 50))],
        ));
        let meta = collector.finish(2);
        assert_eq!(meta.partitions, 2);
        assert_eq!(meta.rows, 3);
        assert_eq!(meta.min_timestamp, 5);
        assert_eq!(meta.max_timestamp, 9);
        assert_eq!(meta.max_local_deletion_time, i64::MAX);
        assert_eq!(meta.level, 2);
        assert_eq!(meta.token_range, Some(10..=20));
    }

    #[test]
    fn test_unknown_metadata_is_shared() {
        let sst = Sstable::new("/d", 1, SstableVersion::Me, SstableFormat::Big);
        assert!(!sst.is_loaded());
        assert_eq!(sst.ownership(2, ShardId::new(0)), Ownership::Shared);
        assert_eq!(sst.max_local_deletion_time(), i64::MAX);
    }

    #[test]
    fn test_drop_without_mark_keeps_files() {
        let dir = TempDir::new().unwrap();
        let sst = Sstable::new(dir.path(), 3, SstableVersion::Me, SstableFormat::Big);
        touch(&sst.component_path(ComponentType::Data));
        touch(&sst.toc_path());
        let data = sst.component_path(ComponentType::Data);
        drop(sst);
        assert!(data.exists());
    }

    #[test]
    fn test_last_reference_unlinks_marked() {
        let dir = TempDir::new().unwrap();
        let sst = Sstable::new(dir.path(), 4, SstableVersion::Me, SstableFormat::Big);
        for c in [ComponentType::Data, ComponentType::Index, ComponentType::Toc] {
            touch(&sst.component_path(c));
        }
        let other = Arc::clone(&sst);
        sst.mark_for_deletion();
        drop(sst);
        assert!(other.toc_path().exists());
        drop(other);
        let left: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(left.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drop_on_worker_unlinks_before_returning() {
        let dir = TempDir::new().unwrap();
        let sst = Sstable::new(dir.path(), 5, SstableVersion::Me, SstableFormat::Big);
        touch(&sst.component_path(ComponentType::Data));
        touch(&sst.toc_path());
        let toc = sst.toc_path();
        sst.mark_for_deletion();

        let dropped = tokio::spawn(async move {
            drop(sst);
            toc.exists()
        });
        assert!(!dropped.await.unwrap());
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_open_info_round_trip_through_bincode() {
        let sst = Sstable::new("/d", 9, SstableVersion::Md, SstableFormat::Big);
        let payload = encode_open_infos(&[sst.open_info()]).unwrap();
        let infos = decode_open_infos(&payload).unwrap();
        let reopened = Sstable::from_open_info(&infos[0]);
        assert_eq!(*reopened, *sst);
        assert!(!reopened.is_loaded());
    }
}
