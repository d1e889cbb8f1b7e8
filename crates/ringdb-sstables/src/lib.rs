#![warn(missing_docs)]

//! RingDB SSTable lifecycle: directory scanning, shard classification, compaction, resharding and reshaping
//!
//! This crate manages the immutable sorted files of one table directory on
//! a sharded node. Each shard scans the directory, loads and classifies the
//! SSTables it is responsible for, and exchanges the ones owned elsewhere.
//! Cleanup of incomplete files goes through a two-phase commit across every
//! shard. Compaction merges SSTables into new ones while dropping expired
//! data, and drives resharding and reshaping.

pub mod compaction;
pub mod component;
pub mod config;
pub mod directory;
pub mod error;
pub mod expiry;
pub mod gate;
pub mod io;
pub mod merge;
pub mod mock;
pub mod mutation;
pub mod ownership;
pub mod reshape;
pub mod reshard;
pub mod scan;
pub mod scrub;
pub mod sharded;
pub mod sstable;

pub use compaction::{
    compact_sstables, CompactionConfig, CompactionDescriptor, CompactionInfo, CompactionKind,
    CompactionStopHandle, CompactionType, PrettyDataSize, PrettyThroughput, Replacement,
};
pub use component::{ComponentType, EntryDescriptor, SstableFormat, SstableVersion};
pub use config::SstablesConfig;
pub use directory::{DirectoryConfig, DirectoryPhase, DirectorySnapshot, SstableDirectory};
pub use error::{SstError, SstResult};
pub use expiry::{fully_expired_sstables, gc_before, max_purgeable_timestamp, PurgeRules};
pub use gate::{OperationGate, OperationGuard};
pub use io::{
    CompactionTable, CreatorRef, IoPriority, OutputHandoff, PartitionReader, ReplacerRef,
    SstableCreator, SstableIo, SstableReplacer, SstableWriter,
};
pub use merge::MergingReader;
pub use mock::{MemoryIo, MemoryTable};
pub use mutation::{Cell, Partition, PartitionKey, Row};
pub use ownership::{classify, OwnedRanges, Ownership, ShardId, Token};
pub use reshape::{reshaping_job, ReshapeConfig, ReshapeJob, ReshapeMode};
pub use reshard::reshard_batches;
pub use scan::{MissingTocPolicy, ScanOutcome, Scanner};
pub use scrub::{ScrubMode, ScrubStats, StreamValidator};
pub use sharded::{ShardHandle, ShardedDirectory};
pub use sstable::{ForeignSstableOpenInfo, Generation, SharedSstable, Sstable, SstableMetadata};
