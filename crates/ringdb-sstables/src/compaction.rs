//! Compaction engine: merges input SSTables into size-bounded outputs.
//!
//! One call to [`compact_sstables`] streams every input through a k-way
//! merge, applies the expiry and purge rules, routes partitions to output
//! writers and finally publishes the result through the replacer. The same
//! engine runs regular, cleanup, scrub, reshard, reshape and upgrade jobs;
//! [`CompactionKind`] selects the behavior.

use std::collections::{btree_map::Entry, BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::component::ComponentType;
use crate::error::{SstError, SstResult};
use crate::expiry::{fully_expired_sstables, gc_before, max_purgeable_timestamp, PurgeRules};
use crate::io::{CompactionTable, CreatorRef, IoPriority, ReplacerRef, SstableIo, SstableWriter};
use crate::merge::MergingReader;
use crate::mutation::{Partition, Row};
use crate::ownership::{shard_for_token, OwnedRanges, ShardId};
use crate::scrub::ScrubMode;
use crate::sstable::SharedSstable;

/// Name of a compaction job as shown in logs and history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompactionType {
    /// Ordinary background compaction.
    Compaction,
    /// Drops data outside the node's token ranges.
    Cleanup,
    /// Scrub that only validates.
    Validation,
    /// Scrub that rewrites.
    Scrub,
    /// Splits shared SSTables by owning shard.
    Reshard,
    /// Rewrites SSTables violating layout policy.
    Reshape,
    /// Rewrites SSTables into the current format.
    Upgrade,
}

impl CompactionType {
    /// Canonical name.
    pub fn as_str(self) -> &'static str {
        match self {
            CompactionType::Compaction => "Compaction",
            CompactionType::Cleanup => "Cleanup",
            CompactionType::Validation => "Validation",
            CompactionType::Scrub => "Scrub",
            CompactionType::Reshard => "Reshard",
            CompactionType::Reshape => "Reshape",
            CompactionType::Upgrade => "Upgrade",
        }
    }

    fn present_participle(self) -> &'static str {
        match self {
            CompactionType::Compaction => "Compacting",
            CompactionType::Cleanup => "Cleaning",
            CompactionType::Validation => "Validating",
            CompactionType::Scrub => "Scrubbing",
            CompactionType::Reshard => "Resharding",
            CompactionType::Reshape => "Reshaping",
            CompactionType::Upgrade => "Upgrading",
        }
    }

    fn past_participle(self) -> &'static str {
        match self {
            CompactionType::Compaction => "Compacted",
            CompactionType::Cleanup => "Cleaned",
            CompactionType::Validation => "Validated",
            CompactionType::Scrub => "Scrubbed",
            CompactionType::Reshard => "Resharded",
            CompactionType::Reshape => "Reshaped",
            CompactionType::Upgrade => "Upgraded",
        }
    }
}

impl fmt::Display for CompactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompactionType {
    type Err = SstError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Compaction" => Ok(CompactionType::Compaction),
            "Cleanup" => Ok(CompactionType::Cleanup),
            "Validation" => Ok(CompactionType::Validation),
            "Scrub" => Ok(CompactionType::Scrub),
            "Reshard" => Ok(CompactionType::Reshard),
            "Reshape" => Ok(CompactionType::Reshape),
            "Upgrade" => Ok(CompactionType::Upgrade),
            other => Err(SstError::Config(format!("unknown compaction type {}", other))),
        }
    }
}

/// What a compaction does with the merged stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CompactionKind {
    /// Merge, drop expired SSTables and purge collectable deletions.
    #[default]
    Regular,
    /// Like regular, but partitions outside `owned` are discarded.
    Cleanup {
        /// Token ranges the node still owns.
        owned: OwnedRanges,
    },
    /// Rewrite while checking every row.
    Scrub {
        /// Reaction to corrupted data.
        mode: ScrubMode,
    },
    /// Split output by owning shard.
    Reshard,
    /// Rewrite to satisfy layout policy.
    Reshape,
    /// Rewrite into the current format.
    Upgrade,
}

impl CompactionKind {
    /// The job name this kind runs under.
    pub fn compaction_type(&self) -> CompactionType {
        match self {
            CompactionKind::Regular => CompactionType::Compaction,
            CompactionKind::Cleanup { .. } => CompactionType::Cleanup,
            CompactionKind::Scrub {
                mode: ScrubMode::Validate,
            } => CompactionType::Validation,
            CompactionKind::Scrub { .. } => CompactionType::Scrub,
            CompactionKind::Reshard => CompactionType::Reshard,
            CompactionKind::Reshape => CompactionType::Reshape,
            CompactionKind::Upgrade => CompactionType::Upgrade,
        }
    }

    fn scrub_mode(&self) -> ScrubMode {
        match self {
            CompactionKind::Scrub { mode } => *mode,
            _ => ScrubMode::Abort,
        }
    }

    fn drops_expired(&self) -> bool {
        matches!(self, CompactionKind::Regular)
    }

    fn purges(&self) -> bool {
        matches!(self, CompactionKind::Regular | CompactionKind::Cleanup { .. })
    }

    fn writes_output(&self) -> bool {
        !matches!(
            self,
            CompactionKind::Scrub {
                mode: ScrubMode::Validate
            }
        )
    }
}

/// Tunables shared by every compaction job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Soft size limit of one output SSTable (default: 160 MiB).
    pub max_sstable_bytes: u64,
    /// Seconds deletions are kept before they may be purged (default: 10 days).
    pub gc_grace_seconds: i64,
    /// Upper bound of inputs per reshard job (default: 32).
    pub max_sstables_per_reshard_job: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            max_sstable_bytes: 160 * 1024 * 1024,
            gc_grace_seconds: 864_000,
            max_sstables_per_reshard_job: 32,
        }
    }
}

/// Cooperative stop flag shared between a running job and its caller.
#[derive(Debug, Clone, Default)]
pub struct CompactionStopHandle {
    reason: Arc<Mutex<Option<String>>>,
}

impl CompactionStopHandle {
    /// Creates a handle with no stop requested.
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks the job to stop at the next partition boundary. The first
    /// reason given is kept.
    pub fn stop(&self, reason: impl Into<String>) {
        let mut guard = self.reason.lock();
        if guard.is_none() {
            *guard = Some(reason.into());
        }
    }

    /// Returns true once a stop was requested.
    pub fn is_stop_requested(&self) -> bool {
        self.reason.lock().is_some()
    }

    /// Reason given with the stop request.
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}

/// Everything one compaction job needs.
#[derive(Clone)]
pub struct CompactionDescriptor {
    /// Inputs, all from the same table.
    pub sstables: Vec<SharedSstable>,
    /// Level assigned to the outputs.
    pub level: u32,
    /// Soft size limit of one output; partitions are never split.
    pub max_sstable_bytes: u64,
    /// Stable across retries of the same logical job.
    pub run_identifier: Uuid,
    /// Behavior selector.
    pub kind: CompactionKind,
    /// Passed through to readers and writers.
    pub priority: IoPriority,
    /// Allocates output SSTables.
    pub creator: CreatorRef,
    /// Publishes the outputs; `None` leaves publication to the caller.
    pub replacer: Option<ReplacerRef>,
    /// Stop flag observed at partition boundaries.
    pub stop: CompactionStopHandle,
    /// Number of shards, used to route reshard output.
    pub shard_count: u32,
    /// Shard running the job.
    pub local_shard: ShardId,
    /// Seconds since the epoch the job treats as now.
    pub compaction_time: i64,
    /// Seconds deletions are kept before they may be purged.
    pub gc_grace_seconds: i64,
}

impl CompactionDescriptor {
    /// Describes a regular compaction of `sstables` with default limits.
    pub fn new(sstables: Vec<SharedSstable>, creator: CreatorRef) -> Self {
        let config = CompactionConfig::default();
        Self {
            sstables,
            level: 0,
            max_sstable_bytes: config.max_sstable_bytes,
            run_identifier: Uuid::new_v4(),
            kind: CompactionKind::Regular,
            priority: IoPriority::default(),
            creator,
            replacer: None,
            stop: CompactionStopHandle::new(),
            shard_count: 1,
            local_shard: ShardId::new(0),
            compaction_time: now_secs(),
            gc_grace_seconds: config.gc_grace_seconds,
        }
    }

    /// Applies limits from configuration.
    pub fn with_config(mut self, config: &CompactionConfig) -> Self {
        self.max_sstable_bytes = config.max_sstable_bytes;
        self.gc_grace_seconds = config.gc_grace_seconds;
        self
    }

    /// Deletions older than this may be purged.
    pub fn gc_before(&self) -> i64 {
        gc_before(self.compaction_time, self.gc_grace_seconds)
    }
}

impl fmt::Debug for CompactionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompactionDescriptor")
            .field("sstables", &self.sstables.len())
            .field("level", &self.level)
            .field("max_sstable_bytes", &self.max_sstable_bytes)
            .field("run_identifier", &self.run_identifier)
            .field("kind", &self.kind)
            .finish()
    }
}

/// One publication of outputs in place of inputs.
#[derive(Debug, Clone)]
pub struct Replacement {
    /// SSTables taken out of the live set.
    pub removed: Vec<SharedSstable>,
    /// SSTables added to the live set.
    pub added: Vec<SharedSstable>,
}

/// Run record of one compaction.
#[derive(Debug, Clone)]
pub struct CompactionInfo {
    /// Job name.
    pub compaction_type: CompactionType,
    /// Keyspace of the table.
    pub keyspace: String,
    /// Table name.
    pub table: String,
    /// Number of inputs.
    pub sstables: usize,
    /// Total data size of the inputs.
    pub start_size: u64,
    /// Total data size of the outputs.
    pub end_size: u64,
    /// Merged partitions read.
    pub total_partitions: u64,
    /// Partitions written.
    pub total_keys_written: u64,
    /// Rows written.
    pub rows_written: u64,
    /// Milliseconds since the epoch when the job ended.
    pub ended_at: Option<u64>,
    /// Sealed outputs.
    pub new_sstables: Vec<SharedSstable>,
    /// Reason of a honored stop request.
    pub stop_requested: Option<String>,
    /// Whether statistics of this run are reported.
    pub tracking: bool,
    /// Identifier of the logical job.
    pub run_identifier: Uuid,
    /// Identifier of this execution.
    pub compaction_uuid: Uuid,
    /// Publications done by this run.
    pub pending_replacements: Vec<Replacement>,
    /// Rows dropped because they were corrupted.
    pub skipped_rows: u64,
    /// Partitions dropped because they were out of order.
    pub skipped_partitions: u64,
    /// Rows dropped by the purge rules.
    pub purged_rows: u64,
    /// Inputs dropped without reading because they were fully expired.
    pub expired_sstables: usize,
}

impl CompactionInfo {
    fn new<T: CompactionTable + ?Sized>(descriptor: &CompactionDescriptor, table: &T) -> Self {
        Self {
            compaction_type: descriptor.kind.compaction_type(),
            keyspace: table.keyspace().to_string(),
            table: table.name().to_string(),
            sstables: descriptor.sstables.len(),
            start_size: descriptor.sstables.iter().map(|s| s.data_size()).sum(),
            end_size: 0,
            total_partitions: 0,
            total_keys_written: 0,
            rows_written: 0,
            ended_at: None,
            new_sstables: Vec::new(),
            stop_requested: None,
            tracking: true,
            run_identifier: descriptor.run_identifier,
            compaction_uuid: Uuid::new_v4(),
            pending_replacements: Vec::new(),
            skipped_rows: 0,
            skipped_partitions: 0,
            purged_rows: 0,
            expired_sstables: 0,
        }
    }

    /// Returns true if the run ended early on request.
    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.is_some()
    }

    /// Excludes this run from reported statistics.
    pub fn stop_tracking(&mut self) {
        self.tracking = false;
    }
}

/// Byte count rendered with a decimal unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrettyDataSize(pub u64);

impl fmt::Display for PrettyDataSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [&str; 5] = ["kB", "MB", "GB", "TB", "PB"];
        if self.0 < 1000 {
            return write!(f, "{} bytes", self.0);
        }
        let mut value = self.0 as f64 / 1000.0;
        let mut unit = 0;
        while value >= 1000.0 && unit + 1 < UNITS.len() {
            value /= 1000.0;
            unit += 1;
        }
        write!(f, "{:.1} {}", value, UNITS[unit])
    }
}

/// Bytes over elapsed time rendered per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrettyThroughput {
    /// Bytes processed.
    pub bytes: u64,
    /// Time taken.
    pub elapsed: Duration,
}

impl fmt::Display for PrettyThroughput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.elapsed.as_secs_f64().max(0.001);
        let rate = (self.bytes as f64 / secs) as u64;
        write!(f, "{}/s", PrettyDataSize(rate))
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn describe(sstables: &[SharedSstable]) -> String {
    sstables
        .iter()
        .map(|s| {
            let data = s.component_path(ComponentType::Data);
            let name = data
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            format!("{}:level={}", name, s.level())
        })
        .collect::<Vec<_>>()
        .join(", ")
}

struct ActiveWriter<W> {
    sst: SharedSstable,
    writer: W,
}

struct RunState<W> {
    writers: BTreeMap<ShardId, ActiveWriter<W>>,
    outputs: Vec<SharedSstable>,
}

async fn seal<W: SstableWriter>(
    active: ActiveWriter<W>,
    level: u32,
    outputs: &mut Vec<SharedSstable>,
) -> SstResult<()> {
    let metadata = active.writer.finish(level).await?;
    debug!(
        generation = active.sst.generation(),
        bytes = metadata.data_size,
        partitions = metadata.partitions,
        "compaction output sealed"
    );
    active.sst.set_metadata(metadata);
    outputs.push(active.sst);
    Ok(())
}

async fn run_compaction<Io: SstableIo>(
    descriptor: &CompactionDescriptor,
    expired: &HashSet<SharedSstable>,
    purge: PurgeRules,
    io: &Io,
    info: &mut CompactionInfo,
    run: &mut RunState<Io::Writer>,
) -> SstResult<()> {
    let mut readers = Vec::with_capacity(descriptor.sstables.len());
    for sst in &descriptor.sstables {
        if expired.contains(sst) {
            debug!(generation = sst.generation(), "dropping fully expired sstable");
            continue;
        }
        readers.push((sst.generation(), io.open_reader(sst, &descriptor.priority).await?));
    }
    let mut merger = MergingReader::new(readers, descriptor.kind.scrub_mode()).await?;
    let writes_output = descriptor.kind.writes_output();

    while !descriptor.stop.is_stop_requested() {
        let Some(partition) = merger.next().await? else {
            break;
        };
        info.total_partitions += 1;

        if let CompactionKind::Cleanup { owned } = &descriptor.kind {
            if !owned.contains(partition.key.token) {
                continue;
            }
        }

        let before = partition.rows.len();
        let rows: Vec<Row> = partition
            .rows
            .into_iter()
            .filter_map(|row| purge.apply(row))
            .collect();
        info.purged_rows += (before - rows.len()) as u64;
        if rows.is_empty() || !writes_output {
            continue;
        }
        let partition = Partition {
            key: partition.key,
            rows,
        };

        let shard = match descriptor.kind {
            CompactionKind::Reshard => shard_for_token(partition.key.token, descriptor.shard_count),
            _ => descriptor.local_shard,
        };
        let active = match run.writers.entry(shard) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => {
                let sst = descriptor.creator.create(shard);
                let writer = io.open_writer(&sst, &descriptor.priority).await?;
                slot.insert(ActiveWriter { sst, writer })
            }
        };
        active.writer.consume(&partition).await?;
        info.total_keys_written += 1;
        info.rows_written += partition.rows.len() as u64;

        if active.writer.bytes_written() >= descriptor.max_sstable_bytes {
            if let Some(full) = run.writers.remove(&shard) {
                seal(full, descriptor.level, &mut run.outputs).await?;
            }
        }
    }

    let stats = merger.stats();
    info.skipped_rows = stats.skipped_rows;
    info.skipped_partitions = stats.skipped_partitions;

    while let Some((_, active)) = run.writers.pop_first() {
        seal(active, descriptor.level, &mut run.outputs).await?;
    }
    Ok(())
}

/// Runs one compaction job.
///
/// On success the outputs are published through the descriptor's replacer,
/// if any. A stop request ends the job at the next partition boundary: the
/// outputs sealed so far are returned unpublished and the stop reason is
/// recorded. Any error aborts open writers and marks sealed outputs for
/// deletion; inputs are never touched on failure.
pub async fn compact_sstables<Io, T>(
    descriptor: CompactionDescriptor,
    table: &T,
    io: &Io,
) -> SstResult<CompactionInfo>
where
    Io: SstableIo,
    T: CompactionTable + ?Sized,
{
    if descriptor.sstables.is_empty() {
        return Err(SstError::NoInputs);
    }
    let compaction_type = descriptor.kind.compaction_type();
    let mut info = CompactionInfo::new(&descriptor, table);
    if matches!(descriptor.kind, CompactionKind::Cleanup { .. }) {
        info.stop_tracking();
    }
    let started = Instant::now();

    let live = table.live_sstables();
    let min_memtable_timestamp = table.min_memtable_timestamp();
    let expired = if descriptor.kind.drops_expired() {
        fully_expired_sstables(
            &live,
            &descriptor.sstables,
            descriptor.gc_before(),
            min_memtable_timestamp,
        )
    } else {
        HashSet::new()
    };
    info.expired_sstables = expired.len();
    let purge = if descriptor.kind.purges() {
        PurgeRules {
            now: descriptor.compaction_time,
            gc_before: descriptor.gc_before(),
            max_purgeable_timestamp: max_purgeable_timestamp(
                &live,
                &descriptor.sstables,
                min_memtable_timestamp,
            ),
        }
    } else {
        PurgeRules::retain_all(descriptor.compaction_time)
    };

    info!(
        keyspace = %info.keyspace,
        table = %info.table,
        "{} [{}]",
        compaction_type.present_participle(),
        describe(&descriptor.sstables)
    );

    let mut run = RunState {
        writers: BTreeMap::new(),
        outputs: Vec::new(),
    };
    if let Err(e) = run_compaction(&descriptor, &expired, purge, io, &mut info, &mut run).await {
        for (_, active) in std::mem::take(&mut run.writers) {
            active.writer.abort().await;
        }
        for sst in &run.outputs {
            sst.mark_for_deletion();
        }
        warn!(
            keyspace = %info.keyspace,
            table = %info.table,
            outputs_discarded = run.outputs.len(),
            "{} failed: {}",
            compaction_type,
            e
        );
        return Err(e);
    }

    info.new_sstables = run.outputs;
    info.end_size = info.new_sstables.iter().map(|s| s.data_size()).sum();
    info.ended_at = Some(now_millis());
    let elapsed = started.elapsed();

    if let Some(reason) = descriptor.stop.reason() {
        info!(
            keyspace = %info.keyspace,
            table = %info.table,
            sealed = info.new_sstables.len(),
            "{} stopped: {}",
            compaction_type,
            reason
        );
        info.stop_requested = Some(reason);
        return Ok(info);
    }

    if descriptor.kind.writes_output() {
        if let Some(replacer) = &descriptor.replacer {
            if let Err(e) = replacer.replace(&descriptor.sstables, &info.new_sstables) {
                for sst in &info.new_sstables {
                    sst.mark_for_deletion();
                }
                return Err(e);
            }
            info.pending_replacements.push(Replacement {
                removed: descriptor.sstables.clone(),
                added: info.new_sstables.clone(),
            });
        }
    }

    let ratio = if info.start_size == 0 {
        0.0
    } else {
        info.end_size as f64 * 100.0 / info.start_size as f64
    };
    info!(
        keyspace = %info.keyspace,
        table = %info.table,
        "{} {} sstables to [{}]. {} to {} (~{}% of original) in {}ms = {}. ~{} total partitions merged to {}.",
        compaction_type.past_participle(),
        info.sstables,
        describe(&info.new_sstables),
        PrettyDataSize(info.start_size),
        PrettyDataSize(info.end_size),
        ratio as u64,
        elapsed.as_millis(),
        PrettyThroughput {
            bytes: info.start_size,
            elapsed,
        },
        info.total_partitions,
        info.total_keys_written
    );
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{SstableFormat, SstableVersion};
    use crate::mock::{MemoryIo, MemoryTable};
    use crate::mutation::{Cell, PartitionKey};
    use crate::sstable::Sstable;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn creator(dir: &str, first: i64) -> CreatorRef {
        let next = Arc::new(AtomicI64::new(first));
        let dir = dir.to_string();
        Arc::new(move |_shard: ShardId| {
            let generation = next.fetch_add(1, Ordering::SeqCst);
            Sstable::new(dir.clone(), generation, SstableVersion::Me, SstableFormat::Big)
        })
    }

    fn partitions(prefix: &str, count: usize, rows: usize, ts: i64) -> Vec<Partition> {
        let mut parts: Vec<Partition> = (0..count)
            .map(|i| {
                let key = PartitionKey::new(format!("{}-{}", prefix, i).into_bytes());
                let rows = (0..rows)
                    .map(|r| Row::new(format!("c{}", r).into_bytes(), Cell::live(ts, b"value".to_vec())))
                    .collect();
                Partition::new(key, rows)
            })
            .collect();
        parts.sort_by(|a, b| a.key.cmp(&b.key));
        parts
    }

    fn input(io: &MemoryIo, table: &MemoryTable, generation: i64, parts: Vec<Partition>) -> SharedSstable {
        let sst = Sstable::new("/mem", generation, SstableVersion::Me, SstableFormat::Big);
        io.insert(&sst, parts, 0);
        table.add(Arc::clone(&sst));
        sst
    }

    fn row_count(io: &MemoryIo, outputs: &[SharedSstable]) -> usize {
        outputs
            .iter()
            .map(|s| io.partitions(s).unwrap().iter().map(|p| p.rows.len()).sum::<usize>())
            .sum()
    }

    #[test]
    fn test_compaction_type_names() {
        for ty in [
            CompactionType::Compaction,
            CompactionType::Cleanup,
            CompactionType::Validation,
            CompactionType::Scrub,
            CompactionType::Reshard,
            CompactionType::Reshape,
            CompactionType::Upgrade,
        ] {
            assert_eq!(ty.to_string().parse::<CompactionType>().unwrap(), ty);
        }
        assert!("Bogus".parse::<CompactionType>().is_err());
    }

    #[test]
    fn test_kind_types() {
        assert_eq!(
            CompactionKind::Scrub { mode: ScrubMode::Validate }.compaction_type(),
            CompactionType::Validation
        );
        assert_eq!(
            CompactionKind::Scrub { mode: ScrubMode::Skip }.compaction_type(),
            CompactionType::Scrub
        );
    }

    #[test]
    fn test_pretty_data_size() {
        assert_eq!(PrettyDataSize(512).to_string(), "512 bytes");
        assert_eq!(PrettyDataSize(1_500).to_string(), "1.5 kB");
        assert_eq!(PrettyDataSize(2_000_000).to_string(), "2.0 MB");
        let t = PrettyThroughput {
            bytes: 4_000_000,
            elapsed: Duration::from_secs(2),
        };
        assert_eq!(t.to_string(), "2.0 MB/s");
    }

    #[test]
    fn test_stop_handle_keeps_first_reason() {
        let handle = CompactionStopHandle::new();
        assert!(!handle.is_stop_requested());
        handle.clone().stop("shutdown");
        handle.stop("other");
        assert_eq!(handle.reason().as_deref(), Some("shutdown"));
    }

    #[tokio::test]
    async fn test_empty_input_rejected() {
        let io = MemoryIo::new();
        let table = MemoryTable::new("ks", "t");
        let desc = CompactionDescriptor::new(vec![], creator("/mem", 100));
        assert!(matches!(
            compact_sstables(desc, &table, &io).await,
            Err(SstError::NoInputs)
        ));
    }

    #[tokio::test]
    async fn test_regular_compaction_merges_and_replaces() {
        let io = MemoryIo::new();
        let table = Arc::new(MemoryTable::new("ks", "t"));
        let a = input(&io, &table, 1, partitions("a", 20, 3, 10));
        let b = input(&io, &table, 2, partitions("b", 20, 3, 10));

        let mut desc = CompactionDescriptor::new(vec![a.clone(), b.clone()], creator("/mem", 100));
        desc.level = 1;
        desc.replacer = Some(table.clone() as ReplacerRef);
        let info = compact_sstables(desc, table.as_ref(), &io).await.unwrap();

        assert_eq!(info.total_partitions, 40);
        assert_eq!(info.total_keys_written, 40);
        assert_eq!(info.new_sstables.len(), 1);
        assert_eq!(info.new_sstables[0].level(), 1);
        assert_eq!(row_count(&io, &info.new_sstables), 120);
        assert_eq!(info.pending_replacements.len(), 1);
        assert!(a.marked_for_deletion());
        let live = table.live_sstables();
        assert_eq!(live, info.new_sstables);
        assert!(info.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_outputs_split_between_partitions() {
        let io = MemoryIo::new();
        let table = MemoryTable::new("ks", "t");
        let a = input(&io, &table, 1, partitions("a", 30, 4, 10));

        let mut desc = CompactionDescriptor::new(vec![a], creator("/mem", 100));
        desc.max_sstable_bytes = 500;
        let info = compact_sstables(desc, &table, &io).await.unwrap();

        assert!(info.new_sstables.len() > 1);
        assert_eq!(row_count(&io, &info.new_sstables), 120);
        for out in &info.new_sstables {
            for p in io.partitions(out).unwrap() {
                assert_eq!(p.rows.len(), 4);
            }
        }
    }

    #[tokio::test]
    async fn test_fully_expired_input_dropped_unread() {
        let io = MemoryIo::new();
        let table = MemoryTable::new("ks", "t");
        let expired_rows = vec![Partition::new(
            PartitionKey::new(b"gone".to_vec()),
            vec![Row::new(b"c".to_vec(), Cell::tombstone(5, 100))],
        )];
        let old = input(&io, &table, 1, expired_rows);
        let live = input(&io, &table, 2, partitions("live", 5, 1, 50));
        io.fail_read(1);

        let mut desc = CompactionDescriptor::new(vec![old, live], creator("/mem", 100));
        desc.compaction_time = 10_000;
        desc.gc_grace_seconds = 1_000;
        let info = compact_sstables(desc, &table, &io).await.unwrap();
        assert_eq!(info.expired_sstables, 1);
        assert_eq!(info.total_keys_written, 5);
    }

    #[tokio::test]
    async fn test_tombstones_purged_only_past_grace() {
        let io = MemoryIo::new();
        let table = MemoryTable::new("ks", "t");
        let parts = vec![Partition::new(
            PartitionKey::new(b"p".to_vec()),
            vec![
                Row::new(b"a".to_vec(), Cell::live(20, b"v".to_vec())),
                Row::new(b"b".to_vec(), Cell::tombstone(20, 500)),
                Row::new(b"c".to_vec(), Cell::tombstone(20, 9_500)),
            ],
        )];
        let sst = input(&io, &table, 1, parts);

        let mut desc = CompactionDescriptor::new(vec![sst], creator("/mem", 100));
        desc.compaction_time = 10_000;
        desc.gc_grace_seconds = 1_000;
        let info = compact_sstables(desc, &table, &io).await.unwrap();
        assert_eq!(info.purged_rows, 1);
        assert_eq!(row_count(&io, &info.new_sstables), 2);
    }

    #[tokio::test]
    async fn test_cleanup_discards_unowned_partitions() {
        let io = MemoryIo::new();
        let table = MemoryTable::new("ks", "t");
        let parts = partitions("k", 50, 1, 10);
        let owned_count = parts.iter().filter(|p| p.key.token <= u64::MAX / 2).count();
        let sst = input(&io, &table, 1, parts);

        let mut desc = CompactionDescriptor::new(vec![sst], creator("/mem", 100));
        desc.kind = CompactionKind::Cleanup {
            owned: OwnedRanges::new(vec![0..=u64::MAX / 2]),
        };
        let info = compact_sstables(desc, &table, &io).await.unwrap();
        assert_eq!(info.compaction_type, CompactionType::Cleanup);
        assert!(!info.tracking);
        assert_eq!(info.total_keys_written as usize, owned_count);
    }

    #[tokio::test]
    async fn test_reshard_routes_by_token() {
        let io = MemoryIo::new();
        let table = MemoryTable::new("ks", "t");
        let sst = input(&io, &table, 1, partitions("k", 64, 1, 10));

        let mut desc = CompactionDescriptor::new(vec![sst], creator("/mem", 100));
        desc.kind = CompactionKind::Reshard;
        desc.shard_count = 4;
        let info = compact_sstables(desc, &table, &io).await.unwrap();
        assert!(info.new_sstables.len() > 1);
        for out in &info.new_sstables {
            let parts = io.partitions(out).unwrap();
            let shard = shard_for_token(parts[0].key.token, 4);
            assert!(parts.iter().all(|p| shard_for_token(p.key.token, 4) == shard));
        }
    }

    #[tokio::test]
    async fn test_write_failure_discards_outputs() {
        let io = MemoryIo::new();
        let table = Arc::new(MemoryTable::new("ks", "t"));
        let sst = input(&io, &table, 1, partitions("k", 40, 2, 10));
        io.fail_write_after(25);

        let mut desc = CompactionDescriptor::new(vec![sst.clone()], creator("/mem", 100));
        desc.max_sstable_bytes = 200;
        desc.replacer = Some(table.clone() as ReplacerRef);
        let err = compact_sstables(desc, table.as_ref(), &io).await.unwrap_err();
        assert!(err.is_storage_fault());
        assert!(!sst.marked_for_deletion());
        assert_eq!(table.live_sstables(), vec![sst]);
    }

    #[tokio::test]
    async fn test_corruption_aborts_regular_compaction() {
        let io = MemoryIo::new();
        let table = MemoryTable::new("ks", "t");
        let sst = input(&io, &table, 3, partitions("k", 5, 2, 10));
        io.corrupt_row(&sst, 2, 1);
        let desc = CompactionDescriptor::new(vec![sst], creator("/mem", 100));
        let err = compact_sstables(desc, &table, &io).await.unwrap_err();
        assert!(err.is_corruption());
    }

    #[tokio::test]
    async fn test_validate_scrub_writes_nothing() {
        let io = MemoryIo::new();
        let table = Arc::new(MemoryTable::new("ks", "t"));
        let sst = input(&io, &table, 3, partitions("k", 5, 2, 10));
        io.corrupt_row(&sst, 0, 0);
        let mut desc = CompactionDescriptor::new(vec![sst.clone()], creator("/mem", 100));
        desc.kind = CompactionKind::Scrub {
            mode: ScrubMode::Validate,
        };
        desc.replacer = Some(table.clone() as ReplacerRef);
        let info = compact_sstables(desc, table.as_ref(), &io).await.unwrap();
        assert_eq!(info.skipped_rows, 1);
        assert!(info.new_sstables.is_empty());
        assert!(info.pending_replacements.is_empty());
        assert_eq!(table.live_sstables(), vec![sst]);
    }
}
