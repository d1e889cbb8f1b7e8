//! Property-based tests for ringdb-sstables using proptest.
//!
//! These cover the ownership math, expiry decisions, output splitting and
//! directory scanning over generated inputs.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use proptest::prelude::*;
use ringdb_sstables::{
    classify, compact_sstables, fully_expired_sstables, ownership::shard_for_token,
    ownership::shards_spanned, Cell, CompactionDescriptor, CreatorRef, MemoryIo, MemoryTable,
    MissingTocPolicy, Ownership, Partition, PartitionKey, Row, Scanner, ShardId, SharedSstable,
    Sstable, SstableFormat, SstableMetadata, SstableVersion,
};

fn sst(generation: i64, min_ts: i64, max_ts: i64, max_ldt: i64) -> SharedSstable {
    let sst = Sstable::new("/mem", generation, SstableVersion::Me, SstableFormat::Big);
    sst.set_metadata(SstableMetadata {
        min_timestamp: min_ts,
        max_timestamp: max_ts,
        max_local_deletion_time: max_ldt,
        ..SstableMetadata::default()
    });
    sst
}

/// Generator for (min_ts, max_ts, max_ldt) with min_ts <= max_ts.
fn any_stats() -> impl Strategy<Value = (i64, i64, i64)> {
    (0i64..1_000, 0i64..1_000, 0i64..2_000).prop_map(|(a, b, ldt)| (a.min(b), a.max(b), ldt))
}

fn creator(first: i64) -> CreatorRef {
    let next = Arc::new(AtomicI64::new(first));
    Arc::new(move |_shard: ShardId| {
        Sstable::new(
            "/mem",
            next.fetch_add(1, Ordering::SeqCst),
            SstableVersion::Me,
            SstableFormat::Big,
        )
    })
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    /// Token slices are contiguous: a larger token never maps to a lower shard.
    #[test]
    fn test_token_shards_are_contiguous(a in any::<u64>(), b in any::<u64>(), count in 1u32..64) {
        let (lo, hi) = (a.min(b), a.max(b));
        let s_lo = shard_for_token(lo, count);
        let s_hi = shard_for_token(hi, count);
        prop_assert!(s_lo <= s_hi);
        prop_assert!(s_hi.as_u32() < count);
    }

    /// A range is unshared exactly when it falls into one slice.
    #[test]
    fn test_classification_matches_span(a in any::<u64>(), b in any::<u64>(), count in 1u32..16, local in 0u32..16) {
        let range = a.min(b)..=a.max(b);
        let local = ShardId::new(local % count);
        let spanned = shards_spanned(&range, count);
        match classify(Some(&range), count, local) {
            Ownership::UnsharedLocal => prop_assert_eq!(spanned, vec![local]),
            Ownership::UnsharedRemote(owner) => {
                prop_assert_ne!(owner, local);
                prop_assert_eq!(spanned, vec![owner]);
            }
            Ownership::Shared => prop_assert!(spanned.len() > 1),
        }
    }

    /// Raising gc_before never un-expires an SSTable.
    #[test]
    fn test_expiry_is_monotonic(
        stats in proptest::collection::vec(any_stats(), 1..12),
        outside in proptest::collection::vec(any_stats(), 0..4),
        gc_low in 0i64..2_000,
        bump in 0i64..1_000,
        memtable in 0i64..2_000,
    ) {
        let compacting: Vec<SharedSstable> = stats
            .iter()
            .enumerate()
            .map(|(i, (min, max, ldt))| sst(i as i64 + 1, *min, *max, *ldt))
            .collect();
        let mut table = compacting.clone();
        table.extend(
            outside
                .iter()
                .enumerate()
                .map(|(i, (min, max, ldt))| sst(100 + i as i64, *min, *max, *ldt)),
        );

        let low = fully_expired_sstables(&table, &compacting, gc_low, memtable);
        let high = fully_expired_sstables(&table, &compacting, gc_low + bump, memtable);
        prop_assert!(low.is_subset(&high));
        for sst in &high {
            prop_assert!(sst.max_local_deletion_time() < gc_low + bump);
            prop_assert!(sst.max_timestamp() < memtable);
        }
    }

    /// Splitting output by size never loses or duplicates rows.
    #[test]
    fn test_split_preserves_rows(
        partitions in 1usize..120,
        rows in 1usize..4,
        max_bytes in 32u64..4_096,
    ) {
        let rt = runtime();
        let io = MemoryIo::new();
        let table = MemoryTable::new("ks", "t");
        let mut parts: Vec<Partition> = (0..partitions)
            .map(|i| {
                let key = PartitionKey::new(format!("pk-{}", i).into_bytes());
                let rows = (0..rows)
                    .map(|r| Row::new(format!("c{}", r).into_bytes(), Cell::live(5, b"value".to_vec())))
                    .collect();
                Partition::new(key, rows)
            })
            .collect();
        parts.sort_by(|a, b| a.key.cmp(&b.key));
        let input = Sstable::new("/mem", 1, SstableVersion::Me, SstableFormat::Big);
        io.insert(&input, parts, 0);
        table.add(Arc::clone(&input));

        let mut descriptor = CompactionDescriptor::new(vec![input], creator(10));
        descriptor.max_sstable_bytes = max_bytes;
        let info = rt.block_on(compact_sstables(descriptor, &table, &io)).unwrap();

        let mut seen = HashSet::new();
        let mut total_rows = 0;
        for out in &info.new_sstables {
            for p in io.partitions(out).unwrap() {
                prop_assert!(seen.insert(p.key.clone()));
                total_rows += p.rows.len();
            }
        }
        prop_assert_eq!(seen.len(), partitions);
        prop_assert_eq!(total_rows, partitions * rows);
    }

    /// Scanning the same directory twice yields the same outcome.
    #[test]
    fn test_scan_is_idempotent(
        files in proptest::collection::vec((1i64..20, 0usize..4), 0..40),
        shard_count in 1u32..4,
    ) {
        let rt = runtime();
        let tmp = tempfile::TempDir::new().unwrap();
        for (generation, component) in &files {
            let suffix = ["Data.db", "Index.db", "TOC.txt", "TOC.txt.tmp"][*component];
            std::fs::write(tmp.path().join(format!("me-{}-big-{}", generation, suffix)), b"").unwrap();
        }
        for shard in 0..shard_count {
            let scanner = Scanner::new(tmp.path(), ShardId::new(shard), shard_count, MissingTocPolicy::Remove);
            let first = rt.block_on(scanner.scan()).unwrap();
            let second = rt.block_on(scanner.scan()).unwrap();
            prop_assert_eq!(first, second);
        }
    }
}
