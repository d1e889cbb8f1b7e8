//! K-way merge of SSTable readers into one partition stream.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::error::{SstError, SstResult};
use crate::io::PartitionReader;
use crate::mutation::{Partition, PartitionKey};
use crate::scrub::{ScrubMode, ScrubStats, StreamValidator};
use crate::sstable::Generation;

struct Source<R> {
    reader: R,
    validator: StreamValidator,
    head: Option<Partition>,
}

/// Yields partitions of all inputs in key order, merging partitions that
/// appear in several inputs.
pub struct MergingReader<R> {
    sources: Vec<Source<R>>,
    heap: BinaryHeap<Reverse<(PartitionKey, usize)>>,
}

impl<R: PartitionReader> MergingReader<R> {
    /// Primes every reader. Each input is validated with `mode`.
    pub async fn new(readers: Vec<(Generation, R)>, mode: ScrubMode) -> SstResult<Self> {
        let mut merger = Self {
            sources: readers
                .into_iter()
                .map(|(generation, reader)| Source {
                    reader,
                    validator: StreamValidator::new(generation, mode),
                    head: None,
                })
                .collect(),
            heap: BinaryHeap::new(),
        };
        for idx in 0..merger.sources.len() {
            merger.advance(idx).await?;
        }
        Ok(merger)
    }

    async fn advance(&mut self, idx: usize) -> SstResult<()> {
        let source = &mut self.sources[idx];
        while let Some(partition) = source.reader.next_partition().await? {
            if let Some(partition) = source.validator.check(partition)? {
                self.heap.push(Reverse((partition.key.clone(), idx)));
                source.head = Some(partition);
                break;
            }
        }
        Ok(())
    }

    fn take_head(&mut self, idx: usize) -> SstResult<Partition> {
        self.sources[idx]
            .head
            .take()
            .ok_or_else(|| SstError::Classification(format!("merge source {} has no pending partition", idx)))
    }

    /// Returns the next merged partition, or `None` once all inputs are drained.
    pub async fn next(&mut self) -> SstResult<Option<Partition>> {
        let Some(Reverse((key, idx))) = self.heap.pop() else {
            return Ok(None);
        };
        let mut merged = self.take_head(idx)?;
        self.advance(idx).await?;

        while self
            .heap
            .peek()
            .is_some_and(|Reverse((next, _))| *next == key)
        {
            if let Some(Reverse((_, other))) = self.heap.pop() {
                let partition = self.take_head(other)?;
                merged = merged.merge(partition);
                self.advance(other).await?;
            }
        }
        Ok(Some(merged))
    }

    /// Validation counters summed over all inputs.
    pub fn stats(&self) -> ScrubStats {
        let mut total = ScrubStats::default();
        for source in &self.sources {
            total += source.validator.stats();
        }
        total
    }
}
