//! Logical rows as produced by SSTable readers and consumed by writers.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::ownership::{token_for_key, Token};

/// Partition key with its token, ordered by token then key bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    /// Token of the key on the ring.
    pub token: Token,
    /// Raw key bytes.
    pub key: Vec<u8>,
}

impl PartitionKey {
    /// Creates a key, deriving its token from the bytes.
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        let key = key.into();
        Self {
            token: token_for_key(&key),
            key,
        }
    }
}

impl Ord for PartitionKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.token
            .cmp(&other.token)
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for PartitionKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A single versioned value.
///
/// A cell with a value and a deletion time expires at that time; a cell
/// without a value is a tombstone deleted at that time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    /// Write timestamp, used for reconciliation.
    pub timestamp: i64,
    /// Payload, `None` for tombstones.
    pub value: Option<Vec<u8>>,
    /// Local deletion time in seconds: expiry for TTL cells, deletion for tombstones.
    pub local_deletion_time: Option<i64>,
}

impl Cell {
    /// A live cell without TTL.
    pub fn live(timestamp: i64, value: impl Into<Vec<u8>>) -> Self {
        Self {
            timestamp,
            value: Some(value.into()),
            local_deletion_time: None,
        }
    }

    /// A live cell that expires at `expiry`.
    pub fn expiring(timestamp: i64, value: impl Into<Vec<u8>>, expiry: i64) -> Self {
        Self {
            timestamp,
            value: Some(value.into()),
            local_deletion_time: Some(expiry),
        }
    }

    /// A deletion marker.
    pub fn tombstone(timestamp: i64, deleted_at: i64) -> Self {
        Self {
            timestamp,
            value: None,
            local_deletion_time: Some(deleted_at),
        }
    }

    /// Returns true for deletion markers.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Returns true if the cell carries a value that has not expired at `now`.
    pub fn is_live(&self, now: i64) -> bool {
        match (&self.value, self.local_deletion_time) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(_), Some(expiry)) => expiry > now,
        }
    }

    /// Picks the winner of two versions of the same cell: the higher
    /// timestamp, then a tombstone over a value, then the larger value.
    pub fn reconcile(self, other: Cell) -> Cell {
        match self.timestamp.cmp(&other.timestamp) {
            Ordering::Greater => self,
            Ordering::Less => other,
            Ordering::Equal => match (self.is_tombstone(), other.is_tombstone()) {
                (true, _) => self,
                (false, true) => other,
                (false, false) => {
                    if self.value >= other.value {
                        self
                    } else {
                        other
                    }
                }
            },
        }
    }
}

/// One clustering row with its stored checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    /// Clustering key, rows are sorted by it inside a partition.
    pub clustering: Vec<u8>,
    /// The row's cell.
    pub cell: Cell,
    /// CRC32 of clustering key and cell, as stored on disk.
    pub checksum: u32,
}

impl Row {
    /// Creates a row with a freshly computed checksum.
    pub fn new(clustering: impl Into<Vec<u8>>, cell: Cell) -> Self {
        let clustering = clustering.into();
        let checksum = row_checksum(&clustering, &cell);
        Self {
            clustering,
            cell,
            checksum,
        }
    }

    /// Returns true if the stored checksum matches the content.
    pub fn verify(&self) -> bool {
        row_checksum(&self.clustering, &self.cell) == self.checksum
    }

    /// Replaces the cell and refreshes the checksum.
    pub fn with_cell(self, cell: Cell) -> Self {
        Row::new(self.clustering, cell)
    }
}

fn row_checksum(clustering: &[u8], cell: &Cell) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&(clustering.len() as u64).to_le_bytes());
    hasher.update(clustering);
    hasher.update(&cell.timestamp.to_le_bytes());
    match &cell.value {
        Some(v) => {
            hasher.update(&[1]);
            hasher.update(&(v.len() as u64).to_le_bytes());
            hasher.update(v);
        }
        None => hasher.update(&[0]),
    }
    match cell.local_deletion_time {
        Some(t) => {
            hasher.update(&[1]);
            hasher.update(&t.to_le_bytes());
        }
        None => hasher.update(&[0]),
    }
    hasher.finalize()
}

/// All rows of one partition, sorted by clustering key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Partition key.
    pub key: PartitionKey,
    /// Rows in clustering order.
    pub rows: Vec<Row>,
}

impl Partition {
    /// Creates a partition, sorting the rows by clustering key.
    pub fn new(key: PartitionKey, mut rows: Vec<Row>) -> Self {
        rows.sort_by(|a, b| a.clustering.cmp(&b.clustering));
        Self { key, rows }
    }

    /// Approximate serialized size used for output size limits.
    pub fn estimated_size(&self) -> u64 {
        let rows: usize = self
            .rows
            .iter()
            .map(|r| r.clustering.len() + r.cell.value.as_ref().map_or(0, Vec::len) + 29)
            .sum();
        (self.key.key.len() + 16 + rows) as u64
    }

    /// Merges another version of the same partition into this one,
    /// reconciling rows that share a clustering key.
    pub fn merge(self, other: Partition) -> Partition {
        let mut merged = Vec::with_capacity(self.rows.len() + other.rows.len());
        let mut left = self.rows.into_iter().peekable();
        let mut right = other.rows.into_iter().peekable();
        loop {
            let ord = match (left.peek(), right.peek()) {
                (Some(l), Some(r)) => l.clustering.cmp(&r.clustering),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => break,
            };
            match ord {
                Ordering::Less => merged.extend(left.next()),
                Ordering::Greater => merged.extend(right.next()),
                Ordering::Equal => {
                    if let (Some(l), Some(r)) = (left.next(), right.next()) {
                        let cell = l.cell.clone().reconcile(r.cell);
                        merged.push(l.with_cell(cell));
                    }
                }
            }
        }
        Partition {
            key: self.key,
            rows: merged,
        }
    }
}
