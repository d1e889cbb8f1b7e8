//! Error types for the SSTable lifecycle subsystem.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::sstable::Generation;

/// Result type alias for SSTable operations.
pub type SstResult<T> = Result<T, SstError>;

/// Error variants for SSTable operations.
#[derive(Debug, Error)]
pub enum SstError {
    /// Wraps standard I/O errors that carry no more specific meaning.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The device holding the directory ran out of space.
    #[error("Disk full while accessing {path}")]
    DiskFull {
        /// The file being written or created.
        path: PathBuf,
    },

    /// The process is not allowed to touch a file.
    #[error("Permission denied on {path}")]
    PermissionDenied {
        /// The offending file.
        path: PathBuf,
    },

    /// A file name could not be parsed as an SSTable component.
    #[error("Malformed SSTable file name {name}: {reason}")]
    MalformedFilename {
        /// The file name as found in the directory.
        name: String,
        /// Why parsing failed.
        reason: String,
    },

    /// A generation never acquired a TOC component.
    #[error("At directory {dir}: partial sstable with generation {generation}, TOC is missing")]
    MissingToc {
        /// Directory being scanned.
        dir: PathBuf,
        /// The incomplete generation.
        generation: Generation,
    },

    /// Data corruption detected while reading an SSTable.
    #[error("Corrupted sstable generation {generation}: {reason}")]
    Corrupted {
        /// Generation of the corrupted artifact.
        generation: Generation,
        /// Description of the corruption.
        reason: String,
    },

    /// An SSTable was rejected by load-time validation.
    #[error("SSTable generation {generation} rejected: {reason}")]
    Validation {
        /// Generation of the rejected artifact.
        generation: Generation,
        /// Why it was rejected.
        reason: String,
    },

    /// Classification sets ended up inconsistent.
    #[error("Classification error: {0}")]
    Classification(String),

    /// An operation was issued in the wrong lifecycle phase.
    #[error("Invalid phase: expected {expected}, found {actual}")]
    InvalidPhase {
        /// Phase the operation requires.
        expected: &'static str,
        /// Phase the directory is in.
        actual: &'static str,
    },

    /// A peer shard stopped answering.
    #[error("Shard {shard} is unavailable")]
    ShardUnavailable {
        /// Index of the unreachable shard.
        shard: u32,
    },

    /// A coordinated commit was aborted because a participant failed.
    #[error("Commit aborted: {reason}")]
    CommitAborted {
        /// Failure reported by the participant.
        reason: String,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {reason}")]
    Serialization {
        /// Description of the error.
        reason: String,
    },

    /// Configuration could not be loaded.
    #[error("Config error: {0}")]
    Config(String),

    /// A compaction was requested without input SSTables.
    #[error("Compaction needs at least one input sstable")]
    NoInputs,

    /// The table the directory belongs to is being dropped.
    #[error("Table is closing, operation refused")]
    Closing,
}

impl SstError {
    /// Wraps an I/O error raised while touching `path`, keeping disk-full
    /// and permission failures distinguishable from other storage faults.
    pub fn from_io(path: &Path, err: std::io::Error) -> Self {
        if err.raw_os_error() == Some(libc::ENOSPC) {
            return SstError::DiskFull {
                path: path.to_path_buf(),
            };
        }
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            return SstError::PermissionDenied {
                path: path.to_path_buf(),
            };
        }
        SstError::Io(err)
    }

    /// Returns true for read/write/unlink failures of the underlying storage.
    pub fn is_storage_fault(&self) -> bool {
        matches!(
            self,
            SstError::Io(_) | SstError::DiskFull { .. } | SstError::PermissionDenied { .. }
        )
    }

    /// Returns true when the error reports corrupted data.
    pub fn is_corruption(&self) -> bool {
        matches!(self, SstError::Corrupted { .. })
    }
}

impl From<bincode::Error> for SstError {
    fn from(err: bincode::Error) -> Self {
        SstError::Serialization {
            reason: err.to_string(),
        }
    }
}
