use std::io;
use std::path::PathBuf;

use crate::blob::BlobError;

/// Errors that can occur while maintaining a backup.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// Storage and backup disagree about a file's length.
    #[error(
        "channel {channel}: backup file {backup_file} has {backup_length} bytes, \
         storage file {} expects {storage_length}",
        .storage_file.display()
    )]
    InconsistentLength {
        channel: u32,
        storage_file: PathBuf,
        storage_length: u64,
        backup_file: String,
        backup_length: u64,
    },

    /// The backup holds a file newer than anything in storage.
    #[error("channel {channel}: backup reaches file {last_backup_file} but storage ends at {last_storage_file}")]
    BackupAhead {
        channel: u32,
        last_storage_file: u64,
        last_backup_file: u64,
    },

    #[error("channel {channel}: storage is empty but the backup holds {backup_files} file(s)")]
    EmptyStorageForNonEmptyBackup { channel: u32, backup_files: usize },

    #[error(
        "channel {channel}: copying {length} bytes at {position} from {} to {backup_file} failed",
        .storage_file.display()
    )]
    Copying {
        channel: u32,
        storage_file: PathBuf,
        backup_file: String,
        position: u64,
        length: u64,
        #[source]
        source: BlobError,
    },

    /// Read-back after a copy did not match the bytes written.
    #[error("channel {channel}: checksum mismatch in {backup_file} at {position} (+{length})")]
    ChecksumMismatch {
        channel: u32,
        backup_file: String,
        position: u64,
        length: u64,
    },

    #[error("blob store error: {0}")]
    Blob(#[from] BlobError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl BackupError {
    /// The channel this error concerns, if any.
    pub fn channel(&self) -> Option<u32> {
        match self {
            Self::InconsistentLength { channel, .. }
            | Self::BackupAhead { channel, .. }
            | Self::EmptyStorageForNonEmptyBackup { channel, .. }
            | Self::Copying { channel, .. }
            | Self::ChecksumMismatch { channel, .. } => Some(*channel),
            Self::Blob(_) | Self::Io(_) => None,
        }
    }
}

pub type BackupResult<T> = Result<T, BackupError>;
