use std::io;
use std::path::PathBuf;

use stow_backup::BackupError;
use stow_codec::CodecError;
use stow_types::Oid;

/// Errors produced by storage channels.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A request reached a channel that does not own the OID.
    #[error("oid {oid} belongs to channel {expected}, not channel {channel}")]
    OutOfPartition { oid: Oid, channel: u32, expected: u32 },

    #[error("the null oid cannot be stored")]
    NullOid,

    #[error("oid {0} not found")]
    NotFound(Oid),

    #[error("corrupt record in {} at offset {offset}: {reason}", .file.display())]
    CorruptRecord {
        file: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error("channel {channel} is not running")]
    ChannelStopped { channel: u32 },

    #[error("invalid storage configuration: {0}")]
    InvalidConfig(String),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("backup error: {0}")]
    Backup(#[from] BackupError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;
