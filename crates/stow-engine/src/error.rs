use std::path::PathBuf;

use stow_backup::{BackupError, BlobError, DisruptionReport};
use stow_codec::CodecError;
use stow_dictionary::DictionaryError;
use stow_registry::RegistryError;
use stow_storage::StorageError;
use stow_types::{Oid, TypeError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("object {0} is not stored")]
    NotFound(Oid),

    #[error("oid {0} is reserved for engine records")]
    ReservedOid(Oid),

    #[error("type `{0}` has never been stored")]
    UnknownType(String),

    #[error("invalid configuration{}: {reason}", location(.path))]
    Config { path: Option<PathBuf>, reason: String },

    #[error("backup disrupted: {0}")]
    Disrupted(#[from] DisruptionReport),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("dictionary error: {0}")]
    Dictionary(#[from] DictionaryError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("backup error: {0}")]
    Backup(#[from] BackupError),

    #[error("blob store error: {0}")]
    Blob(#[from] BlobError),

    #[error("type error: {0}")]
    Type(#[from] TypeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn location(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| format!(" in {}", p.display()))
        .unwrap_or_default()
}

impl EngineError {
    /// Identity or layout consistency violations. These abort the whole
    /// call chain and are never worth retrying.
    pub fn is_consistency(&self) -> bool {
        match self {
            Self::Registry(_) => true,
            Self::Codec(e) => e.is_consistency(),
            Self::Dictionary(e) => e.is_consistency(),
            _ => false,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
