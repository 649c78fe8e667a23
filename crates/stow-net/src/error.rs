use stow_codec::CodecError;
use stow_dictionary::DictionaryError;
use stow_registry::RegistryError;
use stow_types::Oid;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    /// No bytes moved for a whole timeout window.
    #[error("timed out after {transferred} of {expected} bytes")]
    Timeout { expected: u64, transferred: u64 },

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: u64 },

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("record {from} refers to oid {to}, which is not part of the message")]
    DanglingReference { from: Oid, to: Oid },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("graph handler failed: {0}")]
    Handler(String),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("dictionary error: {0}")]
    Dictionary(#[from] DictionaryError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetError {
    /// Whether repeating the exchange may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub type NetResult<T> = Result<T, NetError>;
