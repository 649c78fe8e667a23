use stow_dictionary::DictionaryError;
use stow_registry::RegistryError;
use stow_types::{Oid, Tid, TypeError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("record truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("record header declares length {declared}, below the {minimum}-byte header")]
    InvalidLength { declared: u64, minimum: u64 },

    #[error("record {oid} (type id {tid}) payload malformed at byte {offset}: {reason}")]
    MalformedPayload {
        oid: Oid,
        tid: Tid,
        offset: usize,
        reason: String,
    },

    #[error("record {oid} (type id {tid}) has {trailing} unread payload bytes")]
    TrailingBytes { oid: Oid, tid: Tid, trailing: usize },

    #[error("value of `{type_name}.{field}` does not fit its {expected} layout")]
    FieldMismatch {
        type_name: String,
        field: String,
        expected: String,
    },

    #[error("reference to oid {oid} is not resident and cannot be serialized")]
    UnresolvedStub { oid: Oid },

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("dictionary error: {0}")]
    Dictionary(#[from] DictionaryError),

    #[error("type error: {0}")]
    Type(#[from] TypeError),
}

impl CodecError {
    /// Identity or layout consistency violations, as opposed to problems
    /// confined to one record.
    pub fn is_consistency(&self) -> bool {
        match self {
            Self::Registry(_) => true,
            Self::Dictionary(e) => e.is_consistency(),
            _ => false,
        }
    }
}

pub type CodecResult<T> = Result<T, CodecError>;
