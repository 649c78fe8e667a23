use stow_types::{Oid, Tid};
use thiserror::Error;

/// Identity consistency violations. None of these are retryable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("oid {oid} is already bound to a different live object")]
    OidRebound { oid: Oid },

    #[error("object is already bound to oid {bound}, cannot rebind it to oid {requested}")]
    EntityRebound { bound: Oid, requested: Oid },

    #[error("oid {oid} is registered with type id {registered}, record declares {declared}")]
    TidMismatch {
        oid: Oid,
        registered: Tid,
        declared: Tid,
    },

    #[error("oid {oid} is reserved and cannot be bound to an application object")]
    ReservedOid { oid: Oid },

    #[error("object id space exhausted")]
    OidExhausted,
}

pub type RegistryResult<T> = Result<T, RegistryError>;
