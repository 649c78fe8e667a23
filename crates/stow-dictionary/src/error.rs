use std::io;
use std::path::PathBuf;

use stow_types::{Tid, TypeDescriptor};

/// Errors produced by the type dictionary.
#[derive(Debug, thiserror::Error)]
pub enum DictionaryError {
    /// No layout is registered under this TID.
    #[error("unknown type id {0}")]
    UnknownTypeId(Tid),

    /// A record's TID is not current and no migration chain leads forward.
    #[error("no migration path from type id {from} to current type id {to}")]
    NoMigrationPath { from: Tid, to: Tid },

    /// A migrated field cannot be converted to its new kind.
    #[error("type id {from} -> {to}: field `{source_field}` cannot be converted into `{field}`")]
    IncompatibleField {
        from: Tid,
        to: Tid,
        field: String,
        source_field: String,
    },

    /// A migration names a field the old layout does not have.
    #[error("type id {from} has no field `{field}` to migrate from")]
    UnknownSourceField { from: Tid, field: String },

    #[error("type id {tid} describes `{expected}`, cannot evolve it into `{actual}`")]
    TypeNameMismatch {
        tid: Tid,
        expected: String,
        actual: String,
    },

    #[error("type id {from} already migrates to {to}")]
    MigrationExists { from: Tid, to: Tid },

    /// The same TID is known with two different layouts.
    #[error("type id {tid} is `{}` locally but `{}` in the incoming dictionary", .existing.name(), .incoming.name())]
    LayoutConflict {
        tid: Tid,
        existing: Box<TypeDescriptor>,
        incoming: Box<TypeDescriptor>,
    },

    #[error("corrupt dictionary file {path:?} at line {line}: {reason}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl DictionaryError {
    /// Consistency violations indicate corruption or a bug, never a
    /// per-record schema problem.
    pub fn is_consistency(&self) -> bool {
        matches!(self, Self::LayoutConflict { .. })
    }
}

pub type DictionaryResult<T> = Result<T, DictionaryError>;
