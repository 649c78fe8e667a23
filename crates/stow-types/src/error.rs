use thiserror::Error;

/// Errors produced by schema and entity operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("type `{type_name}` declares field `{field}` more than once")]
    DuplicateField { type_name: String, field: String },

    #[error("type `{type_name}` has no field `{field}`")]
    UnknownField { type_name: String, field: String },

    #[error("type `{type_name}` expects {expected} values, got {actual}")]
    ArityMismatch {
        type_name: String,
        expected: usize,
        actual: usize,
    },

    #[error("field `{type_name}.{field}` expects {expected}, got {actual}")]
    FieldKindMismatch {
        type_name: String,
        field: String,
        expected: String,
        actual: String,
    },
}
