//! Versioned type dictionary for stowage.
//!
//! Every persistent layout gets a [`Tid`](stow_types::Tid). Layouts are never
//! edited: a schema change allocates a new TID and records a [`Migration`]
//! that rewrites values decoded under the old layout. The dictionary can be
//! backed by an append-only JSON-lines file so it survives restarts without
//! replaying any data.

pub mod dictionary;
pub mod error;
pub mod file;
pub mod migration;

pub use dictionary::{DecodePlan, TypeDictionary, TypeEntry};
pub use error::{DictionaryError, DictionaryResult};
pub use file::{DictionaryFile, DictionaryRecord};
pub use migration::{FieldSource, Migration};
