//! Foundation types for stowage.
//!
//! Every other stowage crate depends on `stow-types`. It defines the durable
//! identifiers, the schema vocabulary used by the type dictionary, and the
//! in-memory entity model that object graphs are built from.
//!
//! # Key Types
//!
//! - [`Oid`]: durable identity of one stored object instance
//! - [`Tid`]: durable identity of one persisted schema version
//! - [`TypeDescriptor`]: ordered field layout of a persistent type
//! - [`Entity`] / [`EntityRef`]: a runtime object instance
//! - [`Reference`]: resident or not-yet-loaded pointer to another entity
//! - [`ObjectLoader`]: materializes stub references on first access

pub mod entity;
pub mod error;
pub mod id;
pub mod schema;

pub use entity::{Entity, EntityRef, ObjectLoader, Reference, Value};
pub use error::TypeError;
pub use id::{Oid, Tid};
pub use schema::{ByteLength, EmbeddedKind, FieldDescriptor, FieldKind, PrimitiveKind, TypeDescriptor};
