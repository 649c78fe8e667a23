//! Identity registry ("swizzling") for stowage.
//!
//! Maps live [`Entity`](stow_types::Entity) handles to durable
//! [`Oid`](stow_types::Oid)s and back. One registry is shared by every
//! storage channel of an engine instance; it is constructed by the engine
//! and passed in, never reached through a global.

pub mod error;
pub mod registry;

pub use error::{RegistryError, RegistryResult};
pub use registry::{ObjectRegistry, RegistryStats, Resolution};
