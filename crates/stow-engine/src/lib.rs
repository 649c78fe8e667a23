//! Embedded object-graph persistence.
//!
//! [`EmbeddedStorage`] ties the lower crates together: the identity
//! registry hands out OIDs, the type dictionary hands out TIDs, the codec
//! renders graphs into binary records, and the storage system appends
//! those records to per-channel files, mirrored into an optional backup.
//!
//! ```no_run
//! use std::sync::Arc;
//! use stow_engine::{EmbeddedStorage, EngineConfig};
//! use stow_types::{Entity, FieldDescriptor, PrimitiveKind, TypeDescriptor};
//!
//! let engine = EmbeddedStorage::start(EngineConfig::new("data", 4))?;
//! let layout = TypeDescriptor::new("Counter", vec![FieldDescriptor::primitive("value", PrimitiveKind::I64)])?;
//! let counter = Entity::with_defaults(Arc::new(layout));
//! counter.set("value", 42i64)?;
//! engine.set_root(&counter)?;
//! engine.shutdown();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod integrity;

pub use config::{BackupSettings, EngineConfig, DICTIONARY_FILE_NAME};
pub use engine::{EmbeddedStorage, EngineStats};
pub use error::{EngineError, EngineResult};
pub use handler::StoreGraphHandler;
pub use integrity::{IntegrityProblem, IntegrityReport};
