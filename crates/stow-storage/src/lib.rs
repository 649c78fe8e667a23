//! Channel-partitioned record storage for stowage.
//!
//! The OID space is split into `channel_count` partitions by `oid % count`.
//! Each partition is owned by one [`StorageChannel`], running on its own
//! thread inside a [`StorageSystem`], with an exclusive directory of
//! append-only data files named `channel_<i>_<n>.dat`.
//!
//! # Data files
//!
//! A data file is a plain concatenation of binary records. Nothing else is
//! persisted: on startup every channel rebuilds its in-memory index by
//! walking the record headers, the last copy of an OID winning. A torn
//! record at the end of the newest file is truncated away.
//!
//! # Housekeeping
//!
//! Channels do their own maintenance in short time-budgeted slices:
//!
//! - the [`EntityCache`] evicts records by idle time and size pressure
//! - the [`FileEvaluator`] picks files whose live ratio has dropped too low;
//!   their live records are re-appended to the head file and the emptied
//!   file is deleted
//! - tombstones older than every remaining file are dropped
//!
//! A slice that runs out of time leaves its progress in place for the next.

pub mod cache;
pub mod channel;
pub mod config;
pub mod error;
pub mod file;
pub mod housekeeping;
pub mod index;
pub mod system;

pub use cache::EntityCache;
pub use channel::{ChannelState, ChannelStats, RecordView, StorageChannel};
pub use config::{EntityCacheConfig, FileEvaluatorConfig, HousekeepingConfig, StorageConfig};
pub use error::{StorageError, StorageResult};
pub use file::DataFile;
pub use housekeeping::{FileEvaluator, HousekeepingReport};
pub use index::{ChannelIndex, RecordLocation};
pub use system::StorageSystem;
