//! Backup subsystem for stowage.
//!
//! Each storage channel hands the [`BackupHandler`] every byte range it
//! appends. The handler copies exactly that range into a [`BlobStore`] and
//! checks that the backup file grew by exactly the copied length. Backup
//! files are never rewritten or reordered, so a converged backup is a
//! byte-identical copy of the channel's files.
//!
//! Length disagreements are reported, never repaired: a backup file longer
//! than its storage file means the live store lost data.

pub mod blob;
pub mod error;
pub mod handler;
pub mod inventory;
pub mod local;
pub mod memory;
pub mod report;

pub use blob::{BlobError, BlobResult, BlobStore};
pub use error::{BackupError, BackupResult};
pub use handler::{BackupConfig, BackupHandler, BackupSink};
pub use inventory::{channel_dir_name, data_file_name, parse_data_file_number, ChannelInventory, InventoryFile};
pub use local::LocalBlobStore;
pub use memory::InMemoryBlobStore;
pub use report::{ChannelProblem, DisruptionReport, FileMismatch, SyncReport, VerifyReport};
