use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::blob::{BlobError, BlobStore};
use crate::error::{BackupError, BackupResult};
use crate::inventory::{backup_key, channel_dir_name, parse_data_file_number, ChannelInventory, InventoryFile};
use crate::report::{FileMismatch, SyncReport, VerifyReport};

const DELETED_PREFIX: &str = "deleted";

/// Receives every change a channel makes to its files.
///
/// Storage calls into the sink from its channel threads; calls for the same
/// channel are never concurrent.
pub trait BackupSink: Send + Sync {
    /// Bring the channel's backup in line with `inventory` at startup.
    fn synchronize(&self, inventory: &ChannelInventory) -> BackupResult<SyncReport>;

    /// Mirror `length` bytes appended to `file` at `position`.
    fn copy_file_part(&self, file: &InventoryFile, position: u64, length: u64) -> BackupResult<()>;

    /// Mirror the deletion of a dissolved file.
    fn delete_file(&self, file: &InventoryFile) -> BackupResult<()>;

    /// Compare every file of the channel with its backup copy by digest.
    fn verify(&self, inventory: &ChannelInventory) -> BackupResult<VerifyReport>;
}

/// Backup behaviour knobs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Read each copied range back and compare checksums.
    pub verify_copies: bool,
    /// Move deleted backup files under `deleted/` instead of removing them.
    pub keep_deleted: bool,
}

/// Mirrors channel files into a [`BlobStore`] under the same relative
/// names storage uses.
pub struct BackupHandler {
    store: Arc<dyn BlobStore>,
    config: BackupConfig,
}

struct BackupFile {
    number: u64,
    key: String,
    length: u64,
}

impl BackupHandler {
    pub fn new(store: Arc<dyn BlobStore>, config: BackupConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    fn list_backup_files(&self, channel: u32) -> BackupResult<Vec<BackupFile>> {
        let prefix = format!("{}/", channel_dir_name(channel));
        let mut files = Vec::new();
        for key in self.store.list(&prefix)? {
            let name = &key[prefix.len()..];
            let Some(number) = parse_data_file_number(channel, name) else {
                continue;
            };
            let length = self.store.len(&key)?.unwrap_or(0);
            files.push(BackupFile { number, key, length });
        }
        files.sort_by_key(|f| f.number);
        Ok(files)
    }

    fn retire(&self, key: &str) -> BackupResult<()> {
        if self.config.keep_deleted {
            let stamp = chrono::Utc::now().format("%Y-%m-%d_%H-%M-%S_%3f");
            let target = format!("{DELETED_PREFIX}/{key}_{stamp}");
            self.store.copy(key, &target)?;
            info!(from = key, to = %target, "backup file moved to deleted area");
        }
        self.store.delete(key)?;
        debug!(key, "backup file retired");
        Ok(())
    }

    fn copy_range(&self, file: &InventoryFile, key: &str, position: u64, length: u64) -> Result<(), BlobError> {
        let mut source = File::open(&file.path)?;
        source.seek(SeekFrom::Start(position))?;
        let mut bytes = vec![0u8; length as usize];
        source.read_exact(&mut bytes)?;
        self.store.write_range(key, position, &bytes)
    }

    fn check_copy(&self, file: &InventoryFile, key: &str, position: u64, length: u64) -> BackupResult<()> {
        let expected = position + length;
        let actual = self.store.len(key)?.unwrap_or(0);
        if actual != expected {
            return Err(BackupError::InconsistentLength {
                channel: file.channel,
                storage_file: file.path.clone(),
                storage_length: expected,
                backup_file: key.to_string(),
                backup_length: actual,
            });
        }
        if self.config.verify_copies {
            let mut source = File::open(&file.path)?;
            source.seek(SeekFrom::Start(position))?;
            let mut local = vec![0u8; length as usize];
            source.read_exact(&mut local)?;
            let remote = self.store.read_range(key, position, length)?;
            if crc32fast::hash(&local) != crc32fast::hash(&remote) {
                return Err(BackupError::ChecksumMismatch {
                    channel: file.channel,
                    backup_file: key.to_string(),
                    position,
                    length,
                });
            }
        }
        Ok(())
    }
}

impl BackupSink for BackupHandler {
    fn synchronize(&self, inventory: &ChannelInventory) -> BackupResult<SyncReport> {
        let channel = inventory.channel;
        let backups = self.list_backup_files(channel)?;
        let mut report = SyncReport {
            channel,
            ..SyncReport::default()
        };

        let Some(last_storage) = inventory.last_number() else {
            if backups.is_empty() {
                return Ok(report);
            }
            return Err(BackupError::EmptyStorageForNonEmptyBackup {
                channel,
                backup_files: backups.len(),
            });
        };

        let last_backup = backups.last().map(|b| b.number);
        if let Some(last_backup) = last_backup {
            if last_backup > last_storage {
                return Err(BackupError::BackupAhead {
                    channel,
                    last_storage_file: last_storage,
                    last_backup_file: last_backup,
                });
            }
        }

        // Validate everything before touching the backup.
        let mut copies = Vec::new();
        for file in &inventory.files {
            match backups.iter().find(|b| b.number == file.number) {
                None => copies.push((file, 0, file.length)),
                Some(b) if b.length == file.length => {}
                Some(b) if b.length < file.length && Some(b.number) == last_backup => {
                    copies.push((file, b.length, file.length - b.length));
                }
                Some(b) => {
                    return Err(BackupError::InconsistentLength {
                        channel,
                        storage_file: file.path.clone(),
                        storage_length: file.length,
                        backup_file: b.key.clone(),
                        backup_length: b.length,
                    });
                }
            }
        }

        for backup in &backups {
            if inventory.get(backup.number).is_none() {
                self.retire(&backup.key)?;
                report.files_retired += 1;
            }
        }

        for (file, position, length) in copies {
            self.copy_file_part(file, position, length)?;
            report.files_copied += 1;
            report.bytes_copied += length;
        }

        if report.files_copied > 0 || report.files_retired > 0 {
            info!(
                channel,
                files_copied = report.files_copied,
                bytes_copied = report.bytes_copied,
                files_retired = report.files_retired,
                "backup synchronized"
            );
        }
        Ok(report)
    }

    fn copy_file_part(&self, file: &InventoryFile, position: u64, length: u64) -> BackupResult<()> {
        let key = file.backup_key();
        let current = self.store.len(&key)?.unwrap_or(0);
        if current != position {
            return Err(BackupError::InconsistentLength {
                channel: file.channel,
                storage_file: file.path.clone(),
                storage_length: position,
                backup_file: key,
                backup_length: current,
            });
        }

        if let Err(source) = self.copy_range(file, &key, position, length) {
            warn!(channel = file.channel, key = %key, position, length, error = %source, "backup copy failed");
            return Err(BackupError::Copying {
                channel: file.channel,
                storage_file: file.path.clone(),
                backup_file: key,
                position,
                length,
                source,
            });
        }

        self.check_copy(file, &key, position, length)?;
        debug!(channel = file.channel, key = %key, position, length, "backup range copied");
        Ok(())
    }

    fn delete_file(&self, file: &InventoryFile) -> BackupResult<()> {
        let key = backup_key(file.channel, file.number);
        if self.store.len(&key)?.is_none() {
            return Ok(());
        }
        self.retire(&key)
    }

    fn verify(&self, inventory: &ChannelInventory) -> BackupResult<VerifyReport> {
        let channel = inventory.channel;
        let mut report = VerifyReport {
            channel,
            ..VerifyReport::default()
        };

        for file in &inventory.files {
            let key = file.backup_key();
            let backup_length = self.store.len(&key)?;
            let matches = match backup_length {
                Some(len) if len == file.length => {
                    let local = digest_file(file)?;
                    let remote = blake3::hash(&self.store.read_all(&key)?);
                    local == remote
                }
                _ => false,
            };
            if matches {
                report.matched.push(file.number);
            } else {
                report.mismatched.push(FileMismatch {
                    number: file.number,
                    storage_length: file.length,
                    backup_length,
                });
            }
        }

        for backup in self.list_backup_files(channel)? {
            if inventory.get(backup.number).is_none() {
                report.orphaned.push(backup.key);
            }
        }

        debug!(
            channel,
            matched = report.matched.len(),
            mismatched = report.mismatched.len(),
            orphaned = report.orphaned.len(),
            "backup verified"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for BackupHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupHandler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn digest_file(file: &InventoryFile) -> io::Result<blake3::Hash> {
    let mut source = File::open(&file.path)?.take(file.length);
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut source, &mut hasher)?;
    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Write;
    use std::path::Path;

    use super::*;
    use crate::inventory::data_file_name;
    use crate::memory::InMemoryBlobStore;

    fn write_file(dir: &Path, channel: u32, number: u64, bytes: &[u8]) -> InventoryFile {
        let path = dir.join(data_file_name(channel, number));
        fs::write(&path, bytes).unwrap();
        InventoryFile {
            channel,
            number,
            path,
            length: bytes.len() as u64,
        }
    }

    fn append(file: &mut InventoryFile, bytes: &[u8]) -> u64 {
        let mut f = fs::OpenOptions::new().append(true).open(&file.path).unwrap();
        f.write_all(bytes).unwrap();
        let position = file.length;
        file.length += bytes.len() as u64;
        position
    }

    fn handler(store: &Arc<InMemoryBlobStore>, config: BackupConfig) -> BackupHandler {
        BackupHandler::new(store.clone() as Arc<dyn BlobStore>, config)
    }

    // ------------------------------------------------------------------
    // Synchronize
    // ------------------------------------------------------------------

    #[test]
    fn empty_backup_gets_full_copy() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryBlobStore::new());
        let backup = handler(&store, BackupConfig::default());
        let f1 = write_file(dir.path(), 0, 1, b"first file");
        let f2 = write_file(dir.path(), 0, 2, b"second");
        let inv = ChannelInventory::new(0, vec![f1, f2]);

        let report = backup.synchronize(&inv).unwrap();
        assert_eq!(report.files_copied, 2);
        assert_eq!(report.bytes_copied, 16);
        assert_eq!(store.get("channel_0/channel_0_2.dat").unwrap(), b"second");
        assert!(backup.verify(&inv).unwrap().is_converged());
    }

    #[test]
    fn shorter_head_backup_gets_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryBlobStore::new());
        let backup = handler(&store, BackupConfig::default());
        let f1 = write_file(dir.path(), 0, 1, b"0123456789");
        store.insert("channel_0/channel_0_1.dat", b"01234".to_vec());

        let report = backup.synchronize(&ChannelInventory::new(0, vec![f1])).unwrap();
        assert_eq!(report.bytes_copied, 5);
        assert_eq!(store.get("channel_0/channel_0_1.dat").unwrap(), b"0123456789");
    }

    #[test]
    fn shorter_older_backup_is_inconsistent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryBlobStore::new());
        let backup = handler(&store, BackupConfig::default());
        let f1 = write_file(dir.path(), 0, 1, b"0123456789");
        let f2 = write_file(dir.path(), 0, 2, b"abc");
        store.insert("channel_0/channel_0_1.dat", b"01234".to_vec());
        store.insert("channel_0/channel_0_2.dat", b"abc".to_vec());

        let err = backup
            .synchronize(&ChannelInventory::new(0, vec![f1, f2]))
            .unwrap_err();
        assert!(matches!(
            err,
            BackupError::InconsistentLength { storage_length: 10, backup_length: 5, .. }
        ));
        // nothing was repaired
        assert_eq!(store.get("channel_0/channel_0_1.dat").unwrap(), b"01234");
    }

    #[test]
    fn longer_backup_is_inconsistent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryBlobStore::new());
        let backup = handler(&store, BackupConfig::default());
        let f1 = write_file(dir.path(), 0, 1, b"short");
        store.insert("channel_0/channel_0_1.dat", b"short and longer".to_vec());

        let err = backup
            .synchronize(&ChannelInventory::new(0, vec![f1]))
            .unwrap_err();
        assert!(matches!(err, BackupError::InconsistentLength { .. }));
    }

    #[test]
    fn empty_storage_with_backup_files_is_rejected() {
        let store = Arc::new(InMemoryBlobStore::new());
        let backup = handler(&store, BackupConfig::default());
        store.insert("channel_3/channel_3_1.dat", b"x".to_vec());
        let err = backup
            .synchronize(&ChannelInventory::new(3, vec![]))
            .unwrap_err();
        assert!(matches!(
            err,
            BackupError::EmptyStorageForNonEmptyBackup { channel: 3, backup_files: 1 }
        ));
    }

    #[test]
    fn backup_ahead_of_storage_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryBlobStore::new());
        let backup = handler(&store, BackupConfig::default());
        let f1 = write_file(dir.path(), 0, 1, b"x");
        store.insert("channel_0/channel_0_1.dat", b"x".to_vec());
        store.insert("channel_0/channel_0_4.dat", b"y".to_vec());
        let err = backup
            .synchronize(&ChannelInventory::new(0, vec![f1]))
            .unwrap_err();
        assert!(matches!(
            err,
            BackupError::BackupAhead { last_storage_file: 1, last_backup_file: 4, .. }
        ));
    }

    #[test]
    fn dissolved_files_are_retired() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryBlobStore::new());
        let backup = handler(
            &store,
            BackupConfig {
                keep_deleted: true,
                ..BackupConfig::default()
            },
        );
        let f2 = write_file(dir.path(), 0, 2, b"live");
        store.insert("channel_0/channel_0_1.dat", b"gone".to_vec());
        store.insert("channel_0/channel_0_2.dat", b"live".to_vec());

        let report = backup.synchronize(&ChannelInventory::new(0, vec![f2])).unwrap();
        assert_eq!(report.files_retired, 1);
        assert!(store.get("channel_0/channel_0_1.dat").is_none());
        let kept = store.list("deleted/channel_0/").unwrap();
        assert_eq!(kept.len(), 1);
        assert!(kept[0].starts_with("deleted/channel_0/channel_0_1.dat_"));
    }

    // ------------------------------------------------------------------
    // Appends
    // ------------------------------------------------------------------

    #[test]
    fn appends_are_mirrored_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryBlobStore::new());
        let backup = handler(
            &store,
            BackupConfig {
                verify_copies: true,
                ..BackupConfig::default()
            },
        );
        let mut f1 = write_file(dir.path(), 1, 1, b"");
        for chunk in [&b"alpha"[..], b"beta", b"gamma"] {
            let position = append(&mut f1, chunk);
            backup.copy_file_part(&f1, position, chunk.len() as u64).unwrap();
        }
        assert_eq!(store.get("channel_1/channel_1_1.dat").unwrap(), b"alphabetagamma");
    }

    #[test]
    fn append_at_wrong_position_is_inconsistent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryBlobStore::new());
        let backup = handler(&store, BackupConfig::default());
        let mut f1 = write_file(dir.path(), 0, 1, b"");
        append(&mut f1, b"abc");
        let position = append(&mut f1, b"def");
        let err = backup.copy_file_part(&f1, position, 3).unwrap_err();
        assert!(matches!(
            err,
            BackupError::InconsistentLength { storage_length: 3, backup_length: 0, .. }
        ));
    }

    #[test]
    fn interrupted_copy_resumes_on_next_synchronize() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryBlobStore::new());
        let backup = handler(&store, BackupConfig::default());
        let f1 = write_file(dir.path(), 0, 1, &[7u8; 64]);
        let f2 = write_file(dir.path(), 0, 2, &[9u8; 64]);
        let inv = ChannelInventory::new(0, vec![f1, f2]);

        store.set_write_budget(Some(80));
        let err = backup.synchronize(&inv).unwrap_err();
        assert!(matches!(err, BackupError::Copying { .. }));
        assert_eq!(store.len("channel_0/channel_0_2.dat").unwrap(), Some(16));

        store.set_write_budget(None);
        let report = backup.synchronize(&inv).unwrap();
        assert_eq!(report.bytes_copied, 48);
        assert!(backup.verify(&inv).unwrap().is_converged());
    }

    #[test]
    fn delete_file_without_backup_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryBlobStore::new());
        let backup = handler(&store, BackupConfig::default());
        let f1 = write_file(dir.path(), 0, 1, b"x");
        backup.delete_file(&f1).unwrap();
        backup.copy_file_part(&f1, 0, 1).unwrap();
        backup.delete_file(&f1).unwrap();
        assert_eq!(store.blob_count(), 0);
    }

    // ------------------------------------------------------------------
    // Verify
    // ------------------------------------------------------------------

    #[test]
    fn verify_flags_divergent_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryBlobStore::new());
        let backup = handler(&store, BackupConfig::default());
        let f1 = write_file(dir.path(), 0, 1, b"abcd");
        store.insert("channel_0/channel_0_1.dat", b"abce".to_vec());
        store.insert("channel_0/channel_0_7.dat", b"stray".to_vec());

        let report = backup.verify(&ChannelInventory::new(0, vec![f1])).unwrap();
        assert!(!report.is_converged());
        assert_eq!(report.mismatched.len(), 1);
        assert_eq!(report.mismatched[0].backup_length, Some(4));
        assert_eq!(report.orphaned, vec!["channel_0/channel_0_7.dat".to_string()]);
    }
}
