use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use stow_backup::BackupConfig;
use stow_net::NetworkConfig;
use stow_storage::StorageConfig;

use crate::error::{EngineError, EngineResult};

/// File name of the type dictionary inside the storage root.
pub const DICTIONARY_FILE_NAME: &str = "type-dictionary.jsonl";

/// Top-level engine configuration, usually read from `stow.toml`.
///
/// Every field has a default, so a partial file is valid.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Type dictionary location. Defaults to
    /// `<storage.root>/type-dictionary.jsonl`.
    pub dictionary_file: Option<PathBuf>,
    pub storage: StorageConfig,
    /// Mirror every channel into this backup. No backup when absent.
    pub backup: Option<BackupSettings>,
    /// Timeouts and limits of `stow serve`.
    pub network: NetworkConfig,
}

/// Where and how the continuous backup is kept.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSettings {
    pub directory: PathBuf,
    #[serde(default)]
    pub verify_copies: bool,
    #[serde(default)]
    pub keep_deleted: bool,
}

impl BackupSettings {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            verify_copies: false,
            keep_deleted: false,
        }
    }

    pub fn handler_config(&self) -> BackupConfig {
        BackupConfig {
            verify_copies: self.verify_copies,
            keep_deleted: self.keep_deleted,
        }
    }
}

impl EngineConfig {
    /// Configuration for a store rooted at `root` with `channel_count`
    /// channels and no backup.
    pub fn new(root: impl Into<PathBuf>, channel_count: u32) -> Self {
        Self {
            storage: StorageConfig::new(root, channel_count),
            ..Self::default()
        }
    }

    pub fn with_backup(mut self, backup: BackupSettings) -> Self {
        self.backup = Some(backup);
        self
    }

    pub fn load(path: &Path) -> EngineResult<Self> {
        let text = fs::read_to_string(path).map_err(|e| EngineError::Config {
            path: Some(path.to_path_buf()),
            reason: e.to_string(),
        })?;
        Self::parse(&text, Some(path))
    }

    pub fn from_toml_str(text: &str) -> EngineResult<Self> {
        Self::parse(text, None)
    }

    fn parse(text: &str, path: Option<&Path>) -> EngineResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| EngineError::Config {
            path: path.map(Path::to_path_buf),
            reason: e.to_string(),
        })?;
        config.storage.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> EngineResult<String> {
        toml::to_string_pretty(self).map_err(|e| EngineError::Config {
            path: None,
            reason: e.to_string(),
        })
    }

    pub fn dictionary_path(&self) -> PathBuf {
        self.dictionary_file
            .clone()
            .unwrap_or_else(|| self.storage.root.join(DICTIONARY_FILE_NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.dictionary_path(), PathBuf::from("storage").join(DICTIONARY_FILE_NAME));
        assert!(config.backup.is_none());
    }

    #[test]
    fn partial_file_overrides_selected_fields() {
        let config = EngineConfig::from_toml_str(
            r#"
            [storage]
            root = "/var/lib/stow"
            channel_count = 4

            [storage.file]
            max_file_size = 16777216

            [backup]
            directory = "/mnt/backup"
            verify_copies = true

            [network]
            timeout_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.storage.channel_count, 4);
        assert_eq!(config.storage.file.max_file_size, 16 * 1024 * 1024);
        assert_eq!(config.storage.file.minimum_use_ratio, 0.75);
        let backup = config.backup.unwrap();
        assert!(backup.verify_copies);
        assert!(!backup.keep_deleted);
        assert_eq!(config.network.timeout_ms, 250);
        assert_eq!(config.network.max_frame_size, NetworkConfig::default().max_frame_size);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = EngineConfig::from_toml_str("[storage]\nchannel_count = 0\n").unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)));
        let err = EngineConfig::from_toml_str("storage = 5").unwrap_err();
        assert!(matches!(err, EngineError::Config { path: None, .. }));
    }

    #[test]
    fn written_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stow.toml");
        let config = EngineConfig::new(dir.path().join("data"), 3).with_backup(BackupSettings::new("bak"));
        fs::write(&path, config.to_toml_string().unwrap()).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = EngineConfig::load(Path::new("/nonexistent/stow.toml")).unwrap_err();
        assert!(matches!(err, EngineError::Config { path: Some(_), .. }));
    }
}
