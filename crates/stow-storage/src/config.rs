use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// Storage layout and housekeeping settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one `channel_<i>` subdirectory per channel.
    pub root: PathBuf,
    /// Number of channels; OIDs are partitioned by `oid % channel_count`.
    pub channel_count: u32,
    /// `fsync` the head file after every append.
    pub sync_writes: bool,
    pub file: FileEvaluatorConfig,
    pub entity_cache: EntityCacheConfig,
    pub housekeeping: HousekeepingConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("storage"),
            channel_count: 1,
            sync_writes: true,
            file: FileEvaluatorConfig::default(),
            entity_cache: EntityCacheConfig::default(),
            housekeeping: HousekeepingConfig::default(),
        }
    }
}

impl StorageConfig {
    pub fn new(root: impl Into<PathBuf>, channel_count: u32) -> Self {
        Self {
            root: root.into(),
            channel_count,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.channel_count == 0 {
            return Err(StorageError::InvalidConfig(
                "channel_count must be at least 1".into(),
            ));
        }
        if self.file.min_file_size > self.file.max_file_size {
            return Err(StorageError::InvalidConfig(format!(
                "min_file_size {} exceeds max_file_size {}",
                self.file.min_file_size, self.file.max_file_size
            )));
        }
        if !(0.0..=1.0).contains(&self.file.minimum_use_ratio) {
            return Err(StorageError::InvalidConfig(format!(
                "minimum_use_ratio {} is outside 0..=1",
                self.file.minimum_use_ratio
            )));
        }
        Ok(())
    }
}

/// When a storage file is rotated or dissolved.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileEvaluatorConfig {
    /// Files smaller than this are only dissolved once they hold no live data.
    pub min_file_size: u64,
    /// The head file is rotated once it reaches this size.
    pub max_file_size: u64,
    /// Files whose live/total ratio falls below this are dissolved.
    pub minimum_use_ratio: f64,
    /// Let consolidation dissolve the head file too.
    pub cleanup_head_file: bool,
}

impl Default for FileEvaluatorConfig {
    fn default() -> Self {
        Self {
            min_file_size: 1024 * 1024,     // 1 MiB
            max_file_size: 8 * 1024 * 1024, // 8 MiB
            minimum_use_ratio: 0.75,
            cleanup_head_file: false,
        }
    }
}

/// Record cache eviction policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityCacheConfig {
    /// Entries idle this long are always evicted.
    pub timeout_ms: u64,
    /// Soft cap on cached bytes per channel.
    pub threshold: u64,
}

impl Default for EntityCacheConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 86_400_000, // 1 day
            threshold: 1_000_000_000,
        }
    }
}

/// How often, and for how long, channels run housekeeping.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HousekeepingConfig {
    pub interval_ms: u64,
    /// Time budget of one housekeeping slice, in nanoseconds.
    pub time_budget_ns: u64,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            time_budget_ns: 10_000_000, // 10 ms
        }
    }
}

impl HousekeepingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn time_budget(&self) -> Duration {
        Duration::from_nanos(self.time_budget_ns)
    }
}
