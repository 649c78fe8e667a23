use std::ops::AddAssign;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::FileEvaluatorConfig;
use crate::index::FileUsage;

/// Decides which files consolidation dissolves.
#[derive(Clone, Debug)]
pub struct FileEvaluator {
    config: FileEvaluatorConfig,
}

impl FileEvaluator {
    pub fn new(config: FileEvaluatorConfig) -> Self {
        Self { config }
    }

    /// Whether the head file has to be rotated before the next append.
    pub fn needs_rotation(&self, head_length: u64) -> bool {
        head_length >= self.config.max_file_size
    }

    /// Whether a file with `length` bytes and the given usage should be
    /// dissolved. The head file only qualifies if configured.
    pub fn needs_dissolving(&self, length: u64, usage: FileUsage, is_head: bool) -> bool {
        if is_head && !self.config.cleanup_head_file {
            return false;
        }
        if length == 0 {
            return false;
        }
        if usage.live_records == 0 {
            return true;
        }
        if length < self.config.min_file_size {
            return false;
        }
        (usage.live_bytes as f64 / length as f64) < self.config.minimum_use_ratio
    }
}

/// Deadline of one housekeeping slice.
#[derive(Clone, Copy, Debug)]
pub struct Budget {
    deadline: Instant,
}

impl Budget {
    pub fn new(time: Duration) -> Self {
        Self {
            deadline: Instant::now() + time,
        }
    }

    pub fn exhausted(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// Work done by one or more housekeeping slices.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HousekeepingReport {
    pub evicted_entries: usize,
    pub dissolved_files: usize,
    pub relocated_records: usize,
    pub relocated_bytes: u64,
    pub dropped_tombstones: usize,
    /// `false` if a slice ran out of budget with consolidation work left.
    pub completed: bool,
}

impl AddAssign for HousekeepingReport {
    fn add_assign(&mut self, other: Self) {
        self.evicted_entries += other.evicted_entries;
        self.dissolved_files += other.dissolved_files;
        self.relocated_records += other.relocated_records;
        self.relocated_bytes += other.relocated_bytes;
        self.dropped_tombstones += other.dropped_tombstones;
        self.completed &= other.completed;
    }
}

impl HousekeepingReport {
    /// Identity element for `+=`.
    pub fn empty() -> Self {
        Self {
            completed: true,
            ..Self::default()
        }
    }

    pub fn did_work(&self) -> bool {
        self.evicted_entries > 0 || self.dissolved_files > 0 || self.dropped_tombstones > 0
    }
}
