use std::fmt;

use crate::error::BackupError;

/// A problem found on one channel during a backup pass.
#[derive(Debug)]
pub struct ChannelProblem {
    pub channel: u32,
    pub error: BackupError,
}

/// Problems collected across all channels during one pass.
///
/// A pass keeps going after a channel fails, so one report may carry
/// problems from several channels.
#[derive(Debug, Default)]
pub struct DisruptionReport {
    pub problems: Vec<ChannelProblem>,
}

impl DisruptionReport {
    pub fn push(&mut self, channel: u32, error: BackupError) {
        self.problems.push(ChannelProblem { channel, error });
    }

    pub fn is_empty(&self) -> bool {
        self.problems.is_empty()
    }

    pub fn channels(&self) -> Vec<u32> {
        let mut channels: Vec<u32> = self.problems.iter().map(|p| p.channel).collect();
        channels.dedup();
        channels
    }
}

impl fmt::Display for DisruptionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} backup problem(s)", self.problems.len())?;
        for problem in &self.problems {
            write!(f, "; channel {}: {}", problem.channel, problem.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for DisruptionReport {}

/// Outcome of synchronizing one channel.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub channel: u32,
    pub files_copied: usize,
    pub bytes_copied: u64,
    pub files_retired: usize,
}

/// A file whose backup does not match storage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileMismatch {
    pub number: u64,
    pub storage_length: u64,
    pub backup_length: Option<u64>,
}

/// Outcome of comparing one channel's storage and backup by digest.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub channel: u32,
    pub matched: Vec<u64>,
    pub mismatched: Vec<FileMismatch>,
    /// Backup files with no storage counterpart.
    pub orphaned: Vec<String>,
}

impl VerifyReport {
    pub fn is_converged(&self) -> bool {
        self.mismatched.is_empty() && self.orphaned.is_empty()
    }
}
