use std::collections::BTreeMap;
use std::fs;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use stow_backup::{BackupError, BackupSink, DisruptionReport, SyncReport, VerifyReport};
use stow_codec::BinaryRecord;
use stow_types::Oid;
use tracing::{debug, info, warn};

use crate::channel::{ChannelStats, RecordView, StorageChannel};
use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use crate::housekeeping::HousekeepingReport;

type Reply<T> = Sender<T>;

enum Request {
    Store {
        records: Vec<BinaryRecord>,
        reply: Reply<StorageResult<()>>,
    },
    Load {
        oid: Oid,
        reply: Reply<StorageResult<Option<Arc<BinaryRecord>>>>,
    },
    Delete {
        oids: Vec<Oid>,
        reply: Reply<StorageResult<usize>>,
    },
    Housekeeping {
        budget: Duration,
        reply: Reply<StorageResult<HousekeepingReport>>,
    },
    SyncBackup {
        sink: Option<Arc<dyn BackupSink>>,
        reply: Reply<Result<SyncReport, Vec<BackupError>>>,
    },
    VerifyBackup {
        reply: Reply<StorageResult<Option<VerifyReport>>>,
    },
    Stats {
        reply: Reply<ChannelStats>,
    },
    Records {
        reply: Reply<StorageResult<Vec<RecordView>>>,
    },
    LiveOids {
        reply: Reply<Vec<Oid>>,
    },
    Shutdown {
        reply: Reply<StorageResult<()>>,
    },
}

struct ChannelHandle {
    sender: Sender<Request>,
    thread: Option<JoinHandle<()>>,
}

/// Runs every channel on its own thread and routes requests by OID.
pub struct StorageSystem {
    config: Arc<StorageConfig>,
    channels: Vec<ChannelHandle>,
}

impl StorageSystem {
    /// Open all channels, each rebuilding its index on its own thread.
    pub fn start(config: StorageConfig, backup: Option<Arc<dyn BackupSink>>) -> StorageResult<Self> {
        config.validate()?;
        fs::create_dir_all(&config.root)?;
        let config = Arc::new(config);

        let mut pending = Vec::new();
        for channel in 0..config.channel_count {
            let (sender, receiver) = mpsc::channel();
            let (ready_tx, ready_rx) = mpsc::channel();
            let cfg = Arc::clone(&config);
            let sink = backup.clone();
            let thread = thread::Builder::new()
                .name(format!("stow-channel-{channel}"))
                .spawn(move || match StorageChannel::open(channel, Arc::clone(&cfg), sink) {
                    Ok(ch) => {
                        let _ = ready_tx.send(Ok(()));
                        run_channel(ch, receiver, &cfg);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                })?;
            pending.push((
                ChannelHandle {
                    sender,
                    thread: Some(thread),
                },
                ready_rx,
            ));
        }

        let mut channels = Vec::with_capacity(pending.len());
        let mut failure = None;
        for (index, (handle, ready)) in pending.into_iter().enumerate() {
            let outcome = ready.recv().unwrap_or(Err(StorageError::ChannelStopped {
                channel: index as u32,
            }));
            if let Err(e) = outcome {
                failure.get_or_insert(e);
            }
            channels.push(handle);
        }

        let mut system = Self { config, channels };
        if let Some(e) = failure {
            system.shutdown();
            return Err(e);
        }
        info!(
            root = %system.config.root.display(),
            channels = system.config.channel_count,
            "storage system started"
        );
        Ok(system)
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn channel_count(&self) -> u32 {
        self.config.channel_count
    }

    fn handle(&self, channel: u32) -> StorageResult<&ChannelHandle> {
        self.channels
            .get(channel as usize)
            .ok_or(StorageError::ChannelStopped { channel })
    }

    fn ask<T>(&self, channel: u32, make: impl FnOnce(Reply<T>) -> Request) -> StorageResult<Receiver<T>> {
        let (tx, rx) = mpsc::channel();
        self.handle(channel)?
            .sender
            .send(make(tx))
            .map_err(|_| StorageError::ChannelStopped { channel })?;
        Ok(rx)
    }

    fn wait<T>(channel: u32, rx: Receiver<T>) -> StorageResult<T> {
        rx.recv().map_err(|_| StorageError::ChannelStopped { channel })
    }

    fn call<T>(&self, channel: u32, make: impl FnOnce(Reply<T>) -> Request) -> StorageResult<T> {
        Self::wait(channel, self.ask(channel, make)?)
    }

    /// Store records, fanned out to their channels in parallel.
    ///
    /// Each channel applies its share atomically; there is no atomicity
    /// across channels. The first error is returned after all channels
    /// have answered.
    pub fn store(&self, records: Vec<BinaryRecord>) -> StorageResult<()> {
        let mut by_channel: BTreeMap<u32, Vec<BinaryRecord>> = BTreeMap::new();
        for record in records {
            by_channel
                .entry(record.oid.channel(self.channel_count()))
                .or_default()
                .push(record);
        }

        let mut waiting = Vec::new();
        for (channel, records) in by_channel {
            waiting.push((channel, self.ask(channel, |reply| Request::Store { records, reply })?));
        }
        let mut first_error = None;
        for (channel, rx) in waiting {
            if let Err(e) = Self::wait(channel, rx).and_then(|r| r) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn load(&self, oid: Oid) -> StorageResult<Option<Arc<BinaryRecord>>> {
        let channel = oid.channel(self.channel_count());
        self.call(channel, |reply| Request::Load { oid, reply })?
    }

    /// Delete OIDs; returns how many were live.
    pub fn delete(&self, oids: &[Oid]) -> StorageResult<usize> {
        let mut by_channel: BTreeMap<u32, Vec<Oid>> = BTreeMap::new();
        for &oid in oids {
            by_channel.entry(oid.channel(self.channel_count())).or_default().push(oid);
        }
        let mut deleted = 0;
        for (channel, oids) in by_channel {
            deleted += self.call(channel, |reply| Request::Delete { oids, reply })??;
        }
        Ok(deleted)
    }

    /// Run one housekeeping slice on every channel now.
    pub fn issue_housekeeping(&self, budget: Duration) -> StorageResult<HousekeepingReport> {
        let mut waiting = Vec::new();
        for channel in 0..self.channel_count() {
            waiting.push((channel, self.ask(channel, |reply| Request::Housekeeping { budget, reply })?));
        }
        let mut total = HousekeepingReport::empty();
        for (channel, rx) in waiting {
            total += Self::wait(channel, rx)??;
        }
        Ok(total)
    }

    /// Synchronize every channel with its backup, or with `sink` instead.
    /// Problems from all channels are collected into one report.
    pub fn backup_pass(&self, sink: Option<Arc<dyn BackupSink>>) -> Result<Vec<SyncReport>, DisruptionReport> {
        let mut report = DisruptionReport::default();
        let mut waiting = Vec::new();
        for channel in 0..self.channel_count() {
            let sink = sink.clone();
            match self.ask(channel, |reply| Request::SyncBackup { sink, reply }) {
                Ok(rx) => waiting.push((channel, rx)),
                Err(e) => report.push(channel, BackupError::Io(std::io::Error::other(e.to_string()))),
            }
        }

        let mut synced = Vec::new();
        for (channel, rx) in waiting {
            match rx.recv() {
                Ok(Ok(sync)) => synced.push(sync),
                Ok(Err(problems)) => {
                    for problem in problems {
                        report.push(channel, problem);
                    }
                }
                Err(_) => report.push(
                    channel,
                    BackupError::Io(std::io::Error::other(format!("channel {channel} is not running"))),
                ),
            }
        }

        if report.is_empty() {
            debug!(channels = synced.len(), "backup pass finished");
            Ok(synced)
        } else {
            warn!(problems = report.problems.len(), "backup pass disrupted");
            Err(report)
        }
    }

    /// Compare every channel's files with the backup. Empty when no backup
    /// is configured.
    pub fn verify_backup(&self) -> StorageResult<Vec<VerifyReport>> {
        let mut reports = Vec::new();
        for channel in 0..self.channel_count() {
            if let Some(report) = self.call(channel, |reply| Request::VerifyBackup { reply })?? {
                reports.push(report);
            }
        }
        Ok(reports)
    }

    pub fn stats(&self) -> StorageResult<Vec<ChannelStats>> {
        (0..self.channel_count())
            .map(|channel| self.call(channel, |reply| Request::Stats { reply }))
            .collect()
    }

    /// Highest OID found in any channel, deleted ones included.
    pub fn highest_oid(&self) -> StorageResult<Option<Oid>> {
        Ok(self.stats()?.iter().filter_map(|s| s.highest_oid).max())
    }

    pub fn records(&self, channel: u32) -> StorageResult<Vec<RecordView>> {
        self.call(channel, |reply| Request::Records { reply })?
    }

    pub fn live_oids(&self) -> StorageResult<Vec<Oid>> {
        let mut oids = Vec::new();
        for channel in 0..self.channel_count() {
            oids.extend(self.call(channel, |reply| Request::LiveOids { reply })?);
        }
        oids.sort();
        Ok(oids)
    }

    /// Stop every channel and join its thread. Idempotent.
    pub fn shutdown(&mut self) {
        for (index, handle) in self.channels.iter_mut().enumerate() {
            let Some(thread) = handle.thread.take() else {
                continue;
            };
            let (tx, rx) = mpsc::channel();
            if handle.sender.send(Request::Shutdown { reply: tx }).is_ok() {
                if let Ok(Err(e)) = rx.recv() {
                    warn!(channel = index, error = %e, "channel shutdown failed");
                }
            }
            if thread.join().is_err() {
                warn!(channel = index, "channel thread panicked");
            }
        }
    }
}

impl Drop for StorageSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for StorageSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageSystem")
            .field("root", &self.config.root)
            .field("channels", &self.config.channel_count)
            .finish()
    }
}

/// Channel worker loop: serve requests, and run a housekeeping slice
/// whenever the interval has passed.
fn run_channel(mut channel: StorageChannel, requests: Receiver<Request>, config: &StorageConfig) {
    let interval = config.housekeeping.interval();
    let budget = config.housekeeping.time_budget();
    let mut last_housekeeping = Instant::now();

    loop {
        if last_housekeeping.elapsed() >= interval {
            if let Err(e) = channel.housekeeping(budget) {
                warn!(channel = channel.channel(), error = %e, "housekeeping failed");
            }
            last_housekeeping = Instant::now();
        }

        let wait = interval.saturating_sub(last_housekeeping.elapsed());
        let request = match requests.recv_timeout(wait) {
            Ok(request) => request,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                let _ = channel.shutdown();
                return;
            }
        };

        // Replies are dropped silently if the caller went away.
        match request {
            Request::Store { records, reply } => {
                let _ = reply.send(channel.store(records));
            }
            Request::Load { oid, reply } => {
                let _ = reply.send(channel.load(oid));
            }
            Request::Delete { oids, reply } => {
                let _ = reply.send(channel.delete(&oids));
            }
            Request::Housekeeping { budget, reply } => {
                let _ = reply.send(channel.housekeeping(budget));
                last_housekeeping = Instant::now();
            }
            Request::SyncBackup { sink, reply } => {
                let _ = reply.send(channel.synchronize_backup(sink));
            }
            Request::VerifyBackup { reply } => {
                let _ = reply.send(channel.verify_backup());
            }
            Request::Stats { reply } => {
                let _ = reply.send(channel.stats());
            }
            Request::Records { reply } => {
                let _ = reply.send(channel.records());
            }
            Request::LiveOids { reply } => {
                let _ = reply.send(channel.live_oids());
            }
            Request::Shutdown { reply } => {
                let _ = reply.send(channel.shutdown());
                return;
            }
        }
    }
}
