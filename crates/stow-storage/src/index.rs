use std::collections::{BTreeMap, HashMap};

use stow_types::Oid;

/// Where a record lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordLocation {
    pub file: u64,
    pub offset: u64,
    pub length: u64,
}

/// Index entry for one OID.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexEntry {
    /// The OID's current record.
    Live(RecordLocation),
    /// The OID was deleted. `origin` is the number of the file the tombstone
    /// was first written to; older files may still hold superseded records
    /// that the tombstone must keep shadowing.
    Deleted { location: RecordLocation, origin: u64 },
}

impl IndexEntry {
    pub fn location(&self) -> RecordLocation {
        match self {
            Self::Live(location) | Self::Deleted { location, .. } => *location,
        }
    }
}

/// Live bytes and records per file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileUsage {
    pub live_bytes: u64,
    pub live_records: u64,
}

/// In-memory OID index of one channel, rebuilt from file headers at start.
///
/// Every record an entry points at counts as live in its file, tombstones
/// included; every other record in a file is a gap.
#[derive(Debug, Default)]
pub struct ChannelIndex {
    entries: HashMap<Oid, IndexEntry>,
    usage: BTreeMap<u64, FileUsage>,
    highest_oid: Option<Oid>,
}

impl ChannelIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, oid: Oid) -> Option<&IndexEntry> {
        self.entries.get(&oid)
    }

    /// Location of the OID's current record, unless deleted.
    pub fn live(&self, oid: Oid) -> Option<RecordLocation> {
        match self.entries.get(&oid)? {
            IndexEntry::Live(location) => Some(*location),
            IndexEntry::Deleted { .. } => None,
        }
    }

    /// Start tracking a file with no live content yet.
    pub fn add_file(&mut self, file: u64) {
        self.usage.entry(file).or_default();
    }

    pub fn remove_file(&mut self, file: u64) -> Option<FileUsage> {
        self.usage.remove(&file)
    }

    pub fn usage(&self, file: u64) -> FileUsage {
        self.usage.get(&file).copied().unwrap_or_default()
    }

    pub fn highest_oid(&self) -> Option<Oid> {
        self.highest_oid
    }

    /// Register a record written (or found) at `location`.
    pub fn put(&mut self, oid: Oid, location: RecordLocation) {
        self.note_oid(oid);
        self.replace(oid, Some(IndexEntry::Live(location)));
    }

    /// Register a tombstone at `location`.
    ///
    /// Returns `false`, and leaves the tombstone uncounted, when nothing is
    /// known about the OID: such a tombstone shadows nothing.
    pub fn put_tombstone(&mut self, oid: Oid, location: RecordLocation) -> bool {
        self.note_oid(oid);
        if !self.entries.contains_key(&oid) {
            return false;
        }
        let entry = IndexEntry::Deleted {
            location,
            origin: location.file,
        };
        self.replace(oid, Some(entry));
        true
    }

    /// Point an entry at a relocated copy of its record.
    pub fn relocate(&mut self, oid: Oid, location: RecordLocation) {
        let entry = match self.entries.get(&oid) {
            Some(IndexEntry::Live(_)) => IndexEntry::Live(location),
            Some(IndexEntry::Deleted { origin, .. }) => IndexEntry::Deleted {
                location,
                origin: *origin,
            },
            None => return,
        };
        self.replace(oid, Some(entry));
    }

    /// Forget an entry entirely.
    pub fn drop_entry(&mut self, oid: Oid) {
        self.replace(oid, None);
    }

    fn replace(&mut self, oid: Oid, entry: Option<IndexEntry>) {
        let previous = match entry {
            Some(entry) => {
                let loc = entry.location();
                let usage = self.usage.entry(loc.file).or_default();
                usage.live_bytes += loc.length;
                usage.live_records += 1;
                self.entries.insert(oid, entry)
            }
            None => self.entries.remove(&oid),
        };
        if let Some(previous) = previous {
            let loc = previous.location();
            if let Some(usage) = self.usage.get_mut(&loc.file) {
                usage.live_bytes = usage.live_bytes.saturating_sub(loc.length);
                usage.live_records = usage.live_records.saturating_sub(1);
            }
        }
    }

    fn note_oid(&mut self, oid: Oid) {
        if self.highest_oid.map_or(true, |h| oid > h) {
            self.highest_oid = Some(oid);
        }
    }

    /// OIDs with an entry in `file`, in file order.
    pub fn entries_in(&self, file: u64) -> Vec<(Oid, IndexEntry)> {
        let mut found: Vec<(Oid, IndexEntry)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.location().file == file)
            .map(|(oid, e)| (*oid, *e))
            .collect();
        found.sort_by_key(|(_, e)| e.location().offset);
        found
    }

    /// Tombstones that no longer shadow anything: no file older than their
    /// origin is left, given the oldest remaining file number.
    pub fn obsolete_tombstones(&self, oldest_file: Option<u64>) -> Vec<Oid> {
        self.entries
            .iter()
            .filter_map(|(oid, e)| match e {
                IndexEntry::Deleted { origin, .. } if oldest_file.map_or(true, |f| f >= *origin) => {
                    Some(*oid)
                }
                _ => None,
            })
            .collect()
    }

    pub fn live_oids(&self) -> Vec<Oid> {
        let mut oids: Vec<Oid> = self
            .entries
            .iter()
            .filter(|(_, e)| matches!(e, IndexEntry::Live(_)))
            .map(|(oid, _)| *oid)
            .collect();
        oids.sort();
        oids
    }

    pub fn live_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e, IndexEntry::Live(_)))
            .count()
    }

    pub fn tombstone_count(&self) -> usize {
        self.entries.len() - self.live_count()
    }

    pub fn live_bytes(&self) -> u64 {
        self.usage.values().map(|u| u.live_bytes).sum()
    }
}
