use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use stow_codec::BinaryRecord;
use stow_types::Oid;

use crate::config::EntityCacheConfig;

struct CacheEntry {
    record: Arc<BinaryRecord>,
    last_access: Instant,
}

/// Recently stored or loaded records of one channel.
///
/// Purely a read accelerator: the data file stays authoritative, so an
/// evicted record is simply read from disk again on its next load.
#[derive(Default)]
pub struct EntityCache {
    entries: HashMap<Oid, CacheEntry>,
    size: u64,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, oid: Oid) -> Option<Arc<BinaryRecord>> {
        let entry = self.entries.get_mut(&oid)?;
        entry.last_access = Instant::now();
        Some(Arc::clone(&entry.record))
    }

    pub fn insert(&mut self, record: Arc<BinaryRecord>) {
        self.size += record.total_length();
        let entry = CacheEntry {
            record,
            last_access: Instant::now(),
        };
        if let Some(old) = self.entries.insert(entry.record.oid, entry) {
            self.size -= old.record.total_length();
        }
    }

    pub fn remove(&mut self, oid: Oid) {
        if let Some(old) = self.entries.remove(&oid) {
            self.size -= old.record.total_length();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cached bytes, record headers included.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Drop every entry the policy considers stale as of `now`.
    ///
    /// An entry goes when it has been idle for `timeout_ms`, or when its
    /// idle time (in ~65 s units) times its size exceeds the room left
    /// below `threshold`. Returns the number of evicted entries.
    pub fn evict(&mut self, config: &EntityCacheConfig, now: Instant) -> usize {
        let mut evicted = Vec::new();
        let mut size = self.size;
        for (oid, entry) in &self.entries {
            let idle_ms = now.saturating_duration_since(entry.last_access).as_millis() as u64;
            let len = entry.record.total_length();
            let room = config.threshold.saturating_sub(size);
            if idle_ms >= config.timeout_ms || room < len.saturating_mul(idle_ms >> 16) {
                evicted.push(*oid);
                size -= len;
            }
        }
        for oid in &evicted {
            self.remove(*oid);
        }
        evicted.len()
    }
}
