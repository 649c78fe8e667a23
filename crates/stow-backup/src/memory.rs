use std::collections::HashMap;
use std::io;
use std::sync::{Mutex, RwLock};

use crate::blob::{BlobError, BlobResult, BlobStore};

/// In-memory, HashMap-based blob store.
///
/// Intended for tests and embedding. A write budget can be armed to make
/// writes fail part-way, leaving a prefix behind the way an interrupted
/// remote upload would.
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    write_budget: Mutex<Option<u64>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
            write_budget: Mutex::new(None),
        }
    }

    /// Number of blobs currently stored.
    pub fn blob_count(&self) -> usize {
        self.blobs.read().expect("lock poisoned").len()
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.blobs.read().expect("lock poisoned").get(path).cloned()
    }

    pub fn insert(&self, path: &str, bytes: Vec<u8>) {
        self.blobs
            .write()
            .expect("lock poisoned")
            .insert(path.to_string(), bytes);
    }

    /// Cut a blob down to `length` bytes.
    pub fn truncate(&self, path: &str, length: u64) {
        if let Some(blob) = self.blobs.write().expect("lock poisoned").get_mut(path) {
            blob.truncate(length as usize);
        }
    }

    /// Allow only `bytes` more bytes to be written; the write that crosses
    /// the limit stores what fits and then fails. `None` lifts the limit.
    pub fn set_write_budget(&self, bytes: Option<u64>) {
        *self.write_budget.lock().expect("lock poisoned") = bytes;
    }
}

impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobStore for InMemoryBlobStore {
    fn write_range(&self, path: &str, offset: u64, bytes: &[u8]) -> BlobResult<()> {
        let mut blobs = self.blobs.write().expect("lock poisoned");
        let current = blobs.get(path).map_or(0, |b| b.len() as u64);
        if offset > current {
            return Err(BlobError::Gap {
                path: path.to_string(),
                offset,
                length: current,
            });
        }
        let blob = blobs.entry(path.to_string()).or_default();

        let mut budget = self.write_budget.lock().expect("lock poisoned");
        let (accepted, interrupted) = match budget.as_mut() {
            Some(left) if (bytes.len() as u64) > *left => {
                let n = *left as usize;
                *left = 0;
                (&bytes[..n], true)
            }
            Some(left) => {
                *left -= bytes.len() as u64;
                (bytes, false)
            }
            None => (bytes, false),
        };

        let start = offset as usize;
        let end = start + accepted.len();
        if end > blob.len() {
            blob.resize(end, 0);
        }
        blob[start..end].copy_from_slice(accepted);

        if interrupted {
            return Err(BlobError::Io(io::Error::new(
                io::ErrorKind::Interrupted,
                format!("write to {path} interrupted after {} bytes", accepted.len()),
            )));
        }
        Ok(())
    }

    fn read_range(&self, path: &str, offset: u64, length: u64) -> BlobResult<Vec<u8>> {
        let blobs = self.blobs.read().expect("lock poisoned");
        let blob = blobs
            .get(path)
            .ok_or_else(|| BlobError::NotFound(path.to_string()))?;
        let size = blob.len() as u64;
        if offset.saturating_add(length) > size {
            return Err(BlobError::OutOfRange {
                path: path.to_string(),
                offset,
                length,
                size,
            });
        }
        Ok(blob[offset as usize..(offset + length) as usize].to_vec())
    }

    fn list(&self, prefix: &str) -> BlobResult<Vec<String>> {
        let blobs = self.blobs.read().expect("lock poisoned");
        let mut keys: Vec<String> = blobs
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn delete(&self, path: &str) -> BlobResult<bool> {
        Ok(self
            .blobs
            .write()
            .expect("lock poisoned")
            .remove(path)
            .is_some())
    }

    fn len(&self, path: &str) -> BlobResult<Option<u64>> {
        Ok(self
            .blobs
            .read()
            .expect("lock poisoned")
            .get(path)
            .map(|b| b.len() as u64))
    }
}

impl std::fmt::Debug for InMemoryBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBlobStore")
            .field("blob_count", &self.blob_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ------------------------------------------------------------------
    // Ranges
    // ------------------------------------------------------------------

    #[test]
    fn append_and_read_back() {
        let store = InMemoryBlobStore::new();
        store.write_range("a/b", 0, b"hello").unwrap();
        store.write_range("a/b", 5, b" world").unwrap();
        assert_eq!(store.len("a/b").unwrap(), Some(11));
        assert_eq!(store.read_range("a/b", 6, 5).unwrap(), b"world");
        assert_eq!(store.read_all("a/b").unwrap(), b"hello world");
    }

    #[test]
    fn gap_is_rejected() {
        let store = InMemoryBlobStore::new();
        store.write_range("x", 0, b"abc").unwrap();
        let err = store.write_range("x", 5, b"z").unwrap_err();
        assert!(matches!(err, BlobError::Gap { offset: 5, length: 3, .. }));
    }

    #[test]
    fn read_past_end_is_rejected() {
        let store = InMemoryBlobStore::new();
        store.write_range("x", 0, b"abc").unwrap();
        assert!(matches!(
            store.read_range("x", 2, 5),
            Err(BlobError::OutOfRange { size: 3, .. })
        ));
        assert!(matches!(store.read_range("y", 0, 1), Err(BlobError::NotFound(_))));
    }

    // ------------------------------------------------------------------
    // Listing and deletion
    // ------------------------------------------------------------------

    #[test]
    fn list_filters_by_prefix_in_order() {
        let store = InMemoryBlobStore::new();
        store.insert("channel_1/b", vec![]);
        store.insert("channel_1/a", vec![]);
        store.insert("channel_2/a", vec![]);
        assert_eq!(
            store.list("channel_1/").unwrap(),
            vec!["channel_1/a".to_string(), "channel_1/b".to_string()]
        );
        assert!(store.delete("channel_1/a").unwrap());
        assert!(!store.delete("channel_1/a").unwrap());
        assert_eq!(store.blob_count(), 2);
    }

    #[test]
    fn copy_replaces_target() {
        let store = InMemoryBlobStore::new();
        store.insert("src", b"new".to_vec());
        store.insert("dst", b"old contents".to_vec());
        store.copy("src", "dst").unwrap();
        assert_eq!(store.get("dst").unwrap(), b"new");
    }

    // ------------------------------------------------------------------
    // Interrupted writes
    // ------------------------------------------------------------------

    #[test]
    fn write_budget_leaves_a_prefix() {
        let store = InMemoryBlobStore::new();
        store.set_write_budget(Some(4));
        let err = store.write_range("x", 0, b"abcdefgh").unwrap_err();
        assert!(matches!(err, BlobError::Io(_)));
        assert_eq!(store.get("x").unwrap(), b"abcd");

        store.set_write_budget(None);
        store.write_range("x", 4, b"efgh").unwrap();
        assert_eq!(store.get("x").unwrap(), b"abcdefgh");
    }
}
