use std::io;

/// Errors produced by blob stores.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),

    /// A write would leave a hole between the current end and `offset`.
    #[error("write to {path} at offset {offset} would leave a gap after its {length} bytes")]
    Gap { path: String, offset: u64, length: u64 },

    #[error("read of {length} bytes at offset {offset} exceeds {path} ({size} bytes)")]
    OutOfRange {
        path: String,
        offset: u64,
        length: u64,
        size: u64,
    },

    #[error("invalid blob path: {0}")]
    InvalidPath(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type BlobResult<T> = Result<T, BlobError>;

/// Byte-range storage target for backup and exported files.
///
/// Keys are `/`-separated relative paths. Implementations must satisfy:
/// - `write_range` at `offset == len` appends; `offset < len` overwrites in
///   place; `offset > len` fails with [`BlobError::Gap`].
/// - A failed `write_range` may have written a prefix of `bytes`, but never
///   more than `bytes`.
/// - `list` returns keys in ascending order.
pub trait BlobStore: Send + Sync {
    fn write_range(&self, path: &str, offset: u64, bytes: &[u8]) -> BlobResult<()>;

    fn read_range(&self, path: &str, offset: u64, length: u64) -> BlobResult<Vec<u8>>;

    /// Every key starting with `prefix`.
    fn list(&self, prefix: &str) -> BlobResult<Vec<String>>;

    /// Returns `true` if the blob existed.
    fn delete(&self, path: &str) -> BlobResult<bool>;

    /// Size in bytes, or `None` if the blob does not exist.
    fn len(&self, path: &str) -> BlobResult<Option<u64>>;

    fn read_all(&self, path: &str) -> BlobResult<Vec<u8>> {
        let size = self
            .len(path)?
            .ok_or_else(|| BlobError::NotFound(path.to_string()))?;
        self.read_range(path, 0, size)
    }

    /// Copy `from` to a new blob `to`, replacing anything already there.
    fn copy(&self, from: &str, to: &str) -> BlobResult<()> {
        let bytes = self.read_all(from)?;
        self.delete(to)?;
        self.write_range(to, 0, &bytes)
    }
}
