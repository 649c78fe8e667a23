use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::blob::{BlobError, BlobResult, BlobStore};

/// Blob store backed by a directory on the local filesystem.
///
/// Keys map to files below `root`; intermediate directories are created on
/// first write.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
    sync: bool,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sync: true,
        }
    }

    /// Skip `fsync` after each write.
    pub fn without_sync(mut self) -> Self {
        self.sync = false;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> BlobResult<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(BlobError::InvalidPath(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

impl BlobStore for LocalBlobStore {
    fn write_range(&self, path: &str, offset: u64, bytes: &[u8]) -> BlobResult<()> {
        let file_path = self.resolve(path)?;
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&file_path)?;
        let current = file.metadata()?.len();
        if offset > current {
            return Err(BlobError::Gap {
                path: path.to_string(),
                offset,
                length: current,
            });
        }
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        if self.sync {
            file.sync_data()?;
        }
        debug!(path, offset, len = bytes.len(), "blob range written");
        Ok(())
    }

    fn read_range(&self, path: &str, offset: u64, length: u64) -> BlobResult<Vec<u8>> {
        let file_path = self.resolve(path)?;
        let mut file = match fs::File::open(&file_path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(BlobError::NotFound(path.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata()?.len();
        if offset.saturating_add(length) > size {
            return Err(BlobError::OutOfRange {
                path: path.to_string(),
                offset,
                length,
                size,
            });
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn list(&self, prefix: &str) -> BlobResult<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1) {
            let entry = entry.map_err(|e| BlobError::Io(io::Error::other(e.to_string())))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn delete(&self, path: &str) -> BlobResult<bool> {
        match fs::remove_file(self.resolve(path)?) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn len(&self, path: &str) -> BlobResult<Option<u64>> {
        match fs::metadata(self.resolve(path)?) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
