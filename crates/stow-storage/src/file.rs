use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use stow_backup::{data_file_name, InventoryFile};
use stow_codec::{CodecError, RecordHeader, RECORD_HEADER_SIZE};
use tracing::{debug, warn};

use crate::error::{StorageError, StorageResult};

/// One append-only data file of a channel.
#[derive(Debug)]
pub struct DataFile {
    channel: u32,
    number: u64,
    path: PathBuf,
    file: File,
    length: u64,
}

/// A record header found while scanning a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScannedRecord {
    pub offset: u64,
    pub header: RecordHeader,
}

impl DataFile {
    /// Create a new, empty data file in `dir`.
    pub fn create(dir: &Path, channel: u32, number: u64) -> StorageResult<Self> {
        let path = dir.join(data_file_name(channel, number));
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        debug!(channel, number, path = %path.display(), "data file created");
        Ok(Self {
            channel,
            number,
            path,
            file,
            length: 0,
        })
    }

    pub fn open(path: PathBuf, channel: u32, number: u64) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let length = file.metadata()?.len();
        Ok(Self {
            channel,
            number,
            path,
            file,
            length,
        })
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn inventory_entry(&self) -> InventoryFile {
        InventoryFile {
            channel: self.channel,
            number: self.number,
            path: self.path.clone(),
            length: self.length,
        }
    }

    /// Append `bytes` at the end of the file and return their offset.
    ///
    /// On failure the file is cut back to its previous length, so an append
    /// either lands completely or not at all.
    pub fn append(&mut self, bytes: &[u8], sync: bool) -> StorageResult<u64> {
        let position = self.length;
        let result = self.write_at_end(position, bytes, sync);
        if let Err(e) = result {
            warn!(path = %self.path.display(), position, error = %e, "append failed, truncating");
            self.file.set_len(position)?;
            return Err(e.into());
        }
        self.length = position + bytes.len() as u64;
        Ok(position)
    }

    fn write_at_end(&mut self, position: u64, bytes: &[u8], sync: bool) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(position))?;
        self.file.write_all(bytes)?;
        if sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    pub fn read_at(&self, offset: u64, length: u64) -> StorageResult<Vec<u8>> {
        if offset + length > self.length {
            return Err(StorageError::CorruptRecord {
                file: self.path.clone(),
                offset,
                reason: format!("range of {length} bytes runs past end of file ({})", self.length),
            });
        }
        let mut reader = &self.file;
        reader.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; length as usize];
        reader.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Walk the record headers front to back.
    ///
    /// A trailing partial record is the remains of an interrupted append; it
    /// is cut off when `repair_tail` is set and reported as corruption
    /// otherwise.
    pub fn scan(&mut self, repair_tail: bool) -> StorageResult<Vec<ScannedRecord>> {
        let mut reader = BufReader::new(&self.file);
        reader.seek(SeekFrom::Start(0))?;
        let mut records = Vec::new();
        let mut offset = 0u64;
        let mut header_buf = [0u8; RECORD_HEADER_SIZE];

        while offset < self.length {
            let remaining = self.length - offset;
            let torn = if remaining < RECORD_HEADER_SIZE as u64 {
                true
            } else {
                reader.read_exact(&mut header_buf)?;
                let header = RecordHeader::parse(&header_buf).map_err(|e| self.corrupt(offset, e))?;
                if header.length > remaining {
                    true
                } else {
                    records.push(ScannedRecord { offset, header });
                    reader.seek_relative(header.payload_len() as i64)?;
                    offset += header.length;
                    false
                }
            };

            if torn {
                if !repair_tail {
                    return Err(StorageError::CorruptRecord {
                        file: self.path.clone(),
                        offset,
                        reason: format!("partial record of {remaining} bytes"),
                    });
                }
                warn!(
                    path = %self.path.display(),
                    offset,
                    discarded = remaining,
                    "truncating torn record at end of data file"
                );
                drop(reader);
                self.file.set_len(offset)?;
                self.length = offset;
                break;
            }
        }

        debug!(path = %self.path.display(), records = records.len(), "data file scanned");
        Ok(records)
    }

    fn corrupt(&self, offset: u64, error: CodecError) -> StorageError {
        StorageError::CorruptRecord {
            file: self.path.clone(),
            offset,
            reason: error.to_string(),
        }
    }

    pub fn sync(&self) -> StorageResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Close and delete the file.
    pub fn remove(self) -> StorageResult<()> {
        let path = self.path;
        drop(self.file);
        fs::remove_file(&path)?;
        debug!(path = %path.display(), "data file removed");
        Ok(())
    }
}
