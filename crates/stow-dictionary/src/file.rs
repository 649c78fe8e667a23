use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dictionary::TypeEntry;
use crate::error::{DictionaryError, DictionaryResult};
use crate::migration::Migration;

/// One line of the dictionary file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DictionaryRecord {
    Type(TypeEntry),
    Migration(Migration),
}

/// Append-only JSON-lines log of dictionary additions.
///
/// On-disk format: one JSON-encoded [`DictionaryRecord`] per line, in the
/// order the additions were made. Replaying the lines in order rebuilds the
/// dictionary. A final line without a trailing newline is a torn write and
/// is cut off on open.
pub struct DictionaryFile {
    path: PathBuf,
    writer: BufWriter<File>,
    sync: bool,
}

impl DictionaryFile {
    /// Open (or create) the file and return every record it holds.
    pub fn open(path: &Path, sync: bool) -> DictionaryResult<(Self, Vec<DictionaryRecord>)> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let records = if path.exists() {
            Self::replay(path)?
        } else {
            Vec::new()
        };

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        debug!(path = ?path, records = records.len(), "opened type dictionary file");
        Ok((
            Self {
                path: path.to_path_buf(),
                writer: BufWriter::new(file),
                sync,
            },
            records,
        ))
    }

    fn replay(path: &Path) -> DictionaryResult<Vec<DictionaryRecord>> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();
        let mut line = String::new();
        let mut good_len: u64 = 0;
        let mut line_no = 0;

        loop {
            line.clear();
            let read = reader.read_line(&mut line)?;
            if read == 0 {
                break;
            }
            line_no += 1;
            if !line.ends_with('\n') {
                warn!(path = ?path, line = line_no, "truncated dictionary line; discarding");
                OpenOptions::new().write(true).open(path)?.set_len(good_len)?;
                break;
            }
            let text = line.trim_end();
            if !text.is_empty() {
                let record = serde_json::from_str(text).map_err(|e| DictionaryError::Corrupt {
                    path: path.to_path_buf(),
                    line: line_no,
                    reason: e.to_string(),
                })?;
                records.push(record);
            }
            good_len += read as u64;
        }
        Ok(records)
    }

    pub fn append(&mut self, record: &DictionaryRecord) -> DictionaryResult<()> {
        let mut line =
            serde_json::to_string(record).map_err(|e| DictionaryError::Serialization(e.to_string()))?;
        line.push('\n');
        self.writer.write_all(line.as_bytes())?;
        self.writer.flush()?;
        if self.sync {
            self.writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use stow_types::{FieldDescriptor, Tid, TypeDescriptor};

    use super::*;
    use crate::migration::FieldSource;

    fn entry(tid: u64, name: &str) -> DictionaryRecord {
        DictionaryRecord::Type(TypeEntry {
            tid: Tid::new(tid),
            descriptor: TypeDescriptor::new(name, vec![FieldDescriptor::text("label")]).unwrap(),
        })
    }

    #[test]
    fn append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dict.jsonl");
        {
            let (mut file, existing) = DictionaryFile::open(&path, false).unwrap();
            assert!(existing.is_empty());
            file.append(&entry(1_000_001, "A")).unwrap();
            file.append(&DictionaryRecord::Migration(Migration {
                from: Tid::new(1_000_001),
                to: Tid::new(1_000_002),
                fields: vec![FieldSource::Default],
                inferred: false,
            }))
            .unwrap();
        }
        let (_, records) = DictionaryFile::open(&path, false).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], entry(1_000_001, "A"));
        assert!(matches!(records[1], DictionaryRecord::Migration(_)));
    }

    #[test]
    fn torn_tail_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dict.jsonl");
        {
            let (mut file, _) = DictionaryFile::open(&path, false).unwrap();
            file.append(&entry(1_000_001, "A")).unwrap();
        }
        let intact = fs::metadata(&path).unwrap().len();
        {
            let mut raw = OpenOptions::new().append(true).open(&path).unwrap();
            raw.write_all(b"{\"Type\":{\"tid\":100").unwrap();
        }
        let (_, records) = DictionaryFile::open(&path, false).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact);
    }

    #[test]
    fn corrupt_line_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dict.jsonl");
        fs::write(&path, "not json\n").unwrap();
        let err = DictionaryFile::open(&path, false).err().unwrap();
        assert!(matches!(err, DictionaryError::Corrupt { line: 1, .. }));
    }
}
