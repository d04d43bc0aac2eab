use serde_derive::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{Item, Result, StoreError};

const HEADER_SIZE: u64 = 16; // 8 bytes for magic + 8 bytes for format version
const RECORD_HEADER_SIZE: u64 = 17; // 1 byte flag + 8 bytes key size + 8 bytes value size
const MAGIC: u64 = 0x726b_765f_6461_7461; // "rkv_data"
const FORMAT_VERSION: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum RecordKind {
    Put,
    Delete,
}

impl RecordKind {
    fn flag(self) -> u8 {
        match self {
            RecordKind::Put => 0,
            RecordKind::Delete => 1,
        }
    }

    fn from_flag(flag: u8) -> Option<Self> {
        match flag {
            0 => Some(RecordKind::Put),
            1 => Some(RecordKind::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FileHeader {
    magic: u64,
    version: u64,
}

#[derive(Debug, Clone, Copy)]
struct RecordHeader {
    kind: RecordKind,
    key_size: u64,
    value_size: u64,
}

impl RecordHeader {
    fn decode(buf: &[u8; RECORD_HEADER_SIZE as usize]) -> Result<Self> {
        let kind = RecordKind::from_flag(buf[0])
            .ok_or_else(|| StoreError::Corrupted(format!("unknown record flag {}", buf[0])))?;
        let mut size = [0u8; 8];
        size.copy_from_slice(&buf[1..9]);
        let key_size = u64::from_le_bytes(size);
        size.copy_from_slice(&buf[9..17]);
        let value_size = u64::from_le_bytes(size);
        Ok(RecordHeader {
            kind,
            key_size,
            value_size,
        })
    }

    fn record_size(&self) -> u64 {
        RECORD_HEADER_SIZE
            .saturating_add(self.key_size)
            .saturating_add(self.value_size)
    }
}

/// A record found while replaying the data file.
#[derive(Debug)]
pub(super) struct ReplayedRecord {
    pub offset: u64,
    pub kind: RecordKind,
    pub key: Vec<u8>,
}

/// Append-only data file. Records are never rewritten in place; the last record
/// for a key wins.
#[derive(Debug)]
pub(super) struct DataFile {
    writer: File,
    reader: Mutex<File>,
    path: PathBuf,
    len: u64,
}

impl DataFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let writer = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let reader = File::open(&path)?;

        let mut data_file = DataFile {
            writer,
            reader: Mutex::new(reader),
            path: path.as_ref().to_path_buf(),
            len: 0,
        };

        if data_file.writer.metadata()?.len() == 0 {
            data_file.write_header()?;
        } else {
            data_file.read_header()?;
        }
        data_file.len = data_file.writer.metadata()?.len();

        Ok(data_file)
    }

    fn write_header(&mut self) -> Result<()> {
        let header = FileHeader {
            magic: MAGIC,
            version: FORMAT_VERSION,
        };

        let header_bytes =
            bincode::serialize(&header).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        self.writer.seek(SeekFrom::Start(0))?;
        self.writer.write_all(&header_bytes)?;
        Ok(())
    }

    fn read_header(&mut self) -> Result<()> {
        self.writer.seek(SeekFrom::Start(0))?;
        let mut header_bytes = vec![0u8; HEADER_SIZE as usize];
        self.writer.read_exact(&mut header_bytes).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                StoreError::Corrupted("data file header is truncated".to_string())
            } else {
                StoreError::Io(e)
            }
        })?;

        let header: FileHeader = bincode::deserialize(&header_bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        if header.magic != MAGIC {
            return Err(StoreError::Corrupted(format!(
                "{} is not a data file",
                self.path.display()
            )));
        }
        if header.version != FORMAT_VERSION {
            return Err(StoreError::Corrupted(format!(
                "unsupported data file version {}",
                header.version
            )));
        }
        Ok(())
    }

    /// Reads every record from the start of the file. A torn trailing record,
    /// left by a crash in the middle of an append, is cut off.
    pub fn replay(&mut self) -> Result<Vec<ReplayedRecord>> {
        let file_len = self.writer.metadata()?.len();
        let mut records = Vec::new();
        let mut reader = BufReader::new(self.writer.try_clone()?);
        reader.seek(SeekFrom::Start(HEADER_SIZE))?;
        let mut pos = HEADER_SIZE;

        while pos < file_len {
            if file_len - pos < RECORD_HEADER_SIZE {
                break;
            }
            let mut header_bytes = [0u8; RECORD_HEADER_SIZE as usize];
            reader.read_exact(&mut header_bytes)?;
            let header = RecordHeader::decode(&header_bytes)?;
            if file_len - pos < header.record_size() {
                break;
            }

            let mut key = vec![0u8; header.key_size as usize];
            reader.read_exact(&mut key)?;
            reader.seek_relative(header.value_size as i64)?;

            records.push(ReplayedRecord {
                offset: pos,
                kind: header.kind,
                key,
            });
            pos += header.record_size();
        }

        if pos < file_len {
            log::warn!(
                "{}: truncating torn record at offset {} ({} trailing bytes)",
                self.path.display(),
                pos,
                file_len - pos
            );
            self.writer.set_len(pos)?;
        }
        self.len = pos;

        Ok(records)
    }

    /// Appends one record and returns its offset.
    pub fn append(&mut self, kind: RecordKind, key: &[u8], value: &[u8]) -> Result<u64> {
        let mut record = Vec::with_capacity(RECORD_HEADER_SIZE as usize + key.len() + value.len());
        record.push(kind.flag());
        record.extend_from_slice(&(key.len() as u64).to_le_bytes());
        record.extend_from_slice(&(value.len() as u64).to_le_bytes());
        record.extend_from_slice(key);
        record.extend_from_slice(value);

        let offset = self.len;
        self.writer.seek(SeekFrom::Start(offset))?;
        self.writer.write_all(&record)?;
        self.len += record.len() as u64;
        Ok(offset)
    }

    /// Reads the put record stored at `offset`.
    pub fn read_item(&self, offset: u64) -> Result<Item> {
        let mut reader = self
            .reader
            .lock()
            .map_err(|_| StoreError::Poisoned)?;
        reader.seek(SeekFrom::Start(offset))?;

        let mut header_bytes = [0u8; RECORD_HEADER_SIZE as usize];
        reader.read_exact(&mut header_bytes)?;
        let header = RecordHeader::decode(&header_bytes)?;
        if header.kind != RecordKind::Put {
            return Err(StoreError::Corrupted(format!(
                "expected a put record at offset {}",
                offset
            )));
        }

        let mut key = vec![0u8; header.key_size as usize];
        reader.read_exact(&mut key)?;
        let mut value = vec![0u8; header.value_size as usize];
        reader.read_exact(&mut value)?;
        Ok((key, value))
    }

    pub fn sync(&self) -> Result<()> {
        self.writer.sync_all()?;
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_data_file_creation() {
        let dir = TempDir::new().unwrap();
        let mut data_file = DataFile::open(dir.path().join("node.db")).unwrap();

        assert_eq!(data_file.len(), HEADER_SIZE);
        assert!(data_file.replay().unwrap().is_empty());
    }

    #[test]
    fn test_data_file_append() {
        let dir = TempDir::new().unwrap();
        let mut data_file = DataFile::open(dir.path().join("node.db")).unwrap();

        let first = data_file.append(RecordKind::Put, b"k1", b"first").unwrap();
        let second = data_file.append(RecordKind::Put, b"k2", b"second").unwrap();
        data_file.append(RecordKind::Delete, b"k1", b"").unwrap();

        assert_eq!(first, HEADER_SIZE);
        assert_eq!(data_file.read_item(first).unwrap(), (b"k1".to_vec(), b"first".to_vec()));
        assert_eq!(data_file.read_item(second).unwrap(), (b"k2".to_vec(), b"second".to_vec()));

        let records = data_file.replay().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].kind, RecordKind::Delete);
        assert_eq!(records[2].key, b"k1");
    }

    #[test]
    fn test_data_file_truncates_torn_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node.db");
        let full_len = {
            let mut data_file = DataFile::open(&path).unwrap();
            data_file.append(RecordKind::Put, b"k1", b"v1").unwrap();
            data_file.append(RecordKind::Put, b"k2", b"v2").unwrap();
            data_file.sync().unwrap();
            data_file.len()
        };

        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full_len - 1).unwrap();
        drop(file);

        let mut data_file = DataFile::open(&path).unwrap();
        let records = data_file.replay().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, b"k1");
        assert_eq!(data_file.len(), full_len - (RECORD_HEADER_SIZE + 4));
    }

    #[test]
    fn test_data_file_rejects_foreign_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node.db");
        std::fs::write(&path, b"definitely not a data file").unwrap();

        assert!(matches!(DataFile::open(&path), Err(StoreError::Corrupted(_))));
    }
}
