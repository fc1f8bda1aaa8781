//! Fixed-size journal file: header plus an append-only record area

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use lumatm_common::error::{JournalError, Result};
use lumatm_common::types::{Timestamp, FORMAT_ID};

use crate::record::{DecodeError, TransactionLogRecord};

/// Magic bytes for journal file header
pub const LOG_MAGIC: &[u8; 4] = b"LTMJ";

/// Size of the journal header in bytes: magic(4) + format id(4) + timestamp(8) + state(1) + position(8)
pub const HEADER_SIZE: u64 = 25;

/// Header state byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogState {
    /// The file was closed by a graceful shutdown
    Clean = 0,
    /// The file is (or was, at crash time) open for appends
    Unclean = 1,
}

/// Journal file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    pub format_id: i32,
    /// Generation of the file, the newer file is the active one
    pub timestamp: Timestamp,
    pub state: LogState,
    /// Offset where the next record is appended
    pub position: u64,
}

impl LogHeader {
    fn fresh(timestamp: Timestamp) -> Self {
        Self {
            format_id: FORMAT_ID,
            timestamp,
            state: LogState::Clean,
            position: HEADER_SIZE,
        }
    }

    fn to_bytes(self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(LOG_MAGIC);
        buf[4..8].copy_from_slice(&self.format_id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[16] = self.state as u8;
        buf[17..25].copy_from_slice(&self.position.to_le_bytes());
        buf
    }

    /// `Ok(None)` for a zero-filled (never initialized) header
    fn from_bytes(data: &[u8; HEADER_SIZE as usize], path: &Path) -> Result<Option<Self>> {
        if data.iter().all(|b| *b == 0) {
            return Ok(None);
        }
        if &data[0..4] != LOG_MAGIC {
            return Err(JournalError::Corrupted(format!(
                "{} is not a transaction journal (bad magic)",
                path.display()
            ))
            .into());
        }

        let format_id = i32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&data[8..16]);
        let mut pos = [0u8; 8];
        pos.copy_from_slice(&data[17..25]);

        let state = match data[16] {
            0 => LogState::Clean,
            1 => LogState::Unclean,
            other => {
                return Err(JournalError::Corrupted(format!(
                    "{} has an invalid header state {}",
                    path.display(),
                    other
                ))
                .into())
            }
        };

        Ok(Some(Self {
            format_id,
            timestamp: i64::from_le_bytes(ts),
            state,
            position: u64::from_le_bytes(pos),
        }))
    }
}

/// One of the two journal files
pub struct LogFile {
    path: PathBuf,
    file: File,
    header: LogHeader,
    capacity: u64,
}

impl LogFile {
    /// Open a journal file, creating and zero-filling it on first use
    pub fn open(path: &Path, capacity: u64, initial_timestamp: Timestamp) -> Result<Self> {
        let existed = path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let len = file.metadata()?.len();
        let capacity = capacity.max(len);
        if len < capacity {
            if existed && len > 0 {
                warn!(
                    "journal file {} is {} bytes, growing it to {} bytes",
                    path.display(),
                    len,
                    capacity
                );
            }
            file.set_len(capacity)?;
        }

        let mut raw = [0u8; HEADER_SIZE as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut raw)?;

        let header = match LogHeader::from_bytes(&raw, path)? {
            Some(header) => header,
            None => {
                debug!("initializing new journal file {}", path.display());
                let header = LogHeader::fresh(initial_timestamp);
                file.seek(SeekFrom::Start(0))?;
                file.write_all(&header.to_bytes())?;
                file.sync_all()?;
                header
            }
        };

        if header.format_id != FORMAT_ID {
            return Err(JournalError::Corrupted(format!(
                "{} was written with format id {:#x}",
                path.display(),
                header.format_id
            ))
            .into());
        }
        if header.position < HEADER_SIZE || header.position > capacity {
            return Err(JournalError::Corrupted(format!(
                "{} has an invalid append position {}",
                path.display(),
                header.position
            ))
            .into());
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            header,
            capacity,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &LogHeader {
        &self.header
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes left for records
    pub fn remaining(&self) -> u64 {
        self.capacity - self.header.position
    }

    fn write_header(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.to_bytes())?;
        Ok(())
    }

    pub fn set_state(&mut self, state: LogState) -> Result<()> {
        self.header.state = state;
        self.write_header()
    }

    /// Append raw record bytes at the current position and advance it
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        if data.len() as u64 > self.remaining() {
            return Err(JournalError::RecordTooLarge {
                size: data.len(),
                capacity: self.capacity,
            }
            .into());
        }

        self.file.seek(SeekFrom::Start(self.header.position))?;
        self.file
            .write_all(data)
            .map_err(|e| JournalError::WriteFailed(e.to_string()))?;
        self.header.position += data.len() as u64;
        self.write_header()
    }

    /// Drop every record and start over; the header keeps its old timestamp
    /// until [`LogFile::stamp`] so a crash meanwhile leaves this file the older one
    pub fn truncate_records(&mut self) {
        self.header.position = HEADER_SIZE;
    }

    /// Append without touching the header, used while rewriting a file
    pub fn append_unstamped(&mut self, data: &[u8]) -> Result<()> {
        if data.len() as u64 > self.remaining() {
            return Err(JournalError::RecordTooLarge {
                size: data.len(),
                capacity: self.capacity,
            }
            .into());
        }
        self.file.seek(SeekFrom::Start(self.header.position))?;
        self.file.write_all(data)?;
        self.header.position += data.len() as u64;
        Ok(())
    }

    /// Persist a new generation timestamp and state together with the position
    pub fn stamp(&mut self, timestamp: Timestamp, state: LogState) -> Result<()> {
        self.header.timestamp = timestamp;
        self.header.state = state;
        self.write_header()
    }

    /// Push written bytes to stable storage
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Read every record between the header and the append position
    pub fn read_records(&mut self, skip_corrupted: bool) -> Result<Vec<TransactionLogRecord>> {
        let end = self.header.position;
        let mut data = vec![0u8; (end - HEADER_SIZE) as usize];
        self.file.seek(SeekFrom::Start(HEADER_SIZE))?;
        self.file.read_exact(&mut data)?;
        decode_all(&data, &self.path, skip_corrupted)
    }
}

/// Decode a record area, applying the corruption policy
fn decode_all(data: &[u8], path: &Path, skip_corrupted: bool) -> Result<Vec<TransactionLogRecord>> {
    let mut records = Vec::new();
    let mut offset = 0usize;

    while offset < data.len() {
        let position = HEADER_SIZE + offset as u64;
        match TransactionLogRecord::decode(&data[offset..], position) {
            Ok((record, used)) => {
                records.push(record);
                offset += used;
            }
            Err(err) => {
                if !skip_corrupted {
                    return Err(err.into_journal_error(position).into());
                }
                match err.skippable_length() {
                    Some(length) => {
                        warn!(
                            "skipping corrupted record at position {} of {}: {:?}",
                            position,
                            path.display(),
                            err
                        );
                        offset += length;
                    }
                    None => {
                        warn!(
                            "unreadable data at position {} of {}, ignoring the rest of the file: {:?}",
                            position,
                            path.display(),
                            err
                        );
                        break;
                    }
                }
            }
        }
    }

    Ok(records)
}

/// Read-only access to a journal file for inspection tools
pub fn read_records(path: &Path, skip_corrupted: bool) -> Result<(LogHeader, Vec<TransactionLogRecord>)> {
    let mut file = File::open(path)?;
    let mut raw = [0u8; HEADER_SIZE as usize];
    file.read_exact(&mut raw)?;

    let header = LogHeader::from_bytes(&raw, path)?
        .ok_or_else(|| JournalError::Corrupted(format!("{} was never initialized", path.display())))?;

    let len = file.metadata()?.len();
    if header.position < HEADER_SIZE || header.position > len {
        return Err(JournalError::Corrupted(format!(
            "{} has an invalid append position {}",
            path.display(),
            header.position
        ))
        .into());
    }

    let mut data = vec![0u8; (header.position - HEADER_SIZE) as usize];
    file.seek(SeekFrom::Start(HEADER_SIZE))?;
    file.read_exact(&mut data)?;

    let records = decode_all(&data, path, skip_corrupted)?;
    Ok((header, records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumatm_common::types::{Status, Uid};
    use std::collections::BTreeSet;

    fn record(seq: u32) -> TransactionLogRecord {
        let names: BTreeSet<String> = ["a".to_string()].into_iter().collect();
        TransactionLogRecord::new(Status::Committing, Uid::new(b"n", 1, seq), names, seq, 1)
    }

    #[test]
    fn test_new_file_is_zero_filled_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part1.tlog");
        let file = LogFile::open(&path, 4096, 77).unwrap();

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
        assert_eq!(file.header().timestamp, 77);
        assert_eq!(file.header().position, HEADER_SIZE);
        assert_eq!(file.remaining(), 4096 - HEADER_SIZE);
    }

    #[test]
    fn test_append_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part1.tlog");
        {
            let mut file = LogFile::open(&path, 4096, 1).unwrap();
            file.append(&record(1).encode().unwrap()).unwrap();
            file.append(&record(2).encode().unwrap()).unwrap();
            file.sync().unwrap();
        }

        let mut file = LogFile::open(&path, 4096, 999).unwrap();
        assert_eq!(file.header().timestamp, 1);
        let records = file.read_records(false).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].sequence(), 2);

        let (header, read_only) = read_records(&path, false).unwrap();
        assert_eq!(header.position, file.header().position);
        assert_eq!(read_only, records);
    }

    #[test]
    fn test_append_beyond_capacity_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.tlog");
        let mut file = LogFile::open(&path, HEADER_SIZE + 10, 1).unwrap();
        let err = file.append(&record(1).encode().unwrap()).unwrap_err();
        assert!(err.to_string().contains("does not fit"));
    }

    #[test]
    fn test_foreign_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.tlog");
        std::fs::write(&path, vec![0xAB; 128]).unwrap();
        assert!(LogFile::open(&path, 4096, 1).is_err());
    }

    #[test]
    fn test_corrupted_record_policy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part1.tlog");
        let first_len;
        {
            let mut file = LogFile::open(&path, 4096, 1).unwrap();
            let first = record(1).encode().unwrap();
            first_len = first.len() as u64;
            file.append(&first).unwrap();
            file.append(&record(2).encode().unwrap()).unwrap();
        }

        // damage the gtrid of the first record
        let mut raw = std::fs::read(&path).unwrap();
        raw[(HEADER_SIZE + 27) as usize] ^= 0xFF;
        std::fs::write(&path, raw).unwrap();
        assert!(first_len > 27);

        let mut file = LogFile::open(&path, 4096, 1).unwrap();
        assert!(file.read_records(false).is_err());
        let records = file.read_records(true).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sequence(), 2);
    }
}
