//! On-disk transaction log record

use std::collections::BTreeSet;

use bytes::{BufMut, BytesMut};

use lumatm_common::error::{JournalError, Result};
use lumatm_common::types::{Status, Timestamp, Uid};

/// Marker closing every record, "ENDR"
pub const END_RECORD: u32 = 0x454e_4452;

/// Bytes before the variable part: status(4) + record length(4) + time(8) + sequence(4) + crc(4)
const FIXED_PREFIX_SIZE: usize = 24;

/// Bytes not covered by `record_length`: status(4) + record length(4)
const UNCOUNTED_SIZE: usize = 8;

/// Smallest possible encoded record: fixed prefix, gtrid length, name count, end marker
pub const MIN_RECORD_SIZE: usize = FIXED_PREFIX_SIZE + 2 + 2 + 4;

/// One journal entry: a status change of a transaction and the resources it involves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionLogRecord {
    status: Status,
    time: Timestamp,
    sequence: u32,
    gtrid: Uid,
    unique_names: BTreeSet<String>,
}

impl TransactionLogRecord {
    pub fn new(
        status: Status,
        gtrid: Uid,
        unique_names: BTreeSet<String>,
        sequence: u32,
        time: Timestamp,
    ) -> Self {
        Self {
            status,
            time,
            sequence,
            gtrid,
            unique_names,
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn time(&self) -> Timestamp {
        self.time
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn gtrid(&self) -> &Uid {
        &self.gtrid
    }

    pub fn unique_names(&self) -> &BTreeSet<String> {
        &self.unique_names
    }

    pub(crate) fn unique_names_mut(&mut self) -> &mut BTreeSet<String> {
        &mut self.unique_names
    }

    /// Total encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        let names: usize = self.unique_names.iter().map(|n| 2 + n.len()).sum();
        FIXED_PREFIX_SIZE + 2 + self.gtrid.len() + 2 + names + 4
    }

    /// Value stored in the record length field: bytes following that field
    pub fn record_length(&self) -> u32 {
        (self.encoded_len() - UNCOUNTED_SIZE) as u32
    }

    /// Reject names that cannot be stored in the journal
    pub fn check_names(unique_names: &BTreeSet<String>) -> Result<()> {
        if let Some(bad) = unique_names.iter().find(|n| !n.is_ascii()) {
            return Err(JournalError::NonAsciiName(bad.clone()).into());
        }
        if let Some(long) = unique_names.iter().find(|n| n.len() > u16::MAX as usize) {
            return Err(JournalError::WriteFailed(format!(
                "unique name of {} bytes is too long",
                long.len()
            ))
            .into());
        }
        Ok(())
    }

    /// CRC32 over every field except the checksum itself and the end marker
    pub fn compute_crc(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.status.code().to_le_bytes());
        hasher.update(&self.record_length().to_le_bytes());
        hasher.update(&self.time.to_le_bytes());
        hasher.update(&self.sequence.to_le_bytes());
        hasher.update(&(self.gtrid.len() as u16).to_le_bytes());
        hasher.update(self.gtrid.as_bytes());
        hasher.update(&(self.unique_names.len() as u16).to_le_bytes());
        for name in &self.unique_names {
            hasher.update(&(name.len() as u16).to_le_bytes());
            hasher.update(name.as_bytes());
        }
        hasher.finalize()
    }

    /// Serialize record to bytes
    pub fn encode(&self) -> Result<BytesMut> {
        Self::check_names(&self.unique_names)?;
        if self.gtrid.len() > u16::MAX as usize || self.unique_names.len() > u16::MAX as usize {
            return Err(JournalError::WriteFailed("record too large to encode".to_string()).into());
        }

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_i32_le(self.status.code());
        buf.put_u32_le(self.record_length());
        buf.put_i64_le(self.time);
        buf.put_u32_le(self.sequence);
        buf.put_u32_le(self.compute_crc());

        buf.put_u16_le(self.gtrid.len() as u16);
        buf.put_slice(self.gtrid.as_bytes());

        buf.put_u16_le(self.unique_names.len() as u16);
        for name in &self.unique_names {
            buf.put_u16_le(name.len() as u16);
            buf.put_slice(name.as_bytes());
        }

        buf.put_u32_le(END_RECORD);
        Ok(buf)
    }

    /// Deserialize a record starting at `data[0]`, `position` is only used for error reporting.
    ///
    /// Returns the record and the number of bytes it occupies.
    pub fn decode(data: &[u8], position: u64) -> std::result::Result<(Self, usize), DecodeError> {
        if data.len() < MIN_RECORD_SIZE {
            return Err(DecodeError::Truncated);
        }

        let mut reader = Reader::new(data);
        let status_code = reader.i32()?;
        let record_length = reader.u32()? as usize;
        let total = record_length + UNCOUNTED_SIZE;
        if total < MIN_RECORD_SIZE {
            return Err(DecodeError::Malformed(format!(
                "record length {} at position {} is too small",
                record_length, position
            )));
        }
        if total > data.len() {
            return Err(DecodeError::Truncated);
        }

        let time = reader.i64()?;
        let sequence = reader.u32()?;
        let stored_crc = reader.u32()?;

        let gtrid_len = reader.u16()? as usize;
        let gtrid = Uid::from_bytes(reader.bytes(gtrid_len)?.to_vec());

        let name_count = reader.u16()? as usize;
        let mut unique_names = BTreeSet::new();
        for _ in 0..name_count {
            let len = reader.u16()? as usize;
            let raw = reader.bytes(len)?;
            if !raw.is_ascii() {
                return Err(DecodeError::Malformed(format!(
                    "non US-ASCII unique name at position {}",
                    position
                )));
            }
            unique_names.insert(String::from_utf8_lossy(raw).into_owned());
        }

        let end = reader.u32()?;
        if end != END_RECORD || reader.consumed() != total {
            return Err(DecodeError::Corrupted {
                length: total,
                reason: format!("bad end of record marker at position {}", position),
            });
        }

        let status = match Status::from_code(status_code) {
            Some(status) => status,
            None => {
                return Err(DecodeError::Corrupted {
                    length: total,
                    reason: format!("unknown status {} at position {}", status_code, position),
                })
            }
        };

        let record = Self {
            status,
            time,
            sequence,
            gtrid,
            unique_names,
        };

        let actual = record.compute_crc();
        if actual != stored_crc {
            return Err(DecodeError::ChecksumMismatch {
                length: total,
                expected: stored_crc,
                actual,
            });
        }

        Ok((record, total))
    }
}

/// Why a record could not be decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough bytes left for a record
    Truncated,
    /// The length field cannot be trusted, the rest of the file cannot be scanned
    Malformed(String),
    /// The record is framed correctly but its content is damaged
    Corrupted { length: usize, reason: String },
    /// The record is framed correctly but fails its checksum
    ChecksumMismatch {
        length: usize,
        expected: u32,
        actual: u32,
    },
}

impl DecodeError {
    /// Length of the damaged record when the scan can continue after it
    pub fn skippable_length(&self) -> Option<usize> {
        match self {
            DecodeError::Corrupted { length, .. } | DecodeError::ChecksumMismatch { length, .. } => {
                Some(*length)
            }
            DecodeError::Truncated | DecodeError::Malformed(_) => None,
        }
    }

    pub fn into_journal_error(self, position: u64) -> JournalError {
        match self {
            DecodeError::Truncated => {
                JournalError::Corrupted(format!("truncated record at position {}", position))
            }
            DecodeError::Malformed(reason) | DecodeError::Corrupted { reason, .. } => {
                JournalError::Corrupted(reason)
            }
            DecodeError::ChecksumMismatch {
                expected, actual, ..
            } => JournalError::ChecksumMismatch {
                position,
                expected,
                actual,
            },
        }
    }
}

/// Little-endian cursor over a record slice
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn consumed(&self) -> usize {
        self.pos
    }

    fn bytes(&mut self, len: usize) -> std::result::Result<&'a [u8], DecodeError> {
        if self.pos + len > self.data.len() {
            return Err(DecodeError::Truncated);
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> std::result::Result<[u8; N], DecodeError> {
        let slice = self.bytes(N)?;
        slice
            .try_into()
            .map_err(|_| DecodeError::Malformed("short read".to_string()))
    }

    fn u16(&mut self) -> std::result::Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> std::result::Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> std::result::Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> std::result::Result<i64, DecodeError> {
        Ok(i64::from_le_bytes(self.array()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn record() -> TransactionLogRecord {
        TransactionLogRecord::new(
            Status::Committing,
            Uid::new(b"node", 1_700_000_000_000, 9),
            names(&["orders-db", "events-mq"]),
            3,
            1_700_000_000_500,
        )
    }

    #[test]
    fn test_encoded_length_matches_header() {
        let rec = record();
        let buf = rec.encode().unwrap();
        assert_eq!(buf.len(), rec.encoded_len());
        let stored = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        assert_eq!(stored as usize, buf.len() - 8);
    }

    #[test]
    fn test_decode_encoded_record() {
        let rec = record();
        let buf = rec.encode().unwrap();
        let (decoded, used) = TransactionLogRecord::decode(&buf, 0).unwrap();
        assert_eq!(decoded, rec);
        assert_eq!(used, buf.len());
    }

    #[test]
    fn test_flipped_bit_fails_checksum() {
        let rec = record();
        let mut buf = rec.encode().unwrap();
        let last_name_byte = buf.len() - 5;
        buf[last_name_byte] ^= 0x01;

        let err = TransactionLogRecord::decode(&buf, 128).unwrap_err();
        assert!(matches!(err, DecodeError::ChecksumMismatch { .. }));
        assert_eq!(err.skippable_length(), Some(buf.len()));
    }

    #[test]
    fn test_zeroed_space_is_malformed() {
        let zeros = vec![0u8; 64];
        let err = TransactionLogRecord::decode(&zeros, 0).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
        assert_eq!(err.skippable_length(), None);
    }

    #[test]
    fn test_non_ascii_names_are_rejected() {
        let rec = TransactionLogRecord::new(
            Status::Committing,
            Uid::new(b"node", 1, 1),
            names(&["caf\u{e9}"]),
            1,
            1,
        );
        assert!(rec.encode().is_err());
    }
}
