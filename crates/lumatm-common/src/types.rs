//! Common type definitions for LumaTM

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Timestamp in milliseconds since Unix epoch
pub type Timestamp = i64;

/// Xid format identifier of this transaction manager ("Luma")
pub const FORMAT_ID: i32 = 0x4c75_6d61;

/// Maximum size of a global transaction id or branch qualifier
pub const MAX_XID_PART_SIZE: usize = 64;

/// Bytes taken by the timestamp and sequence suffix of a Uid
pub const UID_SUFFIX_SIZE: usize = 12;

/// Largest server id that still fits an XA gtrid
pub const MAX_SERVER_ID_SIZE: usize = MAX_XID_PART_SIZE - UID_SUFFIX_SIZE - 1;

// ============================================================================
// Uid
// ============================================================================

/// Globally unique identifier: server id, 8-byte millisecond timestamp and
/// 4-byte sequence number, all big endian so byte order is creation order.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uid(Bytes);

impl Uid {
    /// Assemble a Uid from its parts
    pub fn new(server_id: &[u8], timestamp: Timestamp, sequence: u32) -> Self {
        let mut buf = BytesMut::with_capacity(server_id.len() + UID_SUFFIX_SIZE);
        buf.put_slice(server_id);
        buf.put_i64(timestamp);
        buf.put_u32(sequence);
        Self(buf.freeze())
    }

    /// Wrap raw bytes, e.g. a gtrid read back from a journal or a resource
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Server id prefix, empty when the bytes were not produced by a Uid generator
    pub fn server_id(&self) -> &[u8] {
        if self.0.len() < UID_SUFFIX_SIZE {
            return &[];
        }
        &self.0[..self.0.len() - UID_SUFFIX_SIZE]
    }

    /// Embedded creation timestamp, `None` when the bytes are too short
    pub fn timestamp(&self) -> Option<Timestamp> {
        let len = self.0.len();
        if len < UID_SUFFIX_SIZE {
            return None;
        }
        let raw: [u8; 8] = self.0[len - UID_SUFFIX_SIZE..len - 4].try_into().ok()?;
        Some(i64::from_be_bytes(raw))
    }

    /// Embedded sequence number
    pub fn sequence(&self) -> Option<u32> {
        let len = self.0.len();
        if len < UID_SUFFIX_SIZE {
            return None;
        }
        let raw: [u8; 4] = self.0[len - 4..].try_into().ok()?;
        Some(u32::from_be_bytes(raw))
    }

    /// Upper-case hex rendering
    pub fn to_hex(&self) -> String {
        hex::encode_upper(&self.0)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({})", self.to_hex())
    }
}

// ============================================================================
// Xid
// ============================================================================

/// Transaction branch identifier: format id, gtrid and branch qualifier
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Xid {
    format_id: i32,
    gtrid: Uid,
    bqual: Uid,
}

impl Xid {
    /// Branch identifier in this transaction manager's format
    pub fn new(gtrid: Uid, bqual: Uid) -> Self {
        Self {
            format_id: FORMAT_ID,
            gtrid,
            bqual,
        }
    }

    /// Branch identifier in an arbitrary format, as returned by `recover`
    pub fn with_format(format_id: i32, gtrid: impl Into<Bytes>, bqual: impl Into<Bytes>) -> Self {
        Self {
            format_id,
            gtrid: Uid::from_bytes(gtrid),
            bqual: Uid::from_bytes(bqual),
        }
    }

    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    pub fn global_transaction_id(&self) -> &[u8] {
        self.gtrid.as_bytes()
    }

    pub fn branch_qualifier(&self) -> &[u8] {
        self.bqual.as_bytes()
    }

    pub fn gtrid(&self) -> &Uid {
        &self.gtrid
    }

    pub fn bqual(&self) -> &Uid {
        &self.bqual
    }

    /// Whether this branch was created by a LumaTM instance
    pub fn is_ours(&self) -> bool {
        self.format_id == FORMAT_ID
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.format_id, self.gtrid, self.bqual)
    }
}

impl fmt::Debug for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Xid({self})")
    }
}

// ============================================================================
// Status
// ============================================================================

/// Transaction status, numbered like `javax.transaction.Status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum Status {
    Active = 0,
    MarkedRollback = 1,
    Prepared = 2,
    Committed = 3,
    RolledBack = 4,
    Unknown = 5,
    NoTransaction = 6,
    Preparing = 7,
    Committing = 8,
    RollingBack = 9,
}

impl Status {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        let status = match code {
            0 => Status::Active,
            1 => Status::MarkedRollback,
            2 => Status::Prepared,
            3 => Status::Committed,
            4 => Status::RolledBack,
            5 => Status::Unknown,
            6 => Status::NoTransaction,
            7 => Status::Preparing,
            8 => Status::Committing,
            9 => Status::RollingBack,
            _ => return None,
        };
        Some(status)
    }

    pub fn name(self) -> &'static str {
        match self {
            Status::Active => "ACTIVE",
            Status::MarkedRollback => "MARKED_ROLLBACK",
            Status::Prepared => "PREPARED",
            Status::Committed => "COMMITTED",
            Status::RolledBack => "ROLLEDBACK",
            Status::Unknown => "UNKNOWN",
            Status::NoTransaction => "NO_TRANSACTION",
            Status::Preparing => "PREPARING",
            Status::Committing => "COMMITTING",
            Status::RollingBack => "ROLLING_BACK",
        }
    }

    /// No further transition is possible
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Committed | Status::RolledBack | Status::Unknown | Status::NoTransaction
        )
    }

    /// Statuses recovery depends on, always written to the journal
    pub fn is_recovery_relevant(self) -> bool {
        matches!(self, Status::Committing | Status::Committed | Status::Unknown)
    }

    /// Allowed forward transitions of the transaction state machine
    pub fn can_transition_to(self, next: Status) -> bool {
        use Status::*;
        match (self, next) {
            (NoTransaction, Active) => true,
            (Active, MarkedRollback | Preparing | RollingBack | Committing | Committed) => true,
            (MarkedRollback, RollingBack) => true,
            (Preparing, Prepared | MarkedRollback | RollingBack) => true,
            (Prepared, Committing | Committed | RollingBack | MarkedRollback) => true,
            (Committing, Committed | RolledBack | Unknown) => true,
            (RollingBack, RolledBack | Unknown) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_parts() {
        let uid = Uid::new(b"node-a", 1_700_000_000_123, 42);
        assert_eq!(uid.server_id(), b"node-a");
        assert_eq!(uid.timestamp(), Some(1_700_000_000_123));
        assert_eq!(uid.sequence(), Some(42));
        assert_eq!(uid.len(), 6 + UID_SUFFIX_SIZE);
    }

    #[test]
    fn test_uid_ordering_follows_creation() {
        let a = Uid::new(b"n", 1000, 7);
        let b = Uid::new(b"n", 1000, 8);
        let c = Uid::new(b"n", 1001, 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_short_uid_has_no_timestamp() {
        let uid = Uid::from_bytes(vec![1u8, 2, 3]);
        assert_eq!(uid.timestamp(), None);
        assert!(uid.server_id().is_empty());
    }

    #[test]
    fn test_xid_format() {
        let xid = Xid::new(Uid::new(b"n", 1, 1), Uid::new(b"n", 1, 2));
        assert!(xid.is_ours());
        let foreign = Xid::with_format(0, vec![1u8], vec![2u8]);
        assert!(!foreign.is_ours());
    }

    #[test]
    fn test_status_transitions() {
        assert!(Status::Active.can_transition_to(Status::Preparing));
        assert!(Status::Committing.can_transition_to(Status::Committed));
        assert!(!Status::Committed.can_transition_to(Status::Active));
        assert!(!Status::RolledBack.can_transition_to(Status::Committing));
        assert_eq!(Status::from_code(8), Some(Status::Committing));
        assert_eq!(Status::from_code(42), None);
    }
}
