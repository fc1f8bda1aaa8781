//! Transaction and branch identifier generation

use std::sync::atomic::{AtomicU32, Ordering};

use lumatm_common::types::{Timestamp, Uid, Xid};

/// Generates process-unique Uids prefixed by the server id
pub struct UidGenerator {
    server_id: Vec<u8>,
    sequence: AtomicU32,
}

impl UidGenerator {
    pub fn new(server_id: Vec<u8>) -> Self {
        Self {
            server_id,
            sequence: AtomicU32::new(0),
        }
    }

    pub fn server_id(&self) -> &[u8] {
        &self.server_id
    }

    pub fn generate_uid(&self) -> Uid {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        Uid::new(&self.server_id, current_time_millis(), sequence)
    }

    /// Branch id of `gtrid` with a fresh branch qualifier
    pub fn generate_xid(&self, gtrid: &Uid) -> Xid {
        Xid::new(gtrid.clone(), self.generate_uid())
    }
}

pub fn current_time_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_uids_are_unique() {
        let generator = UidGenerator::new(b"node-1".to_vec());
        let uids: HashSet<Uid> = (0..10_000).map(|_| generator.generate_uid()).collect();
        assert_eq!(uids.len(), 10_000);
    }

    #[test]
    fn test_uids_embed_server_id_and_time() {
        let before = current_time_millis();
        let generator = UidGenerator::new(b"node-1".to_vec());
        let uid = generator.generate_uid();

        assert_eq!(uid.server_id(), b"node-1");
        assert!(uid.timestamp().unwrap() >= before);
    }

    #[test]
    fn test_xid_branch_qualifiers_differ() {
        let generator = UidGenerator::new(b"node-1".to_vec());
        let gtrid = generator.generate_uid();
        let a = generator.generate_xid(&gtrid);
        let b = generator.generate_xid(&gtrid);

        assert_eq!(a.gtrid(), b.gtrid());
        assert_ne!(a.bqual(), b.bqual());
        assert!(a.is_ours());
    }
}
