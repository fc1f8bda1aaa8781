//! Journal that records nothing

use std::collections::{BTreeSet, HashMap};

use tracing::warn;

use lumatm_common::error::Result;
use lumatm_common::types::{Status, Uid};

use crate::record::TransactionLogRecord;
use crate::Journal;

/// Accepts every write and remembers nothing. Transactions left in doubt by
/// a crash can then only be resolved by presumed abort.
#[derive(Debug, Default)]
pub struct NullJournal;

impl NullJournal {
    pub fn new() -> Self {
        Self
    }
}

impl Journal for NullJournal {
    fn open(&self) -> Result<()> {
        warn!("transaction journal disabled, in-doubt transactions cannot be recovered after a crash");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn force(&self) -> Result<()> {
        Ok(())
    }

    fn log(&self, _status: Status, _gtrid: &Uid, _unique_names: &BTreeSet<String>) -> Result<()> {
        Ok(())
    }

    fn collect_dangling_records(&self) -> Result<HashMap<Uid, TransactionLogRecord>> {
        Ok(HashMap::new())
    }

    fn shutdown(&self) {}
}
