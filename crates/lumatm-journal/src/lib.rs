//! Durable transaction journal for LumaTM
//!
//! Records the status transitions recovery depends on (COMMITTING,
//! COMMITTED, UNKNOWN) together with the unique names of the resources a
//! transaction involves. Provides:
//! - [`Journal`], the contract used by the transaction manager
//! - [`DiskJournal`], two fixed-size files with compaction on rollover
//! - [`NullJournal`], for deployments that do not need crash recovery

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod disk;
pub mod file;
pub mod null;
pub mod record;

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use lumatm_common::config::{Config, JournalKind};
use lumatm_common::error::Result;
use lumatm_common::types::{Status, Timestamp, Uid};

pub use disk::{DiskJournal, JournalOptions};
pub use file::{read_records, LogHeader, LogState};
pub use null::NullJournal;
pub use record::TransactionLogRecord;

/// Write-ahead log of transaction outcomes
///
/// `log`, `force` and `collect_dangling_records` fail with
/// [`JournalError::Closed`](lumatm_common::error::JournalError::Closed) unless
/// the journal is open.
pub trait Journal: Send + Sync {
    /// Prepare the journal for appends, does nothing when already open
    fn open(&self) -> Result<()>;

    fn close(&self) -> Result<()>;

    /// Make every record logged so far durable
    fn force(&self) -> Result<()>;

    /// Append a status change of a transaction
    fn log(&self, status: Status, gtrid: &Uid, unique_names: &BTreeSet<String>) -> Result<()>;

    /// Transactions that reached COMMITTING without every resource reaching
    /// COMMITTED, keyed by gtrid
    fn collect_dangling_records(&self) -> Result<HashMap<Uid, TransactionLogRecord>>;

    /// Close, logging instead of returning failures
    fn shutdown(&self);
}

/// Build the journal selected by the configuration
pub fn create_journal(config: &Config) -> Arc<dyn Journal> {
    match config.journal {
        JournalKind::Disk => Arc::new(DiskJournal::from_config(config)),
        JournalKind::Null => Arc::new(NullJournal::new()),
    }
}

/// Replay records in log order and keep the unresolved COMMITTING ones.
///
/// A COMMITTED or UNKNOWN record removes its unique names from the pending
/// set of the gtrid; the gtrid is resolved once no name is left.
pub fn dangling_records<I>(records: I) -> HashMap<Uid, TransactionLogRecord>
where
    I: IntoIterator<Item = TransactionLogRecord>,
{
    let mut dangling: HashMap<Uid, TransactionLogRecord> = HashMap::new();

    for record in records {
        match record.status() {
            Status::Committing => match dangling.get_mut(record.gtrid()) {
                Some(existing) => {
                    existing
                        .unique_names_mut()
                        .extend(record.unique_names().iter().cloned());
                }
                None => {
                    dangling.insert(record.gtrid().clone(), record);
                }
            },
            Status::Committed | Status::Unknown => {
                let resolved = match dangling.get_mut(record.gtrid()) {
                    Some(existing) => {
                        let pending = existing.unique_names_mut();
                        for name in record.unique_names() {
                            pending.remove(name);
                        }
                        pending.is_empty()
                    }
                    None => false,
                };
                if resolved {
                    dangling.remove(record.gtrid());
                }
            }
            _ => {}
        }
    }

    dangling
}

/// Dangling records of a journal file pair without opening it for writing
pub fn inspect_dangling_records(
    part1: &Path,
    part2: &Path,
    skip_corrupted: bool,
) -> Result<HashMap<Uid, TransactionLogRecord>> {
    let (header1, records1) = read_records(part1, skip_corrupted)?;
    let (header2, records2) = read_records(part2, skip_corrupted)?;

    let records = if header2.timestamp > header1.timestamp {
        records2
    } else {
        records1
    };
    Ok(dangling_records(records))
}

pub(crate) fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}
