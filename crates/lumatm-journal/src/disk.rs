//! Dual-file disk journal

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use lumatm_common::config::Config;
use lumatm_common::error::{JournalError, Result};
use lumatm_common::types::{Status, Uid};

use crate::file::{LogFile, LogState};
use crate::record::TransactionLogRecord;
use crate::{dangling_records, now_millis, Journal};

/// Settings of a [`DiskJournal`]
#[derive(Debug, Clone)]
pub struct JournalOptions {
    pub part1: PathBuf,
    pub part2: PathBuf,
    /// Size of each file in bytes
    pub capacity: u64,
    pub forced_write: bool,
    pub force_batching: bool,
    pub filter_log_status: bool,
    pub skip_corrupted: bool,
}

impl JournalOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            part1: config.log_part1_filename.clone(),
            part2: config.log_part2_filename.clone(),
            capacity: config.max_log_size_bytes(),
            forced_write: config.forced_write_enabled,
            force_batching: config.force_batching_enabled,
            filter_log_status: config.filter_log_status,
            skip_corrupted: config.skip_corrupted_logs,
        }
    }
}

struct OpenJournal {
    active: LogFile,
    backup: LogFile,
}

/// Journal appending to one of two fixed-size files, compacting into the
/// other one when the active file is full.
///
/// Appends are serialized by a single lock. `force` implements group commit:
/// writes are counted, and a caller whose writes were already covered by
/// another caller's fsync returns immediately.
pub struct DiskJournal {
    options: JournalOptions,
    inner: Mutex<Option<OpenJournal>>,
    /// Write count covered by the last fsync
    synced: Mutex<u64>,
    /// Writes appended so far, only incremented under `inner`
    written: AtomicU64,
    sequence: AtomicU32,
}

impl DiskJournal {
    pub fn new(options: JournalOptions) -> Self {
        Self {
            options,
            inner: Mutex::new(None),
            synced: Mutex::new(0),
            written: AtomicU64::new(0),
            sequence: AtomicU32::new(0),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(JournalOptions::from_config(config))
    }

    pub fn options(&self) -> &JournalOptions {
        &self.options
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Rewrite the backup file with the dangling records of the active
    /// file, then make it the active one.
    fn swap_journal_files(&self, journal: &mut OpenJournal) -> Result<()> {
        let records = journal.active.read_records(self.options.skip_corrupted)?;
        let dangling = dangling_records(records);

        debug!(
            "active journal {} is full, compacting {} dangling record(s) into {}",
            journal.active.path().display(),
            dangling.len(),
            journal.backup.path().display()
        );

        journal.backup.truncate_records();
        let mut ordered: Vec<_> = dangling.into_values().collect();
        ordered.sort_by_key(TransactionLogRecord::sequence);
        for record in &ordered {
            journal.backup.append_unstamped(&record.encode()?)?;
        }
        journal.backup.sync()?;

        // the backup only takes over once its newer header is durable
        let generation = now_millis().max(journal.active.header().timestamp + 1);
        journal.backup.stamp(generation, LogState::Unclean)?;
        journal.backup.sync()?;

        journal.active.set_state(LogState::Clean)?;
        std::mem::swap(&mut journal.active, &mut journal.backup);

        info!(
            "journal rotated, {} is now active with {} dangling record(s)",
            journal.active.path().display(),
            ordered.len()
        );
        Ok(())
    }
}

impl Journal for DiskJournal {
    fn open(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.is_some() {
            debug!("disk journal already open");
            return Ok(());
        }

        let now = now_millis();
        let part1 = LogFile::open(&self.options.part1, self.options.capacity, now)?;
        let part2 = LogFile::open(&self.options.part2, self.options.capacity, now)?;

        let (mut active, backup) = if part2.header().timestamp > part1.header().timestamp {
            (part2, part1)
        } else {
            (part1, part2)
        };

        if active.header().state == LogState::Unclean {
            warn!(
                "active journal {} was not closed cleanly, the previous shutdown was not graceful",
                active.path().display()
            );
        }

        let records = active.read_records(self.options.skip_corrupted)?;
        let last_sequence = records.iter().map(TransactionLogRecord::sequence).max();
        if let Some(last) = last_sequence {
            self.sequence.store(last.wrapping_add(1), Ordering::SeqCst);
        }

        active.set_state(LogState::Unclean)?;
        active.sync()?;

        info!(
            "disk journal open, active file {} ({} record(s), {} byte(s) free)",
            active.path().display(),
            records.len(),
            active.remaining()
        );

        *inner = Some(OpenJournal { active, backup });
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(mut journal) = inner.take() {
            journal.active.set_state(LogState::Clean)?;
            journal.active.sync()?;
            info!("disk journal closed");
        }
        Ok(())
    }

    fn force(&self) -> Result<()> {
        if !self.options.forced_write {
            return if self.is_open() {
                Ok(())
            } else {
                Err(JournalError::Closed.into())
            };
        }

        let wanted = self.written.load(Ordering::SeqCst);
        let mut synced = self.synced.lock();
        if self.options.force_batching && *synced >= wanted {
            return Ok(());
        }

        let inner = self.inner.lock();
        let journal = inner.as_ref().ok_or(JournalError::Closed)?;
        let covered = self.written.load(Ordering::SeqCst);
        journal.active.sync()?;
        *synced = covered;
        Ok(())
    }

    fn log(&self, status: Status, gtrid: &Uid, unique_names: &BTreeSet<String>) -> Result<()> {
        let mut inner = self.inner.lock();
        let journal = inner.as_mut().ok_or(JournalError::Closed)?;

        if self.options.filter_log_status && !status.is_recovery_relevant() {
            return Ok(());
        }
        TransactionLogRecord::check_names(unique_names)?;

        let record = TransactionLogRecord::new(
            status,
            gtrid.clone(),
            unique_names.clone(),
            self.sequence.fetch_add(1, Ordering::SeqCst),
            now_millis(),
        );
        let data = record.encode()?;

        if data.len() as u64 > journal.active.remaining() {
            self.swap_journal_files(journal)?;
            if data.len() as u64 > journal.active.remaining() {
                error!(
                    "journal cannot hold a {} byte record even after rotation, increase max_log_size_mb",
                    data.len()
                );
                return Err(JournalError::RecordTooLarge {
                    size: data.len(),
                    capacity: journal.active.capacity(),
                }
                .into());
            }
        }

        journal.active.append(&data)?;
        self.written.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn collect_dangling_records(&self) -> Result<HashMap<Uid, TransactionLogRecord>> {
        let mut inner = self.inner.lock();
        let journal = inner.as_mut().ok_or(JournalError::Closed)?;
        let records = journal.active.read_records(self.options.skip_corrupted)?;
        Ok(dangling_records(records))
    }

    fn shutdown(&self) {
        if let Err(e) = self.close() {
            error!("error shutting down disk journal: {}", e);
        }
    }
}
