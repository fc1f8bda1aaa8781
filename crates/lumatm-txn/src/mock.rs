//! In-memory resources, producers and journals for tests

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use lumatm_common::error::{Error, JournalError, Result};
use lumatm_common::types::{Status, Uid, Xid};
use lumatm_common::xa::{Vote, XaError, TMENDRSCAN, TMSTARTRSCAN};
use lumatm_journal::{dangling_records, Journal, TransactionLogRecord};

use crate::holder::ResourceHolderState;
use crate::resource::{ResourceConfig, ResourcePool, ResourceProducer, XaResource, XaResult};
use crate::synchronization::Synchronization;
use crate::uid::current_time_millis;

/// Call received by a [`MockXaResource`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start { xid: Xid, flags: i32 },
    End { xid: Xid, flags: i32 },
    Prepare(Xid),
    Commit { xid: Xid, one_phase: bool },
    Rollback(Xid),
    Recover(i32),
    Forget(Xid),
    SetTransactionTimeout(u32),
}

impl Event {
    fn label(&self) -> &'static str {
        match self {
            Event::Start { .. } => "start",
            Event::End { .. } => "end",
            Event::Prepare(_) => "prepare",
            Event::Commit { .. } => "commit",
            Event::Rollback(_) => "rollback",
            Event::Recover(_) => "recover",
            Event::Forget(_) => "forget",
            Event::SetTransactionTimeout(_) => "timeout",
        }
    }
}

#[derive(Default)]
struct Failures {
    start: Option<XaError>,
    end: Option<XaError>,
    prepare: Option<XaError>,
    commit: Option<XaError>,
    rollback: Option<XaError>,
    recover: Option<XaError>,
}

struct MockState {
    events: Vec<Event>,
    vote: Vote,
    delay: Option<Duration>,
    failures: Failures,
    log: Option<Arc<Mutex<Vec<String>>>>,
}

/// Resource manager session recording every call. Prepared branches stay
/// in doubt until committed, rolled back or forgotten, and are shared by
/// every session of the same resource manager.
pub struct MockXaResource {
    name: String,
    rm_id: String,
    in_doubt: Arc<Mutex<Vec<Xid>>>,
    state: Mutex<MockState>,
}

impl MockXaResource {
    pub fn new(name: &str) -> Arc<Self> {
        Self::session(name, name, Arc::new(Mutex::new(Vec::new())))
    }

    /// Session of resource manager `rm_id`
    pub fn on_rm(name: &str, rm_id: &str) -> Arc<Self> {
        Self::session(name, rm_id, Arc::new(Mutex::new(Vec::new())))
    }

    fn session(name: &str, rm_id: &str, in_doubt: Arc<Mutex<Vec<Xid>>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            rm_id: rm_id.to_string(),
            in_doubt,
            state: Mutex::new(MockState {
                events: Vec::new(),
                vote: Vote::Ok,
                delay: None,
                failures: Failures::default(),
                log: None,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Also append `"<name>:<call>"` to `log`, to check ordering across resources
    pub fn attach_log(&self, log: &Arc<Mutex<Vec<String>>>) {
        self.state.lock().log = Some(log.clone());
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().events.clone()
    }

    /// `one_phase` flag of every commit call
    pub fn commits(&self) -> Vec<bool> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Commit { one_phase, .. } => Some(one_phase),
                _ => None,
            })
            .collect()
    }

    pub fn prepares(&self) -> Vec<Xid> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Prepare(xid) => Some(xid),
                _ => None,
            })
            .collect()
    }

    pub fn rollbacks(&self) -> Vec<Xid> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Rollback(xid) => Some(xid),
                _ => None,
            })
            .collect()
    }

    pub fn forgotten(&self) -> Vec<Xid> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Forget(xid) => Some(xid),
                _ => None,
            })
            .collect()
    }

    pub fn set_vote(&self, vote: Vote) {
        self.state.lock().vote = vote;
    }

    /// Sleep this long in every call
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = Some(delay);
    }

    pub fn fail_start(&self, err: XaError) {
        self.state.lock().failures.start = Some(err);
    }

    pub fn fail_end(&self, err: XaError) {
        self.state.lock().failures.end = Some(err);
    }

    pub fn fail_prepare(&self, err: XaError) {
        self.state.lock().failures.prepare = Some(err);
    }

    pub fn fail_commit(&self, err: XaError) {
        self.state.lock().failures.commit = Some(err);
    }

    pub fn fail_rollback(&self, err: XaError) {
        self.state.lock().failures.rollback = Some(err);
    }

    pub fn fail_recover(&self, err: XaError) {
        self.state.lock().failures.recover = Some(err);
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures = Failures::default();
    }

    /// Pretend `xid` was prepared before a crash
    pub fn add_in_doubt(&self, xid: Xid) {
        self.in_doubt.lock().push(xid);
    }

    pub fn in_doubt(&self) -> Vec<Xid> {
        self.in_doubt.lock().clone()
    }

    fn resolve(&self, xid: &Xid) {
        self.in_doubt.lock().retain(|x| x != xid);
    }

    /// Record `event` and return the configured failure of that call
    fn call<F>(&self, event: Event, failure: F) -> XaResult<()>
    where
        F: FnOnce(&Failures) -> Option<XaError>,
    {
        let delay = {
            let mut state = self.state.lock();
            if let Some(log) = &state.log {
                log.lock().push(format!("{}:{}", self.name, event.label()));
            }
            state.events.push(event);
            state.delay
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        match failure(&self.state.lock().failures) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl XaResource for MockXaResource {
    fn start(&self, xid: &Xid, flags: i32) -> XaResult<()> {
        self.call(Event::Start { xid: xid.clone(), flags }, |f| f.start.clone())
    }

    fn end(&self, xid: &Xid, flags: i32) -> XaResult<()> {
        self.call(Event::End { xid: xid.clone(), flags }, |f| f.end.clone())
    }

    fn prepare(&self, xid: &Xid) -> XaResult<Vote> {
        self.call(Event::Prepare(xid.clone()), |f| f.prepare.clone())?;
        let vote = self.state.lock().vote;
        if vote == Vote::Ok {
            self.in_doubt.lock().push(xid.clone());
        }
        Ok(vote)
    }

    fn commit(&self, xid: &Xid, one_phase: bool) -> XaResult<()> {
        self.call(
            Event::Commit {
                xid: xid.clone(),
                one_phase,
            },
            |f| f.commit.clone(),
        )?;
        self.resolve(xid);
        Ok(())
    }

    fn rollback(&self, xid: &Xid) -> XaResult<()> {
        self.call(Event::Rollback(xid.clone()), |f| f.rollback.clone())?;
        self.resolve(xid);
        Ok(())
    }

    fn recover(&self, flags: i32) -> XaResult<Vec<Xid>> {
        self.call(Event::Recover(flags), |f| f.recover.clone())?;
        if flags & TMENDRSCAN != 0 && flags & TMSTARTRSCAN == 0 {
            return Ok(Vec::new());
        }
        Ok(self.in_doubt())
    }

    fn is_same_rm(&self, other: &dyn XaResource) -> XaResult<bool> {
        Ok(other
            .as_any()
            .downcast_ref::<MockXaResource>()
            .map_or(false, |other| other.rm_id == self.rm_id))
    }

    fn forget(&self, xid: &Xid) -> XaResult<()> {
        self.call(Event::Forget(xid.clone()), |_| None)?;
        self.resolve(xid);
        Ok(())
    }

    fn set_transaction_timeout(&self, seconds: u32) -> XaResult<bool> {
        self.call(Event::SetTransactionTimeout(seconds), |_| None)?;
        Ok(true)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Holder of `resource` on a branch of `gtrid` numbered `n`
pub fn holder_for(resource: &Arc<MockXaResource>, gtrid: &Uid, n: u32) -> Arc<ResourceHolderState> {
    Arc::new(ResourceHolderState::new(
        resource.clone(),
        ResourceConfig::new(resource.name()),
        Xid::new(gtrid.clone(), Uid::new(b"b", 1, n)),
    ))
}

/// Producer whose sessions share one resource manager
pub struct MockProducer {
    config: ResourceConfig,
    recovery: Arc<MockXaResource>,
    in_doubt: Arc<Mutex<Vec<Xid>>>,
    failed: AtomicBool,
    recovery_sessions: AtomicUsize,
}

impl MockProducer {
    pub fn new(name: &str) -> Arc<Self> {
        Self::with_config(ResourceConfig::new(name))
    }

    pub fn with_config(config: ResourceConfig) -> Arc<Self> {
        let in_doubt = Arc::new(Mutex::new(Vec::new()));
        let recovery = MockXaResource::session(&config.unique_name, &config.unique_name, in_doubt.clone());
        Arc::new(Self {
            config,
            recovery,
            in_doubt,
            failed: AtomicBool::new(false),
            recovery_sessions: AtomicUsize::new(0),
        })
    }

    /// New application session
    pub fn create_resource(&self) -> Arc<MockXaResource> {
        MockXaResource::session(&self.config.unique_name, &self.config.unique_name, self.in_doubt.clone())
    }

    /// Session handed out by `start_recovery`
    pub fn resource(&self) -> Arc<MockXaResource> {
        self.recovery.clone()
    }

    pub fn recovery_sessions(&self) -> usize {
        self.recovery_sessions.load(Ordering::SeqCst)
    }
}

impl ResourceProducer for MockProducer {
    fn config(&self) -> &ResourceConfig {
        &self.config
    }

    fn start_recovery(&self) -> Result<Arc<dyn XaResource>> {
        self.recovery_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(self.recovery.clone())
    }

    fn end_recovery(&self) -> Result<()> {
        Ok(())
    }

    fn set_failed(&self, failed: bool) {
        self.failed.store(failed, Ordering::SeqCst);
    }

    fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    fn holds(&self, resource: &dyn XaResource) -> bool {
        resource
            .as_any()
            .downcast_ref::<MockXaResource>()
            .map_or(false, |session| Arc::ptr_eq(&session.in_doubt, &self.in_doubt))
    }
}

/// Pool asking to be shrunk every `period`
pub struct MockPool {
    name: String,
    period: Duration,
    shrinks: AtomicUsize,
    stopped: AtomicBool,
}

impl MockPool {
    pub fn new(name: &str, period: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            period,
            shrinks: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn shrink_count(&self) -> usize {
        self.shrinks.load(Ordering::SeqCst)
    }

    /// Stop asking for shrinking
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

impl ResourcePool for MockPool {
    fn unique_name(&self) -> &str {
        &self.name
    }

    fn acquire(&self) -> Result<Arc<dyn XaResource>> {
        Ok(MockXaResource::new(&self.name))
    }

    fn release(&self, _resource: Arc<dyn XaResource>) {}

    fn shrink(&self) -> Result<()> {
        self.shrinks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn next_shrink_time(&self) -> Option<Instant> {
        if self.stopped.load(Ordering::SeqCst) {
            None
        } else {
            Some(Instant::now() + self.period)
        }
    }
}

/// In-memory journal keeping every record
#[derive(Default)]
pub struct RecordingJournal {
    records: Mutex<Vec<TransactionLogRecord>>,
    sequence: AtomicU32,
    forces: AtomicUsize,
    failures: AtomicUsize,
}

impl RecordingJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` journal calls fail
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<TransactionLogRecord> {
        self.records.lock().clone()
    }

    /// Records written for `gtrid`, in order
    pub fn statuses(&self, gtrid: &Uid) -> Vec<Status> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.gtrid() == gtrid)
            .map(TransactionLogRecord::status)
            .collect()
    }

    pub fn count(&self, status: Status) -> usize {
        self.records.lock().iter().filter(|r| r.status() == status).count()
    }

    pub fn forces(&self) -> usize {
        self.forces.load(Ordering::SeqCst)
    }

    fn injected_failure(&self) -> Result<()> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            Err(Error::Journal(JournalError::WriteFailed("injected failure".to_string())))
        } else {
            Ok(())
        }
    }
}

impl Journal for RecordingJournal {
    fn open(&self) -> Result<()> {
        self.injected_failure()
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn force(&self) -> Result<()> {
        self.injected_failure()?;
        self.forces.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn log(&self, status: Status, gtrid: &Uid, unique_names: &BTreeSet<String>) -> Result<()> {
        self.injected_failure()?;
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.records.lock().push(TransactionLogRecord::new(
            status,
            gtrid.clone(),
            unique_names.clone(),
            sequence,
            current_time_millis(),
        ));
        Ok(())
    }

    fn collect_dangling_records(&self) -> Result<HashMap<Uid, TransactionLogRecord>> {
        self.injected_failure()?;
        Ok(dangling_records(self.records()))
    }

    fn shutdown(&self) {}
}

/// Synchronization appending `before:<name>` and `after:<name>:<status>` to a log
pub struct RecordingSynchronization {
    name: String,
    fail: bool,
    log: Arc<Mutex<Vec<String>>>,
}

impl RecordingSynchronization {
    pub fn new(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fail: false,
            log: log.clone(),
        })
    }

    /// Fails in `before_completion`
    pub fn failing(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fail: true,
            log: log.clone(),
        })
    }
}

impl Synchronization for RecordingSynchronization {
    fn before_completion(&self) -> anyhow::Result<()> {
        self.log.lock().push(format!("before:{}", self.name));
        if self.fail {
            anyhow::bail!("{} refused to complete", self.name);
        }
        Ok(())
    }

    fn after_completion(&self, status: Status) {
        self.log.lock().push(format!("after:{}:{}", self.name, status));
    }
}
