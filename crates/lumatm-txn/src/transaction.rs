//! Transaction state machine

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use lumatm_common::error::{Error, Result, TransactionError};
use lumatm_common::types::{Status, Timestamp, Uid};
use lumatm_common::xa::{TMFAIL, TMJOIN, TMNOFLAGS, TMSUCCESS, TMSUSPEND};

use crate::holder::{BranchPhase, ResourceHolderState};
use crate::recovery::incremental_recover;
use crate::resource::XaResource;
use crate::scheduler::Scheduler;
use crate::services::Services;
use crate::synchronization::{
    fire_after_completion, fire_before_completion, Synchronization, Synchronizations,
};
use crate::twopc::{
    completed_names, distinct_participants, unique_names, Committer, PrepareOutcome, Preparer,
    Rollbacker,
};

/// One global transaction and the resources enlisted in it
pub struct Transaction {
    gtrid: Uid,
    services: Arc<Services>,
    timeout: Duration,
    deadline: Instant,
    status: Mutex<Status>,
    resources: Mutex<Scheduler<Arc<ResourceHolderState>>>,
    synchronizations: Mutex<Synchronizations>,
    resource_map: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    timed_out: AtomicBool,
}

impl Transaction {
    /// Create an ACTIVE transaction, register it as in flight and schedule
    /// its timeout
    pub fn begin(services: &Arc<Services>, timeout: Duration) -> Result<Arc<Self>> {
        let transaction = Arc::new(Self {
            gtrid: services.uid_generator().generate_uid(),
            services: services.clone(),
            timeout,
            deadline: Instant::now() + timeout,
            status: Mutex::new(Status::NoTransaction),
            resources: Mutex::new(Scheduler::new()),
            synchronizations: Mutex::new(Synchronizations::new()),
            resource_map: Mutex::new(HashMap::new()),
            timed_out: AtomicBool::new(false),
        });

        transaction.change_status(Status::Active, Some(&BTreeSet::new()))?;
        services.add_in_flight(transaction.clone());
        services
            .task_scheduler()
            .schedule_transaction_timeout(&transaction, transaction.deadline);

        debug!("began transaction {} with a timeout of {:?}", transaction.gtrid, timeout);
        Ok(transaction)
    }

    pub fn gtrid(&self) -> &Uid {
        &self.gtrid
    }

    pub fn status(&self) -> Status {
        *self.status.lock()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Creation time embedded in the gtrid
    pub fn created_at(&self) -> Option<Timestamp> {
        self.gtrid.timestamp()
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    /// Unique names of every enlisted resource
    pub fn enlisted_names(&self) -> BTreeSet<String> {
        unique_names(self.resources.lock().iter())
    }

    /// Holders of every enlisted resource, in commit order
    pub fn enlisted(&self) -> Vec<Arc<ResourceHolderState>> {
        self.resources.lock().iter().cloned().collect()
    }

    // ========================================================================
    // Enlistment
    // ========================================================================

    /// Start a branch of this transaction on `resource`.
    ///
    /// Enlisting a resource that is already enlisted reattaches its branch.
    /// A resource of the same resource manager as an ended branch joins that
    /// branch when both allow it.
    pub fn enlist_resource(&self, resource: Arc<dyn XaResource>) -> Result<()> {
        self.check_accepts_work("enlist a resource in")?;

        let producer = self
            .services
            .registrar()
            .find_producer(resource.as_ref())
            .ok_or_else(|| {
                TransactionError::UnknownResource(
                    "resource does not belong to any registered producer".to_string(),
                )
            })?;

        if producer.is_failed() {
            info!(
                "resource {} failed earlier, recovering it before enlistment",
                producer.unique_name()
            );
            incremental_recover(&self.services, &producer).map_err(|e| {
                Error::Transaction(TransactionError::ResourceUnavailable(format!(
                    "{} cannot be recovered: {}",
                    producer.unique_name(),
                    e
                )))
            })?;
        }

        let config = producer.config().clone();
        let timeout_secs = self.remaining_timeout_secs();
        let mut resources = self.resources.lock();

        if let Some(existing) = resources.iter().find(|h| h.holds(resource.as_ref())).cloned() {
            match existing.phase() {
                BranchPhase::Active => {
                    debug!("resource {} is already enlisted in {}", config.unique_name, self.gtrid);
                }
                BranchPhase::Suspended => existing.resume()?,
                BranchPhase::Ended | BranchPhase::Idle => existing.rejoin()?,
            }
            return Ok(());
        }

        if config.last_resource && !self.services.config().allow_multiple_lrc {
            if let Some(other) = resources.iter().find(|h| h.is_last_resource()) {
                return Err(Error::illegal_state(format!(
                    "cannot enlist last resource {} next to last resource {} in transaction {}",
                    config.unique_name,
                    other.unique_name(),
                    self.gtrid
                )));
            }
        }

        let mut joined = None;
        if config.use_tm_join && !config.last_resource {
            for candidate in resources.iter() {
                if !candidate.config().use_tm_join
                    || candidate.is_last_resource()
                    || candidate.phase() != BranchPhase::Ended
                {
                    continue;
                }
                if candidate.is_same_rm(resource.as_ref())? {
                    joined = Some(candidate.clone());
                    break;
                }
            }
        }

        let position = config.two_pc_ordering_position;
        let holder = match &joined {
            Some(other) => {
                debug!(
                    "resource {} joins branch {} of {}",
                    config.unique_name,
                    other.xid(),
                    other.unique_name()
                );
                let holder = ResourceHolderState::join(resource, config, other);
                holder.start(TMJOIN, timeout_secs)?;
                holder
            }
            None => {
                let xid = self.services.uid_generator().generate_xid(&self.gtrid);
                let holder = ResourceHolderState::new(resource, config, xid);
                holder.start(TMNOFLAGS, timeout_secs)?;
                holder
            }
        };

        debug!(
            "enlisted resource {} in {} with branch {}",
            holder.unique_name(),
            self.gtrid,
            holder.xid()
        );
        resources.add(Arc::new(holder), position);
        Ok(())
    }

    /// End the branch of `resource`, `TMFAIL` also marks the transaction
    /// rollback only. Returns false when the resource is not enlisted.
    pub fn delist_resource(&self, resource: &dyn XaResource, flags: i32) -> Result<bool> {
        let status = self.status();
        if !matches!(status, Status::Active | Status::MarkedRollback) {
            return Err(Error::wrong_status("delist a resource from", status));
        }

        let holder = self
            .resources
            .lock()
            .iter()
            .find(|h| h.holds(resource))
            .cloned();
        let holder = match holder {
            Some(holder) => holder,
            None => return Ok(false),
        };

        if let Err(e) = holder.end(flags) {
            warn!(
                "error ending branch {} of {}, marking {} rollback only: {}",
                holder.xid(),
                holder.unique_name(),
                self.gtrid,
                e
            );
            self.set_rollback_only()?;
            return Err(e.into());
        }

        if flags & TMFAIL != 0 {
            self.set_rollback_only()?;
        }
        Ok(true)
    }

    // ========================================================================
    // Synchronizations and resources
    // ========================================================================

    pub fn register_synchronization(&self, synchronization: Arc<dyn Synchronization>) -> Result<()> {
        self.check_accepts_work("register a synchronization in")?;
        self.synchronizations.lock().register(synchronization);
        Ok(())
    }

    pub fn register_interposed_synchronization(
        &self,
        synchronization: Arc<dyn Synchronization>,
    ) -> Result<()> {
        self.check_accepts_work("register a synchronization in")?;
        self.synchronizations.lock().register_interposed(synchronization);
        Ok(())
    }

    pub fn put_resource(&self, key: impl Into<String>, value: Arc<dyn Any + Send + Sync>) {
        self.resource_map.lock().insert(key.into(), value);
    }

    pub fn get_resource(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.resource_map.lock().get(key).cloned()
    }

    // ========================================================================
    // Status changes
    // ========================================================================

    pub fn set_rollback_only(&self) -> Result<()> {
        {
            let mut status = self.status.lock();
            match *status {
                Status::MarkedRollback => return Ok(()),
                Status::Active | Status::Preparing | Status::Prepared => {
                    *status = Status::MarkedRollback;
                }
                other => return Err(Error::wrong_status("mark rollback only", other)),
            }
        }
        debug!("transaction {} marked rollback only", self.gtrid);
        self.journal_status(Status::MarkedRollback, &self.enlisted_names());
        Ok(())
    }

    /// Called by the timeout task: an ACTIVE transaction becomes rollback only
    pub fn mark_timed_out(&self) {
        let mut status = self.status.lock();
        if *status == Status::Active {
            *status = Status::MarkedRollback;
            self.timed_out.store(true, Ordering::SeqCst);
            warn!(
                "transaction {} timed out after {:?}, marked rollback only",
                self.gtrid, self.timeout
            );
        }
    }

    /// End every branch still associated with a session
    pub fn suspend(&self) -> Result<()> {
        self.for_each_branch("suspend", |holder| holder.end(TMSUSPEND))
    }

    /// Reattach every suspended branch
    pub fn resume(&self) -> Result<()> {
        self.for_each_branch("resume", ResourceHolderState::resume)
    }

    // ========================================================================
    // Completion
    // ========================================================================

    /// Commit the transaction.
    ///
    /// A rollback-only transaction is rolled back and a rollback-class error
    /// is returned. Resources deviating from the decision surface as a
    /// heuristic error.
    pub fn commit(&self) -> Result<()> {
        let status = self.status();
        if !matches!(status, Status::Active | Status::MarkedRollback) {
            return Err(Error::wrong_status("commit", status));
        }
        self.services
            .task_scheduler()
            .cancel_transaction_timeout(&self.gtrid);

        if status == Status::MarkedRollback {
            return self.rollback_marked();
        }

        let synchronizations = self.synchronizations.lock().before_completion_order();
        if let Err(e) = fire_before_completion(&synchronizations) {
            warn!("before_completion failed in {}, rolling back: {:#}", self.gtrid, e);
            self.set_rollback_only()?;
            return self.rollback_after_failure(Error::rolled_back_by(
                "a synchronization failed before completion",
                Error::System(format!("{:#}", e)),
            ));
        }
        if self.status() == Status::MarkedRollback {
            return self.rollback_marked();
        }

        if let Err(e) = self.end_active_branches() {
            self.set_rollback_only()?;
            return self.rollback_after_failure(Error::rolled_back_by(
                "a branch could not be ended before prepare",
                e,
            ));
        }

        let participants = distinct_participants(&self.resources.lock());
        let all_names = unique_names(participants.iter());
        if participants.is_empty() && self.services.config().warn_about_zero_resource_transaction {
            warn!("committing transaction {} with no enlisted resource", self.gtrid);
        }

        if participants.len() > 1 {
            // the timeout task may have marked the transaction in the meantime
            if let Err(e) = self.change_status(Status::Preparing, Some(&all_names)) {
                return self.rollback_after_failure(e);
            }
        }
        let engine = self.services.engine();
        let prepared = match Preparer::new(engine).prepare(&participants, Some(self.deadline)) {
            Ok(prepared) => prepared,
            Err(e) => return self.rollback_after_failure(e),
        };

        let (committers, one_phase) = match prepared {
            PrepareOutcome::NoParticipant => (Scheduler::new(), false),
            PrepareOutcome::OnePhase(holder) => {
                let position = holder.ordering_position();
                (std::iter::once((holder, position)).collect(), true)
            }
            PrepareOutcome::Prepared(voters) => {
                if let Err(e) = self.change_status(Status::Prepared, Some(&all_names)) {
                    return self.rollback_after_failure(e);
                }
                (voters, false)
            }
        };

        // every prepared voter needs a durable decision for recovery to replay
        let journaled = !one_phase && !committers.is_empty();
        let voter_names = unique_names(committers.iter());
        let decision = if journaled { Some(&voter_names) } else { None };
        if let Err(e) = self.change_status(Status::Committing, decision) {
            error!("cannot journal the commit decision of {}: {}", self.gtrid, e);
            return self.rollback_after_failure(e);
        }

        match Committer::new(engine).commit(&self.gtrid, &committers, one_phase, Some(self.deadline)) {
            Ok(report) => {
                let committed = report.completed_names();
                self.finish(Status::Committed, journaled.then_some(&committed))
            }
            Err(e) if e.is_rollback() => {
                self.finish(Status::RolledBack, Some(&all_names))?;
                Err(e)
            }
            Err(e) => {
                let decided = match &e {
                    Error::Heuristic(h) => completed_names(&h.outcomes),
                    _ => BTreeSet::new(),
                };
                self.finish(Status::Unknown, journaled.then_some(&decided))?;
                Err(e)
            }
        }
    }

    /// Roll the transaction back
    pub fn rollback(&self) -> Result<()> {
        let status = self.status();
        if !matches!(
            status,
            Status::Active | Status::MarkedRollback | Status::Preparing | Status::Prepared
        ) {
            return Err(Error::wrong_status("roll back", status));
        }
        self.services
            .task_scheduler()
            .cancel_transaction_timeout(&self.gtrid);
        self.rollback_internal()
    }

    fn rollback_internal(&self) -> Result<()> {
        if let Err(e) = self.end_active_branches() {
            warn!("error ending branches of {} before rollback: {}", self.gtrid, e);
        }

        let participants = distinct_participants(&self.resources.lock());
        let all_names = unique_names(participants.iter());
        self.change_status(Status::RollingBack, Some(&all_names))?;

        // a timed out transaction must still get its rollback attempts
        let deadline = Instant::now() + self.timeout;
        match Rollbacker::new(self.services.engine()).rollback(&self.gtrid, &participants, Some(deadline)) {
            Ok(_) => self.finish(Status::RolledBack, Some(&all_names)),
            Err(e) => {
                self.finish(Status::Unknown, None)?;
                Err(e)
            }
        }
    }

    fn rollback_marked(&self) -> Result<()> {
        self.rollback_internal()?;
        if self.is_timed_out() {
            Err(Error::rolled_back(format!(
                "transaction {} timed out after {:?}",
                self.gtrid, self.timeout
            )))
        } else {
            Err(Error::rolled_back(format!(
                "transaction {} was marked rollback only",
                self.gtrid
            )))
        }
    }

    /// Roll back after `cause` prevented the commit; a heuristic outcome of
    /// the rollback takes precedence over `cause`
    fn rollback_after_failure(&self, cause: Error) -> Result<()> {
        match self.rollback_internal() {
            Ok(()) => Err(cause),
            Err(e) if e.is_heuristic() => {
                error!("rollback of {} after failure ({}) was not clean", self.gtrid, cause);
                Err(e)
            }
            Err(e) => {
                error!("rollback of {} after failure ({}) failed: {}", self.gtrid, cause, e);
                Err(cause)
            }
        }
    }

    /// Reach a final status: journal it, notify synchronizations and leave
    /// the in-flight registry
    fn finish(&self, status: Status, journal_names: Option<&BTreeSet<String>>) -> Result<()> {
        let mut journal_error = None;
        if let Some(names) = journal_names.filter(|n| !n.is_empty()) {
            let journal = self.services.journal();
            let written = journal.log(status, &self.gtrid, names).and_then(|()| {
                if status.is_recovery_relevant() {
                    journal.force()
                } else {
                    Ok(())
                }
            });
            match written {
                Err(e) if status.is_recovery_relevant() => {
                    error!("cannot journal status {} of {}: {}", status, self.gtrid, e);
                    journal_error = Some(e);
                }
                Err(e) => warn!("cannot journal status {} of {}: {}", status, self.gtrid, e),
                Ok(()) => {}
            }
        }

        {
            let mut current = self.status.lock();
            if !current.can_transition_to(status) {
                debug!("transaction {} jumps from {} to {}", self.gtrid, *current, status);
            }
            *current = status;
        }

        let synchronizations = self.synchronizations.lock().after_completion_order();
        fire_after_completion(&synchronizations, status);
        self.services.remove_in_flight(&self.gtrid);
        debug!("transaction {} completed with status {}", self.gtrid, status);

        match journal_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Move to `next`, journaling it with `names` when given. Journal
    /// failures only matter for the statuses recovery depends on.
    fn change_status(&self, next: Status, names: Option<&BTreeSet<String>>) -> Result<()> {
        let current = self.status();
        if current != next && !current.can_transition_to(next) {
            return Err(Error::System(format!(
                "illegal status change of {} from {} to {}",
                self.gtrid, current, next
            )));
        }

        if let Some(names) = names {
            if next.is_recovery_relevant() {
                let journal = self.services.journal();
                journal.log(next, &self.gtrid, names)?;
                journal.force()?;
            } else {
                self.journal_status(next, names);
            }
        }

        *self.status.lock() = next;
        Ok(())
    }

    /// Journal a status recovery does not depend on
    fn journal_status(&self, status: Status, names: &BTreeSet<String>) {
        if let Err(e) = self.services.journal().log(status, &self.gtrid, names) {
            warn!("cannot journal status {} of {}: {}", status, self.gtrid, e);
        }
    }

    fn end_active_branches(&self) -> Result<()> {
        self.for_each_branch("end", |holder| holder.end(TMSUCCESS))
    }

    /// Apply `op` to every holder, returning the first failure after trying all
    fn for_each_branch<F>(&self, what: &str, op: F) -> Result<()>
    where
        F: Fn(&ResourceHolderState) -> crate::resource::XaResult<()>,
    {
        let holders = self.enlisted();
        let mut first_error = None;
        for holder in &holders {
            if let Err(e) = op(holder) {
                warn!(
                    "cannot {} branch {} of {}: {}",
                    what,
                    holder.xid(),
                    holder.unique_name(),
                    e
                );
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn check_accepts_work(&self, operation: &str) -> Result<()> {
        match self.status() {
            Status::Active => Ok(()),
            Status::MarkedRollback => Err(Error::rolled_back(format!(
                "transaction {} is marked rollback only",
                self.gtrid
            ))),
            other => Err(Error::wrong_status(operation, other)),
        }
    }

    fn remaining_timeout_secs(&self) -> u32 {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        u32::try_from(remaining.as_secs()).unwrap_or(u32::MAX).max(1)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("gtrid", &self.gtrid)
            .field("status", &self.status())
            .field("resources", &self.resources.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Event, MockProducer, MockXaResource, RecordingJournal, RecordingSynchronization};
    use crate::resource::ResourceConfig;
    use lumatm_common::config::Config;
    use lumatm_common::error::HeuristicKind;
    use lumatm_common::xa::{Vote, XaError, XAER_RMERR, XAER_RMFAIL, XA_HEURRB};
    use lumatm_journal::Journal;

    fn setup_with(config: Config) -> (Arc<RecordingJournal>, Arc<Services>) {
        let journal = Arc::new(RecordingJournal::new());
        let config = Config {
            server_id: Some("node-a".to_string()),
            ..config
        };
        let services = Services::with_journal(config, journal.clone()).unwrap();
        (journal, services)
    }

    fn setup() -> (Arc<RecordingJournal>, Arc<Services>) {
        setup_with(Config::default())
    }

    fn register(services: &Services, config: ResourceConfig) -> Arc<MockProducer> {
        let producer = MockProducer::with_config(config);
        services.registrar().register(producer.clone()).unwrap();
        producer
    }

    fn enlist(services: &Services, tx: &Transaction, name: &str) -> Arc<MockXaResource> {
        let session = register(services, ResourceConfig::new(name)).create_resource();
        tx.enlist_resource(session.clone()).unwrap();
        session
    }

    #[test]
    fn test_single_resource_commits_in_one_phase() {
        let (journal, services) = setup();
        let tx = Transaction::begin(&services, Duration::from_secs(60)).unwrap();
        let db = enlist(&services, &tx, "db");

        tx.commit().unwrap();
        assert_eq!(tx.status(), Status::Committed);
        assert_eq!(db.commits(), vec![true]);
        assert!(db.prepares().is_empty());
        assert_eq!(journal.count(Status::Committing), 0);
        assert_eq!(services.in_flight_count(), 0);
    }

    #[test]
    fn test_two_phase_commit_order_and_journal() {
        let (journal, services) = setup();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let tx = Transaction::begin(&services, Duration::from_secs(60)).unwrap();
        let db = register(&services, ResourceConfig::new("db")).create_resource();
        let mq = register(&services, ResourceConfig::new("mq")).create_resource();
        db.attach_log(&log);
        mq.attach_log(&log);
        tx.enlist_resource(db.clone()).unwrap();
        tx.enlist_resource(mq.clone()).unwrap();

        tx.commit().unwrap();
        assert_eq!(
            *log.lock(),
            vec![
                "db:start", "mq:start", "db:end", "mq:end", "db:prepare", "mq:prepare", "db:commit",
                "mq:commit",
            ]
        );
        assert_eq!(db.commits(), vec![false]);
        assert_eq!(journal.count(Status::Committing), 1);
        assert_eq!(journal.count(Status::Committed), 1);
        assert!(journal.collect_dangling_records().unwrap().is_empty());
    }

    #[test]
    fn test_ordering_position_drives_commit_order() {
        let (_journal, services) = setup();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let tx = Transaction::begin(&services, Duration::from_secs(60)).unwrap();
        let broker = register(&services, ResourceConfig::new("broker").with_ordering_position(10))
            .create_resource();
        let db = register(&services, ResourceConfig::new("db").with_ordering_position(0))
            .create_resource();
        broker.attach_log(&log);
        db.attach_log(&log);
        tx.enlist_resource(broker.clone()).unwrap();
        tx.enlist_resource(db.clone()).unwrap();

        tx.commit().unwrap();
        let commits: Vec<_> = log
            .lock()
            .iter()
            .filter(|e| e.ends_with(":commit"))
            .cloned()
            .collect();
        assert_eq!(commits, vec!["db:commit", "broker:commit"]);
    }

    #[test]
    fn test_rollback_only_never_commits() {
        let (journal, services) = setup();
        let tx = Transaction::begin(&services, Duration::from_secs(60)).unwrap();
        let db = enlist(&services, &tx, "db");
        let mq = enlist(&services, &tx, "mq");

        tx.set_rollback_only().unwrap();
        let err = tx.commit().unwrap_err();
        assert!(err.is_rollback());
        assert!(db.commits().is_empty() && mq.commits().is_empty());
        assert_eq!(db.rollbacks().len(), 1);
        assert_eq!(mq.rollbacks().len(), 1);
        assert_eq!(tx.status(), Status::RolledBack);
        assert_eq!(journal.count(Status::Committing), 0);
    }

    #[test]
    fn test_timed_out_commit_reports_timeout() {
        let (_journal, services) = setup();
        let tx = Transaction::begin(&services, Duration::from_secs(60)).unwrap();
        let db = enlist(&services, &tx, "db");

        tx.mark_timed_out();
        assert!(tx.is_timed_out());
        let err = tx.commit().unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert_eq!(db.rollbacks().len(), 1);
    }

    #[test]
    fn test_prepare_failure_rolls_everything_back() {
        let (journal, services) = setup();
        let tx = Transaction::begin(&services, Duration::from_secs(60)).unwrap();
        let db = enlist(&services, &tx, "db");
        let mq = enlist(&services, &tx, "mq");
        mq.fail_prepare(XaError::new(XAER_RMERR, "constraint violation"));

        let err = tx.commit().unwrap_err();
        assert!(err.is_rollback());
        assert_eq!(tx.status(), Status::RolledBack);
        assert!(db.commits().is_empty());
        assert_eq!(db.rollbacks().len(), 1);
        assert_eq!(journal.count(Status::Committing), 0);
    }

    #[test]
    fn test_read_only_voters_are_left_out() {
        let (journal, services) = setup();
        let tx = Transaction::begin(&services, Duration::from_secs(60)).unwrap();
        let db = enlist(&services, &tx, "db");
        let mq = enlist(&services, &tx, "mq");
        db.set_vote(Vote::ReadOnly);

        tx.commit().unwrap();
        assert!(db.commits().is_empty());
        assert_eq!(mq.commits(), vec![false]);
        // the decision names the remaining voter only
        let decisions: Vec<_> = journal
            .records()
            .into_iter()
            .filter(|r| r.status() == Status::Committing)
            .collect();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].unique_names().iter().collect::<Vec<_>>(), vec!["mq"]);
        assert!(journal.collect_dangling_records().unwrap().is_empty());
    }

    #[test]
    fn test_single_voter_left_unfinished_is_committed_by_recovery() {
        let (journal, services) = setup();
        let tx = Transaction::begin(&services, Duration::from_secs(60)).unwrap();
        let db = enlist(&services, &tx, "db");
        let mq_producer = register(&services, ResourceConfig::new("mq"));
        let mq = mq_producer.create_resource();
        tx.enlist_resource(mq.clone()).unwrap();
        db.set_vote(Vote::ReadOnly);
        mq.fail_commit(XaError::new(XAER_RMFAIL, "connection reset"));

        tx.commit().unwrap();
        assert_eq!(tx.status(), Status::Committed);
        assert_eq!(mq_producer.resource().in_doubt().len(), 1);
        let dangling = journal.collect_dangling_records().unwrap();
        assert_eq!(dangling[tx.gtrid()].unique_names().iter().collect::<Vec<_>>(), vec!["mq"]);

        std::thread::sleep(Duration::from_millis(5));
        let report = crate::recovery::Recoverer::new(services).run().unwrap();
        assert_eq!(report.committed, 1);
        assert_eq!(report.rolled_back, 0);
        assert!(mq_producer.resource().rollbacks().is_empty());
        assert!(mq_producer.resource().in_doubt().is_empty());
        assert!(journal.collect_dangling_records().unwrap().is_empty());
    }

    #[test]
    fn test_marked_while_ending_branches_rolls_back() {
        let (journal, services) = setup();
        let tx = Transaction::begin(&services, Duration::from_secs(60)).unwrap();
        let db = enlist(&services, &tx, "db");
        let _mq = enlist(&services, &tx, "mq");
        db.set_delay(Duration::from_millis(200));

        let marker = {
            let tx = tx.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                tx.set_rollback_only().unwrap();
            })
        };
        assert!(tx.commit().is_err());
        marker.join().unwrap();

        assert_eq!(tx.status(), Status::RolledBack);
        assert!(db.prepares().is_empty());
        assert_eq!(db.rollbacks().len(), 1);
        assert_eq!(journal.count(Status::Committing), 0);
        assert_eq!(services.in_flight_count(), 0);
    }

    #[test]
    fn test_journal_failure_before_commit_rolls_back() {
        let (journal, services) = setup();
        let tx = Transaction::begin(&services, Duration::from_secs(60)).unwrap();
        let db = enlist(&services, &tx, "db");
        let mq = enlist(&services, &tx, "mq");

        // PREPARING and PREPARED writes are only warned about, COMMITTING aborts
        journal.fail_next(3);
        let err = tx.commit().unwrap_err();
        assert!(err.is_system());
        assert_eq!(tx.status(), Status::RolledBack);
        assert!(db.commits().is_empty() && mq.commits().is_empty());
        assert_eq!(db.rollbacks().len(), 1);
    }

    #[test]
    fn test_heuristic_rollback_in_commit_phase() {
        let (journal, services) = setup();
        let tx = Transaction::begin(&services, Duration::from_secs(60)).unwrap();
        let _db = enlist(&services, &tx, "db");
        let mq = enlist(&services, &tx, "mq");
        mq.fail_commit(XaError::new(XA_HEURRB, "operator rolled back"));

        let err = tx.commit().unwrap_err();
        assert_eq!(err.heuristic_kind(), Some(HeuristicKind::Mixed));
        assert_eq!(tx.status(), Status::Unknown);
        assert_eq!(mq.forgotten().len(), 1);
        assert!(journal.collect_dangling_records().unwrap().is_empty());
    }

    #[test]
    fn test_unfinished_commit_is_left_to_recovery() {
        let (journal, services) = setup();
        let tx = Transaction::begin(&services, Duration::from_secs(60)).unwrap();
        let _db = enlist(&services, &tx, "db");
        let mq = enlist(&services, &tx, "mq");
        mq.fail_commit(XaError::new(XAER_RMFAIL, "connection reset"));

        tx.commit().unwrap();
        assert_eq!(tx.status(), Status::Committed);
        let dangling = journal.collect_dangling_records().unwrap();
        let pending = &dangling[tx.gtrid()];
        assert_eq!(pending.unique_names().iter().collect::<Vec<_>>(), vec!["mq"]);
    }

    #[test]
    fn test_failing_synchronization_rolls_back() {
        let (_journal, services) = setup();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let tx = Transaction::begin(&services, Duration::from_secs(60)).unwrap();
        let db = enlist(&services, &tx, "db");
        tx.register_synchronization(RecordingSynchronization::failing("flush", &log))
            .unwrap();

        let err = tx.commit().unwrap_err();
        assert!(err.is_rollback());
        assert!(db.commits().is_empty());
        assert_eq!(*log.lock(), vec!["before:flush", "after:flush:ROLLEDBACK"]);
    }

    #[test]
    fn test_rollback_from_active() {
        let (_journal, services) = setup();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let tx = Transaction::begin(&services, Duration::from_secs(60)).unwrap();
        let db = enlist(&services, &tx, "db");
        tx.register_synchronization(RecordingSynchronization::new("cache", &log))
            .unwrap();

        tx.rollback().unwrap();
        assert_eq!(tx.status(), Status::RolledBack);
        assert_eq!(db.rollbacks().len(), 1);
        assert_eq!(*log.lock(), vec!["after:cache:ROLLEDBACK"]);
        assert!(tx.rollback().is_err());
        assert!(tx.commit().is_err());
    }

    #[test]
    fn test_enlisting_twice_is_a_no_op() {
        let (_journal, services) = setup();
        let tx = Transaction::begin(&services, Duration::from_secs(60)).unwrap();
        let db = enlist(&services, &tx, "db");
        tx.enlist_resource(db.clone()).unwrap();

        let starts = db
            .events()
            .iter()
            .filter(|e| matches!(e, Event::Start { .. }))
            .count();
        assert_eq!(starts, 1);
        assert_eq!(tx.enlisted().len(), 1);
        tx.rollback().unwrap();
    }

    #[test]
    fn test_unknown_resource_is_refused() {
        let (_journal, services) = setup();
        let tx = Transaction::begin(&services, Duration::from_secs(60)).unwrap();
        let err = tx.enlist_resource(MockXaResource::new("stray")).unwrap_err();
        assert!(matches!(err, Error::Transaction(TransactionError::UnknownResource(_))));
        tx.rollback().unwrap();
    }

    #[test]
    fn test_same_rm_joins_ended_branch() {
        let (_journal, services) = setup();
        let producer = register(&services, ResourceConfig::new("db"));
        let tx = Transaction::begin(&services, Duration::from_secs(60)).unwrap();

        let first = producer.create_resource();
        tx.enlist_resource(first.clone()).unwrap();
        assert!(tx.delist_resource(first.as_ref(), TMSUCCESS).unwrap());

        let second = producer.create_resource();
        tx.enlist_resource(second.clone()).unwrap();
        let holders = tx.enlisted();
        assert_eq!(holders.len(), 2);
        assert_eq!(holders[0].xid(), holders[1].xid());
        assert!(second
            .events()
            .iter()
            .any(|e| matches!(e, Event::Start { flags, .. } if *flags == TMJOIN)));

        // one branch, committed once in one phase
        tx.commit().unwrap();
        assert_eq!(first.commits().len() + second.commits().len(), 1);
    }

    #[test]
    fn test_single_last_resource_per_transaction() {
        let (_journal, services) = setup();
        let tx = Transaction::begin(&services, Duration::from_secs(60)).unwrap();
        let lrc1 = register(&services, ResourceConfig::new("lrc1").with_last_resource(true));
        let lrc2 = register(&services, ResourceConfig::new("lrc2").with_last_resource(true));

        tx.enlist_resource(lrc1.create_resource()).unwrap();
        let err = tx.enlist_resource(lrc2.create_resource()).unwrap_err();
        assert!(matches!(err, Error::Transaction(TransactionError::IllegalState(_))));
        tx.rollback().unwrap();
    }

    #[test]
    fn test_multiple_last_resources_when_allowed() {
        let (_journal, services) = setup_with(Config {
            allow_multiple_lrc: true,
            ..Config::default()
        });
        let tx = Transaction::begin(&services, Duration::from_secs(60)).unwrap();
        let lrc1 = register(&services, ResourceConfig::new("lrc1").with_last_resource(true));
        let lrc2 = register(&services, ResourceConfig::new("lrc2").with_last_resource(true));

        tx.enlist_resource(lrc1.create_resource()).unwrap();
        tx.enlist_resource(lrc2.create_resource()).unwrap();
        tx.rollback().unwrap();
    }

    #[test]
    fn test_delist_with_failure_marks_rollback_only() {
        let (_journal, services) = setup();
        let tx = Transaction::begin(&services, Duration::from_secs(60)).unwrap();
        let db = enlist(&services, &tx, "db");

        assert!(tx.delist_resource(db.as_ref(), TMFAIL).unwrap());
        assert_eq!(tx.status(), Status::MarkedRollback);
        assert!(!tx.delist_resource(MockXaResource::new("other").as_ref(), TMSUCCESS).unwrap());

        let err = tx.enlist_resource(db.clone()).unwrap_err();
        assert!(err.is_rollback());
        assert!(tx.commit().unwrap_err().is_rollback());
    }

    #[test]
    fn test_asynchronous_two_phase_commit() {
        let (journal, services) = setup_with(Config {
            asynchronous_2pc: true,
            async_pool_size: 2,
            ..Config::default()
        });
        let tx = Transaction::begin(&services, Duration::from_secs(60)).unwrap();
        let db = enlist(&services, &tx, "db");
        let mq = enlist(&services, &tx, "mq");

        tx.commit().unwrap();
        assert_eq!(db.commits(), vec![false]);
        assert_eq!(mq.commits(), vec![false]);
        assert_eq!(journal.count(Status::Committed), 1);
        services.engine().executor().shutdown();
    }

    #[test]
    fn test_transaction_resources() {
        let (_journal, services) = setup();
        let tx = Transaction::begin(&services, Duration::from_secs(60)).unwrap();
        tx.put_resource("session", Arc::new(String::from("s-1")));
        let value = tx.get_resource("session").unwrap();
        assert_eq!(value.downcast_ref::<String>().map(String::as_str), Some("s-1"));
        assert!(tx.get_resource("missing").is_none());
        tx.rollback().unwrap();
    }
}
