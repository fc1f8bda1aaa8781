//! Transaction manager
//!
//! Entry point of the coordinator: associates transactions with threads,
//! owns the recoverer and drives the lifecycle of the shared services.

use std::any::Any;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use lumatm_common::config::Config;
use lumatm_common::error::{Error, Result, TransactionError};
use lumatm_common::types::{Status, Timestamp, Uid};
use lumatm_journal::Journal;

use crate::recovery::{incremental_recover, Recoverer, RecoveryReport};
use crate::resource::{ResourcePool, ResourceProducer};
use crate::services::Services;
use crate::synchronization::Synchronization;
use crate::transaction::Transaction;

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Default)]
struct ThreadContext {
    transaction: Option<Arc<Transaction>>,
    /// Timeout of the next transaction begun on the thread
    timeout: Option<Duration>,
}

/// JTA-style transaction manager bound to one journal
pub struct TransactionManager {
    services: Arc<Services>,
    recoverer: Arc<Recoverer>,
    threads: DashMap<ThreadId, ThreadContext>,
}

impl TransactionManager {
    /// Start a manager with the journal selected by `config`
    pub fn new(config: Config) -> Result<Self> {
        Self::start(Services::new(config)?)
    }

    /// Start a manager on a caller-provided journal
    pub fn with_journal(config: Config, journal: Arc<dyn Journal>) -> Result<Self> {
        Self::start(Services::with_journal(config, journal)?)
    }

    /// Open the journal, resolve what a previous run left in doubt and
    /// schedule background recovery
    fn start(services: Arc<Services>) -> Result<Self> {
        if let Err(e) = services.journal().open() {
            error!("cannot open the transaction journal: {}", e);
            stop_background(&services, Duration::ZERO);
            return Err(e);
        }

        let recoverer = Arc::new(Recoverer::new(services.clone()));
        match recoverer.run() {
            Ok(report) => info!("startup recovery: {}", report),
            Err(e) => {
                error!("startup recovery failed, refusing to start: {}", e);
                stop_background(&services, Duration::ZERO);
                services.journal().shutdown();
                return Err(e);
            }
        }

        if let Some(interval) = services.config().background_recovery_interval() {
            services
                .task_scheduler()
                .schedule_recovery(&recoverer, Instant::now() + interval, interval);
        }

        info!("transaction manager started");
        Ok(Self {
            services,
            recoverer,
            threads: DashMap::new(),
        })
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn recoverer(&self) -> &Arc<Recoverer> {
        &self.recoverer
    }

    // ========================================================================
    // Demarcation
    // ========================================================================

    /// Begin a transaction and associate it with the calling thread
    pub fn begin(&self) -> Result<Arc<Transaction>> {
        if self.services.is_shutting_down() {
            return Err(Error::illegal_state("transaction manager is shutting down"));
        }

        let mut context = self.threads.entry(thread::current().id()).or_default();
        if let Some(current) = &context.transaction {
            if !current.status().is_terminal() {
                return Err(TransactionError::NotSupported(format!(
                    "nested transactions are not supported, thread already runs {}",
                    current.gtrid()
                ))
                .into());
            }
        }

        let timeout = context
            .timeout
            .unwrap_or_else(|| self.services.config().default_transaction_timeout());
        let transaction = Transaction::begin(&self.services, timeout)?;
        context.transaction = Some(transaction.clone());
        Ok(transaction)
    }

    /// Commit the transaction of the calling thread and dissociate it
    pub fn commit(&self) -> Result<()> {
        self.take_current()?.commit()
    }

    /// Roll back the transaction of the calling thread and dissociate it
    pub fn rollback(&self) -> Result<()> {
        self.take_current()?.rollback()
    }

    pub fn set_rollback_only(&self) -> Result<()> {
        self.require_current()?.set_rollback_only()
    }

    /// Status of the transaction of the calling thread
    pub fn status(&self) -> Status {
        self.transaction()
            .map_or(Status::NoTransaction, |tx| tx.status())
    }

    /// Timeout of transactions begun later on the calling thread, 0 restores
    /// the default
    pub fn set_transaction_timeout(&self, seconds: u64) {
        let timeout = (seconds > 0).then(|| Duration::from_secs(seconds));
        self.threads.entry(thread::current().id()).or_default().timeout = timeout;
    }

    /// Transaction associated with the calling thread
    pub fn transaction(&self) -> Option<Arc<Transaction>> {
        self.threads
            .get(&thread::current().id())
            .and_then(|context| context.transaction.clone())
    }

    /// Dissociate the transaction from the calling thread, ending its branches
    /// with `TMSUSPEND`
    pub fn suspend(&self) -> Result<Option<Arc<Transaction>>> {
        let transaction = match self.transaction() {
            Some(transaction) => transaction,
            None => return Ok(None),
        };
        transaction.suspend()?;
        self.dissociate();
        debug!("suspended transaction {}", transaction.gtrid());
        Ok(Some(transaction))
    }

    /// Associate a suspended transaction with the calling thread
    pub fn resume(&self, transaction: Arc<Transaction>) -> Result<()> {
        if let Some(current) = self.transaction() {
            if !current.status().is_terminal() {
                return Err(Error::illegal_state(format!(
                    "thread already runs transaction {}",
                    current.gtrid()
                )));
            }
        }
        let status = transaction.status();
        if !matches!(status, Status::Active | Status::MarkedRollback) {
            return Err(Error::wrong_status("resume", status));
        }

        transaction.resume()?;
        debug!("resumed transaction {}", transaction.gtrid());
        self.threads
            .entry(thread::current().id())
            .or_default()
            .transaction = Some(transaction);
        Ok(())
    }

    fn require_current(&self) -> Result<Arc<Transaction>> {
        self.transaction()
            .ok_or_else(|| Error::illegal_state("no transaction associated with the current thread"))
    }

    fn take_current(&self) -> Result<Arc<Transaction>> {
        let transaction = self.require_current()?;
        self.dissociate();
        Ok(transaction)
    }

    fn dissociate(&self) {
        let id = thread::current().id();
        if let Some(mut context) = self.threads.get_mut(&id) {
            context.transaction = None;
        }
        self.threads
            .remove_if(&id, |_, context| context.transaction.is_none() && context.timeout.is_none());
    }

    // ========================================================================
    // Resources
    // ========================================================================

    /// Register a producer and recover its in-doubt branches. A producer
    /// that cannot be recovered yet stays registered, marked failed.
    pub fn register_resource(&self, producer: Arc<dyn ResourceProducer>) -> Result<()> {
        self.services.registrar().register(producer.clone())?;
        if let Err(e) = incremental_recover(&self.services, &producer) {
            warn!(
                "resource {} registered but not recovered, it will be retried: {}",
                producer.unique_name(),
                e
            );
        }
        Ok(())
    }

    pub fn unregister_resource(&self, unique_name: &str) -> Result<Arc<dyn ResourceProducer>> {
        self.services.registrar().unregister(unique_name)
    }

    /// Let the manager drive the shrinking of `pool`
    pub fn register_pool(&self, pool: &Arc<dyn ResourcePool>) {
        self.services.task_scheduler().schedule_pool_shrinking(pool);
    }

    pub fn unregister_pool(&self, unique_name: &str) {
        self.services.task_scheduler().cancel_pool_shrinking(unique_name);
    }

    /// Run a full recovery pass now
    pub fn recover(&self) -> Result<RecoveryReport> {
        self.recoverer.run()
    }

    pub fn in_flight_count(&self) -> usize {
        self.services.in_flight_count()
    }

    pub fn oldest_in_flight_timestamp(&self) -> Option<Timestamp> {
        self.services.oldest_in_flight_timestamp()
    }

    pub fn synchronization_registry(&self) -> SynchronizationRegistry<'_> {
        SynchronizationRegistry { manager: self }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Wait for in-flight transactions up to the graceful shutdown interval,
    /// then stop background work and close the journal. Idempotent.
    pub fn shutdown(&self) {
        if !self.services.begin_shutdown() {
            return;
        }
        let grace = self.services.config().graceful_shutdown_interval();
        info!("shutting down transaction manager");

        let deadline = Instant::now() + grace;
        while self.services.in_flight_count() > 0 && Instant::now() < deadline {
            thread::sleep(SHUTDOWN_POLL_INTERVAL);
        }
        let abandoned = self.services.abandon_in_flight();
        if abandoned > 0 {
            warn!(
                "{} transaction(s) still in flight after {:?}, abandoning them to recovery",
                abandoned, grace
            );
        }

        stop_background(&self.services, deadline.saturating_duration_since(Instant::now()));
        self.services.journal().shutdown();
        self.threads.clear();
        info!("transaction manager stopped");
    }
}

fn stop_background(services: &Services, grace: Duration) {
    services.task_scheduler().cancel_recovery();
    services.task_scheduler().shutdown(grace.max(Duration::from_secs(1)));
    services.engine().executor().shutdown();
}

/// Transaction-scoped registry for frameworks, bound to the calling thread
pub struct SynchronizationRegistry<'a> {
    manager: &'a TransactionManager,
}

impl SynchronizationRegistry<'_> {
    /// Gtrid of the current transaction
    pub fn transaction_key(&self) -> Option<Uid> {
        self.manager.transaction().map(|tx| tx.gtrid().clone())
    }

    pub fn register_interposed_synchronization(
        &self,
        synchronization: Arc<dyn Synchronization>,
    ) -> Result<()> {
        self.manager
            .require_current()?
            .register_interposed_synchronization(synchronization)
    }

    pub fn put_resource(&self, key: &str, value: Arc<dyn Any + Send + Sync>) -> Result<()> {
        self.manager.require_current()?.put_resource(key, value);
        Ok(())
    }

    pub fn get_resource(&self, key: &str) -> Result<Option<Arc<dyn Any + Send + Sync>>> {
        Ok(self.manager.require_current()?.get_resource(key))
    }

    pub fn rollback_only(&self) -> Result<bool> {
        Ok(self.manager.require_current()?.status() == Status::MarkedRollback)
    }

    pub fn set_rollback_only(&self) -> Result<()> {
        self.manager.set_rollback_only()
    }

    pub fn transaction_status(&self) -> Status {
        self.manager.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockProducer, RecordingJournal, RecordingSynchronization};
    use lumatm_common::types::Xid;
    use lumatm_common::xa::XaError;
    use parking_lot::Mutex;

    fn config() -> Config {
        Config {
            server_id: Some("node-a".to_string()),
            graceful_shutdown_interval_secs: 1,
            background_recovery_interval_secs: 0,
            ..Config::default()
        }
    }

    fn manager() -> (Arc<RecordingJournal>, TransactionManager) {
        let journal = Arc::new(RecordingJournal::new());
        let tm = TransactionManager::with_journal(config(), journal.clone()).unwrap();
        (journal, tm)
    }

    #[test]
    fn test_begin_commit_without_resources() {
        let (_journal, tm) = manager();
        assert_eq!(tm.status(), Status::NoTransaction);

        let tx = tm.begin().unwrap();
        assert_eq!(tm.status(), Status::Active);
        assert_eq!(tm.in_flight_count(), 1);

        tm.commit().unwrap();
        assert_eq!(tx.status(), Status::Committed);
        assert_eq!(tm.status(), Status::NoTransaction);
        assert_eq!(tm.in_flight_count(), 0);
        tm.shutdown();
    }

    #[test]
    fn test_nested_begin_not_supported() {
        let (_journal, tm) = manager();
        tm.begin().unwrap();
        let err = tm.begin().unwrap_err();
        assert!(matches!(err, Error::Transaction(TransactionError::NotSupported(_))));
        tm.rollback().unwrap();
        tm.shutdown();
    }

    #[test]
    fn test_commit_without_transaction_is_illegal() {
        let (_journal, tm) = manager();
        assert!(tm.commit().is_err());
        assert!(tm.rollback().is_err());
        tm.shutdown();
    }

    #[test]
    fn test_begin_after_shutdown_fails() {
        let (_journal, tm) = manager();
        tm.shutdown();
        tm.shutdown();
        assert!(tm.begin().is_err());
    }

    #[test]
    fn test_transaction_timeout_per_thread() {
        let (_journal, tm) = manager();
        tm.set_transaction_timeout(5);
        let tx = tm.begin().unwrap();
        assert_eq!(tx.timeout(), Duration::from_secs(5));
        tm.rollback().unwrap();

        tm.set_transaction_timeout(0);
        let tx = tm.begin().unwrap();
        assert_eq!(tx.timeout(), Duration::from_secs(60));
        tm.rollback().unwrap();
        tm.shutdown();
    }

    #[test]
    fn test_timed_out_transaction_rolls_back() {
        let (_journal, tm) = manager();
        let producer = MockProducer::new("db");
        tm.register_resource(producer.clone()).unwrap();

        tm.set_transaction_timeout(1);
        let tx = tm.begin().unwrap();
        let session = producer.create_resource();
        tx.enlist_resource(session.clone()).unwrap();

        thread::sleep(Duration::from_millis(1_300));
        assert_eq!(tx.status(), Status::MarkedRollback);
        assert!(tx.is_timed_out());

        let err = tm.commit().unwrap_err();
        assert!(err.is_rollback());
        assert!(err.to_string().contains("timed out"));
        assert!(session.commits().is_empty());
        assert_eq!(session.rollbacks().len(), 1);
        tm.shutdown();
    }

    #[test]
    fn test_suspend_and_resume() {
        let (_journal, tm) = manager();
        let producer = MockProducer::new("db");
        tm.register_resource(producer.clone()).unwrap();

        let tx = tm.begin().unwrap();
        tx.enlist_resource(producer.create_resource()).unwrap();
        let suspended = tm.suspend().unwrap().unwrap();
        assert_eq!(tm.status(), Status::NoTransaction);
        assert_eq!(suspended.status(), Status::Active);

        // another transaction can run meanwhile
        tm.begin().unwrap();
        tm.commit().unwrap();

        tm.resume(suspended).unwrap();
        tm.commit().unwrap();
        assert_eq!(tx.status(), Status::Committed);
        tm.shutdown();
    }

    #[test]
    fn test_startup_recovery_rolls_back_orphans() {
        let journal = Arc::new(RecordingJournal::new());
        let producer = MockProducer::new("db");
        let gtrid = Uid::new(b"node-a", 1_000, 7);
        producer
            .resource()
            .add_in_doubt(Xid::new(gtrid, Uid::new(b"node-a", 1_000, 8)));

        let tm = TransactionManager::with_journal(config(), journal).unwrap();
        tm.register_resource(producer.clone()).unwrap();
        assert!(producer.resource().in_doubt().is_empty());
        tm.shutdown();
    }

    #[test]
    fn test_journal_failure_aborts_startup() {
        let journal = Arc::new(RecordingJournal::new());
        journal.fail_next(1);
        assert!(TransactionManager::with_journal(config(), journal).is_err());
    }

    #[test]
    fn test_unreachable_resource_stays_registered() {
        let (_journal, tm) = manager();
        let producer = MockProducer::new("db");
        producer.resource().fail_recover(XaError::rm_fail("down"));

        tm.register_resource(producer.clone()).unwrap();
        assert!(producer.is_failed());
        assert!(tm.services().registrar().get("db").is_some());

        // enlistment retries recovery and is refused while it fails
        let tx = tm.begin().unwrap();
        let err = tx.enlist_resource(producer.create_resource()).unwrap_err();
        assert!(matches!(
            err,
            Error::Transaction(TransactionError::ResourceUnavailable(_))
        ));

        producer.resource().clear_failures();
        tx.enlist_resource(producer.create_resource()).unwrap();
        assert!(!producer.is_failed());
        tm.rollback().unwrap();
        tm.shutdown();
    }

    #[test]
    fn test_synchronization_registry() {
        let (_journal, tm) = manager();
        let registry = tm.synchronization_registry();
        assert!(registry.transaction_key().is_none());
        assert!(registry.put_resource("k", Arc::new(1u32)).is_err());

        let tx = tm.begin().unwrap();
        assert_eq!(registry.transaction_key().as_ref(), Some(tx.gtrid()));
        registry.put_resource("k", Arc::new(42u32)).unwrap();
        let value = registry.get_resource("k").unwrap().unwrap();
        assert_eq!(value.downcast_ref::<u32>(), Some(&42));

        let log = Arc::new(Mutex::new(Vec::new()));
        registry
            .register_interposed_synchronization(RecordingSynchronization::new("tsr", &log))
            .unwrap();
        assert!(!registry.rollback_only().unwrap());
        registry.set_rollback_only().unwrap();
        assert!(registry.rollback_only().unwrap());
        assert_eq!(registry.transaction_status(), Status::MarkedRollback);

        assert!(tm.commit().unwrap_err().is_rollback());
        assert_eq!(*log.lock(), vec!["after:tsr:ROLLEDBACK"]);
        tm.shutdown();
    }

    #[test]
    fn test_shutdown_abandons_in_flight_after_grace() {
        let (_journal, tm) = manager();
        tm.begin().unwrap();
        let started = Instant::now();
        tm.shutdown();
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(tm.in_flight_count(), 0);
    }
}
