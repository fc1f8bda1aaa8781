//! Components shared by the transactions of one manager

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use lumatm_common::config::Config;
use lumatm_common::error::Result;
use lumatm_common::types::{Timestamp, Uid};
use lumatm_journal::{create_journal, Journal};

use crate::executor::{AsyncExecutor, Executor, SyncExecutor};
use crate::registrar::ResourceRegistrar;
use crate::timer::TaskScheduler;
use crate::transaction::Transaction;
use crate::twopc::PhaseEngine;
use crate::uid::UidGenerator;

/// Process-scoped state of one transaction manager instance
pub struct Services {
    config: Config,
    journal: Arc<dyn Journal>,
    uid_generator: UidGenerator,
    registrar: ResourceRegistrar,
    engine: PhaseEngine,
    task_scheduler: TaskScheduler,
    /// Live transactions by gtrid
    in_flight: DashMap<Uid, Arc<Transaction>>,
    shutting_down: AtomicBool,
}

impl Services {
    /// Build the services with the journal selected by the configuration
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let journal = create_journal(&config);
        Self::with_journal(config, journal)
    }

    pub fn with_journal(config: Config, journal: Arc<dyn Journal>) -> Result<Arc<Self>> {
        config.validate()?;

        let executor: Arc<dyn Executor> = if config.asynchronous_2pc {
            Arc::new(AsyncExecutor::new(config.async_pool_size)?)
        } else {
            Arc::new(SyncExecutor)
        };

        let uid_generator = UidGenerator::new(config.server_id_bytes());
        let task_scheduler = TaskScheduler::start()?;

        info!(
            "transaction manager services ready (server id '{}', {} 2PC)",
            String::from_utf8_lossy(uid_generator.server_id()),
            if config.asynchronous_2pc { "asynchronous" } else { "synchronous" }
        );

        Ok(Arc::new(Self {
            config,
            journal,
            uid_generator,
            registrar: ResourceRegistrar::new(),
            engine: PhaseEngine::new(executor),
            task_scheduler,
            in_flight: DashMap::new(),
            shutting_down: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn journal(&self) -> &Arc<dyn Journal> {
        &self.journal
    }

    pub fn uid_generator(&self) -> &UidGenerator {
        &self.uid_generator
    }

    pub fn registrar(&self) -> &ResourceRegistrar {
        &self.registrar
    }

    pub fn engine(&self) -> &PhaseEngine {
        &self.engine
    }

    pub fn task_scheduler(&self) -> &TaskScheduler {
        &self.task_scheduler
    }

    pub(crate) fn add_in_flight(&self, transaction: Arc<Transaction>) {
        self.in_flight.insert(transaction.gtrid().clone(), transaction);
    }

    pub(crate) fn remove_in_flight(&self, gtrid: &Uid) {
        self.in_flight.remove(gtrid);
    }

    /// Forget transactions still running when shutdown gave up waiting
    pub(crate) fn abandon_in_flight(&self) -> usize {
        let abandoned = self.in_flight.len();
        self.in_flight.clear();
        abandoned
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Creation time of the oldest live transaction
    pub fn oldest_in_flight_timestamp(&self) -> Option<Timestamp> {
        self.in_flight
            .iter()
            .filter_map(|entry| entry.key().timestamp())
            .min()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Returns false when shutdown had already started
    pub(crate) fn begin_shutdown(&self) -> bool {
        !self.shutting_down.swap(true, Ordering::SeqCst)
    }
}
