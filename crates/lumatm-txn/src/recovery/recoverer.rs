//! Full recovery across every registered resource

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use lumatm_common::error::{Error, Result};

use crate::recovery::{ProducerOutcome, RecoveryContext, RecoveryReport};
use crate::services::Services;

#[derive(Default)]
struct RunState {
    running: bool,
    /// Bumped when a pass ends
    generation: u64,
    last: Option<std::result::Result<RecoveryReport, String>>,
}

/// Runs full recovery passes; concurrent callers share the running pass
pub struct Recoverer {
    services: Arc<Services>,
    state: Mutex<RunState>,
    finished: Condvar,
    executions: AtomicU64,
    committed: AtomicUsize,
    rolled_back: AtomicUsize,
    completion_error: Mutex<Option<String>>,
}

impl Recoverer {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            state: Mutex::new(RunState::default()),
            finished: Condvar::new(),
            executions: AtomicU64::new(0),
            committed: AtomicUsize::new(0),
            rolled_back: AtomicUsize::new(0),
            completion_error: Mutex::new(None),
        }
    }

    /// Run a recovery pass, or wait for the one already running and return
    /// its result
    pub fn run(&self) -> Result<RecoveryReport> {
        {
            let mut state = self.state.lock();
            if state.running {
                let generation = state.generation;
                debug!("recovery already running, waiting for it");
                while state.generation == generation {
                    self.finished.wait(&mut state);
                }
                return match &state.last {
                    Some(Ok(report)) => Ok(report.clone()),
                    Some(Err(message)) => Err(Error::System(format!("recovery failed: {}", message))),
                    None => Err(Error::System("recovery ended without a result".to_string())),
                };
            }
            state.running = true;
        }

        self.executions.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        let result = self.run_pass();

        match &result {
            Ok(report) => {
                self.committed.store(report.committed, Ordering::SeqCst);
                self.rolled_back.store(report.rolled_back, Ordering::SeqCst);
                *self.completion_error.lock() = None;
                if report.committed > 0 || report.rolled_back > 0 {
                    info!("recovery done in {:?}: {}", started.elapsed(), report);
                } else {
                    debug!("recovery done in {:?}: {}", started.elapsed(), report);
                }
            }
            Err(e) => {
                self.committed.store(0, Ordering::SeqCst);
                self.rolled_back.store(0, Ordering::SeqCst);
                *self.completion_error.lock() = Some(e.to_string());
                error!("recovery failed: {}", e);
            }
        }

        {
            let mut state = self.state.lock();
            state.running = false;
            state.generation += 1;
            state.last = Some(match &result {
                Ok(report) => Ok(report.clone()),
                Err(e) => Err(e.to_string()),
            });
        }
        self.finished.notify_all();

        result
    }

    fn run_pass(&self) -> Result<RecoveryReport> {
        let context = RecoveryContext::snapshot(&self.services)?;
        let producers = self.services.registrar().producers();
        debug!(
            "recovering {} resource(s) against {} dangling record(s)",
            producers.len(),
            context.dangling_count()
        );

        let mut report = RecoveryReport::default();
        let mut outcomes: Vec<ProducerOutcome> = Vec::with_capacity(producers.len());
        for producer in producers.iter() {
            match context.recover_producer(producer) {
                Ok(outcome) => {
                    if producer.is_failed() {
                        info!("resource {} is reachable again", producer.unique_name());
                    }
                    producer.set_failed(false);
                    report.committed += outcome.committed;
                    report.rolled_back += outcome.rolled_back;
                    outcomes.push(outcome);
                }
                Err(e) => {
                    warn!(
                        "cannot recover resource {}, marking it failed: {}",
                        producer.unique_name(),
                        e
                    );
                    producer.set_failed(true);
                    report.failed_resources.push(producer.unique_name().to_string());
                }
            }
        }

        context.resolve(&self.services, &outcomes)?;
        Ok(report)
    }

    /// Number of passes actually executed
    pub fn executions_count(&self) -> u64 {
        self.executions.load(Ordering::SeqCst)
    }

    /// Branches committed by the last pass
    pub fn committed_count(&self) -> usize {
        self.committed.load(Ordering::SeqCst)
    }

    /// Branches rolled back by the last pass
    pub fn rolled_back_count(&self) -> usize {
        self.rolled_back.load(Ordering::SeqCst)
    }

    /// Error of the last pass, `None` when it succeeded
    pub fn completion_error(&self) -> Option<String> {
        self.completion_error.lock().clone()
    }
}
