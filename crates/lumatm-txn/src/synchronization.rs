//! Transaction completion callbacks

use std::sync::Arc;

use tracing::warn;

use lumatm_common::types::Status;

use crate::scheduler::Scheduler;

/// Callback notified around transaction completion
pub trait Synchronization: Send + Sync {
    /// Called before the commit starts; an error makes the transaction roll back
    fn before_completion(&self) -> anyhow::Result<()>;

    /// Called once the transaction reached its final status
    fn after_completion(&self, status: Status);
}

const ORDINARY_POSITION: i32 = 0;
const INTERPOSED_POSITION: i32 = i32::MAX;

/// Synchronizations of one transaction, interposed ones run last before
/// completion and first after it
#[derive(Default)]
pub struct Synchronizations {
    scheduler: Scheduler<Arc<dyn Synchronization>>,
}

impl Synchronizations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, synchronization: Arc<dyn Synchronization>) {
        self.scheduler.add(synchronization, ORDINARY_POSITION);
    }

    pub fn register_interposed(&mut self, synchronization: Arc<dyn Synchronization>) {
        self.scheduler.add(synchronization, INTERPOSED_POSITION);
    }

    pub fn len(&self) -> usize {
        self.scheduler.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scheduler.is_empty()
    }

    /// Order of `before_completion` calls
    pub fn before_completion_order(&self) -> Vec<Arc<dyn Synchronization>> {
        self.scheduler.iter().cloned().collect()
    }

    /// Order of `after_completion` calls
    pub fn after_completion_order(&self) -> Vec<Arc<dyn Synchronization>> {
        self.scheduler.iter_reverse().cloned().collect()
    }
}

/// Run `before_completion` callbacks until one fails
pub fn fire_before_completion(synchronizations: &[Arc<dyn Synchronization>]) -> anyhow::Result<()> {
    for synchronization in synchronizations {
        synchronization.before_completion()?;
    }
    Ok(())
}

/// Run every `after_completion` callback; failures are logged
pub fn fire_after_completion(synchronizations: &[Arc<dyn Synchronization>], status: Status) {
    for synchronization in synchronizations {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            synchronization.after_completion(status);
        }));
        if result.is_err() {
            warn!("synchronization panicked in after_completion({})", status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::RecordingSynchronization;
    use parking_lot::Mutex;

    #[test]
    fn test_interposed_run_last_before_and_first_after() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut syncs = Synchronizations::new();
        syncs.register_interposed(RecordingSynchronization::new("interposed", &log));
        syncs.register(RecordingSynchronization::new("first", &log));
        syncs.register(RecordingSynchronization::new("second", &log));

        fire_before_completion(&syncs.before_completion_order()).unwrap();
        fire_after_completion(&syncs.after_completion_order(), Status::Committed);

        assert_eq!(
            *log.lock(),
            vec![
                "before:first",
                "before:second",
                "before:interposed",
                "after:interposed:COMMITTED",
                "after:second:COMMITTED",
                "after:first:COMMITTED",
            ]
        );
    }

    #[test]
    fn test_failing_before_completion_stops_the_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut syncs = Synchronizations::new();
        syncs.register(RecordingSynchronization::failing("broken", &log));
        syncs.register(RecordingSynchronization::new("never", &log));

        assert!(fire_before_completion(&syncs.before_completion_order()).is_err());
        assert_eq!(*log.lock(), vec!["before:broken"]);
    }
}
