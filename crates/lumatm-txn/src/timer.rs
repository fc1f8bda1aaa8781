//! Background task scheduler
//!
//! One thread runs the timed tasks of a transaction manager: transaction
//! timeouts, periodic background recovery and pool shrinking. Tasks only
//! hold weak references so a scheduled task never keeps its target alive.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use lumatm_common::error::Result;
use lumatm_common::types::Uid;

use crate::recovery::Recoverer;
use crate::resource::ResourcePool;
use crate::transaction::Transaction;

/// Identity of a scheduled task; scheduling a key again replaces the task
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskKey {
    Timeout(Uid),
    Recovery,
    PoolShrink(String),
}

enum Task {
    TransactionTimeout(Weak<Transaction>),
    Recovery {
        recoverer: Weak<Recoverer>,
        interval: Duration,
    },
    PoolShrink(Weak<dyn ResourcePool>),
}

type Slot = (Instant, u64);

#[derive(Default)]
struct Queue {
    tasks: BTreeMap<Slot, (TaskKey, Task)>,
    index: HashMap<TaskKey, Slot>,
    sequence: u64,
    stopped: bool,
}

impl Queue {
    fn insert(&mut self, key: TaskKey, task: Task, at: Instant) {
        self.remove(&key);
        self.sequence += 1;
        let slot = (at, self.sequence);
        self.index.insert(key.clone(), slot);
        self.tasks.insert(slot, (key, task));
    }

    fn remove(&mut self, key: &TaskKey) -> bool {
        match self.index.remove(key) {
            Some(slot) => self.tasks.remove(&slot).is_some(),
            None => false,
        }
    }

    fn pop_due(&mut self, now: Instant) -> Option<(TaskKey, Task)> {
        let slot = *self.tasks.keys().next()?;
        if slot.0 > now {
            return None;
        }
        let (key, task) = self.tasks.remove(&slot)?;
        self.index.remove(&key);
        Some((key, task))
    }
}

struct Shared {
    queue: Mutex<Queue>,
    wakeup: Condvar,
}

impl Shared {
    fn schedule(&self, key: TaskKey, task: Task, at: Instant) {
        let mut queue = self.queue.lock();
        if queue.stopped {
            debug!("task scheduler stopped, dropping task {:?}", key);
            return;
        }
        queue.insert(key, task, at);
        self.wakeup.notify_one();
    }

    fn cancel(&self, key: &TaskKey) -> bool {
        let removed = self.queue.lock().remove(key);
        if removed {
            self.wakeup.notify_one();
        }
        removed
    }
}

/// Timed task queue served by a dedicated thread
pub struct TaskScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<(JoinHandle<()>, Receiver<()>)>>,
}

impl TaskScheduler {
    /// Spawn the scheduler thread
    pub fn start() -> Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            wakeup: Condvar::new(),
        });

        // the sender is dropped when the thread exits
        let (done_tx, done_rx) = channel::bounded::<()>(0);
        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("lumatm-task-scheduler".to_string())
            .spawn(move || {
                let _done = done_tx;
                run_loop(&thread_shared);
            })?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some((handle, done_rx))),
        })
    }

    /// Mark `transaction` rollback only at `deadline`
    pub fn schedule_transaction_timeout(&self, transaction: &Arc<Transaction>, deadline: Instant) {
        self.shared.schedule(
            TaskKey::Timeout(transaction.gtrid().clone()),
            Task::TransactionTimeout(Arc::downgrade(transaction)),
            deadline,
        );
    }

    pub fn cancel_transaction_timeout(&self, gtrid: &Uid) -> bool {
        self.shared.cancel(&TaskKey::Timeout(gtrid.clone()))
    }

    /// Run `recoverer` at `first_run`, then every `interval` after each run ended
    pub fn schedule_recovery(&self, recoverer: &Arc<Recoverer>, first_run: Instant, interval: Duration) {
        self.shared.schedule(
            TaskKey::Recovery,
            Task::Recovery {
                recoverer: Arc::downgrade(recoverer),
                interval,
            },
            first_run,
        );
    }

    pub fn cancel_recovery(&self) -> bool {
        self.shared.cancel(&TaskKey::Recovery)
    }

    /// Shrink `pool` whenever it asks for it
    pub fn schedule_pool_shrinking(&self, pool: &Arc<dyn ResourcePool>) {
        match pool.next_shrink_time() {
            Some(at) => self.shared.schedule(
                TaskKey::PoolShrink(pool.unique_name().to_string()),
                Task::PoolShrink(Arc::downgrade(pool)),
                at,
            ),
            None => debug!("pool {} does not need shrinking", pool.unique_name()),
        }
    }

    pub fn cancel_pool_shrinking(&self, unique_name: &str) -> bool {
        self.shared.cancel(&TaskKey::PoolShrink(unique_name.to_string()))
    }

    /// When the earliest queued task is due
    pub fn next_scheduled_time(&self) -> Option<Instant> {
        self.shared.queue.lock().tasks.keys().next().map(|slot| slot.0)
    }

    pub fn count_tasks_queued(&self) -> usize {
        self.shared.queue.lock().tasks.len()
    }

    pub fn is_scheduled(&self, key: &TaskKey) -> bool {
        self.shared.queue.lock().index.contains_key(key)
    }

    /// Drop every queued task and stop the thread, waiting up to `grace`
    /// for a running task to finish
    pub fn shutdown(&self, grace: Duration) {
        {
            let mut queue = self.shared.queue.lock();
            queue.stopped = true;
            queue.tasks.clear();
            queue.index.clear();
        }
        self.shared.wakeup.notify_all();

        let worker = self.worker.lock().take();
        if let Some((handle, done)) = worker {
            match done.recv_timeout(grace) {
                Err(RecvTimeoutError::Disconnected) | Ok(()) => {
                    if handle.join().is_err() {
                        error!("task scheduler thread panicked");
                    }
                    debug!("task scheduler stopped");
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!("task scheduler did not stop within {:?}, abandoning it", grace);
                }
            }
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        if self.worker.get_mut().is_some() {
            self.shutdown(Duration::from_secs(1));
        }
    }
}

fn run_loop(shared: &Arc<Shared>) {
    loop {
        let (key, task) = {
            let mut queue = shared.queue.lock();
            loop {
                if queue.stopped {
                    return;
                }
                if let Some(due) = queue.pop_due(Instant::now()) {
                    break due;
                }
                match queue.tasks.keys().next().map(|slot| slot.0) {
                    Some(at) => {
                        shared.wakeup.wait_until(&mut queue, at);
                    }
                    None => shared.wakeup.wait(&mut queue),
                }
            }
        };

        debug!("running scheduled task {:?}", key);
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            execute(shared, task);
        }));
        if outcome.is_err() {
            error!("scheduled task {:?} panicked", key);
        }
    }
}

fn execute(shared: &Arc<Shared>, task: Task) {
    match task {
        Task::TransactionTimeout(transaction) => {
            if let Some(transaction) = transaction.upgrade() {
                transaction.mark_timed_out();
            }
        }
        Task::Recovery { recoverer, interval } => {
            if recoverer.strong_count() == 0 {
                return;
            }
            // recovery may block on resources, it must not delay timeouts
            let shared = shared.clone();
            let spawned = std::thread::Builder::new()
                .name("lumatm-recovery".to_string())
                .spawn(move || {
                    if let Some(running) = recoverer.upgrade() {
                        match running.run() {
                            Ok(report) => debug!("background recovery done: {}", report),
                            Err(e) => warn!("background recovery failed: {}", e),
                        }
                    }
                    shared.schedule(
                        TaskKey::Recovery,
                        Task::Recovery { recoverer, interval },
                        Instant::now() + interval,
                    );
                });
            if let Err(e) = spawned {
                error!("cannot spawn background recovery thread: {}", e);
            }
        }
        Task::PoolShrink(pool) => {
            let Some(pool) = pool.upgrade() else {
                return;
            };
            if let Err(e) = pool.shrink() {
                warn!("error shrinking pool {}: {}", pool.unique_name(), e);
            }
            match pool.next_shrink_time() {
                Some(at) => shared.schedule(
                    TaskKey::PoolShrink(pool.unique_name().to_string()),
                    Task::PoolShrink(Arc::downgrade(&pool)),
                    at,
                ),
                None => info!("pool {} stopped shrinking", pool.unique_name()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockPool;

    #[test]
    fn test_empty_scheduler() {
        let scheduler = TaskScheduler::start().unwrap();
        assert_eq!(scheduler.count_tasks_queued(), 0);
        assert!(scheduler.next_scheduled_time().is_none());
        scheduler.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_pool_shrinking_reschedules() {
        let scheduler = TaskScheduler::start().unwrap();
        let mock = MockPool::new("pool", Duration::from_millis(20));
        let pool: Arc<dyn ResourcePool> = mock.clone();

        scheduler.schedule_pool_shrinking(&pool);
        assert!(scheduler.is_scheduled(&TaskKey::PoolShrink("pool".to_string())));

        std::thread::sleep(Duration::from_millis(200));
        assert!(mock.shrink_count() >= 2);

        assert!(scheduler.cancel_pool_shrinking("pool"));
        scheduler.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_dropped_pool_is_not_rescheduled() {
        let scheduler = TaskScheduler::start().unwrap();
        let mock = MockPool::new("gone", Duration::from_millis(20));
        let pool: Arc<dyn ResourcePool> = mock;
        scheduler.schedule_pool_shrinking(&pool);
        drop(pool);

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(scheduler.count_tasks_queued(), 0);
        scheduler.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_shutdown_drops_tasks() {
        let scheduler = TaskScheduler::start().unwrap();
        let mock = MockPool::new("pool", Duration::from_secs(3600));
        let pool: Arc<dyn ResourcePool> = mock;
        scheduler.schedule_pool_shrinking(&pool);
        assert_eq!(scheduler.count_tasks_queued(), 1);

        scheduler.shutdown(Duration::from_secs(1));
        assert_eq!(scheduler.count_tasks_queued(), 0);

        // scheduling after shutdown is ignored
        scheduler.schedule_pool_shrinking(&pool);
        assert_eq!(scheduler.count_tasks_queued(), 0);
    }
}
