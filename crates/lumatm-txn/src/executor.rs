//! Execution of per-resource 2PC jobs

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use lumatm_common::xa::{Vote, XaError};

use crate::resource::XaResult;

/// Result of a job; commit and rollback jobs report `Vote::Ok` on success
pub type JobResult = XaResult<Vote>;

/// One resource call of a phase
pub type Job = Box<dyn FnOnce() -> JobResult + Send + 'static>;

/// Runs the jobs of one phase
pub trait Executor: Send + Sync {
    /// Run every job and return their results in submission order.
    ///
    /// `None` marks a job that did not finish before `deadline`.
    fn execute_all(&self, jobs: Vec<Job>, deadline: Option<Instant>) -> Vec<Option<JobResult>>;

    fn shutdown(&self);
}

/// Runs jobs one after the other on the calling thread
#[derive(Debug, Default)]
pub struct SyncExecutor;

impl Executor for SyncExecutor {
    fn execute_all(&self, jobs: Vec<Job>, _deadline: Option<Instant>) -> Vec<Option<JobResult>> {
        jobs.into_iter().map(|job| Some(job())).collect()
    }

    fn shutdown(&self) {}
}

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Dispatches jobs to a pool of worker threads and waits for all of them
pub struct AsyncExecutor {
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl AsyncExecutor {
    /// Pool of `size` workers, the number of CPUs when `size` is 0
    pub fn new(size: usize) -> std::io::Result<Self> {
        let size = if size == 0 { num_cpus::get() } else { size };
        let (sender, receiver) = channel::unbounded::<Task>();

        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let receiver: Receiver<Task> = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("lumatm-2pc-{}", i))
                .spawn(move || {
                    while let Ok(task) = receiver.recv() {
                        task();
                    }
                })?;
            workers.push(handle);
        }

        debug!("started asynchronous 2PC executor with {} worker(s)", size);
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }
}

impl Executor for AsyncExecutor {
    fn execute_all(&self, jobs: Vec<Job>, deadline: Option<Instant>) -> Vec<Option<JobResult>> {
        let sender = match self.sender.lock().clone() {
            Some(sender) => sender,
            None => {
                warn!("asynchronous executor is shut down, running {} job(s) inline", jobs.len());
                return SyncExecutor.execute_all(jobs, deadline);
            }
        };

        let mut pending = Vec::with_capacity(jobs.len());
        for job in jobs {
            let (tx, rx) = channel::bounded::<JobResult>(1);
            let task: Task = Box::new(move || {
                let result = catch_unwind(AssertUnwindSafe(job))
                    .unwrap_or_else(|_| Err(XaError::rm_err("resource call panicked")));
                // the waiter may have given up already
                let _ = tx.send(result);
            });
            if let Err(rejected) = sender.send(task) {
                error!("2PC worker pool is gone, running job inline");
                (rejected.into_inner())();
            }
            pending.push(rx);
        }

        pending
            .into_iter()
            .map(|rx| match deadline {
                Some(deadline) => match rx.recv_deadline(deadline) {
                    Ok(result) => Some(result),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => None,
                },
                None => rx.recv().ok(),
            })
            .collect()
    }

    fn shutdown(&self) {
        // dropping the sender lets the workers drain the queue and exit
        self.sender.lock().take();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                error!("2PC worker thread panicked");
            }
        }
    }
}
