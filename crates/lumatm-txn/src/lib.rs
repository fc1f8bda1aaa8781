//! LumaTM transaction coordinator
//!
//! XA two-phase commit across the resources enlisted in a transaction:
//! - [`TransactionManager`], thread-associated demarcation (begin, commit,
//!   rollback, suspend, resume) and resource registration
//! - [`Transaction`], the status machine of one global transaction
//! - [`twopc`], prepare, commit and rollback phases with heuristic handling
//! - [`recovery`], presumed-abort resolution of in-doubt branches after a crash
//! - [`TaskScheduler`], timeouts, background recovery and pool shrinking

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod executor;
pub mod holder;
pub mod manager;
#[cfg(any(test, feature = "testing"))]
pub mod mock;
pub mod recovery;
pub mod registrar;
pub mod resource;
pub mod scheduler;
pub mod services;
pub mod synchronization;
pub mod timer;
pub mod transaction;
pub mod twopc;
pub mod uid;

pub use executor::{AsyncExecutor, Executor, SyncExecutor};
pub use holder::{BranchPhase, ResourceHolderState};
pub use manager::{SynchronizationRegistry, TransactionManager};
pub use recovery::{incremental_recover, Recoverer, RecoveryReport};
pub use registrar::ResourceRegistrar;
pub use resource::{ResourceConfig, ResourcePool, ResourceProducer, XaResource, XaResult};
pub use scheduler::Scheduler;
pub use services::Services;
pub use synchronization::Synchronization;
pub use timer::TaskScheduler;
pub use transaction::Transaction;
pub use uid::UidGenerator;
