//! Two-phase commit engines
//!
//! Every phase runs per ordering position, ascending: all jobs of a
//! position are dispatched to the executor and awaited before the next
//! position starts.

pub mod committer;
pub mod phase;
pub mod preparer;
pub mod rollbacker;

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use tracing::warn;

use lumatm_common::error::{BranchOutcome, BranchState};
use lumatm_common::types::Xid;

use crate::holder::ResourceHolderState;
use crate::scheduler::Scheduler;

pub use committer::Committer;
pub use phase::{PhaseEngine, PhaseReport};
pub use preparer::{PrepareOutcome, Preparer};
pub use rollbacker::Rollbacker;

/// One holder per branch: resources joined on the same branch are driven once
pub fn distinct_participants(
    resources: &Scheduler<Arc<ResourceHolderState>>,
) -> Scheduler<Arc<ResourceHolderState>> {
    let mut seen: HashSet<Xid> = HashSet::new();
    let mut distinct = Scheduler::new();
    for holder in resources.iter() {
        if seen.insert(holder.xid().clone()) {
            distinct.add(holder.clone(), holder.ordering_position());
        }
    }
    distinct
}

/// Unique names of a set of participants
pub fn unique_names<'a, I>(holders: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a Arc<ResourceHolderState>>,
{
    holders
        .into_iter()
        .map(|h| h.unique_name().to_string())
        .collect()
}

/// Resources whose branch reached an outcome, `NotCompleted` ones are left
/// to recovery
pub fn completed_names(outcomes: &[BranchOutcome]) -> BTreeSet<String> {
    outcomes
        .iter()
        .filter(|o| o.state != BranchState::NotCompleted)
        .map(|o| o.unique_name.clone())
        .collect()
}

/// Branch outcomes of a successful commit or rollback phase
#[derive(Debug, Clone, Default)]
pub struct CompletionReport {
    pub outcomes: Vec<BranchOutcome>,
}

impl CompletionReport {
    pub fn completed_names(&self) -> BTreeSet<String> {
        completed_names(&self.outcomes)
    }

    /// Resources that may still hold the branch
    pub fn unfinished_names(&self) -> BTreeSet<String> {
        self.outcomes
            .iter()
            .filter(|o| o.state == BranchState::NotCompleted)
            .map(|o| o.unique_name.clone())
            .collect()
    }
}

/// Call `forget` after a heuristic outcome was recorded
fn forget(holder: &ResourceHolderState) {
    if let Err(e) = holder.forget() {
        warn!(
            "cannot forget heuristic outcome of branch {} on {}: {}",
            holder.xid(),
            holder.unique_name(),
            e
        );
    }
}

fn outcome(holder: &ResourceHolderState, state: BranchState) -> BranchOutcome {
    BranchOutcome {
        unique_name: holder.unique_name().to_string(),
        xid: holder.xid().clone(),
        state,
    }
}
