//! Rollback phase

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, warn};

use lumatm_common::error::{BranchOutcome, BranchState, Error, HeuristicError, HeuristicKind, Result};
use lumatm_common::types::Uid;
use lumatm_common::xa::{Vote, XA_HEURCOM, XA_HEURHAZ, XA_HEURMIX, XA_HEURRB};

use crate::executor::JobResult;
use crate::holder::ResourceHolderState;
use crate::scheduler::Scheduler;
use crate::twopc::phase::PhaseEngine;
use crate::twopc::{forget, outcome, CompletionReport};

pub struct Rollbacker<'a> {
    engine: &'a PhaseEngine,
}

impl<'a> Rollbacker<'a> {
    pub fn new(engine: &'a PhaseEngine) -> Self {
        Self { engine }
    }

    /// Roll back every participant, failing with a heuristic error when a
    /// resource committed or could not tell what it did.
    pub fn rollback(
        &self,
        gtrid: &Uid,
        participants: &Scheduler<Arc<ResourceHolderState>>,
        deadline: Option<Instant>,
    ) -> Result<CompletionReport> {
        let report = self.engine.execute_phase("rollback", participants, deadline, false, |holder| {
            Box::new(move || holder.rollback().map(|()| Vote::Ok))
        });

        let mut outcomes = Vec::with_capacity(report.results.len());
        for result in report.results {
            let state = classify(&result.holder, result.result);
            outcomes.push(outcome(&result.holder, state));
        }

        for unfinished in outcomes.iter().filter(|o| o.state == BranchState::NotCompleted) {
            warn!(
                "branch {} on {} might not be rolled back, recovery will complete it",
                unfinished.xid, unfinished.unique_name
            );
        }

        match heuristic_kind(&outcomes) {
            None => {
                debug!("rolled back {} resource(s) of {}", outcomes.len(), gtrid);
                Ok(CompletionReport { outcomes })
            }
            Some(kind) => {
                let err = HeuristicError {
                    kind,
                    gtrid: gtrid.to_hex(),
                    outcomes,
                };
                if kind == HeuristicKind::Mixed {
                    error!("{}: {:?}", err, err.deviating().collect::<Vec<_>>());
                } else {
                    warn!("{}: {:?}", err, err.deviating().collect::<Vec<_>>());
                }
                Err(Error::Heuristic(err))
            }
        }
    }
}

fn classify(holder: &ResourceHolderState, result: Option<JobResult>) -> BranchState {
    let err = match result {
        None => return BranchState::NotCompleted,
        Some(Ok(_)) => return BranchState::RolledBack,
        Some(Err(err)) => err,
    };

    match err.code {
        XA_HEURRB => {
            forget(holder);
            BranchState::RolledBack
        }
        XA_HEURCOM => {
            forget(holder);
            BranchState::HeuristicCommit
        }
        XA_HEURMIX => {
            forget(holder);
            BranchState::HeuristicMixed
        }
        XA_HEURHAZ => {
            forget(holder);
            BranchState::HeuristicHazard
        }
        _ if err.is_rollback() || err.is_unknown_branch() => BranchState::RolledBack,
        _ if err.is_transient() => BranchState::NotCompleted,
        _ => {
            warn!(
                "rollback of branch {} on {} failed: {}",
                holder.xid(),
                holder.unique_name(),
                err
            );
            BranchState::Failed(err)
        }
    }
}

/// Overall outcome when at least one branch deviated from the rollback decision
fn heuristic_kind(outcomes: &[BranchOutcome]) -> Option<HeuristicKind> {
    let deviating: Vec<&BranchState> = outcomes
        .iter()
        .map(|o| &o.state)
        .filter(|s| !matches!(s, BranchState::RolledBack | BranchState::NotCompleted))
        .collect();
    if deviating.is_empty() {
        return None;
    }

    let rolled_back_any = outcomes.iter().any(|o| o.state == BranchState::RolledBack);
    let all_committed = deviating
        .iter()
        .all(|s| matches!(s, BranchState::HeuristicCommit));
    let any_committed = deviating
        .iter()
        .any(|s| matches!(s, BranchState::HeuristicCommit));
    let any_mixed = deviating
        .iter()
        .any(|s| matches!(s, BranchState::HeuristicMixed));

    let kind = if !rolled_back_any && all_committed {
        HeuristicKind::Commit
    } else if any_mixed || (rolled_back_any && any_committed) {
        HeuristicKind::Mixed
    } else {
        HeuristicKind::Hazard
    };
    Some(kind)
}
