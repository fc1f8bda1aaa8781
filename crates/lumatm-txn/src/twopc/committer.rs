//! Commit phase

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, warn};

use lumatm_common::error::{BranchOutcome, BranchState, Error, HeuristicError, HeuristicKind, Result};
use lumatm_common::types::Uid;
use lumatm_common::xa::{
    Vote, XaError, XA_HEURCOM, XA_HEURHAZ, XA_HEURMIX, XA_HEURRB,
};

use crate::executor::JobResult;
use crate::holder::ResourceHolderState;
use crate::scheduler::Scheduler;
use crate::twopc::phase::PhaseEngine;
use crate::twopc::{forget, outcome, CompletionReport};

pub struct Committer<'a> {
    engine: &'a PhaseEngine,
}

impl<'a> Committer<'a> {
    pub fn new(engine: &'a PhaseEngine) -> Self {
        Self { engine }
    }

    /// Commit every participant.
    ///
    /// Fails with a heuristic error when a resource deviated from the commit
    /// decision, or with a rollback-class error when a one-phase commit
    /// rolled back.
    pub fn commit(
        &self,
        gtrid: &Uid,
        participants: &Scheduler<Arc<ResourceHolderState>>,
        one_phase: bool,
        deadline: Option<Instant>,
    ) -> Result<CompletionReport> {
        let report = self.engine.execute_phase("commit", participants, deadline, false, |holder| {
            Box::new(move || holder.commit(one_phase).map(|()| Vote::Ok))
        });

        let mut outcomes = Vec::with_capacity(report.results.len());
        for result in report.results {
            let state = classify(&result.holder, result.result, one_phase);
            outcomes.push(outcome(&result.holder, state));
        }

        if one_phase {
            if let Some(rolled_back) = outcomes.iter().find(|o| o.state == BranchState::RolledBack) {
                return Err(Error::rolled_back(format!(
                    "resource {} rolled back during one-phase commit",
                    rolled_back.unique_name
                )));
            }
        }

        for unfinished in outcomes.iter().filter(|o| o.state == BranchState::NotCompleted) {
            warn!(
                "branch {} on {} might not be committed, recovery will complete it",
                unfinished.xid, unfinished.unique_name
            );
        }

        match heuristic_kind(&outcomes) {
            None => {
                debug!("committed {} resource(s) of {}", outcomes.len(), gtrid);
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

fn classify(holder: &ResourceHolderState, result: Option<JobResult>, one_phase: bool) -> BranchState {
    let err = match result {
        // a one-phase branch has no durable decision recovery could replay
        None if one_phase => {
            warn!(
                "one-phase commit of branch {} on {} did not finish in time, outcome unknown",
                holder.xid(),
                holder.unique_name()
            );
            return BranchState::HeuristicHazard;
        }
        None => return BranchState::NotCompleted,
        Some(Ok(_)) => return BranchState::Committed,
        Some(Err(err)) => err,
    };

    match err.code {
        XA_HEURCOM => {
            forget(holder);
            BranchState::Committed
        }
        XA_HEURRB => {
            forget(holder);
            BranchState::HeuristicRollback
        }
        XA_HEURMIX => {
            forget(holder);
            BranchState::HeuristicMixed
        }
        XA_HEURHAZ => {
            forget(holder);
            BranchState::HeuristicHazard
        }
        _ if err.is_rollback() => {
            if one_phase {
                BranchState::RolledBack
            } else {
                BranchState::HeuristicRollback
            }
        }
        _ if err.is_unknown_branch() && !one_phase => {
            debug!(
                "branch {} on {} is unknown to the resource, assuming it committed",
                holder.xid(),
                holder.unique_name()
            );
            BranchState::Committed
        }
        _ if err.is_transient() && !one_phase => BranchState::NotCompleted,
        _ => failed(holder, err),
    }
}

fn failed(holder: &ResourceHolderState, err: XaError) -> BranchState {
    warn!(
        "commit of branch {} on {} failed: {}",
        holder.xid(),
        holder.unique_name(),
        err
    );
    BranchState::Failed(err)
}

/// Overall outcome when at least one branch deviated from the commit decision
fn heuristic_kind(outcomes: &[BranchOutcome]) -> Option<HeuristicKind> {
    let deviating: Vec<&BranchState> = outcomes
        .iter()
        .map(|o| &o.state)
        .filter(|s| !matches!(s, BranchState::Committed | BranchState::NotCompleted))
        .collect();
    if deviating.is_empty() {
        return None;
    }

    let committed_any = outcomes.iter().any(|o| o.state == BranchState::Committed);
    let all_rolled_back = deviating
        .iter()
        .all(|s| matches!(s, BranchState::HeuristicRollback));
    let any_rolled_back = deviating
        .iter()
        .any(|s| matches!(s, BranchState::HeuristicRollback));
    let any_mixed = deviating
        .iter()
        .any(|s| matches!(s, BranchState::HeuristicMixed));

    let kind = if !committed_any && all_rolled_back {
        HeuristicKind::Rollback
    } else if any_mixed || (committed_any && any_rolled_back) {
        HeuristicKind::Mixed
    } else {
        HeuristicKind::Hazard
    };
    Some(kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SyncExecutor;
    use crate::mock::{holder_for, MockXaResource};
    use lumatm_common::xa::{XAER_NOTA, XAER_RMERR, XAER_RMFAIL, XA_RBROLLBACK};
    use rstest::rstest;

    fn engine() -> PhaseEngine {
        PhaseEngine::new(Arc::new(SyncExecutor))
    }

    fn participants(resources: &[Arc<MockXaResource>]) -> (Uid, Scheduler<Arc<ResourceHolderState>>) {
        let gtrid = Uid::new(b"n", 1, 1);
        let mut scheduler = Scheduler::new();
        for (i, resource) in resources.iter().enumerate() {
            scheduler.add(holder_for(resource, &gtrid, i as u32), 1);
        }
        (gtrid, scheduler)
    }

    #[test]
    fn test_all_committed() {
        let db = MockXaResource::new("db");
        let mq = MockXaResource::new("mq");
        let (gtrid, scheduler) = participants(&[db.clone(), mq.clone()]);

        let report = Committer::new(&engine())
            .commit(&gtrid, &scheduler, false, None)
            .unwrap();
        assert_eq!(report.completed_names().len(), 2);
        assert!(report.unfinished_names().is_empty());
        assert_eq!(db.commits(), vec![false]);
        assert_eq!(mq.commits(), vec![false]);
    }

    #[test]
    fn test_transient_failure_is_left_to_recovery() {
        let db = MockXaResource::new("db");
        let mq = MockXaResource::new("mq");
        mq.fail_commit(XaError::new(XAER_RMFAIL, "connection reset"));
        let (gtrid, scheduler) = participants(&[db, mq]);

        let report = Committer::new(&engine())
            .commit(&gtrid, &scheduler, false, None)
            .unwrap();
        assert_eq!(report.completed_names().into_iter().collect::<Vec<_>>(), vec!["db"]);
        assert_eq!(report.unfinished_names().into_iter().collect::<Vec<_>>(), vec!["mq"]);
    }

    #[rstest]
    #[case(XA_HEURRB, XA_HEURRB, HeuristicKind::Rollback)]
    #[case(XA_HEURMIX, XA_OK_MARKER, HeuristicKind::Mixed)]
    #[case(XA_HEURRB, XA_OK_MARKER, HeuristicKind::Mixed)]
    #[case(XA_HEURHAZ, XA_OK_MARKER, HeuristicKind::Hazard)]
    #[case(XAER_RMERR, XA_OK_MARKER, HeuristicKind::Hazard)]
    fn test_heuristic_classification(
        #[case] first: i32,
        #[case] second: i32,
        #[case] expected: HeuristicKind,
    ) {
        let db = MockXaResource::new("db");
        let mq = MockXaResource::new("mq");
        db.fail_commit(XaError::new(first, "heuristic"));
        if second != XA_OK_MARKER {
            mq.fail_commit(XaError::new(second, "heuristic"));
        }
        let (gtrid, scheduler) = participants(&[db, mq]);

        let err = Committer::new(&engine())
            .commit(&gtrid, &scheduler, false, None)
            .unwrap_err();
        assert_eq!(err.heuristic_kind(), Some(expected));
    }

    const XA_OK_MARKER: i32 = i32::MIN;

    #[test]
    fn test_heuristic_commit_counts_as_committed_and_is_forgotten() {
        let db = MockXaResource::new("db");
        db.fail_commit(XaError::new(XA_HEURCOM, "already committed"));
        let (gtrid, scheduler) = participants(&[db.clone(), MockXaResource::new("mq")]);

        let report = Committer::new(&engine())
            .commit(&gtrid, &scheduler, false, None)
            .unwrap();
        assert_eq!(report.completed_names().len(), 2);
        assert_eq!(db.forgotten().len(), 1);
    }

    #[test]
    fn test_unknown_branch_counts_as_committed() {
        let db = MockXaResource::new("db");
        db.fail_commit(XaError::new(XAER_NOTA, "gone"));
        let (gtrid, scheduler) = participants(&[db, MockXaResource::new("mq")]);

        assert!(Committer::new(&engine()).commit(&gtrid, &scheduler, false, None).is_ok());
    }

    #[test]
    fn test_one_phase_rollback_is_rollback_class() {
        let db = MockXaResource::new("db");
        db.fail_commit(XaError::new(XA_RBROLLBACK, "deadlock victim"));
        let (gtrid, scheduler) = participants(&[db]);

        let err = Committer::new(&engine())
            .commit(&gtrid, &scheduler, true, None)
            .unwrap_err();
        assert!(err.is_rollback());
    }

    #[test]
    fn test_one_phase_connection_loss_is_hazard() {
        let db = MockXaResource::new("db");
        db.fail_commit(XaError::new(XAER_RMFAIL, "connection reset"));
        let (gtrid, scheduler) = participants(&[db]);

        let err = Committer::new(&engine())
            .commit(&gtrid, &scheduler, true, None)
            .unwrap_err();
        assert_eq!(err.heuristic_kind(), Some(HeuristicKind::Hazard));
    }

    #[test]
    fn test_unfinished_one_phase_commit_is_hazard() {
        let db = MockXaResource::new("db");
        db.set_delay(std::time::Duration::from_millis(300));
        let (gtrid, scheduler) = participants(&[db]);
        let engine = PhaseEngine::new(Arc::new(crate::executor::AsyncExecutor::new(2).unwrap()));

        let deadline = Instant::now() + std::time::Duration::from_millis(50);
        let err = Committer::new(&engine)
            .commit(&gtrid, &scheduler, true, Some(deadline))
            .unwrap_err();
        assert_eq!(err.heuristic_kind(), Some(HeuristicKind::Hazard));
        assert!(!err.is_rollback());
    }
}
