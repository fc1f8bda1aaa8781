//! Prepare phase

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use lumatm_common::error::{Error, Result};
use lumatm_common::xa::{Vote, XaError};

use crate::holder::ResourceHolderState;
use crate::scheduler::Scheduler;
use crate::twopc::phase::PhaseEngine;

/// What the commit phase has to do after preparing
#[derive(Debug)]
pub enum PrepareOutcome {
    /// No resource takes part in the transaction
    NoParticipant,
    /// A single resource, committed in one phase without preparing it
    OnePhase(Arc<ResourceHolderState>),
    /// Resources that voted `XA_OK`, read-only voters are left out
    Prepared(Scheduler<Arc<ResourceHolderState>>),
}

impl PrepareOutcome {
    /// Number of resources the commit phase involves
    pub fn participant_count(&self) -> usize {
        match self {
            PrepareOutcome::NoParticipant => 0,
            PrepareOutcome::OnePhase(_) => 1,
            PrepareOutcome::Prepared(voters) => voters.len(),
        }
    }
}

pub struct Preparer<'a> {
    engine: &'a PhaseEngine,
}

impl<'a> Preparer<'a> {
    pub fn new(engine: &'a PhaseEngine) -> Self {
        Self { engine }
    }

    /// Prepare every distinct participant.
    ///
    /// A failed or unfinished prepare stops the phase and is returned as a
    /// rollback-class error; the caller rolls everything back.
    pub fn prepare(
        &self,
        participants: &Scheduler<Arc<ResourceHolderState>>,
        deadline: Option<Instant>,
    ) -> Result<PrepareOutcome> {
        match participants.len() {
            0 => return Ok(PrepareOutcome::NoParticipant),
            1 => {
                if let Some(holder) = participants.iter().next() {
                    debug!(
                        "single participant {}, skipping prepare for one-phase commit",
                        holder.unique_name()
                    );
                    return Ok(PrepareOutcome::OnePhase(holder.clone()));
                }
            }
            _ => {}
        }

        let report = self.engine.execute_phase("prepare", participants, deadline, true, |holder| {
            Box::new(move || holder.prepare())
        });

        if let Some(failure) = report.first_failure() {
            let cause = match &failure.result {
                Some(Err(e)) => e.clone(),
                _ => XaError::rm_fail("prepare did not finish before the transaction timeout"),
            };
            warn!(
                "prepare of branch {} on {} failed: {}",
                failure.holder.xid(),
                failure.holder.unique_name(),
                cause
            );
            return Err(Error::rolled_back_by(
                format!("prepare of resource {} failed", failure.holder.unique_name()),
                Error::Resource(cause),
            ));
        }

        let mut voters = Scheduler::new();
        for result in report.results {
            match result.result {
                Some(Ok(Vote::Ok)) => {
                    let position = result.holder.ordering_position();
                    voters.add(result.holder, position);
                }
                Some(Ok(Vote::ReadOnly)) => {
                    debug!("resource {} voted read-only", result.holder.unique_name());
                }
                _ => {}
            }
        }

        Ok(PrepareOutcome::Prepared(voters))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SyncExecutor;
    use crate::mock::{holder_for, MockXaResource};
    use lumatm_common::types::Uid;
    use lumatm_common::xa::XAER_RMERR;

    fn prepare(resources: &[(Arc<MockXaResource>, i32)]) -> Result<PrepareOutcome> {
        let gtrid = Uid::new(b"n", 1, 1);
        let mut scheduler = Scheduler::new();
        for (i, (resource, position)) in resources.iter().enumerate() {
            scheduler.add(holder_for(resource, &gtrid, i as u32), *position);
        }
        let engine = PhaseEngine::new(Arc::new(SyncExecutor));
        Preparer::new(&engine).prepare(&scheduler, None)
    }

    #[test]
    fn test_no_participant() {
        assert!(matches!(prepare(&[]).unwrap(), PrepareOutcome::NoParticipant));
    }

    #[test]
    fn test_single_participant_is_not_prepared() {
        let db = MockXaResource::new("db");
        let outcome = prepare(&[(db.clone(), 1)]).unwrap();
        assert!(matches!(outcome, PrepareOutcome::OnePhase(_)));
        assert!(db.prepares().is_empty());
    }

    #[test]
    fn test_read_only_voters_dropped() {
        let db = MockXaResource::new("db");
        let mq = MockXaResource::new("mq");
        db.set_vote(Vote::ReadOnly);

        let outcome = prepare(&[(db, 1), (mq, 1)]).unwrap();
        assert_eq!(outcome.participant_count(), 1);
        match outcome {
            PrepareOutcome::Prepared(voters) => {
                assert_eq!(voters.iter().next().map(|h| h.unique_name()), Some("mq"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_failure_stops_later_positions() {
        let db = MockXaResource::new("db");
        let mq = MockXaResource::new("mq");
        let late = MockXaResource::new("late");
        mq.fail_prepare(XaError::new(XAER_RMERR, "deadlock"));

        let err = prepare(&[(db.clone(), 0), (mq, 0), (late.clone(), 5)]).unwrap_err();
        assert!(err.is_rollback());
        assert_eq!(db.prepares().len(), 1);
        assert!(late.prepares().is_empty());
    }
}
