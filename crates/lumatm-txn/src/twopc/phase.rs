//! Dispatch of one phase across the participants

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::executor::{Executor, Job, JobResult};
use crate::holder::ResourceHolderState;
use crate::scheduler::Scheduler;

/// Result of the job of one participant, `None` when it did not finish in time
#[derive(Debug)]
pub struct PhaseResult {
    pub holder: Arc<ResourceHolderState>,
    pub result: Option<JobResult>,
}

/// Results in participant order; positions after an aborted one are absent
#[derive(Debug, Default)]
pub struct PhaseReport {
    pub results: Vec<PhaseResult>,
    pub aborted: bool,
}

impl PhaseReport {
    /// First participant whose job failed or did not finish
    pub fn first_failure(&self) -> Option<&PhaseResult> {
        self.results
            .iter()
            .find(|r| !matches!(r.result, Some(Ok(_))))
    }
}

/// Runs jobs built per participant on an executor
pub struct PhaseEngine {
    executor: Arc<dyn Executor>,
}

impl PhaseEngine {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    /// Run `make_job` for every participant.
    ///
    /// With `abort_on_failure`, positions following one with a failed job
    /// are not started.
    pub fn execute_phase<F>(
        &self,
        phase: &str,
        participants: &Scheduler<Arc<ResourceHolderState>>,
        deadline: Option<Instant>,
        abort_on_failure: bool,
        make_job: F,
    ) -> PhaseReport
    where
        F: Fn(Arc<ResourceHolderState>) -> Job,
    {
        let mut report = PhaseReport::default();

        for (position, holders) in participants.groups() {
            debug!(
                "executing {} phase on {} resource(s) at position {}",
                phase,
                holders.len(),
                position
            );

            let jobs: Vec<Job> = holders.iter().cloned().map(&make_job).collect();
            let results = self.executor.execute_all(jobs, deadline);

            let mut failed = false;
            for (holder, result) in holders.iter().cloned().zip(results) {
                failed |= !matches!(result, Some(Ok(_)));
                report.results.push(PhaseResult { holder, result });
            }

            if failed && abort_on_failure {
                report.aborted = true;
                break;
            }
        }

        report
    }
}
