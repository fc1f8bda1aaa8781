//! Crash recovery
//!
//! Recovery resolves the in-doubt branches reported by the resources:
//! branches of a gtrid the journal holds an unresolved COMMITTING record for
//! are committed, every other in-doubt branch is rolled back (presumed
//! abort). Only branches and records of transactions created before the
//! recovery pass started are considered, so transactions still running on
//! other threads are never touched.

mod incremental;
mod recoverer;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use lumatm_common::error::Result;
use lumatm_common::types::{Status, Timestamp, Uid, Xid};
use lumatm_common::xa::{
    TMENDRSCAN, TMNOFLAGS, TMSTARTRSCAN, XA_HEURCOM, XA_HEURHAZ, XA_HEURMIX, XA_HEURRB,
};
use lumatm_journal::TransactionLogRecord;

use crate::resource::{ResourceProducer, XaResource, XaResult};
use crate::services::Services;
use crate::uid::current_time_millis;

pub use incremental::incremental_recover;
pub use recoverer::Recoverer;

/// Counters of one recovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub committed: usize,
    pub rolled_back: usize,
    /// Resources that could not be recovered in this pass
    pub failed_resources: Vec<String>,
}

impl fmt::Display for RecoveryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} committed, {} rolled back",
            self.committed, self.rolled_back
        )?;
        if !self.failed_resources.is_empty() {
            write!(f, ", failed resources: {}", self.failed_resources.join(", "))?;
        }
        Ok(())
    }
}

/// Which in-doubt Xids a pass may act on
#[derive(Debug, Clone)]
pub struct XidFilter {
    /// Only Xids created by this server id, when set
    pub server_id: Option<Vec<u8>>,
    /// Only gtrids created strictly before this time
    pub threshold: Timestamp,
}

impl XidFilter {
    pub fn accepts(&self, xid: &Xid) -> bool {
        if !xid.is_ours() {
            return false;
        }
        if let Some(server_id) = &self.server_id {
            if xid.gtrid().server_id() != server_id.as_slice() {
                return false;
            }
        }
        self.accepts_gtrid(xid.gtrid())
    }

    pub fn accepts_gtrid(&self, gtrid: &Uid) -> bool {
        gtrid.timestamp().map_or(false, |ts| ts < self.threshold)
    }
}

/// Full in-doubt scan of `resource`, filtered by `filter`
pub fn recover_xids(resource: &dyn XaResource, filter: &XidFilter) -> XaResult<Vec<Xid>> {
    let mut seen = HashSet::new();
    let mut xids = Vec::new();
    let mut collect = |batch: Vec<Xid>, xids: &mut Vec<Xid>| {
        let mut fresh = 0;
        for xid in batch {
            if seen.insert(xid.clone()) {
                fresh += 1;
                if filter.accepts(&xid) {
                    xids.push(xid);
                } else {
                    debug!("ignoring in-doubt branch {} during recovery", xid);
                }
            }
        }
        fresh
    };

    let mut flags = TMSTARTRSCAN;
    loop {
        let batch = resource.recover(flags)?;
        if collect(batch, &mut xids) == 0 {
            break;
        }
        flags = TMNOFLAGS;
    }
    let batch = resource.recover(TMENDRSCAN)?;
    collect(batch, &mut xids);

    Ok(xids)
}

/// Journal and filter snapshot shared by the resources of one pass
pub(crate) struct RecoveryContext {
    dangling: HashMap<Uid, TransactionLogRecord>,
    filter: XidFilter,
}

impl RecoveryContext {
    /// Dangling records older than the oldest live transaction
    pub(crate) fn snapshot(services: &Services) -> Result<Self> {
        let now = current_time_millis();
        let threshold = services
            .oldest_in_flight_timestamp()
            .map_or(now, |oldest| oldest.min(now));
        let server_id = services
            .config()
            .current_node_only_recovery
            .then(|| services.uid_generator().server_id().to_vec());
        let filter = XidFilter {
            server_id,
            threshold,
        };

        let mut dangling = services.journal().collect_dangling_records()?;
        dangling.retain(|gtrid, _| filter.accepts_gtrid(gtrid));
        debug!(
            "recovery snapshot: {} dangling record(s) before {}",
            dangling.len(),
            threshold
        );
        Ok(Self { dangling, filter })
    }

    pub(crate) fn dangling_count(&self) -> usize {
        self.dangling.len()
    }

    /// Scan one producer and resolve its in-doubt branches. The recovery
    /// session is always released.
    pub(crate) fn recover_producer(&self, producer: &Arc<dyn ResourceProducer>) -> Result<ProducerOutcome> {
        let resource = producer.start_recovery()?;
        let result = self.recover_resource(producer.unique_name(), resource.as_ref());
        if let Err(e) = producer.end_recovery() {
            warn!("error ending recovery of {}: {}", producer.unique_name(), e);
        }
        result
    }

    fn recover_resource(&self, unique_name: &str, resource: &dyn XaResource) -> Result<ProducerOutcome> {
        let xids = recover_xids(resource, &self.filter)?;
        let mut outcome = ProducerOutcome {
            unique_name: unique_name.to_string(),
            ..ProducerOutcome::default()
        };
        if !xids.is_empty() {
            info!("resource {} reported {} in-doubt branch(es)", unique_name, xids.len());
        }

        for xid in xids {
            if self.dangling.contains_key(xid.gtrid()) {
                match commit_in_doubt(unique_name, resource, &xid) {
                    Resolution::Done => outcome.committed += 1,
                    Resolution::Resolved => {}
                    Resolution::Pending => {
                        outcome.unresolved.insert(xid.gtrid().clone());
                    }
                }
            } else {
                match rollback_in_doubt(unique_name, resource, &xid) {
                    Resolution::Done => outcome.rolled_back += 1,
                    Resolution::Resolved | Resolution::Pending => {}
                }
            }
        }
        Ok(outcome)
    }

    /// Journal COMMITTED for the resources each dangling gtrid no longer
    /// waits for, then force
    pub(crate) fn resolve(&self, services: &Services, outcomes: &[ProducerOutcome]) -> Result<()> {
        let journal = services.journal();
        let mut written = false;
        for (gtrid, record) in &self.dangling {
            let resolved: BTreeSet<String> = outcomes
                .iter()
                .filter(|o| record.unique_names().contains(&o.unique_name))
                .filter(|o| !o.unresolved.contains(gtrid))
                .map(|o| o.unique_name.clone())
                .collect();
            if resolved.is_empty() {
                continue;
            }
            debug!("recovery resolved {:?} of transaction {}", resolved, gtrid);
            journal.log(Status::Committed, gtrid, &resolved)?;
            written = true;
        }
        if written {
            journal.force()?;
        }
        Ok(())
    }
}

/// What recovery achieved on one resource
#[derive(Debug, Default)]
pub(crate) struct ProducerOutcome {
    pub unique_name: String,
    pub committed: usize,
    pub rolled_back: usize,
    /// Dangling gtrids this resource still holds a branch of
    pub unresolved: HashSet<Uid>,
}

enum Resolution {
    /// The branch was completed as decided
    Done,
    /// The resource no longer holds the branch
    Resolved,
    /// Left for a later pass
    Pending,
}

fn commit_in_doubt(unique_name: &str, resource: &dyn XaResource, xid: &Xid) -> Resolution {
    let err = match resource.commit(xid, false) {
        Ok(()) => {
            info!("recovery committed branch {} on {}", xid, unique_name);
            return Resolution::Done;
        }
        Err(err) => err,
    };

    match err.code {
        XA_HEURCOM => {
            forget(unique_name, resource, xid);
            Resolution::Done
        }
        XA_HEURRB | XA_HEURMIX | XA_HEURHAZ => {
            error!(
                "heuristic outcome while committing branch {} on {} during recovery: {}",
                xid, unique_name, err
            );
            forget(unique_name, resource, xid);
            Resolution::Resolved
        }
        _ if err.is_unknown_branch() => Resolution::Resolved,
        _ => {
            warn!(
                "cannot commit in-doubt branch {} on {}, retrying on the next recovery: {}",
                xid, unique_name, err
            );
            Resolution::Pending
        }
    }
}

fn rollback_in_doubt(unique_name: &str, resource: &dyn XaResource, xid: &Xid) -> Resolution {
    let err = match resource.rollback(xid) {
        Ok(()) => {
            info!("recovery rolled back branch {} on {}", xid, unique_name);
            return Resolution::Done;
        }
        Err(err) => err,
    };

    match err.code {
        XA_HEURRB => {
            forget(unique_name, resource, xid);
            Resolution::Done
        }
        XA_HEURCOM | XA_HEURMIX | XA_HEURHAZ => {
            error!(
                "heuristic outcome while rolling back branch {} on {} during recovery: {}",
                xid, unique_name, err
            );
            forget(unique_name, resource, xid);
            Resolution::Resolved
        }
        _ if err.is_unknown_branch() || err.is_rollback() => Resolution::Resolved,
        _ => {
            warn!(
                "cannot roll back in-doubt branch {} on {}, retrying on the next recovery: {}",
                xid, unique_name, err
            );
            Resolution::Pending
        }
    }
}

fn forget(unique_name: &str, resource: &dyn XaResource, xid: &Xid) {
    if let Err(e) = resource.forget(xid) {
        warn!("cannot forget branch {} on {}: {}", xid, unique_name, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockXaResource;
    use lumatm_common::types::Uid;

    fn xid(server: &[u8], ts: Timestamp, seq: u32) -> Xid {
        Xid::new(Uid::new(server, ts, seq), Uid::new(server, ts, seq + 1000))
    }

    #[test]
    fn test_filter_threshold_is_exclusive() {
        let filter = XidFilter {
            server_id: None,
            threshold: 100,
        };
        assert!(filter.accepts(&xid(b"a", 99, 1)));
        assert!(!filter.accepts(&xid(b"a", 100, 1)));
        assert!(!filter.accepts(&Xid::with_format(7, &b"foreign"[..], &b"branch"[..])));
    }

    #[test]
    fn test_filter_current_node_only() {
        let filter = XidFilter {
            server_id: Some(b"node-a".to_vec()),
            threshold: 100,
        };
        assert!(filter.accepts(&xid(b"node-a", 1, 1)));
        assert!(!filter.accepts(&xid(b"node-b", 1, 1)));
    }

    #[test]
    fn test_recover_xids_dedupes_scan_batches() {
        let resource = MockXaResource::new("db");
        resource.add_in_doubt(xid(b"a", 1, 1));
        resource.add_in_doubt(xid(b"a", 2, 2));
        let filter = XidFilter {
            server_id: None,
            threshold: 10,
        };

        let xids = recover_xids(resource.as_ref(), &filter).unwrap();
        assert_eq!(xids.len(), 2);
    }

    #[test]
    fn test_report_display() {
        let report = RecoveryReport {
            committed: 2,
            rolled_back: 1,
            failed_resources: vec!["mq".to_string()],
        };
        assert_eq!(report.to_string(), "2 committed, 1 rolled back, failed resources: mq");
    }
}
