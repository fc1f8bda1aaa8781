//! Recovery of a single resource

use std::sync::Arc;

use tracing::{info, warn};

use lumatm_common::error::Result;

use crate::recovery::{RecoveryContext, RecoveryReport};
use crate::resource::ResourceProducer;
use crate::services::Services;

/// Resolve the in-doubt branches of `producer` only, used when a resource
/// is registered or becomes reachable again. The producer is marked failed
/// when it cannot be recovered.
pub fn incremental_recover(
    services: &Arc<Services>,
    producer: &Arc<dyn ResourceProducer>,
) -> Result<RecoveryReport> {
    let context = RecoveryContext::snapshot(services)?;

    let outcome = match context.recover_producer(producer) {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!("incremental recovery of {} failed: {}", producer.unique_name(), e);
            producer.set_failed(true);
            return Err(e);
        }
    };

    let report = RecoveryReport {
        committed: outcome.committed,
        rolled_back: outcome.rolled_back,
        failed_resources: Vec::new(),
    };
    context.resolve(services, std::slice::from_ref(&outcome))?;
    producer.set_failed(false);

    if report.committed > 0 || report.rolled_back > 0 {
        info!("incremental recovery of {}: {}", producer.unique_name(), report);
    }
    Ok(report)
}
