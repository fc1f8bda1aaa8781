//! Participation of one enlisted resource in a transaction

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use lumatm_common::types::Xid;
use lumatm_common::xa::{Flags, Vote, TMJOIN, TMRESUME, TMSUSPEND};

use crate::resource::{same_resource, ResourceConfig, XaResource, XaResult};

/// Association state of a branch with its resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchPhase {
    /// `start` was never called successfully
    Idle,
    /// `start` was called and the branch is associated
    Active,
    /// `end(TMSUSPEND)` was called, `start(TMRESUME)` reattaches it
    Suspended,
    /// `end(TMSUCCESS | TMFAIL)` was called
    Ended,
}

#[derive(Debug)]
struct HolderFlags {
    phase: BranchPhase,
    timeout_set: bool,
}

/// One enlisted resource: its session, branch id and association state
pub struct ResourceHolderState {
    resource: Arc<dyn XaResource>,
    config: ResourceConfig,
    xid: Xid,
    flags: Mutex<HolderFlags>,
}

impl ResourceHolderState {
    pub fn new(resource: Arc<dyn XaResource>, config: ResourceConfig, xid: Xid) -> Self {
        Self {
            resource,
            config,
            xid,
            flags: Mutex::new(HolderFlags {
                phase: BranchPhase::Idle,
                timeout_set: false,
            }),
        }
    }

    pub fn resource(&self) -> &Arc<dyn XaResource> {
        &self.resource
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    pub fn unique_name(&self) -> &str {
        &self.config.unique_name
    }

    pub fn xid(&self) -> &Xid {
        &self.xid
    }

    pub fn ordering_position(&self) -> i32 {
        self.config.two_pc_ordering_position
    }

    pub fn is_last_resource(&self) -> bool {
        self.config.last_resource
    }

    pub fn phase(&self) -> BranchPhase {
        self.flags.lock().phase
    }

    pub fn holds(&self, resource: &dyn XaResource) -> bool {
        same_resource(self.resource.as_ref(), resource)
    }

    /// Associate the branch, passing the transaction timeout first when the
    /// resource asks for it
    pub fn start(&self, flags: i32, timeout_secs: u32) -> XaResult<()> {
        let mut state = self.flags.lock();
        if self.config.apply_transaction_timeout && !state.timeout_set {
            self.resource.set_transaction_timeout(timeout_secs)?;
            state.timeout_set = true;
        }

        debug!(
            "starting branch {} of {} with {}",
            self.xid,
            self.config.unique_name,
            Flags(flags)
        );
        self.resource.start(&self.xid, flags)?;
        state.phase = BranchPhase::Active;
        Ok(())
    }

    /// Start on the branch of `other`, which belongs to the same resource manager
    pub fn join(resource: Arc<dyn XaResource>, config: ResourceConfig, other: &Self) -> Self {
        Self::new(resource, config, other.xid.clone())
    }

    /// Dissociate the branch; a branch that is not active is left alone
    pub fn end(&self, flags: i32) -> XaResult<()> {
        let mut state = self.flags.lock();
        if state.phase != BranchPhase::Active {
            return Ok(());
        }

        debug!(
            "ending branch {} of {} with {}",
            self.xid,
            self.config.unique_name,
            Flags(flags)
        );
        self.resource.end(&self.xid, flags)?;
        state.phase = if flags & TMSUSPEND != 0 {
            BranchPhase::Suspended
        } else {
            BranchPhase::Ended
        };
        Ok(())
    }

    /// Reattach a suspended branch
    pub fn resume(&self) -> XaResult<()> {
        let mut state = self.flags.lock();
        if state.phase != BranchPhase::Suspended {
            return Ok(());
        }
        self.resource.start(&self.xid, TMRESUME)?;
        state.phase = BranchPhase::Active;
        Ok(())
    }

    /// Reopen an ended branch on the same session
    pub fn rejoin(&self) -> XaResult<()> {
        let mut state = self.flags.lock();
        if state.phase != BranchPhase::Ended {
            return Ok(());
        }
        self.resource.start(&self.xid, TMJOIN)?;
        state.phase = BranchPhase::Active;
        Ok(())
    }

    pub fn is_same_rm(&self, resource: &dyn XaResource) -> XaResult<bool> {
        self.resource.is_same_rm(resource)
    }

    pub fn prepare(&self) -> XaResult<Vote> {
        self.resource.prepare(&self.xid)
    }

    pub fn commit(&self, one_phase: bool) -> XaResult<()> {
        self.resource.commit(&self.xid, one_phase)
    }

    pub fn rollback(&self) -> XaResult<()> {
        self.resource.rollback(&self.xid)
    }

    pub fn forget(&self) -> XaResult<()> {
        self.resource.forget(&self.xid)
    }
}

impl fmt::Debug for ResourceHolderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHolderState")
            .field("unique_name", &self.config.unique_name)
            .field("xid", &self.xid)
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Event, MockXaResource};
    use lumatm_common::types::Uid;
    use lumatm_common::xa::{TMNOFLAGS, TMSUCCESS};

    fn holder(resource: &Arc<MockXaResource>, config: ResourceConfig) -> ResourceHolderState {
        let xid = Xid::new(Uid::new(b"n", 1, 1), Uid::new(b"n", 1, 2));
        ResourceHolderState::new(resource.clone(), config, xid)
    }

    #[test]
    fn test_start_end_cycle() {
        let resource = MockXaResource::new("db");
        let holder = holder(&resource, ResourceConfig::new("db"));

        holder.start(TMNOFLAGS, 60).unwrap();
        assert_eq!(holder.phase(), BranchPhase::Active);
        holder.end(TMSUSPEND).unwrap();
        assert_eq!(holder.phase(), BranchPhase::Suspended);
        holder.resume().unwrap();
        holder.end(TMSUCCESS).unwrap();
        assert_eq!(holder.phase(), BranchPhase::Ended);

        // ending twice does not reach the resource
        holder.end(TMSUCCESS).unwrap();
        let ends = resource
            .events()
            .iter()
            .filter(|e| matches!(e, Event::End { .. }))
            .count();
        assert_eq!(ends, 2);
    }

    #[test]
    fn test_timeout_applied_once() {
        let resource = MockXaResource::new("db");
        let holder = holder(&resource, ResourceConfig::new("db").with_transaction_timeout(true));

        holder.start(TMNOFLAGS, 30).unwrap();
        holder.end(TMSUCCESS).unwrap();
        holder.rejoin().unwrap();

        let timeouts: Vec<_> = resource
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::SetTransactionTimeout(secs) => Some(secs),
                _ => None,
            })
            .collect();
        assert_eq!(timeouts, vec![30]);
    }

    #[test]
    fn test_failed_start_leaves_branch_idle() {
        let resource = MockXaResource::new("db");
        resource.fail_start(lumatm_common::xa::XaError::rm_fail("down"));
        let holder = holder(&resource, ResourceConfig::new("db"));

        assert!(holder.start(TMNOFLAGS, 60).is_err());
        assert_eq!(holder.phase(), BranchPhase::Idle);
    }
}
