//! Resource manager contract consumed by the coordinator

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use lumatm_common::error::Result;
use lumatm_common::types::Xid;
use lumatm_common::xa::{Vote, XaError};

/// Result of an XA call
pub type XaResult<T> = std::result::Result<T, XaError>;

/// Two-phase capable resource, the `XAResource` equivalent
pub trait XaResource: Send + Sync {
    /// Associate the calling thread with a branch
    fn start(&self, xid: &Xid, flags: i32) -> XaResult<()>;

    /// Dissociate the calling thread from a branch
    fn end(&self, xid: &Xid, flags: i32) -> XaResult<()>;

    fn prepare(&self, xid: &Xid) -> XaResult<Vote>;

    fn commit(&self, xid: &Xid, one_phase: bool) -> XaResult<()>;

    fn rollback(&self, xid: &Xid) -> XaResult<()>;

    /// List prepared or heuristically completed branches
    fn recover(&self, flags: i32) -> XaResult<Vec<Xid>>;

    fn is_same_rm(&self, other: &dyn XaResource) -> XaResult<bool>;

    /// Discard the knowledge of a heuristically completed branch
    fn forget(&self, xid: &Xid) -> XaResult<()>;

    fn set_transaction_timeout(&self, seconds: u32) -> XaResult<bool>;

    fn as_any(&self) -> &dyn Any;
}

/// Same resource instance, regardless of the vtable the pointer came with
pub fn same_resource(a: &dyn XaResource, b: &dyn XaResource) -> bool {
    std::ptr::eq(
        a as *const dyn XaResource as *const (),
        b as *const dyn XaResource as *const (),
    )
}

/// Per-resource settings relevant to the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Name recorded in the journal, must be US-ASCII
    pub unique_name: String,
    /// Commit ordering group, lower positions are prepared and committed first
    pub two_pc_ordering_position: i32,
    /// Join branches of other resources of the same resource manager
    pub use_tm_join: bool,
    /// Resource emulating XA (last resource commit)
    pub last_resource: bool,
    /// Pass the transaction timeout to the resource on start
    pub apply_transaction_timeout: bool,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            unique_name: String::new(),
            two_pc_ordering_position: 1,
            use_tm_join: true,
            last_resource: false,
            apply_transaction_timeout: false,
        }
    }
}

impl ResourceConfig {
    pub fn new(unique_name: impl Into<String>) -> Self {
        Self {
            unique_name: unique_name.into(),
            ..Default::default()
        }
    }

    pub fn with_ordering_position(mut self, position: i32) -> Self {
        self.two_pc_ordering_position = position;
        self
    }

    pub fn with_tm_join(mut self, use_tm_join: bool) -> Self {
        self.use_tm_join = use_tm_join;
        self
    }

    pub fn with_last_resource(mut self, last_resource: bool) -> Self {
        self.last_resource = last_resource;
        self
    }

    pub fn with_transaction_timeout(mut self, apply: bool) -> Self {
        self.apply_transaction_timeout = apply;
        self
    }
}

/// Registration unit for a resource: hands out recovery sessions and tells
/// which enlisted resources it owns.
pub trait ResourceProducer: Send + Sync {
    fn config(&self) -> &ResourceConfig;

    fn unique_name(&self) -> &str {
        &self.config().unique_name
    }

    /// Session used to scan for in-doubt branches
    fn start_recovery(&self) -> Result<Arc<dyn XaResource>>;

    /// Release the recovery session
    fn end_recovery(&self) -> Result<()>;

    /// Mark the producer as unreachable until a recovery succeeds
    fn set_failed(&self, failed: bool);

    fn is_failed(&self) -> bool;

    /// Whether `resource` was created by this producer
    fn holds(&self, resource: &dyn XaResource) -> bool;
}

/// Pool of resource sessions; the coordinator only drives shrinking
pub trait ResourcePool: Send + Sync {
    fn unique_name(&self) -> &str;

    fn acquire(&self) -> Result<Arc<dyn XaResource>>;

    fn release(&self, resource: Arc<dyn XaResource>);

    /// Close idle sessions
    fn shrink(&self) -> Result<()>;

    /// When `shrink` should run next, `None` stops shrinking
    fn next_shrink_time(&self) -> Option<Instant>;
}
