//! Registry of resource producers

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::info;

use lumatm_common::error::{Result, TransactionError};

use crate::resource::{ResourceProducer, XaResource};

/// Copy-on-write list of registered producers.
///
/// Lookups clone the current snapshot and never wait for a registration.
pub struct ResourceRegistrar {
    producers: RwLock<Arc<Vec<Arc<dyn ResourceProducer>>>>,
    /// Serializes writers so concurrent registrations never lose each other
    write_lock: Mutex<()>,
}

impl ResourceRegistrar {
    pub fn new() -> Self {
        Self {
            producers: RwLock::new(Arc::new(Vec::new())),
            write_lock: Mutex::new(()),
        }
    }

    /// Check that a unique name can be written to the journal
    pub fn validate_unique_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(TransactionError::InvalidResourceName(
                "unique name must not be empty".to_string(),
            )
            .into());
        }
        if !name.is_ascii() {
            return Err(TransactionError::InvalidResourceName(format!(
                "unique name '{}' is not US-ASCII",
                name
            ))
            .into());
        }
        if name.len() > u16::MAX as usize {
            return Err(TransactionError::InvalidResourceName(format!(
                "unique name of {} bytes is too long",
                name.len()
            ))
            .into());
        }
        Ok(())
    }

    pub fn register(&self, producer: Arc<dyn ResourceProducer>) -> Result<()> {
        let name = producer.unique_name().to_string();
        Self::validate_unique_name(&name)?;

        let _guard = self.write_lock.lock();
        let current = self.snapshot();
        if current.iter().any(|p| p.unique_name() == name) {
            return Err(TransactionError::DuplicateResource(name).into());
        }

        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(producer);
        *self.producers.write() = Arc::new(next);

        info!("registered resource {}", name);
        Ok(())
    }

    pub fn unregister(&self, unique_name: &str) -> Result<Arc<dyn ResourceProducer>> {
        let _guard = self.write_lock.lock();
        let current = self.snapshot();
        let removed = current
            .iter()
            .find(|p| p.unique_name() == unique_name)
            .cloned()
            .ok_or_else(|| TransactionError::UnknownResource(unique_name.to_string()))?;

        let next: Vec<_> = current
            .iter()
            .filter(|p| p.unique_name() != unique_name)
            .cloned()
            .collect();
        *self.producers.write() = Arc::new(next);

        info!("unregistered resource {}", unique_name);
        Ok(removed)
    }

    pub fn get(&self, unique_name: &str) -> Option<Arc<dyn ResourceProducer>> {
        self.snapshot()
            .iter()
            .find(|p| p.unique_name() == unique_name)
            .cloned()
    }

    /// Producer owning an enlisted resource
    pub fn find_producer(&self, resource: &dyn XaResource) -> Option<Arc<dyn ResourceProducer>> {
        self.snapshot().iter().find(|p| p.holds(resource)).cloned()
    }

    /// Current registrations in registration order
    pub fn producers(&self) -> Arc<Vec<Arc<dyn ResourceProducer>>> {
        self.snapshot()
    }

    pub fn unique_names(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .map(|p| p.unique_name().to_string())
            .collect()
    }

    fn snapshot(&self) -> Arc<Vec<Arc<dyn ResourceProducer>>> {
        self.producers.read().clone()
    }
}

impl Default for ResourceRegistrar {
    fn default() -> Self {
        Self::new()
    }
}
