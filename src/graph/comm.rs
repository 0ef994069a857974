use crate::{
    connector::{AnyConnector, Connector},
    memory::{Memory, MemoryError},
    sync::RwLock,
    types::HashMap,
};
use std::sync::Arc;

/// Address-indexed registry of connectors for out-of-band data delivery.
///
/// Every memory edge registers its release connector here under a unique
/// address, which is stamped on each buffer the edge issues. Releases route
/// through the registry by that address, so a buffer may be returned by a
/// task other than the borrower, by a different pipeline replica's graph, or
/// by a caller outside the graph entirely.
///
/// A graph and all of its deep copies share one communicator. Lookups are
/// read-mostly; registrations happen only while edges are applied.
pub(crate) struct TaskGraphCommunicator {
    connectors: RwLock<HashMap<String, Arc<dyn AnyConnector>>>,
}

impl TaskGraphCommunicator {
    pub(crate) fn new() -> Self {
        Self {
            connectors: RwLock::new(HashMap::default()),
        }
    }

    pub(crate) fn register(&self, address: String, connector: Arc<dyn AnyConnector>) {
        let previous = self
            .connectors
            .write()
            .expect("TaskGraphCommunicator::register: [1]")
            .insert(address, connector);
        debug_assert!(
            previous.is_none(),
            "TaskGraphCommunicator::register: duplicate address"
        );
    }

    /// Delivers a released buffer to its memory manager's release edge.
    pub(crate) fn release<B: Send + 'static>(&self, memory: Memory<B>) -> Result<(), MemoryError> {
        let connector = self
            .connectors
            .read()
            .expect("TaskGraphCommunicator::release: [1]")
            .get(memory.address())
            .cloned()
            .ok_or_else(|| MemoryError::UnknownAddress(memory.address().to_string()))?;
        let typed = connector
            .as_any_arc()
            .downcast::<Connector<Memory<B>>>()
            .map_err(|_| MemoryError::TypeMismatch(memory.manager_name().to_string()))?;
        typed.produce(memory);
        Ok(())
    }
}
