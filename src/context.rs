//! Shared context for mesh operations.

use std::sync::Arc;

use crate::backend::{create_backend, ComputeBackend, MemoryBudget};
use crate::error::Result;

/// Shared state every mesh operation runs under: the compute backend plus
/// the device memory-budget query the batch partitioner and remesh engine
/// both consult.
///
/// Cheap to clone; all operations borrow it immutably. Orchestration is
/// single-threaded by design: one context drives one submission at a time.
#[derive(Clone)]
pub struct Context {
    backend: Arc<dyn ComputeBackend>,
}

impl Context {
    /// Create a context on the best available backend.
    pub fn new() -> Result<Self> {
        Ok(Self {
            backend: create_backend()?,
        })
    }

    /// Create a context on an explicit backend.
    pub fn with_backend(backend: Arc<dyn ComputeBackend>) -> Self {
        log::info!("meshops context on {} backend", backend.name());
        Self { backend }
    }

    /// The compute backend.
    pub fn backend(&self) -> &Arc<dyn ComputeBackend> {
        &self.backend
    }

    /// Current device-local heap budget and usage.
    pub fn memory_budget(&self) -> MemoryBudget {
        self.backend.memory_budget()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("backend", &self.backend.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;

    #[test]
    fn test_context_reports_budget() {
        let context = Context::with_backend(Arc::new(DummyBackend::with_budget(1 << 20)));
        assert_eq!(context.memory_budget().budget, 1 << 20);
    }
}
