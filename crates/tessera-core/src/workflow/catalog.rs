//! Workflow definitions by name.
//!
//! The engine resolves `start_workflow` identifiers and `workflow:` tasks
//! through a [`WorkflowCatalog`]. Definitions are shared as `Arc`s and
//! snapshotted into each execution, so replacing a definition never affects
//! runs already in flight.

use std::sync::Arc;

use dashmap::DashMap;
use tessera_types::spec::WorkflowSpec;

/// Read access to registered workflow definitions.
pub trait WorkflowCatalog: Send + Sync {
    fn get(&self, name: &str) -> Option<Arc<WorkflowSpec>>;
}

/// Process-local catalog backed by a `DashMap`.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    specs: DashMap<String, Arc<WorkflowSpec>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a definition under its own name.
    pub fn register(&self, spec: WorkflowSpec) -> Arc<WorkflowSpec> {
        let spec = Arc::new(spec);
        self.specs.insert(spec.name.clone(), Arc::clone(&spec));
        spec
    }

    pub fn remove(&self, name: &str) -> bool {
        self.specs.remove(name).is_some()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.specs.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

impl WorkflowCatalog for InMemoryCatalog {
    fn get(&self, name: &str) -> Option<Arc<WorkflowSpec>> {
        self.specs.get(name).map(|e| Arc::clone(e.value()))
    }
}
