//! Registry of graph definitions loaded in this process.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::graph::Graph;

/// Graphs keyed by `(name, version)`.
///
/// Typically populated once at startup and shared by handle; registering at
/// runtime is supported. Unregistering a graph makes the advance loop and
/// sweepers skip executions that were started from it.
#[derive(Clone, Default)]
pub struct GraphCatalog {
    inner: Arc<RwLock<HashMap<(String, String), Arc<Graph>>>>,
}

impl GraphCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_graphs(graphs: impl IntoIterator<Item = Graph>) -> Self {
        let catalog = Self::new();

        for graph in graphs {
            catalog.register(graph);
        }

        catalog
    }

    /// Register a graph, replacing any previous definition under the same
    /// `(name, version)`.
    pub fn register(&self, graph: Graph) -> Arc<Graph> {
        tracing::info!(graph = graph.name(), version = graph.version(), "registering graph");

        let key = (graph.name().to_string(), graph.version().to_string());
        let graph = Arc::new(graph);

        let mut inner = self.inner.write().expect("catalog lock poisoned");
        inner.insert(key, graph.clone());

        graph
    }

    pub fn unregister(&self, name: &str, version: &str) -> Option<Arc<Graph>> {
        tracing::info!(graph = name, version, "unregistering graph");

        let mut inner = self.inner.write().expect("catalog lock poisoned");
        inner.remove(&(name.to_string(), version.to_string()))
    }

    pub fn get(&self, name: &str, version: &str) -> Option<Arc<Graph>> {
        let inner = self.inner.read().expect("catalog lock poisoned");
        inner.get(&(name.to_string(), version.to_string())).cloned()
    }

    pub fn is_loaded(&self, name: &str, version: &str) -> bool {
        self.get(name, version).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("catalog lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::input;

    fn graph(name: &str, version: &str) -> Graph {
        Graph::new(name, version, vec![input("a")]).unwrap()
    }

    #[test]
    fn register_and_lookup() {
        let catalog = GraphCatalog::new();
        catalog.register(graph("g", "v1"));

        assert!(catalog.is_loaded("g", "v1"));
        assert!(!catalog.is_loaded("g", "v2"));
    }

    #[test]
    fn unregister_removes() {
        let catalog = GraphCatalog::new();
        catalog.register(graph("g", "v1"));
        catalog.unregister("g", "v1");

        assert!(catalog.get("g", "v1").is_none());
    }

    #[test]
    fn register_replaces_same_key() {
        let catalog = GraphCatalog::new();
        catalog.register(graph("g", "v1"));
        catalog.register(graph("g", "v1"));

        assert_eq!(catalog.len(), 1);
    }
}
