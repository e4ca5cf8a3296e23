//! Traits and machinery that are common to all rill crates.
//!
//! Glossary:
//!  - `gate`: the boolean expression over upstream node states that must
//!    hold for a computation to become eligible.
//!  - `revision`: per-execution monotonically increasing integer, bumped on
//!    every mutating transaction.
//!  - `pulse`: a value produced by a schedule node whose contents are the
//!    epoch second at which downstream gates should become satisfied.
//!  - `sweep`: a cluster-wide-singleton periodic pass that heals stuck or
//!    missed work.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod catalog;
pub mod config;
pub mod gate;
pub mod graph;
pub mod model;
pub mod retry;
pub mod rules;
pub mod store;

pub use catalog::*;
pub use config::*;
pub use gate::*;
pub use graph::*;
pub use model::*;
pub use store::*;

/// Wall-clock time expressed as whole epoch seconds.
pub type EpochSecs = i64;

/// Per-execution monotonically increasing counter.
pub type Revision = i64;

/// Current wall-clock time as whole epoch seconds.
pub fn now_secs() -> EpochSecs {
    chrono::Utc::now().timestamp()
}

/// Opaque identifier for one running instance of a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-assigned identifier for a computation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComputationId(pub i64);

impl Display for ComputationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Access to the shared pieces the engine operates on: the store, the graph
/// catalog and the runtime configuration.
///
/// Implementors are cheap-clone handles, one per process, shared across
/// worker tasks and sweep drivers.
pub trait Domain: Clone + Send + Sync + 'static {
    type Store: WorkflowStore;

    fn store(&self) -> &Self::Store;
    fn catalog(&self) -> &GraphCatalog;
    fn runtime(&self) -> &RuntimeConfig;

    /// Resolve the graph a persisted execution was started from.
    ///
    /// Returns `None` when the graph is no longer registered, which is the
    /// signal used by sweepers and the advance loop to skip the execution.
    fn graph_for(&self, execution: &ExecutionRecord) -> Option<std::sync::Arc<Graph>> {
        self.catalog()
            .get(&execution.graph_name, &execution.graph_version)
    }
}

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(Box<dyn std::error::Error + Send + Sync>),
}

#[trait_variant::make(Send)]
pub trait CancelToken: Send + Sync + 'static + Clone {
    async fn cancelled(&self);
}

/// A long-running background service tied to a domain.
///
/// Drivers run until completion or until the cancel token fires, whichever
/// comes first.
#[trait_variant::make(Send)]
pub trait Driver<D: Domain, C: CancelToken>: Send + Sync + 'static {
    type Config: Clone;

    async fn run(config: Self::Config, domain: D, cancel: C) -> Result<(), DriveError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_id_roundtrip() {
        let id = ExecutionId::new();
        let parsed = ExecutionId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }
}
