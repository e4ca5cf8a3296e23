pub use rill_core::*;

use std::fmt::Display;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("graph not registered: {name} {version}")]
    GraphNotRegistered { name: String, version: String },

    #[error("execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    #[error("execution {execution} has no node named {node}")]
    UnknownNode {
        execution: ExecutionId,
        node: String,
    },

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The value is not set (and did not become set within the wait).
    #[error("value not set")]
    NotSet,

    /// Retries are exhausted at the current upstream-revision level; the
    /// node stays failed until upstream revisions advance.
    #[error("computation failed")]
    ComputationFailed,
}

impl Error {
    pub fn invalid(text: impl Display) -> Error {
        Error::InvalidOperation(text.to_string())
    }

    pub fn not_registered(name: impl Into<String>, version: impl Into<String>) -> Error {
        Error::GraphNotRegistered {
            name: name.into(),
            version: version.into(),
        }
    }
}

#[derive(Clone, Default)]
pub struct CancelTokenImpl(pub tokio_util::sync::CancellationToken);

impl CancelToken for CancelTokenImpl {
    async fn cancelled(&self) {
        self.0.cancelled().await;
    }
}
