//! Blocking value reads.
//!
//! `get_value` polls the store with bounded exponential backoff instead of
//! subscribing to notifications; the store is the only coordination
//! surface shared by all replicas.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Wait {
    /// Snapshot read, return immediately.
    #[default]
    None,

    /// Block until the value is set at any revision.
    Any,

    /// Block until a value strictly newer than the snapshot taken when the
    /// call started.
    Newer,

    /// Block until a value with `ex_revision` greater than the given one.
    NewerThan(Revision),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    Infinite,
    After(Duration),
}

impl Default for Timeout {
    fn default() -> Self {
        Timeout::After(Duration::from_secs(30))
    }
}

#[derive(Debug, Clone, Default)]
pub struct GetOpts {
    pub wait: Wait,
    pub timeout: Timeout,
}

impl GetOpts {
    pub fn no_wait() -> Self {
        Self::default()
    }

    pub fn wait_any(timeout: Duration) -> Self {
        Self {
            wait: Wait::Any,
            timeout: Timeout::After(timeout),
        }
    }

    pub fn wait_newer(timeout: Duration) -> Self {
        Self {
            wait: Wait::Newer,
            timeout: Timeout::After(timeout),
        }
    }

    pub fn wait_newer_than(revision: Revision, timeout: Duration) -> Self {
        Self {
            wait: Wait::NewerThan(revision),
            timeout: Timeout::After(timeout),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadValue {
    pub value: serde_json::Value,
    pub revision: Revision,
}

/// Read a node's value, optionally blocking until it is set or supersedes
/// a known revision.
///
/// Errors: [`Error::NotSet`] when the wait expires (or on a no-wait read
/// of an unset value); [`Error::ComputationFailed`] as soon as the node is
/// permanently failed at the current upstream revisions.
pub async fn get_value<D: Domain>(
    domain: &D,
    id: ExecutionId,
    node: &str,
    opts: GetOpts,
) -> Result<ReadValue, Error> {
    let execution = domain
        .store()
        .load_execution(id, true)
        .await?
        .ok_or(Error::ExecutionNotFound(id))?;

    let graph = domain.graph_for(&execution);
    let node_def = graph.as_deref().and_then(|g| g.node(node));

    if graph.is_some() && node_def.is_none() && !is_system_node(node) {
        return Err(Error::UnknownNode {
            execution: id,
            node: node.to_string(),
        });
    }

    let reader = &domain.runtime().reader;

    let deadline = match opts.timeout {
        Timeout::Infinite => None,
        Timeout::After(t) => Some(Instant::now() + t),
    };

    // `Newer` means newer than what this reader can see right now
    let baseline = match opts.wait {
        Wait::NewerThan(revision) => Some(revision),
        Wait::Newer => {
            let current = domain.store().load_value(id, node).await?;
            Some(current.map(|row| row.ex_revision).unwrap_or(0))
        }
        _ => None,
    };

    let mut attempt: u64 = 0;

    loop {
        let row = domain
            .store()
            .load_value(id, node)
            .await?
            .ok_or_else(|| Error::UnknownNode {
                execution: id,
                node: node.to_string(),
            })?;

        let satisfied = match (&opts.wait, baseline) {
            (Wait::None | Wait::Any, _) => row.is_set(),
            (_, Some(baseline)) => row.is_set() && row.ex_revision > baseline,
            _ => row.is_set(),
        };

        if satisfied {
            return Ok(ReadValue {
                value: row.node_value.clone().unwrap_or(serde_json::Value::Null),
                revision: row.ex_revision,
            });
        }

        // permanent failure surfaces immediately, not at timeout
        if let Some(node_def) = node_def {
            if !node_def.is_input() {
                let computations = domain.store().load_computations(id, Some(node)).await?;
                let snapshot = domain.store().load_values(id).await?;

                if rules::permanently_failed(node_def, &computations, &snapshot, now_secs()) {
                    return Err(Error::ComputationFailed);
                }
            }
        }

        if opts.wait == Wait::None {
            return Err(Error::NotSet);
        }

        attempt += 1;

        let backoff = (reader.poll_base_ms.saturating_mul(attempt)).min(reader.poll_cap_ms);
        let jitter = rand::rng().random_range(0..=reader.poll_base_ms);
        let mut sleep = Duration::from_millis(backoff + jitter);

        if let Some(deadline) = deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());

            if remaining.is_zero() {
                return Err(Error::NotSet);
            }

            sleep = sleep.min(remaining);
        }

        tokio::time::sleep(sleep).await;
    }
}
