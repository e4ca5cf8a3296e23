//! Worker task: runs one claimed computation through its lifecycle.
//!
//! The worker and its heartbeat are sibling tasks linked through a shared
//! cancellation token: the heartbeat cancels it when the computation is
//! abandoned under us, and the worker cancels it on completion so the
//! heartbeat winds down. Store state stays the authoritative source of
//! truth; a late result against a non-`computing` row is dropped by
//! `record_success` itself.

use std::sync::Arc;

use serde_json::{json, Map as JsonMap, Value as JsonValue};
use tokio_util::sync::CancellationToken;

use crate::prelude::*;

use super::advance::advance_boxed;
use super::heartbeat;

pub(crate) fn spawn<D: Domain>(
    domain: &D,
    graph: Arc<Graph>,
    claim: ClaimedComputation,
) -> tokio::task::JoinHandle<()> {
    let domain = domain.clone();

    tokio::spawn(run(domain, graph, claim))
}

async fn run<D: Domain>(domain: D, graph: Arc<Graph>, claim: ClaimedComputation) {
    let computation = &claim.computation;
    let execution_id = computation.execution_id;

    let Some(node) = graph.node(&computation.node_name) else {
        tracing::warn!(
            execution = %execution_id,
            node = %computation.node_name,
            "claimed computation for a node the graph no longer defines"
        );
        return;
    };

    let token = CancellationToken::new();

    let hb_config = &domain.runtime().heartbeat;
    let heartbeat = tokio::spawn(heartbeat::run(
        domain.clone(),
        computation.id,
        node.heartbeat_interval_seconds
            .unwrap_or(hb_config.interval_seconds),
        node.heartbeat_timeout_seconds
            .unwrap_or(hb_config.timeout_seconds) as i64,
        hb_config.deadline_buffer_seconds,
        token.clone(),
    ));

    let outcome = execute(node, &claim, &token).await;

    match outcome {
        Execution::Completed(Ok(value)) => {
            record_success(&domain, &graph, node, &claim, value).await;
        }
        Execution::Completed(Err(reason)) => {
            tracing::debug!(
                execution = %execution_id,
                node = %node.name,
                reason = %reason,
                "computation failed"
            );

            match domain
                .store()
                .record_failure(computation.id, node, &reason, now_secs())
                .await
            {
                Ok(outcome) => {
                    tracing::debug!(
                        execution = %execution_id,
                        node = %node.name,
                        retry = outcome.retry_scheduled,
                        "failure recorded"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        execution = %execution_id,
                        node = %node.name,
                        err = %err,
                        "recording failure; a sweeper will recover this computation"
                    );
                }
            }
        }
        Execution::Killed => {
            // abandoned under us; the abandoned sweeper owns the retry
            tracing::warn!(
                execution = %execution_id,
                node = %node.name,
                computation = %computation.id,
                "worker killed by heartbeat, dropping result"
            );
            return;
        }
    }

    token.cancel();
    let _ = heartbeat.await;

    advance_boxed(domain, execution_id).await;
}

enum Execution {
    Completed(Result<JsonValue, ComputeError>),
    Killed,
}

async fn execute(node: &Node, claim: &ClaimedComputation, token: &CancellationToken) -> Execution {
    match &node.kind {
        // engine-supplied behaviors run inline, they never block
        NodeKind::Historian { max_entries } => {
            Execution::Completed(Ok(historian_entry(node, claim, *max_entries)))
        }
        NodeKind::Archive => Execution::Completed(Ok(json!(now_secs()))),

        _ => {
            let Some(f) = node.f_compute.clone() else {
                return Execution::Completed(Err(format!(
                    "node {} has no compute function",
                    node.name
                )));
            };

            let input = build_input(node, claim);

            let mut task = tokio::task::spawn_blocking(move || f(&input));

            tokio::select! {
                joined = &mut task => match joined {
                    Ok(result) => Execution::Completed(result),
                    Err(err) => Execution::Completed(Err(format!("compute panicked: {err}"))),
                },
                _ = token.cancelled() => Execution::Killed,
            }
        }
    }
}

async fn record_success<D: Domain>(
    domain: &D,
    graph: &Graph,
    node: &Node,
    claim: &ClaimedComputation,
    value: JsonValue,
) {
    let computation = &claim.computation;
    let execution_id = computation.execution_id;

    let plan = match build_plan(node, claim, value) {
        Ok(plan) => plan,
        Err(reason) => {
            // a malformed return value is a user-function failure
            match domain
                .store()
                .record_failure(computation.id, node, &reason, now_secs())
                .await
            {
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(execution = %execution_id, err = %err, "recording failure")
                }
            }
            return;
        }
    };

    match domain
        .store()
        .record_success(computation.id, &plan, now_secs())
        .await
    {
        Ok(SuccessOutcome::Recorded { execution, saved }) => {
            tracing::debug!(
                execution = %execution_id,
                node = %node.name,
                revision = execution.revision,
                "computation succeeded"
            );

            for (saved_node, saved_value) in &saved {
                run_callback(node.f_on_save.as_ref(), &execution, saved_node, saved_value);
                run_callback(graph.on_save(), &execution, saved_node, saved_value);
            }
        }
        Ok(SuccessOutcome::Dropped) => {
            tracing::warn!(
                execution = %execution_id,
                node = %node.name,
                computation = %computation.id,
                "computation left computing before the result landed, dropping it"
            );
        }
        Err(err) => {
            tracing::warn!(
                execution = %execution_id,
                node = %node.name,
                err = %err,
                "recording success; a sweeper will recover this computation"
            );
        }
    }
}

fn run_callback(
    callback: Option<&OnSaveFn>,
    execution: &ExecutionRecord,
    node: &str,
    value: &JsonValue,
) {
    if let Some(callback) = callback {
        if let Err(err) = callback(execution, node, value) {
            tracing::warn!(execution = %execution.id, node, err = %err, "on-save callback failed");
        }
    }
}

/// Snapshot the user-visible values plus per-node metadata for the gate's
/// dependency set, as captured by the claiming transaction.
fn build_input(node: &Node, claim: &ClaimedComputation) -> ComputeInput {
    let mut values = JsonMap::new();

    for (name, row) in &claim.snapshot {
        if is_system_node(name) || !row.is_set() {
            continue;
        }

        if let Some(value) = &row.node_value {
            values.insert(name.clone(), value.clone());
        }
    }

    let nodes = node
        .dependencies()
        .into_iter()
        .filter_map(|dep| {
            claim
                .snapshot
                .get(&dep)
                .map(|row| (dep.clone(), NodeSnapshot::from(row)))
        })
        .collect();

    ComputeInput { values, nodes }
}

/// Upstream revisions captured at claim time, restricted to the conditions
/// that held.
fn captured_revisions(claim: &ClaimedComputation) -> ComputedWith {
    claim
        .conditions_met
        .iter()
        .filter_map(|c| {
            claim
                .snapshot
                .get(&c.node)
                .map(|row| (c.node.clone(), row.ex_revision))
        })
        .collect()
}

/// Per-node-type write rules applied to a successful result.
fn build_plan(
    node: &Node,
    claim: &ClaimedComputation,
    value: JsonValue,
) -> Result<SuccessPlan, ComputeError> {
    let computed_with = captured_revisions(claim);

    let plan = match &node.kind {
        NodeKind::Input => {
            return Err("input nodes do not compute".to_string());
        }

        NodeKind::Compute | NodeKind::Historian { .. } => SuccessPlan {
            writes: vec![ValueWrite {
                node: node.name.clone(),
                value,
                mode: match node.kind {
                    // historians always move forward
                    NodeKind::Historian { .. } => WriteMode::AlwaysBump,
                    _ => WriteMode::BumpIfChanged,
                },
            }],
            computed_with,
            archive_execution: false,
        },

        NodeKind::Archive => SuccessPlan {
            writes: vec![ValueWrite {
                node: node.name.clone(),
                value,
                mode: WriteMode::BumpIfChanged,
            }],
            computed_with,
            archive_execution: true,
        },

        NodeKind::Mutate {
            mutates,
            update_revision_on_change,
        } => SuccessPlan {
            writes: vec![
                ValueWrite {
                    node: node.name.clone(),
                    value: json!(format!("updated {mutates}")),
                    mode: WriteMode::AlwaysBump,
                },
                ValueWrite {
                    node: mutates.clone(),
                    value,
                    mode: if *update_revision_on_change {
                        WriteMode::BumpIfChanged
                    } else {
                        WriteMode::NoBump
                    },
                },
            ],
            computed_with,
            archive_execution: false,
        },

        NodeKind::ScheduleOnce | NodeKind::ScheduleRecurring => {
            if value.as_i64().is_none() {
                return Err(format!(
                    "schedule node {} must return an epoch second, got {value}",
                    node.name
                ));
            }

            SuccessPlan {
                writes: vec![ValueWrite {
                    node: node.name.clone(),
                    value,
                    mode: WriteMode::AlwaysBump,
                }],
                computed_with,
                archive_execution: false,
            }
        }
    };

    Ok(plan)
}

/// Prepend the current upstream readings to the historian's log, newest
/// first, bounded by `max_entries`.
fn historian_entry(node: &Node, claim: &ClaimedComputation, max_entries: Option<usize>) -> JsonValue {
    let mut observed = JsonMap::new();
    let mut revisions = JsonMap::new();

    for dep in node.dependencies() {
        if let Some(row) = claim.snapshot.get(&dep) {
            observed.insert(dep.clone(), row.node_value.clone().unwrap_or(JsonValue::Null));
            revisions.insert(dep, json!(row.ex_revision));
        }
    }

    let entry = json!({
        "at": now_secs(),
        "values": observed,
        "revisions": revisions,
    });

    let mut log = claim
        .snapshot
        .get(&node.name)
        .and_then(|row| row.node_value.clone())
        .and_then(|v| v.as_array().cloned())
        .unwrap_or_default();

    log.insert(0, entry);

    if let Some(max) = max_entries {
        log.truncate(max);
    }

    JsonValue::Array(log)
}
