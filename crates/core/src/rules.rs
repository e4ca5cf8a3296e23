//! Pure decision rules shared by every store backend.
//!
//! Backends call these inside their own transactions so that the exact
//! same staleness and invalidation semantics apply regardless of where the
//! snapshot came from.

use std::collections::HashMap;

use crate::gate::{evaluate_opt, EvalMode};
use crate::graph::Graph;
use crate::model::{ComputationRecord, ComputationState, NodeType, ValueRecord};
use crate::{EpochSecs, Revision};

/// A node whose latest successful computation is based on stale inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct StaleNode {
    pub node: String,

    /// `ex_revision_at_start` of the success that went stale. The
    /// conditional insert uses it to ignore races with a newer success.
    pub prior_start_revision: Revision,
}

/// Detect computations whose prior result must be redone because an
/// upstream revision advanced past the captured `computed_with` snapshot.
pub fn stale_nodes(
    graph: &Graph,
    snapshot: &HashMap<String, ValueRecord>,
    computations: &[ComputationRecord],
    now: EpochSecs,
) -> Vec<StaleNode> {
    let mut out = vec![];

    for node in graph.computable_nodes() {
        // latest success = highest starting revision
        let latest = computations
            .iter()
            .filter(|c| c.node_name == node.name && c.state == ComputationState::Success)
            .max_by_key(|c| c.ex_revision_at_start);

        let Some(latest) = latest else {
            continue;
        };

        let readiness = evaluate_opt(node.gated_by.as_ref(), snapshot, EvalMode::Computation, now);

        if !readiness.ready {
            continue;
        }

        let stale = readiness.conditions_met.iter().any(|c| {
            let current = snapshot.get(&c.node).map(|v| v.ex_revision);

            match (current, latest.computed_with.get(&c.node)) {
                (Some(current), Some(captured)) => current > *captured,
                // a met condition the prior run never captured
                (Some(_), None) => true,
                (None, _) => false,
            }
        });

        if stale {
            out.push(StaleNode {
                node: node.name.clone(),
                prior_start_revision: latest.ex_revision_at_start.unwrap_or(0),
            });
        }
    }

    out
}

/// Failed-out nodes that have become eligible again.
///
/// A node whose latest outcome is `failed`/`abandoned` with nothing
/// pending earns a fresh computation once its gate holds and the attempts
/// at the current upstream-revision level are no longer exhausted, which
/// happens exactly when upstream revisions advance past the failed
/// attempts.
pub fn retryable_failed_nodes(
    graph: &Graph,
    snapshot: &HashMap<String, ValueRecord>,
    computations: &[ComputationRecord],
    now: EpochSecs,
) -> Vec<String> {
    let mut out = vec![];

    for node in graph.computable_nodes() {
        let rows: Vec<&ComputationRecord> = computations
            .iter()
            .filter(|c| c.node_name == node.name)
            .collect();

        if rows.is_empty() || rows.iter().any(|c| c.state.is_pending()) {
            continue;
        }

        let latest = rows
            .iter()
            .max_by_key(|c| c.id)
            .expect("rows checked non-empty");

        if !matches!(
            latest.state,
            ComputationState::Failed | ComputationState::Abandoned
        ) {
            continue;
        }

        let readiness = evaluate_opt(node.gated_by.as_ref(), snapshot, EvalMode::Computation, now);

        if !readiness.ready {
            continue;
        }

        let owned: Vec<ComputationRecord> = rows.iter().map(|c| (*c).clone()).collect();

        if crate::retry::should_retry(node, &owned, snapshot, now) {
            out.push(node.name.clone());
        }
    }

    out
}

/// Compute-typed set values whose gate no longer holds under the
/// invalidation evaluation mode. Other node types keep their values across
/// gate transitions.
pub fn invalidation_candidates(
    graph: &Graph,
    snapshot: &HashMap<String, ValueRecord>,
    now: EpochSecs,
) -> Vec<String> {
    let mut out = vec![];

    for node in graph.computable_nodes() {
        if node.node_type() != NodeType::Compute {
            continue;
        }

        let is_set = snapshot.get(&node.name).map(|v| v.is_set()).unwrap_or(false);

        if !is_set {
            continue;
        }

        let readiness = evaluate_opt(node.gated_by.as_ref(), snapshot, EvalMode::Invalidation, now);

        if !readiness.ready {
            out.push(node.name.clone());
        }
    }

    out
}

/// Whether a new pending computation may be inserted for the node given
/// the rows already present. Mirrors the SQL conditional insert: refuse
/// when a pending row exists or when a success newer than the prior one
/// already landed.
pub fn may_insert_recomputation(
    existing: &[ComputationRecord],
    node: &str,
    prior_start_revision: Revision,
) -> bool {
    !existing.iter().any(|c| {
        c.node_name == node
            && (c.state.is_pending()
                || (c.state == ComputationState::Success
                    && c.ex_revision_at_start
                        .map(|r| r > prior_start_revision)
                        .unwrap_or(false)))
    })
}

// re-exported here so backends find the whole rule set in one place
pub use crate::retry::{attempts_at_level, permanently_failed, should_retry};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{compute, input, ComputeInput, NodeOptions};
    use crate::{ComputationId, ExecutionId};
    use serde_json::json;

    fn graph() -> Graph {
        Graph::new(
            "g",
            "v1",
            vec![
                input("a"),
                compute(
                    "out",
                    vec!["a"],
                    |m: &ComputeInput| Ok(m.require("a")?.clone()),
                    NodeOptions::default(),
                ),
            ],
        )
        .unwrap()
    }

    fn value(node: &str, node_type: NodeType, set: bool, revision: Revision) -> ValueRecord {
        ValueRecord {
            execution_id: ExecutionId::new(),
            node_name: node.to_string(),
            node_type,
            node_value: set.then(|| json!(1)),
            set_time: set.then_some(100),
            ex_revision: revision,
            inserted_at: 100,
            updated_at: 100,
        }
    }

    fn success(node: &str, start_revision: Revision, captured: &[(&str, Revision)]) -> ComputationRecord {
        ComputationRecord {
            id: ComputationId(1),
            execution_id: ExecutionId::new(),
            node_name: node.to_string(),
            computation_type: NodeType::Compute,
            state: ComputationState::Success,
            start_time: Some(100),
            completion_time: Some(101),
            deadline: None,
            last_heartbeat_at: None,
            heartbeat_deadline: None,
            ex_revision_at_start: Some(start_revision),
            ex_revision_at_completion: Some(start_revision + 1),
            computed_with: captured
                .iter()
                .map(|(n, r)| (n.to_string(), *r))
                .collect(),
            error_details: None,
            inserted_at: 100,
            updated_at: 101,
        }
    }

    #[test]
    fn newer_upstream_marks_stale() {
        let graph = graph();
        let snapshot: HashMap<_, _> = [
            ("a".to_string(), value("a", NodeType::Input, true, 7)),
            ("out".to_string(), value("out", NodeType::Compute, true, 4)),
        ]
        .into();

        let comps = vec![success("out", 3, &[("a", 2)])];

        let stale = stale_nodes(&graph, &snapshot, &comps, 200);

        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].node, "out");
        assert_eq!(stale[0].prior_start_revision, 3);
    }

    #[test]
    fn captured_revision_means_fresh() {
        let graph = graph();
        let snapshot: HashMap<_, _> = [
            ("a".to_string(), value("a", NodeType::Input, true, 2)),
            ("out".to_string(), value("out", NodeType::Compute, true, 4)),
        ]
        .into();

        let comps = vec![success("out", 3, &[("a", 2)])];

        assert!(stale_nodes(&graph, &snapshot, &comps, 200).is_empty());
    }

    #[test]
    fn unsatisfied_gate_is_never_stale() {
        let graph = graph();
        let snapshot: HashMap<_, _> = [
            ("a".to_string(), value("a", NodeType::Input, false, 9)),
            ("out".to_string(), value("out", NodeType::Compute, true, 4)),
        ]
        .into();

        let comps = vec![success("out", 3, &[("a", 2)])];

        assert!(stale_nodes(&graph, &snapshot, &comps, 200).is_empty());
    }

    #[test]
    fn invalidation_targets_only_set_compute_values() {
        let graph = graph();

        // gate unsatisfied, out still set -> candidate
        let snapshot: HashMap<_, _> = [
            ("a".to_string(), value("a", NodeType::Input, false, 9)),
            ("out".to_string(), value("out", NodeType::Compute, true, 4)),
        ]
        .into();

        assert_eq!(invalidation_candidates(&graph, &snapshot, 200), vec!["out"]);

        // out unset -> nothing to clear
        let snapshot: HashMap<_, _> = [
            ("a".to_string(), value("a", NodeType::Input, false, 9)),
            ("out".to_string(), value("out", NodeType::Compute, false, 4)),
        ]
        .into();

        assert!(invalidation_candidates(&graph, &snapshot, 200).is_empty());
    }

    #[test]
    fn recomputation_insert_guard() {
        let fresh_success = success("out", 5, &[]);

        assert!(!may_insert_recomputation(
            std::slice::from_ref(&fresh_success),
            "out",
            3
        ));

        assert!(may_insert_recomputation(&[success("out", 3, &[])], "out", 3));
    }
}
