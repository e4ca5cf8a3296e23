//! Retry policy over computation history.
//!
//! Attempts are counted "at the current revision level": only computations
//! that started at or after the newest revision among the upstreams
//! currently satisfying the node's gate. When upstream revisions advance,
//! the count resets and a permanently-failed node becomes eligible again.

use std::collections::HashMap;

use crate::gate::{evaluate_opt, Condition, EvalMode, ValueSnapshot};
use crate::graph::Node;
use crate::model::{ComputationRecord, ValueRecord};
use crate::{EpochSecs, Revision};

/// Highest `ex_revision` among upstreams whose conditions currently hold;
/// 0 when none do.
pub fn max_upstream_revision<S: ValueSnapshot>(conditions_met: &[Condition], snapshot: &S) -> Revision {
    conditions_met
        .iter()
        .filter_map(|c| snapshot.value(&c.node))
        .map(|v| v.ex_revision)
        .max()
        .unwrap_or(0)
}

/// Number of computations that started at or after the given revision
/// level. Rows that never started (`not_set`) do not count.
pub fn attempts_at_level(computations: &[ComputationRecord], level: Revision) -> usize {
    computations
        .iter()
        .filter(|c| c.ex_revision_at_start.map(|r| r >= level).unwrap_or(false))
        .count()
}

/// Whether a failed computation should schedule another attempt.
pub fn should_retry(
    node: &Node,
    computations: &[ComputationRecord],
    snapshot: &HashMap<String, ValueRecord>,
    now: EpochSecs,
) -> bool {
    let readiness = evaluate_opt(node.gated_by.as_ref(), snapshot, EvalMode::Computation, now);
    let level = max_upstream_revision(&readiness.conditions_met, snapshot);

    attempts_at_level(computations, level) < node.max_retries as usize
}

/// Whether a reader should report the node as permanently failed: the gate
/// holds, nothing is pending or in flight, and the attempts at the current
/// revision level are exhausted with a non-success outcome.
pub fn permanently_failed(
    node: &Node,
    computations: &[ComputationRecord],
    snapshot: &HashMap<String, ValueRecord>,
    now: EpochSecs,
) -> bool {
    if computations.iter().any(|c| c.state.is_pending()) {
        return false;
    }

    let readiness = evaluate_opt(node.gated_by.as_ref(), snapshot, EvalMode::Computation, now);

    if !readiness.ready {
        return false;
    }

    let level = max_upstream_revision(&readiness.conditions_met, snapshot);

    if attempts_at_level(computations, level) < node.max_retries as usize {
        return false;
    }

    // exhausted; failed only if the level produced no success
    !computations.iter().any(|c| {
        c.state == crate::model::ComputationState::Success
            && c.ex_revision_at_start.map(|r| r >= level).unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{compute, ComputeInput, NodeOptions};
    use crate::model::{ComputationState, NodeType};
    use crate::{ComputationId, ExecutionId};
    use serde_json::json;

    fn node(max_retries: u32) -> Node {
        compute(
            "n",
            vec!["a"],
            |_: &ComputeInput| Ok(json!(1)),
            NodeOptions::default().max_retries(max_retries),
        )
    }

    fn value(node: &str, revision: Revision) -> ValueRecord {
        ValueRecord {
            execution_id: ExecutionId::new(),
            node_name: node.to_string(),
            node_type: NodeType::Input,
            node_value: Some(json!(1)),
            set_time: Some(100),
            ex_revision: revision,
            inserted_at: 100,
            updated_at: 100,
        }
    }

    fn attempt(state: ComputationState, started_at_revision: Option<Revision>) -> ComputationRecord {
        ComputationRecord {
            id: ComputationId(1),
            execution_id: ExecutionId::new(),
            node_name: "n".to_string(),
            computation_type: NodeType::Compute,
            state,
            start_time: started_at_revision.map(|_| 100),
            completion_time: None,
            deadline: None,
            last_heartbeat_at: None,
            heartbeat_deadline: None,
            ex_revision_at_start: started_at_revision,
            ex_revision_at_completion: None,
            computed_with: Default::default(),
            error_details: None,
            inserted_at: 100,
            updated_at: 100,
        }
    }

    fn snapshot(revision: Revision) -> HashMap<String, ValueRecord> {
        [("a".to_string(), value("a", revision))].into()
    }

    #[test]
    fn retries_until_max_at_same_level() {
        let node = node(3);
        let snap = snapshot(5);

        let one = vec![attempt(ComputationState::Failed, Some(5))];
        assert!(should_retry(&node, &one, &snap, 200));

        let three = vec![
            attempt(ComputationState::Failed, Some(5)),
            attempt(ComputationState::Failed, Some(6)),
            attempt(ComputationState::Abandoned, Some(7)),
        ];
        assert!(!should_retry(&node, &three, &snap, 200));
    }

    #[test]
    fn upstream_advance_resets_the_count() {
        let node = node(1);

        // exhausted at level 5
        let comps = vec![attempt(ComputationState::Failed, Some(5))];
        assert!(!should_retry(&node, &comps, &snapshot(5), 200));

        // upstream moved to revision 9: old attempts no longer count
        assert!(should_retry(&node, &comps, &snapshot(9), 200));
    }

    #[test]
    fn permanent_failure_requires_no_pending_work() {
        let node = node(1);
        let snap = snapshot(5);

        let with_pending = vec![
            attempt(ComputationState::Failed, Some(5)),
            attempt(ComputationState::NotSet, None),
        ];
        assert!(!permanently_failed(&node, &with_pending, &snap, 200));

        let exhausted = vec![attempt(ComputationState::Failed, Some(5))];
        assert!(permanently_failed(&node, &exhausted, &snap, 200));
    }

    #[test]
    fn success_at_level_is_not_a_permanent_failure() {
        let node = node(1);
        let snap = snapshot(5);

        let comps = vec![attempt(ComputationState::Success, Some(5))];
        assert!(!permanently_failed(&node, &comps, &snap, 200));
    }
}
