//! In-memory store backend.
//!
//! Every operation takes the single world lock for its whole duration,
//! which gives each call the same atomicity the production backend gets
//! from a database transaction. Advisory locks degenerate to no-ops under
//! the global lock.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::{json, Value as JsonValue};

use rill_core::rules;
use rill_core::{
    evaluate_opt, now_secs, ClaimedComputation, ComputationId, ComputationRecord,
    ComputationState, EpochSecs, EvalMode, ExecutionId, ExecutionRecord, FailureOutcome,
    FilterOp, FilterOperand, Graph, HeartbeatOutcome, ListOptions, Node, NodeType, Revision,
    SetOutcome, SortKey, StoreError, SuccessOutcome, SuccessPlan, SweepRun, SweepType,
    ValueFilter, ValueRecord, WorkflowStore, WriteMode, EXECUTION_ID_NODE,
    LAST_UPDATED_AT_NODE,
};

const ERROR_DETAILS_MAX: usize = 1000;

#[derive(Default)]
struct World {
    executions: HashMap<ExecutionId, ExecutionRecord>,
    values: HashMap<ExecutionId, HashMap<String, ValueRecord>>,
    computations: Vec<ComputationRecord>,
    sweep_runs: Vec<SweepRun>,
    next_computation_id: i64,
    next_sweep_run_id: i64,
}

impl World {
    fn execution(&self, id: ExecutionId) -> Result<&ExecutionRecord, StoreError> {
        self.executions
            .get(&id)
            .ok_or(StoreError::ExecutionNotFound(id))
    }

    fn bump_revision(&mut self, id: ExecutionId, now: EpochSecs) -> Result<Revision, StoreError> {
        let exec = self
            .executions
            .get_mut(&id)
            .ok_or(StoreError::ExecutionNotFound(id))?;

        exec.revision += 1;
        exec.updated_at = now;

        Ok(exec.revision)
    }

    fn touch_last_updated(&mut self, id: ExecutionId, revision: Revision, now: EpochSecs) {
        if let Some(row) = self
            .values
            .get_mut(&id)
            .and_then(|m| m.get_mut(LAST_UPDATED_AT_NODE))
        {
            row.node_value = Some(json!(now));
            row.set_time = Some(now);
            row.ex_revision = revision;
            row.updated_at = now;
        }
    }

    fn insert_computation(
        &mut self,
        id: ExecutionId,
        node: &str,
        computation_type: NodeType,
        now: EpochSecs,
    ) -> ComputationId {
        self.next_computation_id += 1;
        let comp_id = ComputationId(self.next_computation_id);

        self.computations.push(ComputationRecord {
            id: comp_id,
            execution_id: id,
            node_name: node.to_string(),
            computation_type,
            state: ComputationState::NotSet,
            start_time: None,
            completion_time: None,
            deadline: None,
            last_heartbeat_at: None,
            heartbeat_deadline: None,
            ex_revision_at_start: None,
            ex_revision_at_completion: None,
            computed_with: Default::default(),
            error_details: None,
            inserted_at: now,
            updated_at: now,
        });

        comp_id
    }

    fn computations_for(&self, id: ExecutionId, node: &str) -> Vec<ComputationRecord> {
        self.computations
            .iter()
            .filter(|c| c.execution_id == id && c.node_name == node)
            .cloned()
            .collect()
    }

    fn is_archived(&self, id: ExecutionId) -> bool {
        self.executions
            .get(&id)
            .map(|e| e.is_archived())
            .unwrap_or(true)
    }
}

/// Store backend holding everything behind one process-local lock.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<World>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, World> {
        self.inner.write().expect("memory store lock poisoned")
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, World> {
        self.inner.read().expect("memory store lock poisoned")
    }

    /// Test hook: all computation rows, in insertion order.
    pub fn dump_computations(&self) -> Vec<ComputationRecord> {
        self.read().computations.clone()
    }

    /// Test hook: all sweep-run rows, in insertion order.
    pub fn dump_sweep_runs(&self) -> Vec<SweepRun> {
        self.read().sweep_runs.clone()
    }
}

fn value_matches(row: Option<&ValueRecord>, filter: &ValueFilter) -> bool {
    let current = row.and_then(|r| r.node_value.as_ref());

    match (&filter.op, &filter.operand) {
        (FilterOp::IsNil, _) => current.is_none(),
        (FilterOp::IsNotNil, _) => current.is_some(),
        (FilterOp::Eq, FilterOperand::One(expected)) => current == Some(expected),
        (FilterOp::Neq, FilterOperand::One(expected)) => {
            current.map(|v| v != expected).unwrap_or(false)
        }
        (FilterOp::In, FilterOperand::Many(set)) => {
            current.map(|v| set.contains(v)).unwrap_or(false)
        }
        (FilterOp::NotIn, FilterOperand::Many(set)) => {
            current.map(|v| !set.contains(v)).unwrap_or(false)
        }
        (op, FilterOperand::One(expected)) => {
            let Some(current) = current else {
                return false;
            };

            let ord = json_partial_cmp(current, expected);

            match (op, ord) {
                (FilterOp::Lt, Some(Ordering::Less)) => true,
                (FilterOp::Lte, Some(Ordering::Less | Ordering::Equal)) => true,
                (FilterOp::Gt, Some(Ordering::Greater)) => true,
                (FilterOp::Gte, Some(Ordering::Greater | Ordering::Equal)) => true,
                _ => false,
            }
        }
        _ => false,
    }
}

fn json_partial_cmp(a: &JsonValue, b: &JsonValue) -> Option<Ordering> {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => {
            x.as_f64().partial_cmp(&y.as_f64())
        }
        (JsonValue::String(x), JsonValue::String(y)) => Some(x.cmp(y)),
        (JsonValue::Bool(x), JsonValue::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Total order for sorting: nil < bool < number < string < everything else.
fn json_sort_cmp(a: Option<&JsonValue>, b: Option<&JsonValue>) -> Ordering {
    fn rank(v: Option<&JsonValue>) -> u8 {
        match v {
            None | Some(JsonValue::Null) => 0,
            Some(JsonValue::Bool(_)) => 1,
            Some(JsonValue::Number(_)) => 2,
            Some(JsonValue::String(_)) => 3,
            Some(_) => 4,
        }
    }

    match (a, b) {
        (Some(x), Some(y)) if rank(a) == rank(b) => {
            json_partial_cmp(x, y).unwrap_or(Ordering::Equal)
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

impl WorkflowStore for MemoryStore {
    async fn create_execution(&self, graph: &Graph) -> Result<ExecutionRecord, StoreError> {
        let now = now_secs();
        let mut w = self.write();

        let exec = ExecutionRecord {
            id: ExecutionId::new(),
            graph_name: graph.name().to_string(),
            graph_version: graph.version().to_string(),
            revision: 0,
            inserted_at: now,
            updated_at: now,
            archived_at: None,
        };

        let mut rows = HashMap::new();

        let mut insert_row =
            |name: &str, node_type: NodeType, value: Option<JsonValue>, set: bool| {
                rows.insert(
                    name.to_string(),
                    ValueRecord {
                        execution_id: exec.id,
                        node_name: name.to_string(),
                        node_type,
                        node_value: value,
                        set_time: set.then_some(now),
                        ex_revision: 0,
                        inserted_at: now,
                        updated_at: now,
                    },
                );
            };

        insert_row(
            EXECUTION_ID_NODE,
            NodeType::Input,
            Some(json!(exec.id.to_string())),
            true,
        );
        insert_row(LAST_UPDATED_AT_NODE, NodeType::Input, Some(json!(now)), true);

        for node in graph.nodes() {
            insert_row(&node.name, node.node_type(), None, false);
        }

        for node in graph.computable_nodes() {
            w.insert_computation(exec.id, &node.name, node.node_type(), now);
        }

        w.values.insert(exec.id, rows);
        w.executions.insert(exec.id, exec.clone());

        Ok(exec)
    }

    async fn load_execution(
        &self,
        id: ExecutionId,
        include_archived: bool,
    ) -> Result<Option<ExecutionRecord>, StoreError> {
        let w = self.read();

        Ok(w.executions
            .get(&id)
            .filter(|e| include_archived || !e.is_archived())
            .cloned())
    }

    async fn list_executions(
        &self,
        opts: &ListOptions,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        for filter in &opts.filter_by {
            filter.validate()?;
        }

        let w = self.read();

        let mut out: Vec<ExecutionRecord> = w
            .executions
            .values()
            .filter(|e| opts.include_archived || !e.is_archived())
            .filter(|e| {
                opts.graph_name
                    .as_ref()
                    .map(|n| &e.graph_name == n)
                    .unwrap_or(true)
            })
            .filter(|e| {
                opts.graph_version
                    .as_ref()
                    .map(|v| &e.graph_version == v)
                    .unwrap_or(true)
            })
            .filter(|e| {
                opts.filter_by.iter().all(|f| {
                    let row = w.values.get(&e.id).and_then(|m| m.get(&f.node));
                    value_matches(row, f)
                })
            })
            .cloned()
            .collect();

        out.sort_by(|a, b| {
            for spec in &opts.sort_by {
                let ord = match &spec.key {
                    SortKey::InsertedAt => a.inserted_at.cmp(&b.inserted_at),
                    SortKey::UpdatedAt => a.updated_at.cmp(&b.updated_at),
                    SortKey::Revision => a.revision.cmp(&b.revision),
                    SortKey::GraphName => a.graph_name.cmp(&b.graph_name),
                    SortKey::GraphVersion => a.graph_version.cmp(&b.graph_version),
                    SortKey::NodeValue(node) => {
                        let left = w
                            .values
                            .get(&a.id)
                            .and_then(|m| m.get(node))
                            .and_then(|r| r.node_value.as_ref());
                        let right = w
                            .values
                            .get(&b.id)
                            .and_then(|m| m.get(node))
                            .and_then(|r| r.node_value.as_ref());
                        json_sort_cmp(left, right)
                    }
                };

                let ord = if spec.descending { ord.reverse() } else { ord };

                if ord != Ordering::Equal {
                    return ord;
                }
            }

            // stable fallback so pagination is deterministic
            a.inserted_at
                .cmp(&b.inserted_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        let out = out
            .into_iter()
            .skip(opts.offset.max(0) as usize)
            .take(opts.limit.max(0) as usize)
            .collect();

        Ok(out)
    }

    async fn archive_execution(&self, id: ExecutionId) -> Result<ExecutionRecord, StoreError> {
        let now = now_secs();
        let mut w = self.write();

        let exec = w
            .executions
            .get_mut(&id)
            .ok_or(StoreError::ExecutionNotFound(id))?;

        if exec.archived_at.is_none() {
            exec.archived_at = Some(now);
            exec.updated_at = now;
        }

        Ok(exec.clone())
    }

    async fn unarchive_execution(&self, id: ExecutionId) -> Result<ExecutionRecord, StoreError> {
        let now = now_secs();
        let mut w = self.write();

        let exec = w
            .executions
            .get_mut(&id)
            .ok_or(StoreError::ExecutionNotFound(id))?;

        if exec.archived_at.is_some() {
            exec.archived_at = None;
            exec.updated_at = now;
        }

        Ok(exec.clone())
    }

    async fn set_value(
        &self,
        id: ExecutionId,
        node: &str,
        value: JsonValue,
    ) -> Result<SetOutcome, StoreError> {
        let now = now_secs();
        let mut w = self.write();

        let exec = w.execution(id)?.clone();

        let row = w
            .values
            .get(&id)
            .and_then(|m| m.get(node))
            .ok_or_else(|| StoreError::NodeNotFound {
                execution: id,
                node: node.to_string(),
            })?;

        if row.set_time.is_some() && row.node_value.as_ref() == Some(&value) {
            return Ok(SetOutcome::NoChange(exec));
        }

        let revision = w.bump_revision(id, now)?;

        let row = w
            .values
            .get_mut(&id)
            .and_then(|m| m.get_mut(node))
            .expect("row checked above");

        row.node_value = Some(value);
        row.set_time = Some(now);
        row.ex_revision = revision;
        row.updated_at = now;

        w.touch_last_updated(id, revision, now);

        Ok(SetOutcome::Changed(w.execution(id)?.clone()))
    }

    async fn unset_value(&self, id: ExecutionId, node: &str) -> Result<SetOutcome, StoreError> {
        let now = now_secs();
        let mut w = self.write();

        let exec = w.execution(id)?.clone();

        let row = w
            .values
            .get(&id)
            .and_then(|m| m.get(node))
            .ok_or_else(|| StoreError::NodeNotFound {
                execution: id,
                node: node.to_string(),
            })?;

        if row.set_time.is_none() {
            return Ok(SetOutcome::NoChange(exec));
        }

        let revision = w.bump_revision(id, now)?;

        let row = w
            .values
            .get_mut(&id)
            .and_then(|m| m.get_mut(node))
            .expect("row checked above");

        row.node_value = None;
        row.set_time = None;
        row.ex_revision = revision;
        row.updated_at = now;

        w.touch_last_updated(id, revision, now);

        Ok(SetOutcome::Changed(w.execution(id)?.clone()))
    }

    async fn load_values(
        &self,
        id: ExecutionId,
    ) -> Result<HashMap<String, ValueRecord>, StoreError> {
        let w = self.read();
        w.execution(id)?;

        Ok(w.values.get(&id).cloned().unwrap_or_default())
    }

    async fn load_value(
        &self,
        id: ExecutionId,
        node: &str,
    ) -> Result<Option<ValueRecord>, StoreError> {
        let w = self.read();
        w.execution(id)?;

        Ok(w.values.get(&id).and_then(|m| m.get(node)).cloned())
    }

    async fn load_computations(
        &self,
        id: ExecutionId,
        node: Option<&str>,
    ) -> Result<Vec<ComputationRecord>, StoreError> {
        let w = self.read();
        w.execution(id)?;

        Ok(w.computations
            .iter()
            .filter(|c| c.execution_id == id)
            .filter(|c| node.map(|n| c.node_name == n).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn run_invalidation_pass(
        &self,
        id: ExecutionId,
        graph: &Graph,
        now: EpochSecs,
    ) -> Result<usize, StoreError> {
        let mut w = self.write();
        w.execution(id)?;

        let snapshot = w.values.get(&id).cloned().unwrap_or_default();
        let candidates = rules::invalidation_candidates(graph, &snapshot, now);

        for name in &candidates {
            let revision = w.bump_revision(id, now)?;

            if let Some(row) = w.values.get_mut(&id).and_then(|m| m.get_mut(name)) {
                row.node_value = None;
                row.set_time = None;
                row.ex_revision = revision;
                row.updated_at = now;
            }

            // a fresh computation, unless one is already pending
            let existing = w.computations_for(id, name);
            if !existing.iter().any(|c| c.state.is_pending()) {
                let node_type = graph
                    .node(name)
                    .map(|n| n.node_type())
                    .unwrap_or(NodeType::Compute);
                w.insert_computation(id, name, node_type, now);
            }

            w.touch_last_updated(id, revision, now);
        }

        Ok(candidates.len())
    }

    async fn enqueue_stale_recomputations(
        &self,
        id: ExecutionId,
        graph: &Graph,
        now: EpochSecs,
    ) -> Result<usize, StoreError> {
        let mut w = self.write();
        w.execution(id)?;

        let snapshot = w.values.get(&id).cloned().unwrap_or_default();
        let computations: Vec<_> = w
            .computations
            .iter()
            .filter(|c| c.execution_id == id)
            .cloned()
            .collect();

        let stale = rules::stale_nodes(graph, &snapshot, &computations, now);

        let mut inserted = 0;

        for candidate in stale {
            let existing = w.computations_for(id, &candidate.node);

            if rules::may_insert_recomputation(
                &existing,
                &candidate.node,
                candidate.prior_start_revision,
            ) {
                let node_type = graph
                    .node(&candidate.node)
                    .map(|n| n.node_type())
                    .unwrap_or(NodeType::Compute);

                w.insert_computation(id, &candidate.node, node_type, now);
                inserted += 1;
            }
        }

        // failed-out nodes whose upstream revisions advanced
        for name in rules::retryable_failed_nodes(graph, &snapshot, &computations, now) {
            let existing = w.computations_for(id, &name);

            if !existing.iter().any(|c| c.state.is_pending()) {
                let node_type = graph
                    .node(&name)
                    .map(|n| n.node_type())
                    .unwrap_or(NodeType::Compute);

                w.insert_computation(id, &name, node_type, now);
                inserted += 1;
            }
        }

        Ok(inserted)
    }

    async fn claim_ready(
        &self,
        id: ExecutionId,
        graph: &Graph,
        now: EpochSecs,
    ) -> Result<Vec<ClaimedComputation>, StoreError> {
        let mut w = self.write();

        if w.execution(id)?.is_archived() {
            return Ok(vec![]);
        }

        let snapshot = w.values.get(&id).cloned().unwrap_or_default();

        let candidates: Vec<ComputationId> = w
            .computations
            .iter()
            .filter(|c| c.execution_id == id && c.state == ComputationState::NotSet)
            .map(|c| c.id)
            .collect();

        let mut claimed = vec![];

        for comp_id in candidates {
            let node_name = w
                .computations
                .iter()
                .find(|c| c.id == comp_id)
                .map(|c| c.node_name.clone())
                .expect("candidate id collected above");

            let Some(node) = graph.node(&node_name) else {
                continue;
            };

            let readiness =
                evaluate_opt(node.gated_by.as_ref(), &snapshot, EvalMode::Computation, now);

            if !readiness.ready {
                continue;
            }

            let revision = w.bump_revision(id, now)?;

            let comp = w
                .computations
                .iter_mut()
                .find(|c| c.id == comp_id)
                .expect("candidate id collected above");

            comp.state = ComputationState::Computing;
            comp.start_time = Some(now);
            comp.ex_revision_at_start = Some(revision);
            comp.deadline = Some(now + node.abandon_after_seconds);
            comp.updated_at = now;

            let computation = comp.clone();
            let execution = w.execution(id)?.clone();

            claimed.push(ClaimedComputation {
                computation,
                execution,
                snapshot: snapshot.clone(),
                conditions_met: readiness.conditions_met,
            });
        }

        Ok(claimed)
    }

    async fn record_success(
        &self,
        computation: ComputationId,
        plan: &SuccessPlan,
        now: EpochSecs,
    ) -> Result<SuccessOutcome, StoreError> {
        let mut w = self.write();

        let comp = w
            .computations
            .iter()
            .find(|c| c.id == computation)
            .ok_or(StoreError::ComputationNotFound(computation))?;

        if comp.state != ComputationState::Computing {
            return Ok(SuccessOutcome::Dropped);
        }

        let id = comp.execution_id;

        // figure out which writes apply before touching anything
        let mut applied = vec![];

        for write in &plan.writes {
            let current = w.values.get(&id).and_then(|m| m.get(&write.node));

            let skip = write.mode == WriteMode::BumpIfChanged
                && current
                    .map(|row| row.set_time.is_some() && row.node_value.as_ref() == Some(&write.value))
                    .unwrap_or(false);

            if !skip {
                applied.push(write.clone());
            }
        }

        let needs_bump = applied.iter().any(|wr| wr.mode != WriteMode::NoBump);

        let revision = if needs_bump {
            w.bump_revision(id, now)?
        } else {
            w.execution(id)?.revision
        };

        for write in &applied {
            if let Some(row) = w.values.get_mut(&id).and_then(|m| m.get_mut(&write.node)) {
                row.node_value = Some(write.value.clone());
                row.set_time = Some(now);
                row.updated_at = now;

                if write.mode != WriteMode::NoBump {
                    row.ex_revision = revision;
                }
            }
        }

        if needs_bump {
            w.touch_last_updated(id, revision, now);
        }

        if plan.archive_execution {
            if let Some(exec) = w.executions.get_mut(&id) {
                exec.archived_at = Some(now);
                exec.updated_at = now;
            }
        }

        let comp = w
            .computations
            .iter_mut()
            .find(|c| c.id == computation)
            .expect("checked above");

        comp.state = ComputationState::Success;
        comp.completion_time = Some(now);
        comp.ex_revision_at_completion = Some(revision);
        comp.computed_with = plan.computed_with.clone();
        comp.updated_at = now;

        let saved = applied
            .into_iter()
            .map(|wr| (wr.node, wr.value))
            .collect();

        Ok(SuccessOutcome::Recorded {
            execution: w.execution(id)?.clone(),
            saved,
        })
    }

    async fn record_failure(
        &self,
        computation: ComputationId,
        node: &Node,
        error: &str,
        now: EpochSecs,
    ) -> Result<FailureOutcome, StoreError> {
        let mut w = self.write();

        let comp = w
            .computations
            .iter_mut()
            .find(|c| c.id == computation)
            .ok_or(StoreError::ComputationNotFound(computation))?;

        if comp.state != ComputationState::Computing {
            return Ok(FailureOutcome {
                retry_scheduled: false,
            });
        }

        let id = comp.execution_id;
        let node_type = comp.computation_type;

        comp.state = ComputationState::Failed;
        comp.completion_time = Some(now);
        comp.error_details = Some(error.chars().take(ERROR_DETAILS_MAX).collect());
        comp.updated_at = now;

        let snapshot = w.values.get(&id).cloned().unwrap_or_default();
        let history = w.computations_for(id, &node.name);

        let retry_scheduled = rules::should_retry(node, &history, &snapshot, now)
            && !history.iter().any(|c| c.state.is_pending());

        if retry_scheduled {
            w.insert_computation(id, &node.name, node_type, now);
        }

        Ok(FailureOutcome { retry_scheduled })
    }

    async fn schedule_retry(
        &self,
        id: ExecutionId,
        node: &Node,
        now: EpochSecs,
    ) -> Result<bool, StoreError> {
        let mut w = self.write();
        w.execution(id)?;

        let snapshot = w.values.get(&id).cloned().unwrap_or_default();
        let history = w.computations_for(id, &node.name);

        let retry = rules::should_retry(node, &history, &snapshot, now)
            && !history.iter().any(|c| c.state.is_pending());

        if retry {
            w.insert_computation(id, &node.name, node.node_type(), now);
        }

        Ok(retry)
    }

    async fn beat(
        &self,
        computation: ComputationId,
        timeout_seconds: i64,
        buffer_seconds: i64,
        now: EpochSecs,
    ) -> Result<HeartbeatOutcome, StoreError> {
        let mut w = self.write();

        let comp = w
            .computations
            .iter_mut()
            .find(|c| c.id == computation)
            .ok_or(StoreError::ComputationNotFound(computation))?;

        let within_deadline = comp
            .deadline
            .map(|d| d > now - buffer_seconds)
            .unwrap_or(false);

        if comp.state == ComputationState::Computing && within_deadline {
            comp.last_heartbeat_at = Some(now);
            comp.heartbeat_deadline = Some(now + timeout_seconds);
            comp.updated_at = now;

            return Ok(HeartbeatOutcome::Extended);
        }

        match comp.state {
            ComputationState::Abandoned => Ok(HeartbeatOutcome::AlreadyAbandoned),
            ComputationState::Computing => {
                comp.state = ComputationState::Abandoned;
                comp.completion_time = Some(now);
                comp.updated_at = now;

                Ok(HeartbeatOutcome::MarkedAbandoned)
            }
            _ => Ok(HeartbeatOutcome::Terminal),
        }
    }

    async fn last_sweep_started_at(
        &self,
        sweep_type: SweepType,
    ) -> Result<Option<EpochSecs>, StoreError> {
        let w = self.read();

        Ok(w.sweep_runs
            .iter()
            .filter(|r| r.sweep_type == sweep_type)
            .map(|r| r.started_at)
            .max())
    }

    async fn last_completed_sweep_started_at(
        &self,
        sweep_type: SweepType,
    ) -> Result<Option<EpochSecs>, StoreError> {
        let w = self.read();

        Ok(w.sweep_runs
            .iter()
            .filter(|r| r.sweep_type == sweep_type && r.completed_at.is_some())
            .map(|r| r.started_at)
            .max())
    }

    async fn begin_sweep(
        &self,
        sweep_type: SweepType,
        min_seconds_between_runs: i64,
        now: EpochSecs,
    ) -> Result<Option<i64>, StoreError> {
        let mut w = self.write();

        // authoritative re-check under the (global) lock
        let last = w
            .sweep_runs
            .iter()
            .filter(|r| r.sweep_type == sweep_type)
            .map(|r| r.started_at)
            .max();

        if let Some(last) = last {
            if now - last <= min_seconds_between_runs {
                return Ok(None);
            }
        }

        w.next_sweep_run_id += 1;
        let id = w.next_sweep_run_id;

        w.sweep_runs.push(SweepRun {
            id,
            sweep_type,
            started_at: now,
            completed_at: None,
            executions_processed: 0,
        });

        Ok(Some(id))
    }

    async fn complete_sweep(
        &self,
        run: i64,
        executions_processed: i64,
        now: EpochSecs,
    ) -> Result<(), StoreError> {
        let mut w = self.write();

        if let Some(row) = w.sweep_runs.iter_mut().find(|r| r.id == run) {
            row.completed_at = Some(now);
            row.executions_processed = executions_processed;
        }

        Ok(())
    }

    async fn sweep_runs(
        &self,
        sweep_type: Option<SweepType>,
    ) -> Result<Vec<SweepRun>, StoreError> {
        let w = self.read();

        Ok(w.sweep_runs
            .iter()
            .filter(|r| sweep_type.map(|t| r.sweep_type == t).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn mark_abandoned_computations(
        &self,
        now: EpochSecs,
    ) -> Result<Vec<(ExecutionId, String)>, StoreError> {
        let mut w = self.write();

        let archived: Vec<ExecutionId> = w
            .executions
            .values()
            .filter(|e| e.is_archived())
            .map(|e| e.id)
            .collect();

        let mut affected = vec![];

        for comp in w.computations.iter_mut() {
            if comp.state != ComputationState::Computing {
                continue;
            }

            if archived.contains(&comp.execution_id) {
                continue;
            }

            let expired = match (comp.heartbeat_deadline, comp.deadline) {
                (Some(hb), _) => hb < now,
                (None, Some(deadline)) => deadline < now,
                (None, None) => false,
            };

            if expired {
                comp.state = ComputationState::Abandoned;
                comp.completion_time = Some(now);
                comp.updated_at = now;

                affected.push((comp.execution_id, comp.node_name.clone()));
            }
        }

        Ok(affected)
    }

    async fn executions_with_pending_schedules(
        &self,
        cutoff: EpochSecs,
    ) -> Result<Vec<ExecutionId>, StoreError> {
        let w = self.read();

        let out = w
            .executions
            .values()
            .filter(|e| !e.is_archived() && e.updated_at >= cutoff)
            .filter(|e| {
                w.computations.iter().any(|c| {
                    c.execution_id == e.id
                        && c.state == ComputationState::NotSet
                        && c.computation_type.is_schedule()
                })
            })
            .map(|e| e.id)
            .collect();

        Ok(out)
    }

    async fn executions_unblocked_by_schedule(
        &self,
        window_start: EpochSecs,
        window_end: EpochSecs,
    ) -> Result<Vec<ExecutionId>, StoreError> {
        let w = self.read();

        let out = w
            .executions
            .values()
            .filter(|e| !e.is_archived())
            .filter(|e| {
                w.values
                    .get(&e.id)
                    .map(|rows| {
                        rows.values().any(|v| {
                            v.pulse()
                                .map(|p| p >= window_start && p < window_end)
                                .unwrap_or(false)
                        })
                    })
                    .unwrap_or(false)
            })
            .map(|e| e.id)
            .collect();

        Ok(out)
    }

    async fn executions_with_missed_schedules(
        &self,
        window_start: EpochSecs,
        window_end: EpochSecs,
    ) -> Result<Vec<ExecutionId>, StoreError> {
        let w = self.read();

        let out = w
            .executions
            .values()
            .filter(|e| !e.is_archived())
            .filter(|e| {
                w.computations
                    .iter()
                    .any(|c| c.execution_id == e.id && c.state == ComputationState::NotSet)
            })
            .filter(|e| {
                w.values
                    .get(&e.id)
                    .map(|rows| {
                        rows.values().any(|v| {
                            v.pulse()
                                .map(|p| p >= window_start && p < window_end)
                                .unwrap_or(false)
                        })
                    })
                    .unwrap_or(false)
            })
            .map(|e| e.id)
            .collect();

        Ok(out)
    }

    async fn stalled_executions(
        &self,
        idle_cutoff: EpochSecs,
    ) -> Result<Vec<ExecutionId>, StoreError> {
        let w = self.read();

        let out = w
            .executions
            .values()
            .filter(|e| !e.is_archived() && e.updated_at < idle_cutoff)
            .filter(|e| {
                w.computations
                    .iter()
                    .any(|c| c.execution_id == e.id && c.state == ComputationState::NotSet)
            })
            .map(|e| e.id)
            .collect();

        Ok(out)
    }

    async fn regenerate_recurring_schedules(
        &self,
        now: EpochSecs,
    ) -> Result<usize, StoreError> {
        let mut w = self.write();

        let mut due: Vec<(ExecutionId, String)> = vec![];

        for exec in w.executions.values() {
            if exec.is_archived() {
                continue;
            }

            let Some(rows) = w.values.get(&exec.id) else {
                continue;
            };

            for row in rows.values() {
                if row.node_type != NodeType::ScheduleRecurring {
                    continue;
                }

                let fired = row.pulse().map(|p| p <= now).unwrap_or(false);

                if !fired {
                    continue;
                }

                let pending = w.computations.iter().any(|c| {
                    c.execution_id == exec.id
                        && c.node_name == row.node_name
                        && c.state.is_pending()
                });

                if !pending {
                    due.push((exec.id, row.node_name.clone()));
                }
            }
        }

        for (id, node) in &due {
            w.insert_computation(*id, node, NodeType::ScheduleRecurring, now);

            if let Some(exec) = w.executions.get_mut(id) {
                exec.updated_at = now;
            }
        }

        Ok(due.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_core::graph::{compute, input, ComputeInput, NodeOptions};

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

    #[tokio::test]
    async fn create_seeds_values_and_computations() {
        let store = MemoryStore::new();
        let exec = store.create_execution(&graph()).await.unwrap();

        let values = store.load_values(exec.id).await.unwrap();

        assert!(values.contains_key("a"));
        assert!(values.contains_key("out"));
        assert!(values[EXECUTION_ID_NODE].is_set());
        assert!(values[LAST_UPDATED_AT_NODE].is_set());

        let comps = store.load_computations(exec.id, None).await.unwrap();
        assert_eq!(comps.len(), 1);
        assert_eq!(comps[0].state, ComputationState::NotSet);
    }

    #[tokio::test]
    async fn set_value_is_idempotent() {
        let store = MemoryStore::new();
        let exec = store.create_execution(&graph()).await.unwrap();

        let first = store.set_value(exec.id, "a", json!(10)).await.unwrap();
        assert!(first.changed());

        let second = store.set_value(exec.id, "a", json!(10)).await.unwrap();
        assert!(!second.changed());
        assert_eq!(
            first.execution().revision,
            second.execution().revision
        );
    }

    #[tokio::test]
    async fn claim_is_gated() {
        let store = MemoryStore::new();
        let g = graph();
        let exec = store.create_execution(&g).await.unwrap();

        let now = now_secs();
        assert!(store.claim_ready(exec.id, &g, now).await.unwrap().is_empty());

        store.set_value(exec.id, "a", json!(1)).await.unwrap();

        let claimed = store.claim_ready(exec.id, &g, now).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].computation.node_name, "out");

        // second claim finds nothing pending
        assert!(store.claim_ready(exec.id, &g, now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn begin_sweep_is_throttled() {
        let store = MemoryStore::new();
        let now = now_secs();

        let first = store
            .begin_sweep(SweepType::Abandoned, 60, now)
            .await
            .unwrap();
        assert!(first.is_some());

        let second = store
            .begin_sweep(SweepType::Abandoned, 60, now)
            .await
            .unwrap();
        assert!(second.is_none());

        let later = store
            .begin_sweep(SweepType::Abandoned, 60, now + 61)
            .await
            .unwrap();
        assert!(later.is_some());
    }
}
