//! The transactional contract every store backend honors.
//!
//! Operations are semantic and internally transactional: a backend wraps
//! each call in a single transaction (with deadlock retry), so partial
//! application of a multi-row write is impossible. Gate evaluation happens
//! inside the backend's transaction over a snapshot read there, using the
//! pure evaluator from [`crate::gate`].

use std::collections::HashMap;

use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::gate::Condition;
use crate::graph::{Graph, Node};
use crate::model::{
    ComputationRecord, ComputedWith, ExecutionRecord, SweepRun, SweepType, ValueRecord,
};
use crate::{ComputationId, EpochSecs, ExecutionId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    #[error("execution {execution} has no node named {node}")]
    NodeNotFound {
        execution: ExecutionId,
        node: String,
    },

    #[error("computation not found: {0}")]
    ComputationNotFound(ComputationId),

    #[error("conflicting transition: {0}")]
    Conflict(String),

    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Transient condition (deadlock retries exhausted, connectivity). The
    /// caller treats this as a no-change result; a sweeper picks up the
    /// missed work on its next pass.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("internal store error: {0}")]
    Internal(String),
}

/// Result of a `set_value`/`unset_value` call.
#[derive(Debug, Clone)]
pub enum SetOutcome {
    /// The value changed and the execution revision was bumped.
    Changed(ExecutionRecord),

    /// The new contents equal the old byte-for-byte: no revision bump, no
    /// row change.
    NoChange(ExecutionRecord),
}

impl SetOutcome {
    pub fn execution(&self) -> &ExecutionRecord {
        match self {
            Self::Changed(e) | Self::NoChange(e) => e,
        }
    }

    pub fn changed(&self) -> bool {
        matches!(self, Self::Changed(_))
    }
}

/// A computation transitioned to `computing` by the claim pass, together
/// with the in-transaction context the worker needs.
#[derive(Debug, Clone)]
pub struct ClaimedComputation {
    pub computation: ComputationRecord,
    pub execution: ExecutionRecord,

    /// Full value snapshot read in the claiming transaction.
    pub snapshot: HashMap<String, ValueRecord>,

    /// The leaf conditions that held at claim time; their upstream
    /// revisions become the computation's `computed_with`.
    pub conditions_met: Vec<Condition>,
}

/// How a single value row is written when a computation succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Skip the write entirely (and any revision bump for it) when the new
    /// contents equal the current ones.
    BumpIfChanged,

    /// Write and bump unconditionally.
    AlwaysBump,

    /// Write the contents but leave `ex_revision` untouched so the change
    /// stays invisible to downstream gates.
    NoBump,
}

#[derive(Debug, Clone)]
pub struct ValueWrite {
    pub node: String,
    pub value: JsonValue,
    pub mode: WriteMode,
}

/// Everything `record_success` persists in its single transaction.
#[derive(Debug, Clone, Default)]
pub struct SuccessPlan {
    pub writes: Vec<ValueWrite>,
    pub computed_with: ComputedWith,
    pub archive_execution: bool,
}

#[derive(Debug, Clone)]
pub enum SuccessOutcome {
    Recorded {
        execution: ExecutionRecord,
        /// Values actually written, in plan order, for save callbacks.
        saved: Vec<(String, JsonValue)>,
    },

    /// The computation left `computing` before the result arrived; the
    /// result is dropped on the floor.
    Dropped,
}

#[derive(Debug, Clone)]
pub struct FailureOutcome {
    pub retry_scheduled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// The deadline extension was applied.
    Extended,

    /// The computation already reached a terminal result; the heartbeat
    /// exits normally.
    Terminal,

    /// Another actor abandoned the computation; the worker must be killed.
    AlreadyAbandoned,

    /// The deadline passed while still `computing`; this call marked the
    /// computation abandoned and the worker must be killed.
    MarkedAbandoned,
}

/// Listing options for `list_executions`.
#[derive(Debug, Clone)]
pub struct ListOptions {
    pub graph_name: Option<String>,
    pub graph_version: Option<String>,
    pub sort_by: Vec<SortSpec>,
    pub filter_by: Vec<ValueFilter>,
    pub limit: i64,
    pub offset: i64,
    pub include_archived: bool,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            graph_name: None,
            graph_version: None,
            sort_by: vec![],
            filter_by: vec![],
            limit: 10_000,
            offset: 0,
            include_archived: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SortSpec {
    pub key: SortKey,
    pub descending: bool,
}

impl SortSpec {
    pub fn asc(key: SortKey) -> Self {
        Self {
            key,
            descending: false,
        }
    }

    pub fn desc(key: SortKey) -> Self {
        Self {
            key,
            descending: true,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SortKey {
    InsertedAt,
    UpdatedAt,
    Revision,
    GraphName,
    GraphVersion,
    NodeValue(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    NotIn,
    IsNil,
    IsNotNil,
}

#[derive(Debug, Clone)]
pub enum FilterOperand {
    None,
    One(JsonValue),
    Many(Vec<JsonValue>),
}

/// A filter over a node's current value. Operands are restricted to JSON
/// primitives (null, bool, number, string).
#[derive(Debug, Clone)]
pub struct ValueFilter {
    pub node: String,
    pub op: FilterOp,
    pub operand: FilterOperand,
}

impl ValueFilter {
    /// Operand arity and primitiveness check, shared by all backends.
    pub fn validate(&self) -> Result<(), StoreError> {
        let primitive = |v: &JsonValue| !(v.is_object() || v.is_array());

        let ok = match (&self.op, &self.operand) {
            (FilterOp::IsNil | FilterOp::IsNotNil, FilterOperand::None) => true,
            (FilterOp::In | FilterOp::NotIn, FilterOperand::Many(vs)) => vs.iter().all(primitive),
            (
                FilterOp::Eq
                | FilterOp::Neq
                | FilterOp::Lt
                | FilterOp::Lte
                | FilterOp::Gt
                | FilterOp::Gte,
                FilterOperand::One(v),
            ) => primitive(v),
            _ => false,
        };

        if ok {
            Ok(())
        } else {
            Err(StoreError::Internal(format!(
                "invalid filter operand for {:?} on node {}",
                self.op, self.node
            )))
        }
    }
}

/// The persistence protocol the engine drives.
///
/// Backends: `rill-pg` (PostgreSQL via sqlx, the production store) and the
/// in-memory store in `rill-testing`.
#[trait_variant::make(Send)]
pub trait WorkflowStore: Clone + Send + Sync + 'static {
    // ------------------------------------------------------------------
    // executions
    // ------------------------------------------------------------------

    /// Insert the execution row, one value row per node (system values
    /// pre-set) and one `not_set` computation per non-input node, all in
    /// one transaction.
    async fn create_execution(&self, graph: &Graph) -> Result<ExecutionRecord, StoreError>;

    async fn load_execution(
        &self,
        id: ExecutionId,
        include_archived: bool,
    ) -> Result<Option<ExecutionRecord>, StoreError>;

    async fn list_executions(
        &self,
        opts: &ListOptions,
    ) -> Result<Vec<ExecutionRecord>, StoreError>;

    async fn archive_execution(&self, id: ExecutionId) -> Result<ExecutionRecord, StoreError>;

    async fn unarchive_execution(&self, id: ExecutionId) -> Result<ExecutionRecord, StoreError>;

    // ------------------------------------------------------------------
    // values
    // ------------------------------------------------------------------

    async fn set_value(
        &self,
        id: ExecutionId,
        node: &str,
        value: JsonValue,
    ) -> Result<SetOutcome, StoreError>;

    async fn unset_value(&self, id: ExecutionId, node: &str) -> Result<SetOutcome, StoreError>;

    async fn load_values(
        &self,
        id: ExecutionId,
    ) -> Result<HashMap<String, ValueRecord>, StoreError>;

    async fn load_value(
        &self,
        id: ExecutionId,
        node: &str,
    ) -> Result<Option<ValueRecord>, StoreError>;

    // ------------------------------------------------------------------
    // computations
    // ------------------------------------------------------------------

    /// All computation rows for the execution, optionally narrowed to one
    /// node, ordered by id.
    async fn load_computations(
        &self,
        id: ExecutionId,
        node: Option<&str>,
    ) -> Result<Vec<ComputationRecord>, StoreError>;

    // ------------------------------------------------------------------
    // advance passes
    // ------------------------------------------------------------------

    /// One invalidation pass: clear `compute`-typed set values whose gates
    /// no longer hold and enqueue fresh computations for them. Returns how
    /// many values were cleared.
    async fn run_invalidation_pass(
        &self,
        id: ExecutionId,
        graph: &Graph,
        now: EpochSecs,
    ) -> Result<usize, StoreError>;

    /// Detect computations whose latest success is based on stale inputs
    /// and conditionally insert fresh `not_set` rows for them, guarded by
    /// the per-execution advisory lock. Returns how many were enqueued.
    async fn enqueue_stale_recomputations(
        &self,
        id: ExecutionId,
        graph: &Graph,
        now: EpochSecs,
    ) -> Result<usize, StoreError>;

    /// Claim every ready `not_set` computation: row-lock candidates,
    /// evaluate gates over an in-transaction snapshot, transition the
    /// ready ones to `computing` under a fresh revision and deadline.
    async fn claim_ready(
        &self,
        id: ExecutionId,
        graph: &Graph,
        now: EpochSecs,
    ) -> Result<Vec<ClaimedComputation>, StoreError>;

    // ------------------------------------------------------------------
    // worker lifecycle
    // ------------------------------------------------------------------

    async fn record_success(
        &self,
        computation: ComputationId,
        plan: &SuccessPlan,
        now: EpochSecs,
    ) -> Result<SuccessOutcome, StoreError>;

    /// Mark the computation failed with a truncated reason and apply the
    /// retry policy in the same transaction.
    async fn record_failure(
        &self,
        computation: ComputationId,
        node: &Node,
        error: &str,
        now: EpochSecs,
    ) -> Result<FailureOutcome, StoreError>;

    /// Conditionally extend the computation's heartbeat deadline; see
    /// [`HeartbeatOutcome`] for the contract when zero rows match.
    async fn beat(
        &self,
        computation: ComputationId,
        timeout_seconds: i64,
        buffer_seconds: i64,
        now: EpochSecs,
    ) -> Result<HeartbeatOutcome, StoreError>;

    // ------------------------------------------------------------------
    // sweeps
    // ------------------------------------------------------------------

    async fn last_sweep_started_at(
        &self,
        sweep_type: SweepType,
    ) -> Result<Option<EpochSecs>, StoreError>;

    async fn last_completed_sweep_started_at(
        &self,
        sweep_type: SweepType,
    ) -> Result<Option<EpochSecs>, StoreError>;

    /// Start a throttled singleton sweep: take the sweep-type advisory
    /// lock, re-check the throttle window authoritatively, and open a
    /// sweep-run row. `None` means another replica ran recently (or holds
    /// the lock) and this call must skip the sweep.
    async fn begin_sweep(
        &self,
        sweep_type: SweepType,
        min_seconds_between_runs: i64,
        now: EpochSecs,
    ) -> Result<Option<i64>, StoreError>;

    async fn complete_sweep(
        &self,
        run: i64,
        executions_processed: i64,
        now: EpochSecs,
    ) -> Result<(), StoreError>;

    async fn sweep_runs(
        &self,
        sweep_type: Option<SweepType>,
    ) -> Result<Vec<SweepRun>, StoreError>;

    /// Transition `computing` rows whose heartbeat deadline (or plain
    /// deadline, for workers that never beat) has passed to `abandoned`.
    /// Returns the affected `(execution, node)` pairs so the caller can
    /// apply the retry policy with the graph in hand.
    async fn mark_abandoned_computations(
        &self,
        now: EpochSecs,
    ) -> Result<Vec<(ExecutionId, String)>, StoreError>;

    /// Apply the retry policy for a node outside a failure transaction
    /// (after abandonment): conditionally insert a fresh `not_set`
    /// computation when attempts at the current revision level are not
    /// exhausted. Returns whether a retry was enqueued.
    async fn schedule_retry(
        &self,
        id: ExecutionId,
        node: &Node,
        now: EpochSecs,
    ) -> Result<bool, StoreError>;

    /// Active executions touched since the cutoff that still hold
    /// `not_set` computations for schedule nodes.
    async fn executions_with_pending_schedules(
        &self,
        cutoff: EpochSecs,
    ) -> Result<Vec<ExecutionId>, StoreError>;

    /// Active executions holding a schedule pulse inside
    /// `[window_start, window_end)`. Filters on the pulse itself
    /// (`node_value`), not on `set_time`.
    async fn executions_unblocked_by_schedule(
        &self,
        window_start: EpochSecs,
        window_end: EpochSecs,
    ) -> Result<Vec<ExecutionId>, StoreError>;

    /// Catchall variant of the above with a wide lookback window, limited
    /// to executions that still hold pending computations.
    async fn executions_with_missed_schedules(
        &self,
        window_start: EpochSecs,
        window_end: EpochSecs,
    ) -> Result<Vec<ExecutionId>, StoreError>;

    /// Active executions with no `updated_at` movement since the cutoff
    /// that still hold `not_set` computations.
    async fn stalled_executions(
        &self,
        idle_cutoff: EpochSecs,
    ) -> Result<Vec<ExecutionId>, StoreError>;

    /// For recurring schedule values whose pulse has fired and that hold
    /// no pending computation, insert a fresh `not_set` computation and
    /// bump the execution's `updated_at`. Returns how many were enqueued.
    async fn regenerate_recurring_schedules(
        &self,
        now: EpochSecs,
    ) -> Result<usize, StoreError>;
}
