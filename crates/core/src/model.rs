//! Persistent records as they live in the relational store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{EpochSecs, ExecutionId, ComputationId, Revision};

/// Name of the system value holding the execution's own id.
pub const EXECUTION_ID_NODE: &str = "execution_id";

/// Name of the system value touched whenever any value changes under a
/// revision bump.
pub const LAST_UPDATED_AT_NODE: &str = "last_updated_at";

/// System values exist on every execution and are not user-settable.
pub fn is_system_node(name: &str) -> bool {
    name == EXECUTION_ID_NODE || name == LAST_UPDATED_AT_NODE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Input,
    Compute,
    Mutate,
    ScheduleOnce,
    ScheduleRecurring,
    Historian,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Compute => "compute",
            Self::Mutate => "mutate",
            Self::ScheduleOnce => "schedule_once",
            Self::ScheduleRecurring => "schedule_recurring",
            Self::Historian => "historian",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "input" => Some(Self::Input),
            "compute" => Some(Self::Compute),
            "mutate" => Some(Self::Mutate),
            "schedule_once" => Some(Self::ScheduleOnce),
            "schedule_recurring" => Some(Self::ScheduleRecurring),
            "historian" => Some(Self::Historian),
            _ => None,
        }
    }

    pub fn is_schedule(&self) -> bool {
        matches!(self, Self::ScheduleOnce | Self::ScheduleRecurring)
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputationState {
    NotSet,
    Computing,
    Success,
    Failed,
    Abandoned,
    Cancelled,
}

impl ComputationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotSet => "not_set",
            Self::Computing => "computing",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_set" => Some(Self::NotSet),
            "computing" => Some(Self::Computing),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "abandoned" => Some(Self::Abandoned),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Pending states occupy the node's single in-flight slot.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::NotSet | Self::Computing)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_pending()
    }
}

impl std::fmt::Display for ComputationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub graph_name: String,
    pub graph_version: String,
    pub revision: Revision,
    pub inserted_at: EpochSecs,
    pub updated_at: EpochSecs,
    pub archived_at: Option<EpochSecs>,
}

impl ExecutionRecord {
    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueRecord {
    pub execution_id: ExecutionId,
    pub node_name: String,
    pub node_type: NodeType,
    pub node_value: Option<JsonValue>,
    pub set_time: Option<EpochSecs>,
    pub ex_revision: Revision,
    pub inserted_at: EpochSecs,
    pub updated_at: EpochSecs,
}

impl ValueRecord {
    /// A value is "set" when it holds user-visible contents. The invariant
    /// `set_time.is_none() ⇔ node_value.is_none()` holds at all times.
    pub fn is_set(&self) -> bool {
        self.set_time.is_some()
    }

    /// The pulse carried by a schedule-typed value, when present.
    pub fn pulse(&self) -> Option<EpochSecs> {
        match (&self.node_type, &self.node_value) {
            (t, Some(v)) if t.is_schedule() => v.as_i64(),
            _ => None,
        }
    }
}

/// Snapshot of upstream revisions captured when a computation was claimed,
/// keyed by node name.
pub type ComputedWith = BTreeMap<String, Revision>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputationRecord {
    pub id: ComputationId,
    pub execution_id: ExecutionId,
    pub node_name: String,
    pub computation_type: NodeType,
    pub state: ComputationState,
    pub start_time: Option<EpochSecs>,
    pub completion_time: Option<EpochSecs>,
    pub deadline: Option<EpochSecs>,
    pub last_heartbeat_at: Option<EpochSecs>,
    pub heartbeat_deadline: Option<EpochSecs>,
    pub ex_revision_at_start: Option<Revision>,
    pub ex_revision_at_completion: Option<Revision>,
    pub computed_with: ComputedWith,
    pub error_details: Option<String>,
    pub inserted_at: EpochSecs,
    pub updated_at: EpochSecs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepType {
    Abandoned,
    ScheduleNodes,
    UnblockedBySchedule,
    MissedSchedulesCatchall,
    StalledExecutions,
    RegenerateScheduleRecurring,
}

impl SweepType {
    pub const ALL: [SweepType; 6] = [
        Self::Abandoned,
        Self::ScheduleNodes,
        Self::UnblockedBySchedule,
        Self::MissedSchedulesCatchall,
        Self::StalledExecutions,
        Self::RegenerateScheduleRecurring,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Abandoned => "abandoned",
            Self::ScheduleNodes => "schedule_nodes",
            Self::UnblockedBySchedule => "unblocked_by_schedule",
            Self::MissedSchedulesCatchall => "missed_schedules_catchall",
            Self::StalledExecutions => "stalled_executions",
            Self::RegenerateScheduleRecurring => "regenerate_schedule_recurring",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Stable key for the cluster-wide singleton lock of this sweep type.
    pub fn lock_key(&self) -> i32 {
        match self {
            Self::Abandoned => 1,
            Self::ScheduleNodes => 2,
            Self::UnblockedBySchedule => 3,
            Self::MissedSchedulesCatchall => 4,
            Self::StalledExecutions => 5,
            Self::RegenerateScheduleRecurring => 6,
        }
    }
}

impl std::fmt::Display for SweepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only audit row used to enforce per-sweep-type throttling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepRun {
    pub id: i64,
    pub sweep_type: SweepType,
    pub started_at: EpochSecs,
    pub completed_at: Option<EpochSecs>,
    pub executions_processed: i64,
}
