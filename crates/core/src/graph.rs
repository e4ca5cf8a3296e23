//! In-memory graph definitions.
//!
//! Graphs are immutable once built. A definition lives in code: node
//! functions and gate predicates are plain callables, only their shape is
//! ever reflected into the store.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

use crate::gate::{Gate, Predicate};
use crate::model::{is_system_node, NodeType, ValueRecord};
use crate::{EpochSecs, Revision};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_ABANDON_AFTER_SECONDS: i64 = 60;

/// Reasons a compute function can fail. Stored truncated to 1000 chars.
pub type ComputeError = String;

/// What a node's compute function sees when it runs.
#[derive(Debug, Clone)]
pub struct ComputeInput {
    /// User-visible value map: non-system keys, set values only.
    pub values: JsonMap<String, JsonValue>,

    /// Per-node metadata for the nodes in the gate's dependency set.
    pub nodes: HashMap<String, NodeSnapshot>,
}

#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub value: Option<JsonValue>,
    pub node_type: NodeType,
    pub revision: Revision,
    pub set_time: Option<EpochSecs>,
}

impl From<&ValueRecord> for NodeSnapshot {
    fn from(v: &ValueRecord) -> Self {
        Self {
            value: v.node_value.clone(),
            node_type: v.node_type,
            revision: v.ex_revision,
            set_time: v.set_time,
        }
    }
}

impl ComputeInput {
    pub fn get(&self, node: &str) -> Option<&JsonValue> {
        self.values.get(node)
    }

    pub fn require(&self, node: &str) -> Result<&JsonValue, ComputeError> {
        self.values
            .get(node)
            .ok_or_else(|| format!("value not set: {node}"))
    }

    pub fn i64(&self, node: &str) -> Result<i64, ComputeError> {
        self.require(node)?
            .as_i64()
            .ok_or_else(|| format!("value is not an integer: {node}"))
    }

    pub fn f64(&self, node: &str) -> Result<f64, ComputeError> {
        self.require(node)?
            .as_f64()
            .ok_or_else(|| format!("value is not a number: {node}"))
    }

    pub fn str(&self, node: &str) -> Result<&str, ComputeError> {
        self.require(node)?
            .as_str()
            .ok_or_else(|| format!("value is not a string: {node}"))
    }
}

pub type ComputeFn = Arc<dyn Fn(&ComputeInput) -> Result<JsonValue, ComputeError> + Send + Sync>;

/// Callback invoked after a successful save. Best-effort: failures are
/// logged and never affect the persisted result.
pub type OnSaveFn =
    Arc<dyn Fn(&crate::ExecutionRecord, &str, &JsonValue) -> Result<(), String> + Send + Sync>;

/// What kind of node this is, with the kind-specific knobs attached.
#[derive(Clone)]
pub enum NodeKind {
    Input,
    Compute,

    /// Computes a replacement value for another node.
    Mutate {
        mutates: String,
        /// When false (the default) the target's revision is left untouched
        /// so the mutation stays invisible to downstream gates.
        update_revision_on_change: bool,
    },

    ScheduleOnce,
    ScheduleRecurring,

    /// Engine-maintained append-only log of its upstream values.
    Historian { max_entries: Option<usize> },

    /// Archives the execution when its gate is met.
    Archive,
}

impl NodeKind {
    /// The persisted node type. Archive nodes persist as compute-typed
    /// values; the archive behavior is an engine concern.
    pub fn node_type(&self) -> NodeType {
        match self {
            Self::Input => NodeType::Input,
            Self::Compute | Self::Archive => NodeType::Compute,
            Self::Mutate { .. } => NodeType::Mutate,
            Self::ScheduleOnce => NodeType::ScheduleOnce,
            Self::ScheduleRecurring => NodeType::ScheduleRecurring,
            Self::Historian { .. } => NodeType::Historian,
        }
    }
}

impl std::fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Input => write!(f, "Input"),
            Self::Compute => write!(f, "Compute"),
            Self::Mutate {
                mutates,
                update_revision_on_change,
            } => write!(f, "Mutate({mutates}, bump={update_revision_on_change})"),
            Self::ScheduleOnce => write!(f, "ScheduleOnce"),
            Self::ScheduleRecurring => write!(f, "ScheduleRecurring"),
            Self::Historian { max_entries } => write!(f, "Historian({max_entries:?})"),
            Self::Archive => write!(f, "Archive"),
        }
    }
}

/// Per-node options shared by all builder functions.
#[derive(Clone, Default)]
pub struct NodeOptions {
    pub max_retries: Option<u32>,
    pub abandon_after_seconds: Option<i64>,
    pub f_on_save: Option<OnSaveFn>,
    pub heartbeat_interval_seconds: Option<u64>,
    pub heartbeat_timeout_seconds: Option<u64>,
}

impl NodeOptions {
    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }

    pub fn abandon_after_seconds(mut self, secs: i64) -> Self {
        self.abandon_after_seconds = Some(secs);
        self
    }

    pub fn on_save(mut self, f: OnSaveFn) -> Self {
        self.f_on_save = Some(f);
        self
    }
}

#[derive(Clone)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub gated_by: Option<Gate>,
    pub f_compute: Option<ComputeFn>,
    pub f_on_save: Option<OnSaveFn>,
    pub max_retries: u32,
    pub abandon_after_seconds: i64,
    pub heartbeat_interval_seconds: Option<u64>,
    pub heartbeat_timeout_seconds: Option<u64>,
}

impl Node {
    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }

    pub fn is_input(&self) -> bool {
        matches!(self.kind, NodeKind::Input)
    }

    /// The upstream nodes this node's gate reads.
    pub fn dependencies(&self) -> BTreeSet<String> {
        self.gated_by
            .as_ref()
            .map(|g| g.dependencies())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

fn base_node(name: impl Into<String>, kind: NodeKind, gated_by: Option<Gate>, opts: NodeOptions) -> Node {
    Node {
        name: name.into(),
        kind,
        gated_by,
        f_compute: None,
        f_on_save: opts.f_on_save,
        max_retries: opts.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
        abandon_after_seconds: opts
            .abandon_after_seconds
            .unwrap_or(DEFAULT_ABANDON_AFTER_SECONDS),
        heartbeat_interval_seconds: opts.heartbeat_interval_seconds,
        heartbeat_timeout_seconds: opts.heartbeat_timeout_seconds,
    }
}

/// A user-supplied input. Written only through `set_value`/`unset_value`.
pub fn input(name: impl Into<String>) -> Node {
    base_node(name, NodeKind::Input, None, NodeOptions::default())
}

pub fn compute<F>(name: impl Into<String>, gated_by: impl Into<Gate>, f: F, opts: NodeOptions) -> Node
where
    F: Fn(&ComputeInput) -> Result<JsonValue, ComputeError> + Send + Sync + 'static,
{
    let mut node = base_node(name, NodeKind::Compute, Some(gated_by.into()), opts);
    node.f_compute = Some(Arc::new(f));
    node
}

pub fn mutate<F>(
    name: impl Into<String>,
    gated_by: impl Into<Gate>,
    f: F,
    mutates: impl Into<String>,
    update_revision_on_change: bool,
    opts: NodeOptions,
) -> Node
where
    F: Fn(&ComputeInput) -> Result<JsonValue, ComputeError> + Send + Sync + 'static,
{
    let kind = NodeKind::Mutate {
        mutates: mutates.into(),
        update_revision_on_change,
    };
    let mut node = base_node(name, kind, Some(gated_by.into()), opts);
    node.f_compute = Some(Arc::new(f));
    node
}

/// A node whose compute function returns the epoch second at which
/// downstream gates should open.
pub fn schedule_once<F>(
    name: impl Into<String>,
    gated_by: impl Into<Gate>,
    f: F,
    opts: NodeOptions,
) -> Node
where
    F: Fn(&ComputeInput) -> Result<JsonValue, ComputeError> + Send + Sync + 'static,
{
    let mut node = base_node(name, NodeKind::ScheduleOnce, Some(gated_by.into()), opts);
    node.f_compute = Some(Arc::new(f));
    node
}

/// Like [`schedule_once`], but a sweeper re-enqueues the node after each
/// pulse fires so the function can produce the next tick.
pub fn schedule_recurring<F>(
    name: impl Into<String>,
    gated_by: impl Into<Gate>,
    f: F,
    opts: NodeOptions,
) -> Node
where
    F: Fn(&ComputeInput) -> Result<JsonValue, ComputeError> + Send + Sync + 'static,
{
    let mut node = base_node(name, NodeKind::ScheduleRecurring, Some(gated_by.into()), opts);
    node.f_compute = Some(Arc::new(f));
    node
}

/// Engine-maintained log of upstream changes, newest first, bounded by
/// `max_entries` (`None` = unlimited).
pub fn historian(
    name: impl Into<String>,
    gated_by: impl Into<Gate>,
    max_entries: Option<usize>,
    opts: NodeOptions,
) -> Node {
    base_node(
        name,
        NodeKind::Historian { max_entries },
        Some(gated_by.into()),
        opts,
    )
}

/// Archives the execution once the gate is met.
pub fn archive(name: impl Into<String>, gated_by: impl Into<Gate>) -> Node {
    base_node(
        name,
        NodeKind::Archive,
        Some(gated_by.into()),
        NodeOptions::default(),
    )
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("duplicate node name: {0}")]
    DuplicateNode(String),

    #[error("node {node} is gated by unknown upstream: {upstream}")]
    UnknownUpstream { node: String, upstream: String },

    #[error("node {node} is gated by itself")]
    SelfGated { node: String },

    #[error("mutate node {node} targets unknown node: {target}")]
    UnknownMutateTarget { node: String, target: String },

    #[error("node name is reserved: {0}")]
    ReservedNodeName(String),

    #[error("node {0} is missing a compute function")]
    MissingComputeFn(String),
}

/// A validated, immutable graph definition.
#[derive(Clone)]
pub struct Graph {
    name: String,
    version: String,
    nodes: Vec<Node>,
    by_name: HashMap<String, usize>,
    f_on_save: Option<OnSaveFn>,
}

impl Graph {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        nodes: Vec<Node>,
    ) -> Result<Self, GraphError> {
        Self::with_on_save(name, version, nodes, None)
    }

    pub fn with_on_save(
        name: impl Into<String>,
        version: impl Into<String>,
        mut nodes: Vec<Node>,
        f_on_save: Option<OnSaveFn>,
    ) -> Result<Self, GraphError> {
        let mut by_name = HashMap::new();

        for (idx, node) in nodes.iter().enumerate() {
            if is_system_node(&node.name) {
                return Err(GraphError::ReservedNodeName(node.name.clone()));
            }

            if by_name.insert(node.name.clone(), idx).is_some() {
                return Err(GraphError::DuplicateNode(node.name.clone()));
            }

            let needs_fn = matches!(
                node.kind,
                NodeKind::Compute
                    | NodeKind::Mutate { .. }
                    | NodeKind::ScheduleOnce
                    | NodeKind::ScheduleRecurring
            );

            if needs_fn && node.f_compute.is_none() {
                return Err(GraphError::MissingComputeFn(node.name.clone()));
            }
        }

        for node in &nodes {
            for upstream in node.dependencies() {
                if upstream == node.name {
                    return Err(GraphError::SelfGated {
                        node: node.name.clone(),
                    });
                }

                if !by_name.contains_key(&upstream) {
                    return Err(GraphError::UnknownUpstream {
                        node: node.name.clone(),
                        upstream,
                    });
                }
            }

            if let NodeKind::Mutate { mutates, .. } = &node.kind {
                if !by_name.contains_key(mutates) {
                    return Err(GraphError::UnknownMutateTarget {
                        node: node.name.clone(),
                        target: mutates.clone(),
                    });
                }
            }
        }

        // leaves over schedule-typed upstreams gate on time, not on mere
        // presence, unless the definition supplied its own predicate
        let schedule_nodes: BTreeSet<String> = nodes
            .iter()
            .filter(|n| n.node_type().is_schedule())
            .map(|n| n.name.clone())
            .collect();

        for node in nodes.iter_mut() {
            if let Some(gate) = node.gated_by.as_mut() {
                gate.for_each_leaf_mut(&mut |leaf| {
                    if leaf.predicate.is_default_provided() && schedule_nodes.contains(&leaf.node) {
                        leaf.predicate = Predicate::due();
                    }
                });
            }
        }

        Ok(Self {
            name: name.into(),
            version: version.into(),
            nodes,
            by_name,
            f_on_save,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.by_name.get(name).map(|idx| &self.nodes[*idx])
    }

    /// Nodes that carry computations, which is every non-input node.
    pub fn computable_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| !n.is_input())
    }

    pub fn on_save(&self) -> Option<&OnSaveFn> {
        self.f_on_save.as_ref()
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sum_graph() -> Result<Graph, GraphError> {
        Graph::new(
            "adder",
            "v1",
            vec![
                input("a"),
                input("b"),
                compute(
                    "sum",
                    vec!["a", "b"],
                    |m: &ComputeInput| Ok(json!(m.i64("a")? + m.i64("b")?)),
                    NodeOptions::default(),
                ),
            ],
        )
    }

    #[test]
    fn valid_graph_builds() {
        let graph = sum_graph().unwrap();
        assert_eq!(graph.computable_nodes().count(), 1);
        assert!(graph.node("sum").is_some());
    }

    #[test]
    fn duplicate_names_rejected() {
        let err = Graph::new("g", "v1", vec![input("a"), input("a")]).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateNode(_)));
    }

    #[test]
    fn unknown_upstream_rejected() {
        let err = Graph::new(
            "g",
            "v1",
            vec![compute(
                "c",
                vec!["ghost"],
                |_| Ok(json!(1)),
                NodeOptions::default(),
            )],
        )
        .unwrap_err();

        assert!(matches!(err, GraphError::UnknownUpstream { .. }));
    }

    #[test]
    fn reserved_names_rejected() {
        let err = Graph::new("g", "v1", vec![input("execution_id")]).unwrap_err();
        assert!(matches!(err, GraphError::ReservedNodeName(_)));
    }

    #[test]
    fn schedule_upstream_leaf_upgraded_to_due() {
        let graph = Graph::new(
            "g",
            "v1",
            vec![
                input("name"),
                schedule_once(
                    "soon",
                    vec!["name"],
                    |_| Ok(json!(0)),
                    NodeOptions::default(),
                ),
                compute(
                    "msg",
                    vec!["name", "soon"],
                    |_| Ok(json!("hi")),
                    NodeOptions::default(),
                ),
            ],
        )
        .unwrap();

        let gate = graph.node("msg").unwrap().gated_by.as_ref().unwrap();
        let mut names = vec![];
        match gate {
            Gate::And(leaves) => {
                for leaf in leaves {
                    if let Gate::Leaf(c) = leaf {
                        names.push((c.node.clone(), c.predicate.name()));
                    }
                }
            }
            _ => panic!("expected and-gate"),
        }

        assert!(names.contains(&("name".to_string(), "provided")));
        assert!(names.contains(&("soon".to_string(), "due")));
    }

    #[test]
    fn mutate_target_must_exist() {
        let err = Graph::new(
            "g",
            "v1",
            vec![
                input("t"),
                mutate(
                    "inc",
                    vec!["t"],
                    |_| Ok(json!(1)),
                    "ghost",
                    false,
                    NodeOptions::default(),
                ),
            ],
        )
        .unwrap_err();

        assert!(matches!(err, GraphError::UnknownMutateTarget { .. }));
    }
}
