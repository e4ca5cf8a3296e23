//! Gate expressions and the readiness evaluator.
//!
//! A gate is a boolean expression tree over upstream value rows. The
//! evaluator is pure and deterministic: it operates on a value snapshot
//! taken inside the enclosing transaction and never touches the store.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::model::ValueRecord;
use crate::EpochSecs;

/// Evaluation context for predicates.
///
/// The invalidator evaluates gates with [`EvalMode::Invalidation`], which
/// lets a predicate answer more leniently when deciding whether an
/// already-computed value must be cleared, as opposed to whether a
/// computation should start. The built-in predicates answer identically in
/// both modes; the knob exists for user predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    Computation,
    Invalidation,
}

type PredicateFn = dyn Fn(&ValueRecord, EvalMode, EpochSecs) -> bool + Send + Sync;

/// A unary condition over a single upstream value row.
///
/// Predicates are first-class callables closing over their comparison
/// values. Only the tree shape is ever persisted; predicate bodies live in
/// code as part of the graph definition.
#[derive(Clone)]
pub struct Predicate {
    name: &'static str,
    f: Arc<PredicateFn>,
}

impl Predicate {
    pub fn new(
        name: &'static str,
        f: impl Fn(&ValueRecord, EvalMode, EpochSecs) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self { name, f: Arc::new(f) }
    }

    /// The built-in readiness predicate: the upstream value is set.
    pub fn provided() -> Self {
        Self::new("provided", |value, _, _| value.is_set())
    }

    /// Readiness predicate for schedule-typed upstreams: the pulse the node
    /// produced has come due.
    pub fn due() -> Self {
        Self::new("due", |value, _, now| {
            value.pulse().map(|at| at <= now).unwrap_or(false)
        })
    }

    /// The upstream value equals the given contents.
    pub fn equals(expected: serde_json::Value) -> Self {
        Self::new("equals", move |value, _, _| {
            value.node_value.as_ref() == Some(&expected)
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn is_default_provided(&self) -> bool {
        self.name == "provided"
    }

    pub fn eval(&self, value: &ValueRecord, mode: EvalMode, now: EpochSecs) -> bool {
        (self.f)(value, mode, now)
    }
}

impl std::fmt::Debug for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Predicate({})", self.name)
    }
}

/// One leaf of a gate: an upstream node paired with a predicate over it.
#[derive(Debug, Clone)]
pub struct Condition {
    pub node: String,
    pub predicate: Predicate,
}

impl Condition {
    pub fn new(node: impl Into<String>, predicate: Predicate) -> Self {
        Self {
            node: node.into(),
            predicate,
        }
    }

    pub fn provided(node: impl Into<String>) -> Self {
        Self::new(node, Predicate::provided())
    }
}

#[derive(Debug, Clone)]
pub enum Gate {
    Leaf(Condition),
    And(Vec<Gate>),
    Or(Vec<Gate>),
    Not(Box<Gate>),
}

impl Gate {
    /// A plain list of node names desugars to and-of-provided.
    pub fn all<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Gate::And(
            nodes
                .into_iter()
                .map(|n| Gate::Leaf(Condition::provided(n)))
                .collect(),
        )
    }

    pub fn any<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Gate::Or(
            nodes
                .into_iter()
                .map(|n| Gate::Leaf(Condition::provided(n)))
                .collect(),
        )
    }

    pub fn not(gate: Gate) -> Self {
        Gate::Not(Box::new(gate))
    }

    /// The set of upstream node names this gate depends on.
    pub fn dependencies(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_dependencies(&mut out);
        out
    }

    fn collect_dependencies(&self, out: &mut BTreeSet<String>) {
        match self {
            Gate::Leaf(c) => {
                out.insert(c.node.clone());
            }
            Gate::And(gates) | Gate::Or(gates) => {
                for g in gates {
                    g.collect_dependencies(out);
                }
            }
            Gate::Not(g) => g.collect_dependencies(out),
        }
    }

    /// Visit every leaf mutably. Used by graph validation to upgrade
    /// default predicates on schedule-typed upstreams.
    pub(crate) fn for_each_leaf_mut(&mut self, f: &mut impl FnMut(&mut Condition)) {
        match self {
            Gate::Leaf(c) => f(c),
            Gate::And(gates) | Gate::Or(gates) => {
                for g in gates {
                    g.for_each_leaf_mut(f);
                }
            }
            Gate::Not(g) => g.for_each_leaf_mut(f),
        }
    }
}

impl<S: Into<String>> From<Vec<S>> for Gate {
    fn from(nodes: Vec<S>) -> Self {
        Gate::all(nodes)
    }
}

impl From<Condition> for Gate {
    fn from(c: Condition) -> Self {
        Gate::Leaf(c)
    }
}

/// The outcome of evaluating a gate over a value snapshot.
///
/// `conditions_met` and `conditions_not_met` list each leaf by its own
/// outcome regardless of how the combinators composed them; `ready` is the
/// composed boolean.
#[derive(Debug, Clone)]
pub struct Readiness {
    pub ready: bool,
    pub conditions_met: Vec<Condition>,
    pub conditions_not_met: Vec<Condition>,
}

impl Readiness {
    /// Readiness of a gateless node: always eligible, no conditions.
    pub fn unconditional() -> Self {
        Self {
            ready: true,
            conditions_met: vec![],
            conditions_not_met: vec![],
        }
    }
}

/// Any read-only view of an execution's value rows keyed by node name.
pub trait ValueSnapshot {
    fn value(&self, node: &str) -> Option<&ValueRecord>;
}

impl ValueSnapshot for std::collections::HashMap<String, ValueRecord> {
    fn value(&self, node: &str) -> Option<&ValueRecord> {
        self.get(node)
    }
}

impl ValueSnapshot for std::collections::BTreeMap<String, ValueRecord> {
    fn value(&self, node: &str) -> Option<&ValueRecord> {
        self.get(node)
    }
}

/// Evaluate a gate against a snapshot.
///
/// A leaf over a node absent from the snapshot evaluates to not-met; value
/// rows for every node exist from execution creation, so absence only
/// happens for snapshots scoped down on purpose.
pub fn evaluate<S: ValueSnapshot>(
    gate: &Gate,
    snapshot: &S,
    mode: EvalMode,
    now: EpochSecs,
) -> Readiness {
    let mut met = vec![];
    let mut not_met = vec![];

    let ready = eval_tree(gate, snapshot, mode, now, &mut met, &mut not_met);

    Readiness {
        ready,
        conditions_met: met,
        conditions_not_met: not_met,
    }
}

/// Evaluate an optional gate the way computations carry them.
pub fn evaluate_opt<S: ValueSnapshot>(
    gate: Option<&Gate>,
    snapshot: &S,
    mode: EvalMode,
    now: EpochSecs,
) -> Readiness {
    match gate {
        Some(gate) => evaluate(gate, snapshot, mode, now),
        None => Readiness::unconditional(),
    }
}

fn eval_tree<S: ValueSnapshot>(
    gate: &Gate,
    snapshot: &S,
    mode: EvalMode,
    now: EpochSecs,
    met: &mut Vec<Condition>,
    not_met: &mut Vec<Condition>,
) -> bool {
    match gate {
        Gate::Leaf(c) => {
            let holds = snapshot
                .value(&c.node)
                .map(|v| c.predicate.eval(v, mode, now))
                .unwrap_or(false);

            if holds {
                met.push(c.clone());
            } else {
                not_met.push(c.clone());
            }

            holds
        }
        Gate::And(gates) => {
            // no short-circuit: every leaf outcome is reported
            let mut all = true;
            for g in gates {
                all &= eval_tree(g, snapshot, mode, now, met, not_met);
            }
            all
        }
        Gate::Or(gates) => {
            let mut any = false;
            for g in gates {
                any |= eval_tree(g, snapshot, mode, now, met, not_met);
            }
            any
        }
        Gate::Not(g) => !eval_tree(g, snapshot, mode, now, met, not_met),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeType;
    use crate::ExecutionId;
    use std::collections::HashMap;

    fn value(node: &str, set: bool) -> ValueRecord {
        ValueRecord {
            execution_id: ExecutionId::new(),
            node_name: node.to_string(),
            node_type: NodeType::Input,
            node_value: set.then(|| serde_json::json!(1)),
            set_time: set.then_some(100),
            ex_revision: if set { 1 } else { 0 },
            inserted_at: 100,
            updated_at: 100,
        }
    }

    fn snapshot(entries: &[(&str, bool)]) -> HashMap<String, ValueRecord> {
        entries
            .iter()
            .map(|(n, set)| (n.to_string(), value(n, *set)))
            .collect()
    }

    #[test]
    fn list_desugars_to_and_of_provided() {
        let gate = Gate::all(["a", "b"]);
        let snap = snapshot(&[("a", true), ("b", false)]);

        let readiness = evaluate(&gate, &snap, EvalMode::Computation, 200);

        assert!(!readiness.ready);
        assert_eq!(readiness.conditions_met.len(), 1);
        assert_eq!(readiness.conditions_met[0].node, "a");
        assert_eq!(readiness.conditions_not_met.len(), 1);
        assert_eq!(readiness.conditions_not_met[0].node, "b");
    }

    #[test]
    fn or_is_satisfied_by_one_branch() {
        let gate = Gate::any(["a", "b"]);
        let snap = snapshot(&[("a", true), ("b", false)]);

        assert!(evaluate(&gate, &snap, EvalMode::Computation, 200).ready);
    }

    #[test]
    fn not_inverts() {
        let gate = Gate::not(Gate::all(["a"]));
        let snap = snapshot(&[("a", true)]);

        assert!(!evaluate(&gate, &snap, EvalMode::Computation, 200).ready);
    }

    #[test]
    fn due_waits_for_the_pulse() {
        let mut snap = snapshot(&[]);
        let mut pulse = value("soon", true);
        pulse.node_type = NodeType::ScheduleOnce;
        pulse.node_value = Some(serde_json::json!(500));
        snap.insert("soon".to_string(), pulse);

        let gate = Gate::Leaf(Condition::new("soon", Predicate::due()));

        assert!(!evaluate(&gate, &snap, EvalMode::Computation, 499).ready);
        assert!(evaluate(&gate, &snap, EvalMode::Computation, 500).ready);
    }

    #[test]
    fn missing_row_is_not_met() {
        let gate = Gate::all(["ghost"]);
        let snap = snapshot(&[]);

        let readiness = evaluate(&gate, &snap, EvalMode::Computation, 200);

        assert!(!readiness.ready);
        assert_eq!(readiness.conditions_not_met.len(), 1);
    }
}
