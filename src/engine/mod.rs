//! Public surface of the engine: execution lifecycle, value reads and
//! writes, and the advance loop that drives values toward fixed point.

use std::collections::HashMap;

use itertools::Itertools;
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::prelude::*;

mod advance;
mod heartbeat;
mod reader;
mod worker;

pub use advance::advance;
pub use reader::{get_value, GetOpts, ReadValue, Timeout, Wait};

/// Start a new execution of a registered graph and immediately advance it
/// once so gateless computations can launch.
pub async fn start_execution<D: Domain>(domain: &D, graph: &Graph) -> Result<ExecutionRecord, Error> {
    if !domain.catalog().is_loaded(graph.name(), graph.version()) {
        return Err(Error::not_registered(graph.name(), graph.version()));
    }

    let execution = domain.store().create_execution(graph).await?;

    tracing::info!(
        execution = %execution.id,
        graph = graph.name(),
        version = graph.version(),
        "started execution"
    );

    advance(domain, execution.id).await?;

    Ok(execution)
}

/// Load an execution by id. Archived executions only surface when asked
/// for explicitly.
pub async fn load<D: Domain>(
    domain: &D,
    id: ExecutionId,
    include_archived: bool,
) -> Result<Option<ExecutionRecord>, Error> {
    Ok(domain.store().load_execution(id, include_archived).await?)
}

/// Set an input node's value. A write that equals the current contents is
/// a complete no-op: no revision bump, no cascade.
pub async fn set_value<D: Domain>(
    domain: &D,
    id: ExecutionId,
    node: &str,
    value: JsonValue,
) -> Result<ExecutionRecord, Error> {
    resolve_input(domain, id, node).await?;

    let outcome = domain.store().set_value(id, node, value).await?;

    if outcome.changed() {
        tracing::debug!(execution = %id, node, "value set");
        advance(domain, id).await?;
    }

    Ok(outcome.execution().clone())
}

/// Clear an input node's value and cascade invalidation downstream.
pub async fn unset_value<D: Domain>(
    domain: &D,
    id: ExecutionId,
    node: &str,
) -> Result<ExecutionRecord, Error> {
    resolve_input(domain, id, node).await?;

    let outcome = domain.store().unset_value(id, node).await?;

    if outcome.changed() {
        tracing::debug!(execution = %id, node, "value unset");
        advance(domain, id).await?;
    }

    Ok(outcome.execution().clone())
}

/// The user-visible value map: set values only, system keys excluded.
pub async fn values<D: Domain>(
    domain: &D,
    id: ExecutionId,
) -> Result<JsonMap<String, JsonValue>, Error> {
    let rows = load_rows(domain, id).await?;

    let mut out = JsonMap::new();

    for (name, row) in rows {
        if is_system_node(&name) || !row.is_set() {
            continue;
        }

        if let Some(value) = row.node_value {
            out.insert(name, value);
        }
    }

    Ok(out)
}

/// Every value row, including unset nodes and system values.
pub async fn values_all<D: Domain>(
    domain: &D,
    id: ExecutionId,
) -> Result<HashMap<String, ValueRecord>, Error> {
    load_rows(domain, id).await
}

pub async fn archive<D: Domain>(domain: &D, id: ExecutionId) -> Result<ExecutionRecord, Error> {
    let execution = domain.store().archive_execution(id).await?;

    tracing::info!(execution = %id, "archived execution");

    Ok(execution)
}

pub async fn unarchive<D: Domain>(domain: &D, id: ExecutionId) -> Result<ExecutionRecord, Error> {
    let execution = domain.store().unarchive_execution(id).await?;

    tracing::info!(execution = %id, "unarchived execution");

    Ok(execution)
}

pub async fn list_executions<D: Domain>(
    domain: &D,
    opts: &ListOptions,
) -> Result<Vec<ExecutionRecord>, Error> {
    if opts.graph_version.is_some() && opts.graph_name.is_none() {
        return Err(Error::invalid("graph_version requires graph_name"));
    }

    Ok(domain.store().list_executions(opts).await?)
}

/// What happened to a node at a given revision.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryEvent {
    ValueSet,
    Computation(ComputationState),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub node: String,
    pub event: HistoryEvent,
    pub revision: Revision,
    pub at: EpochSecs,
}

/// Chronological log of value writes and finished computations, ordered by
/// revision then wall clock.
pub async fn history<D: Domain>(domain: &D, id: ExecutionId) -> Result<Vec<HistoryEntry>, Error> {
    let rows = load_rows(domain, id).await?;
    let computations = domain.store().load_computations(id, None).await?;

    let mut out = vec![];

    for (name, row) in rows {
        if is_system_node(&name) {
            continue;
        }

        if let Some(at) = row.set_time {
            out.push(HistoryEntry {
                node: name,
                event: HistoryEvent::ValueSet,
                revision: row.ex_revision,
                at,
            });
        }
    }

    for comp in computations {
        if comp.state.is_pending() {
            continue;
        }

        out.push(HistoryEntry {
            node: comp.node_name,
            event: HistoryEvent::Computation(comp.state),
            revision: comp
                .ex_revision_at_completion
                .or(comp.ex_revision_at_start)
                .unwrap_or(0),
            at: comp.completion_time.or(comp.start_time).unwrap_or(0),
        });
    }

    Ok(out
        .into_iter()
        .sorted_by(|a, b| a.revision.cmp(&b.revision).then(a.at.cmp(&b.at)))
        .collect())
}

async fn load_rows<D: Domain>(
    domain: &D,
    id: ExecutionId,
) -> Result<HashMap<String, ValueRecord>, Error> {
    domain
        .store()
        .load_execution(id, true)
        .await?
        .ok_or(Error::ExecutionNotFound(id))?;

    Ok(domain.store().load_values(id).await?)
}

/// Lookup shared by the write paths: the execution must exist, its graph
/// must be registered, and the node must be an input.
async fn resolve_input<D: Domain>(domain: &D, id: ExecutionId, node: &str) -> Result<(), Error> {
    let execution = domain
        .store()
        .load_execution(id, true)
        .await?
        .ok_or(Error::ExecutionNotFound(id))?;

    let graph = domain
        .graph_for(&execution)
        .ok_or_else(|| Error::not_registered(&execution.graph_name, &execution.graph_version))?;

    let node_def = graph.node(node).ok_or_else(|| Error::UnknownNode {
        execution: id,
        node: node.to_string(),
    })?;

    if !node_def.is_input() {
        return Err(Error::invalid(format!(
            "only input nodes accept direct writes, {node} is {}",
            node_def.node_type()
        )));
    }

    Ok(())
}
