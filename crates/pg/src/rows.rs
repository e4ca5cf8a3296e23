//! Row decoding helpers.

use sqlx::postgres::PgRow;
use sqlx::Row;

use rill_core::{
    ComputationId, ComputationRecord, ComputationState, ComputedWith, ExecutionId,
    ExecutionRecord, NodeType, StoreError, SweepRun, SweepType, ValueRecord,
};

pub(crate) fn decode_execution(row: &PgRow) -> Result<ExecutionRecord, sqlx::Error> {
    Ok(ExecutionRecord {
        id: ExecutionId(row.try_get("id")?),
        graph_name: row.try_get("graph_name")?,
        graph_version: row.try_get("graph_version")?,
        revision: row.try_get("revision")?,
        inserted_at: row.try_get("inserted_at")?,
        updated_at: row.try_get("updated_at")?,
        archived_at: row.try_get("archived_at")?,
    })
}

pub(crate) fn decode_value(row: &PgRow) -> Result<ValueRecord, sqlx::Error> {
    let node_type: String = row.try_get("node_type")?;

    Ok(ValueRecord {
        execution_id: ExecutionId(row.try_get("execution_id")?),
        node_name: row.try_get("node_name")?,
        node_type: parse_node_type(&node_type)?,
        node_value: row.try_get("node_value")?,
        set_time: row.try_get("set_time")?,
        ex_revision: row.try_get("ex_revision")?,
        inserted_at: row.try_get("inserted_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn decode_computation(row: &PgRow) -> Result<ComputationRecord, sqlx::Error> {
    let computation_type: String = row.try_get("computation_type")?;
    let state: String = row.try_get("state")?;

    let computed_with: serde_json::Value = row.try_get("computed_with")?;
    let computed_with: ComputedWith =
        serde_json::from_value(computed_with).map_err(|e| decode_err("computed_with", e))?;

    Ok(ComputationRecord {
        id: ComputationId(row.try_get("id")?),
        execution_id: ExecutionId(row.try_get("execution_id")?),
        node_name: row.try_get("node_name")?,
        computation_type: parse_node_type(&computation_type)?,
        state: ComputationState::parse(&state)
            .ok_or_else(|| decode_err("state", format!("unknown state {state}")))?,
        start_time: row.try_get("start_time")?,
        completion_time: row.try_get("completion_time")?,
        deadline: row.try_get("deadline")?,
        last_heartbeat_at: row.try_get("last_heartbeat_at")?,
        heartbeat_deadline: row.try_get("heartbeat_deadline")?,
        ex_revision_at_start: row.try_get("ex_revision_at_start")?,
        ex_revision_at_completion: row.try_get("ex_revision_at_completion")?,
        computed_with,
        error_details: row.try_get("error_details")?,
        inserted_at: row.try_get("inserted_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn decode_sweep_run(row: &PgRow) -> Result<SweepRun, sqlx::Error> {
    let sweep_type: String = row.try_get("sweep_type")?;

    Ok(SweepRun {
        id: row.try_get("id")?,
        sweep_type: SweepType::parse(&sweep_type)
            .ok_or_else(|| decode_err("sweep_type", format!("unknown sweep type {sweep_type}")))?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        executions_processed: row.try_get("executions_processed")?,
    })
}

fn parse_node_type(raw: &str) -> Result<NodeType, sqlx::Error> {
    NodeType::parse(raw).ok_or_else(|| decode_err("node_type", format!("unknown node type {raw}")))
}

fn decode_err(column: &str, source: impl ToString) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: StoreError::Internal(source.to_string()).into(),
    }
}
