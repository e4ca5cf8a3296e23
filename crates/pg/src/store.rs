//! `WorkflowStore` over PostgreSQL.

use std::collections::HashMap;

use serde_json::{json, Value as JsonValue};
use sqlx::{PgConnection, QueryBuilder, Row};

use rill_core::rules;
use rill_core::{
    evaluate_opt, now_secs, ClaimedComputation, ComputationId, ComputationRecord,
    ComputationState, EpochSecs, EvalMode, ExecutionId, ExecutionRecord, FailureOutcome,
    FilterOp, FilterOperand, Graph, HeartbeatOutcome, ListOptions, Node, NodeType, Revision,
    SetOutcome, SortKey, StoreError, SuccessOutcome, SuccessPlan, SweepRun, SweepType,
    ValueRecord, WorkflowStore, WriteMode, EXECUTION_ID_NODE, LAST_UPDATED_AT_NODE,
};

use crate::rows::{decode_computation, decode_execution, decode_sweep_run, decode_value};
use crate::{
    execution_lock_key, map_sqlx_err, with_tx_retry, PgWorkflowStore, TxError,
    ERROR_DETAILS_MAX, RECOMPUTE_LOCK_NS, SWEEP_LOCK_NS,
};

/// Guard applied by the atomic conditional insert of a fresh `not_set`
/// computation.
enum InsertGuard {
    /// Refuse only when a pending row exists.
    PendingOnly,

    /// Refuse when a pending row exists or a success newer than the given
    /// starting revision already landed.
    PendingOrNewerSuccess(Revision),
}

async fn lock_execution(
    conn: &mut PgConnection,
    id: ExecutionId,
) -> Result<ExecutionRecord, TxError> {
    let row = sqlx::query("SELECT * FROM executions WHERE id = $1 FOR UPDATE")
        .bind(id.0)
        .fetch_optional(conn)
        .await?;

    match row {
        Some(row) => Ok(decode_execution(&row)?),
        None => Err(StoreError::ExecutionNotFound(id).into()),
    }
}

async fn bump_revision(
    conn: &mut PgConnection,
    id: ExecutionId,
    now: EpochSecs,
) -> Result<Revision, TxError> {
    let revision: Revision = sqlx::query_scalar(
        "UPDATE executions SET revision = revision + 1, updated_at = $2 \
         WHERE id = $1 RETURNING revision",
    )
    .bind(id.0)
    .bind(now)
    .fetch_one(conn)
    .await?;

    Ok(revision)
}

async fn touch_last_updated(
    conn: &mut PgConnection,
    id: ExecutionId,
    revision: Revision,
    now: EpochSecs,
) -> Result<(), TxError> {
    sqlx::query(
        "UPDATE \"values\" \
         SET node_value = $3, set_time = $4, ex_revision = $5, updated_at = $4 \
         WHERE execution_id = $1 AND node_name = $2",
    )
    .bind(id.0)
    .bind(LAST_UPDATED_AT_NODE)
    .bind(json!(now))
    .bind(now)
    .bind(revision)
    .execute(conn)
    .await?;

    Ok(())
}

async fn load_values(
    conn: &mut PgConnection,
    id: ExecutionId,
) -> Result<HashMap<String, ValueRecord>, TxError> {
    let rows = sqlx::query("SELECT * FROM \"values\" WHERE execution_id = $1")
        .bind(id.0)
        .fetch_all(conn)
        .await?;

    let mut out = HashMap::with_capacity(rows.len());

    for row in &rows {
        let value = decode_value(row)?;
        out.insert(value.node_name.clone(), value);
    }

    Ok(out)
}

async fn load_computations(
    conn: &mut PgConnection,
    id: ExecutionId,
    node: Option<&str>,
) -> Result<Vec<ComputationRecord>, TxError> {
    let rows = match node {
        Some(node) => {
            sqlx::query(
                "SELECT * FROM computations \
                 WHERE execution_id = $1 AND node_name = $2 ORDER BY id",
            )
            .bind(id.0)
            .bind(node)
            .fetch_all(conn)
            .await?
        }
        None => {
            sqlx::query("SELECT * FROM computations WHERE execution_id = $1 ORDER BY id")
                .bind(id.0)
                .fetch_all(conn)
                .await?
        }
    };

    rows.iter()
        .map(|row| decode_computation(row).map_err(TxError::from))
        .collect()
}

/// The single-statement conditional insert from the recompute protocol:
/// immune to the read-committed gap between checking and writing.
async fn insert_not_set(
    conn: &mut PgConnection,
    id: ExecutionId,
    node: &str,
    computation_type: NodeType,
    guard: InsertGuard,
    now: EpochSecs,
) -> Result<bool, TxError> {
    let result = match guard {
        InsertGuard::PendingOnly => {
            sqlx::query(
                "INSERT INTO computations \
                   (execution_id, node_name, computation_type, state, inserted_at, updated_at) \
                 SELECT $1, $2, $3, 'not_set', $4, $4 \
                 WHERE NOT EXISTS ( \
                   SELECT 1 FROM computations \
                   WHERE execution_id = $1 AND node_name = $2 \
                     AND state IN ('not_set', 'computing'))",
            )
            .bind(id.0)
            .bind(node)
            .bind(computation_type.as_str())
            .bind(now)
            .execute(conn)
            .await?
        }
        InsertGuard::PendingOrNewerSuccess(prior) => {
            sqlx::query(
                "INSERT INTO computations \
                   (execution_id, node_name, computation_type, state, inserted_at, updated_at) \
                 SELECT $1, $2, $3, 'not_set', $4, $4 \
                 WHERE NOT EXISTS ( \
                   SELECT 1 FROM computations \
                   WHERE execution_id = $1 AND node_name = $2 \
                     AND (state IN ('not_set', 'computing') \
                          OR (state = 'success' AND ex_revision_at_start > $5)))",
            )
            .bind(id.0)
            .bind(node)
            .bind(computation_type.as_str())
            .bind(now)
            .bind(prior)
            .execute(conn)
            .await?
        }
    };

    Ok(result.rows_affected() > 0)
}

impl WorkflowStore for PgWorkflowStore {
    async fn create_execution(&self, graph: &Graph) -> Result<ExecutionRecord, StoreError> {
        let id = ExecutionId::new();
        let now = now_secs();

        let graph_name = graph.name().to_string();
        let graph_version = graph.version().to_string();

        with_tx_retry!(self, |tx| {
            sqlx::query(
                "INSERT INTO executions \
                   (id, graph_name, graph_version, revision, inserted_at, updated_at) \
                 VALUES ($1, $2, $3, 0, $4, $4)",
            )
            .bind(id.0)
            .bind(&graph_name)
            .bind(&graph_version)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            let insert_value = "INSERT INTO \"values\" \
                 (execution_id, node_name, node_type, node_value, set_time, ex_revision, \
                  inserted_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, 0, $6, $6)";

            sqlx::query(insert_value)
                .bind(id.0)
                .bind(EXECUTION_ID_NODE)
                .bind(NodeType::Input.as_str())
                .bind(json!(id.to_string()))
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;

            sqlx::query(insert_value)
                .bind(id.0)
                .bind(LAST_UPDATED_AT_NODE)
                .bind(NodeType::Input.as_str())
                .bind(json!(now))
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;

            for node in graph.nodes() {
                sqlx::query(insert_value)
                    .bind(id.0)
                    .bind(&node.name)
                    .bind(node.node_type().as_str())
                    .bind(Option::<JsonValue>::None)
                    .bind(Option::<EpochSecs>::None)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
            }

            for node in graph.computable_nodes() {
                sqlx::query(
                    "INSERT INTO computations \
                       (execution_id, node_name, computation_type, state, inserted_at, updated_at) \
                     VALUES ($1, $2, $3, 'not_set', $4, $4)",
                )
                .bind(id.0)
                .bind(&node.name)
                .bind(node.node_type().as_str())
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }

            Ok(ExecutionRecord {
                id,
                graph_name: graph_name.clone(),
                graph_version: graph_version.clone(),
                revision: 0,
                inserted_at: now,
                updated_at: now,
                archived_at: None,
            })
        })
    }

    async fn load_execution(
        &self,
        id: ExecutionId,
        include_archived: bool,
    ) -> Result<Option<ExecutionRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        let execution = row
            .as_ref()
            .map(decode_execution)
            .transpose()
            .map_err(map_sqlx_err)?;

        Ok(execution.filter(|e| include_archived || !e.is_archived()))
    }

    async fn list_executions(
        &self,
        opts: &ListOptions,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        for filter in &opts.filter_by {
            filter.validate()?;
        }

        let mut qb = QueryBuilder::<sqlx::Postgres>::new(
            "SELECT e.* FROM executions e WHERE 1 = 1",
        );

        if !opts.include_archived {
            qb.push(" AND e.archived_at IS NULL");
        }

        if let Some(name) = &opts.graph_name {
            qb.push(" AND e.graph_name = ").push_bind(name);
        }

        if let Some(version) = &opts.graph_version {
            qb.push(" AND e.graph_version = ").push_bind(version);
        }

        for filter in &opts.filter_by {
            push_value_filter(&mut qb, filter);
        }

        qb.push(" ORDER BY ");

        for spec in &opts.sort_by {
            match &spec.key {
                SortKey::InsertedAt => qb.push("e.inserted_at"),
                SortKey::UpdatedAt => qb.push("e.updated_at"),
                SortKey::Revision => qb.push("e.revision"),
                SortKey::GraphName => qb.push("e.graph_name"),
                SortKey::GraphVersion => qb.push("e.graph_version"),
                SortKey::NodeValue(node) => {
                    qb.push("(SELECT v.node_value FROM \"values\" v WHERE v.execution_id = e.id AND v.node_name = ");
                    qb.push_bind(node);
                    qb.push(")")
                }
            };

            qb.push(if spec.descending { " DESC" } else { " ASC" });
            qb.push(", ");
        }

        // stable fallback so pagination is deterministic
        qb.push("e.inserted_at ASC, e.id ASC");

        qb.push(" LIMIT ").push_bind(opts.limit.max(0));
        qb.push(" OFFSET ").push_bind(opts.offset.max(0));

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        rows.iter()
            .map(|row| decode_execution(row).map_err(map_sqlx_err))
            .collect()
    }

    async fn archive_execution(&self, id: ExecutionId) -> Result<ExecutionRecord, StoreError> {
        let now = now_secs();

        with_tx_retry!(self, |tx| {
            let mut execution = lock_execution(&mut tx, id).await?;

            if execution.archived_at.is_none() {
                sqlx::query(
                    "UPDATE executions SET archived_at = $2, updated_at = $2 WHERE id = $1",
                )
                .bind(id.0)
                .bind(now)
                .execute(&mut *tx)
                .await?;

                execution.archived_at = Some(now);
                execution.updated_at = now;
            }

            Ok(execution)
        })
    }

    async fn unarchive_execution(&self, id: ExecutionId) -> Result<ExecutionRecord, StoreError> {
        let now = now_secs();

        with_tx_retry!(self, |tx| {
            let mut execution = lock_execution(&mut tx, id).await?;

            if execution.archived_at.is_some() {
                sqlx::query(
                    "UPDATE executions SET archived_at = NULL, updated_at = $2 WHERE id = $1",
                )
                .bind(id.0)
                .bind(now)
                .execute(&mut *tx)
                .await?;

                execution.archived_at = None;
                execution.updated_at = now;
            }

            Ok(execution)
        })
    }

    async fn set_value(
        &self,
        id: ExecutionId,
        node: &str,
        value: JsonValue,
    ) -> Result<SetOutcome, StoreError> {
        let now = now_secs();

        with_tx_retry!(self, |tx| {
            let mut execution = lock_execution(&mut tx, id).await?;

            let row = sqlx::query(
                "SELECT * FROM \"values\" \
                 WHERE execution_id = $1 AND node_name = $2 FOR UPDATE",
            )
            .bind(id.0)
            .bind(node)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(row) = row else {
                return Err(StoreError::NodeNotFound {
                    execution: id,
                    node: node.to_string(),
                }
                .into());
            };

            let current = decode_value(&row)?;

            if current.is_set() && current.node_value.as_ref() == Some(&value) {
                return Ok(SetOutcome::NoChange(execution));
            }

            let revision = bump_revision(&mut tx, id, now).await?;

            sqlx::query(
                "UPDATE \"values\" \
                 SET node_value = $3, set_time = $4, ex_revision = $5, updated_at = $4 \
                 WHERE execution_id = $1 AND node_name = $2",
            )
            .bind(id.0)
            .bind(node)
            .bind(&value)
            .bind(now)
            .bind(revision)
            .execute(&mut *tx)
            .await?;

            touch_last_updated(&mut tx, id, revision, now).await?;

            execution.revision = revision;
            execution.updated_at = now;

            Ok(SetOutcome::Changed(execution))
        })
    }

    async fn unset_value(&self, id: ExecutionId, node: &str) -> Result<SetOutcome, StoreError> {
        let now = now_secs();

        with_tx_retry!(self, |tx| {
            let mut execution = lock_execution(&mut tx, id).await?;

            let row = sqlx::query(
                "SELECT * FROM \"values\" \
                 WHERE execution_id = $1 AND node_name = $2 FOR UPDATE",
            )
            .bind(id.0)
            .bind(node)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(row) = row else {
                return Err(StoreError::NodeNotFound {
                    execution: id,
                    node: node.to_string(),
                }
                .into());
            };

            let current = decode_value(&row)?;

            if !current.is_set() {
                return Ok(SetOutcome::NoChange(execution));
            }

            let revision = bump_revision(&mut tx, id, now).await?;

            sqlx::query(
                "UPDATE \"values\" \
                 SET node_value = NULL, set_time = NULL, ex_revision = $3, updated_at = $4 \
                 WHERE execution_id = $1 AND node_name = $2",
            )
            .bind(id.0)
            .bind(node)
            .bind(revision)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            touch_last_updated(&mut tx, id, revision, now).await?;

            execution.revision = revision;
            execution.updated_at = now;

            Ok(SetOutcome::Changed(execution))
        })
    }

    async fn load_values(
        &self,
        id: ExecutionId,
    ) -> Result<HashMap<String, ValueRecord>, StoreError> {
        with_tx_retry!(self, |tx| {
            // existence check first so unknown executions error out
            let row = sqlx::query("SELECT id FROM executions WHERE id = $1")
                .bind(id.0)
                .fetch_optional(&mut *tx)
                .await?;

            if row.is_none() {
                return Err(StoreError::ExecutionNotFound(id).into());
            }

            load_values(&mut tx, id).await
        })
    }

    async fn load_value(
        &self,
        id: ExecutionId,
        node: &str,
    ) -> Result<Option<ValueRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM \"values\" WHERE execution_id = $1 AND node_name = $2",
        )
        .bind(id.0)
        .bind(node)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        row.as_ref()
            .map(decode_value)
            .transpose()
            .map_err(map_sqlx_err)
    }

    async fn load_computations(
        &self,
        id: ExecutionId,
        node: Option<&str>,
    ) -> Result<Vec<ComputationRecord>, StoreError> {
        with_tx_retry!(self, |tx| { load_computations(&mut tx, id, node).await })
    }

    async fn run_invalidation_pass(
        &self,
        id: ExecutionId,
        graph: &Graph,
        now: EpochSecs,
    ) -> Result<usize, StoreError> {
        with_tx_retry!(self, |tx| {
            lock_execution(&mut tx, id).await?;

            let snapshot = load_values(&mut tx, id).await?;
            let candidates = rules::invalidation_candidates(graph, &snapshot, now);

            for name in &candidates {
                let revision = bump_revision(&mut tx, id, now).await?;

                sqlx::query(
                    "UPDATE \"values\" \
                     SET node_value = NULL, set_time = NULL, ex_revision = $3, updated_at = $4 \
                     WHERE execution_id = $1 AND node_name = $2",
                )
                .bind(id.0)
                .bind(name)
                .bind(revision)
                .bind(now)
                .execute(&mut *tx)
                .await?;

                let computation_type = graph
                    .node(name)
                    .map(|n| n.node_type())
                    .unwrap_or(NodeType::Compute);

                insert_not_set(&mut tx, id, name, computation_type, InsertGuard::PendingOnly, now)
                    .await?;

                touch_last_updated(&mut tx, id, revision, now).await?;
            }

            Ok(candidates.len())
        })
    }

    async fn enqueue_stale_recomputations(
        &self,
        id: ExecutionId,
        graph: &Graph,
        now: EpochSecs,
    ) -> Result<usize, StoreError> {
        with_tx_retry!(self, |tx| {
            // serialize recompute detection per execution; record_success
            // races are handled by the conditional insert itself
            sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
                .bind(RECOMPUTE_LOCK_NS)
                .bind(execution_lock_key(id))
                .execute(&mut *tx)
                .await?;

            let snapshot = load_values(&mut tx, id).await?;
            let computations = load_computations(&mut tx, id, None).await?;

            let stale = rules::stale_nodes(graph, &snapshot, &computations, now);

            let mut inserted = 0;

            for candidate in stale {
                let computation_type = graph
                    .node(&candidate.node)
                    .map(|n| n.node_type())
                    .unwrap_or(NodeType::Compute);

                let done = insert_not_set(
                    &mut tx,
                    id,
                    &candidate.node,
                    computation_type,
                    InsertGuard::PendingOrNewerSuccess(candidate.prior_start_revision),
                    now,
                )
                .await?;

                if done {
                    inserted += 1;
                }
            }

            // failed-out nodes whose upstream revisions advanced
            for name in rules::retryable_failed_nodes(graph, &snapshot, &computations, now) {
                let computation_type = graph
                    .node(&name)
                    .map(|n| n.node_type())
                    .unwrap_or(NodeType::Compute);

                let done = insert_not_set(
                    &mut tx,
                    id,
                    &name,
                    computation_type,
                    InsertGuard::PendingOnly,
                    now,
                )
                .await?;

                if done {
                    inserted += 1;
                }
            }

            Ok(inserted)
        })
    }

    async fn claim_ready(
        &self,
        id: ExecutionId,
        graph: &Graph,
        now: EpochSecs,
    ) -> Result<Vec<ClaimedComputation>, StoreError> {
        with_tx_retry!(self, |tx| {
            let mut execution = lock_execution(&mut tx, id).await?;

            if execution.is_archived() {
                return Ok(vec![]);
            }

            let candidate_rows = sqlx::query(
                "SELECT * FROM computations \
                 WHERE execution_id = $1 AND state = 'not_set' \
                 ORDER BY id FOR UPDATE",
            )
            .bind(id.0)
            .fetch_all(&mut *tx)
            .await?;

            let candidates: Vec<ComputationRecord> = candidate_rows
                .iter()
                .map(decode_computation)
                .collect::<Result<_, _>>()?;

            let snapshot = load_values(&mut tx, id).await?;

            let mut claimed = vec![];

            for mut computation in candidates {
                let Some(node) = graph.node(&computation.node_name) else {
                    continue;
                };

                let readiness =
                    evaluate_opt(node.gated_by.as_ref(), &snapshot, EvalMode::Computation, now);

                if !readiness.ready {
                    continue;
                }

                let revision = bump_revision(&mut tx, id, now).await?;
                let deadline = now + node.abandon_after_seconds;

                sqlx::query(
                    "UPDATE computations \
                     SET state = 'computing', start_time = $2, ex_revision_at_start = $3, \
                         deadline = $4, updated_at = $2 \
                     WHERE id = $1",
                )
                .bind(computation.id.0)
                .bind(now)
                .bind(revision)
                .bind(deadline)
                .execute(&mut *tx)
                .await?;

                computation.state = ComputationState::Computing;
                computation.start_time = Some(now);
                computation.ex_revision_at_start = Some(revision);
                computation.deadline = Some(deadline);
                computation.updated_at = now;

                execution.revision = revision;
                execution.updated_at = now;

                claimed.push(ClaimedComputation {
                    computation,
                    execution: execution.clone(),
                    snapshot: snapshot.clone(),
                    conditions_met: readiness.conditions_met,
                });
            }

            Ok(claimed)
        })
    }

    async fn record_success(
        &self,
        computation: ComputationId,
        plan: &SuccessPlan,
        now: EpochSecs,
    ) -> Result<SuccessOutcome, StoreError> {
        let computed_with =
            serde_json::to_value(&plan.computed_with).map_err(StoreError::from)?;

        with_tx_retry!(self, |tx| {
            let row = sqlx::query("SELECT * FROM computations WHERE id = $1 FOR UPDATE")
                .bind(computation.0)
                .fetch_optional(&mut *tx)
                .await?;

            let Some(row) = row else {
                return Err(StoreError::ComputationNotFound(computation).into());
            };

            let current = decode_computation(&row)?;

            if current.state != ComputationState::Computing {
                return Ok(SuccessOutcome::Dropped);
            }

            let id = current.execution_id;
            let mut execution = lock_execution(&mut tx, id).await?;
            let snapshot = load_values(&mut tx, id).await?;

            let applied: Vec<_> = plan
                .writes
                .iter()
                .filter(|write| {
                    let unchanged = snapshot
                        .get(&write.node)
                        .map(|row| {
                            row.is_set() && row.node_value.as_ref() == Some(&write.value)
                        })
                        .unwrap_or(false);

                    !(write.mode == WriteMode::BumpIfChanged && unchanged)
                })
                .cloned()
                .collect();

            let needs_bump = applied.iter().any(|w| w.mode != WriteMode::NoBump);

            let revision = if needs_bump {
                bump_revision(&mut tx, id, now).await?
            } else {
                execution.revision
            };

            for write in &applied {
                match write.mode {
                    WriteMode::NoBump => {
                        sqlx::query(
                            "UPDATE \"values\" \
                             SET node_value = $3, set_time = $4, updated_at = $4 \
                             WHERE execution_id = $1 AND node_name = $2",
                        )
                        .bind(id.0)
                        .bind(&write.node)
                        .bind(&write.value)
                        .bind(now)
                        .execute(&mut *tx)
                        .await?
                    }
                    _ => {
                        sqlx::query(
                            "UPDATE \"values\" \
                             SET node_value = $3, set_time = $4, ex_revision = $5, \
                                 updated_at = $4 \
                             WHERE execution_id = $1 AND node_name = $2",
                        )
                        .bind(id.0)
                        .bind(&write.node)
                        .bind(&write.value)
                        .bind(now)
                        .bind(revision)
                        .execute(&mut *tx)
                        .await?
                    }
                };
            }

            if needs_bump {
                touch_last_updated(&mut tx, id, revision, now).await?;
                execution.revision = revision;
                execution.updated_at = now;
            }

            if plan.archive_execution && execution.archived_at.is_none() {
                sqlx::query(
                    "UPDATE executions SET archived_at = $2, updated_at = $2 WHERE id = $1",
                )
                .bind(id.0)
                .bind(now)
                .execute(&mut *tx)
                .await?;

                execution.archived_at = Some(now);
                execution.updated_at = now;
            }

            sqlx::query(
                "UPDATE computations \
                 SET state = 'success', completion_time = $2, ex_revision_at_completion = $3, \
                     computed_with = $4, updated_at = $2 \
                 WHERE id = $1",
            )
            .bind(computation.0)
            .bind(now)
            .bind(revision)
            .bind(&computed_with)
            .execute(&mut *tx)
            .await?;

            let saved = applied
                .iter()
                .map(|w| (w.node.clone(), w.value.clone()))
                .collect();

            Ok(SuccessOutcome::Recorded { execution, saved })
        })
    }

    async fn record_failure(
        &self,
        computation: ComputationId,
        node: &Node,
        error: &str,
        now: EpochSecs,
    ) -> Result<FailureOutcome, StoreError> {
        let truncated: String = error.chars().take(ERROR_DETAILS_MAX).collect();

        with_tx_retry!(self, |tx| {
            let row = sqlx::query("SELECT * FROM computations WHERE id = $1 FOR UPDATE")
                .bind(computation.0)
                .fetch_optional(&mut *tx)
                .await?;

            let Some(row) = row else {
                return Err(StoreError::ComputationNotFound(computation).into());
            };

            let current = decode_computation(&row)?;

            if current.state != ComputationState::Computing {
                return Ok(FailureOutcome {
                    retry_scheduled: false,
                });
            }

            let id = current.execution_id;

            sqlx::query(
                "UPDATE computations \
                 SET state = 'failed', error_details = $2, completion_time = $3, updated_at = $3 \
                 WHERE id = $1",
            )
            .bind(computation.0)
            .bind(&truncated)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            let snapshot = load_values(&mut tx, id).await?;
            let history = load_computations(&mut tx, id, Some(&node.name)).await?;

            let mut retry_scheduled = false;

            if rules::should_retry(node, &history, &snapshot, now) {
                retry_scheduled = insert_not_set(
                    &mut tx,
                    id,
                    &node.name,
                    current.computation_type,
                    InsertGuard::PendingOnly,
                    now,
                )
                .await?;
            }

            Ok(FailureOutcome { retry_scheduled })
        })
    }

    async fn schedule_retry(
        &self,
        id: ExecutionId,
        node: &Node,
        now: EpochSecs,
    ) -> Result<bool, StoreError> {
        with_tx_retry!(self, |tx| {
            let snapshot = load_values(&mut tx, id).await?;
            let history = load_computations(&mut tx, id, Some(&node.name)).await?;

            if !rules::should_retry(node, &history, &snapshot, now) {
                return Ok(false);
            }

            insert_not_set(
                &mut tx,
                id,
                &node.name,
                node.node_type(),
                InsertGuard::PendingOnly,
                now,
            )
            .await
        })
    }

    async fn beat(
        &self,
        computation: ComputationId,
        timeout_seconds: i64,
        buffer_seconds: i64,
        now: EpochSecs,
    ) -> Result<HeartbeatOutcome, StoreError> {
        with_tx_retry!(self, |tx| {
            let updated = sqlx::query(
                "UPDATE computations \
                 SET last_heartbeat_at = $2, heartbeat_deadline = $3, updated_at = $2 \
                 WHERE id = $1 AND state = 'computing' AND deadline > $4",
            )
            .bind(computation.0)
            .bind(now)
            .bind(now + timeout_seconds)
            .bind(now - buffer_seconds)
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() > 0 {
                return Ok(HeartbeatOutcome::Extended);
            }

            let row = sqlx::query("SELECT * FROM computations WHERE id = $1 FOR UPDATE")
                .bind(computation.0)
                .fetch_optional(&mut *tx)
                .await?;

            let Some(row) = row else {
                return Err(StoreError::ComputationNotFound(computation).into());
            };

            let current = decode_computation(&row)?;

            match current.state {
                ComputationState::Abandoned => Ok(HeartbeatOutcome::AlreadyAbandoned),
                ComputationState::Computing => {
                    sqlx::query(
                        "UPDATE computations \
                         SET state = 'abandoned', completion_time = $2, updated_at = $2 \
                         WHERE id = $1",
                    )
                    .bind(computation.0)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;

                    Ok(HeartbeatOutcome::MarkedAbandoned)
                }
                _ => Ok(HeartbeatOutcome::Terminal),
            }
        })
    }

    async fn last_sweep_started_at(
        &self,
        sweep_type: SweepType,
    ) -> Result<Option<EpochSecs>, StoreError> {
        sqlx::query_scalar("SELECT MAX(started_at) FROM sweep_runs WHERE sweep_type = $1")
            .bind(sweep_type.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_err)
    }

    async fn last_completed_sweep_started_at(
        &self,
        sweep_type: SweepType,
    ) -> Result<Option<EpochSecs>, StoreError> {
        sqlx::query_scalar(
            "SELECT MAX(started_at) FROM sweep_runs \
             WHERE sweep_type = $1 AND completed_at IS NOT NULL",
        )
        .bind(sweep_type.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)
    }

    async fn begin_sweep(
        &self,
        sweep_type: SweepType,
        min_seconds_between_runs: i64,
        now: EpochSecs,
    ) -> Result<Option<i64>, StoreError> {
        with_tx_retry!(self, |tx| {
            // cluster-wide singleton per sweep type
            sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
                .bind(SWEEP_LOCK_NS)
                .bind(sweep_type.lock_key())
                .execute(&mut *tx)
                .await?;

            let last: Option<EpochSecs> = sqlx::query_scalar(
                "SELECT MAX(started_at) FROM sweep_runs WHERE sweep_type = $1",
            )
            .bind(sweep_type.as_str())
            .fetch_one(&mut *tx)
            .await?;

            if let Some(last) = last {
                if now - last <= min_seconds_between_runs {
                    return Ok(None);
                }
            }

            let id: i64 = sqlx::query_scalar(
                "INSERT INTO sweep_runs (sweep_type, started_at, executions_processed) \
                 VALUES ($1, $2, 0) RETURNING id",
            )
            .bind(sweep_type.as_str())
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;

            Ok(Some(id))
        })
    }

    async fn complete_sweep(
        &self,
        run: i64,
        executions_processed: i64,
        now: EpochSecs,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE sweep_runs SET completed_at = $2, executions_processed = $3 WHERE id = $1",
        )
        .bind(run)
        .bind(now)
        .bind(executions_processed)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(())
    }

    async fn sweep_runs(
        &self,
        sweep_type: Option<SweepType>,
    ) -> Result<Vec<SweepRun>, StoreError> {
        let rows = match sweep_type {
            Some(sweep_type) => {
                sqlx::query("SELECT * FROM sweep_runs WHERE sweep_type = $1 ORDER BY id")
                    .bind(sweep_type.as_str())
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM sweep_runs ORDER BY id")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(map_sqlx_err)?;

        rows.iter()
            .map(|row| decode_sweep_run(row).map_err(map_sqlx_err))
            .collect()
    }

    async fn mark_abandoned_computations(
        &self,
        now: EpochSecs,
    ) -> Result<Vec<(ExecutionId, String)>, StoreError> {
        with_tx_retry!(self, |tx| {
            let rows = sqlx::query(
                "UPDATE computations c \
                 SET state = 'abandoned', completion_time = $1, updated_at = $1 \
                 FROM executions e \
                 WHERE e.id = c.execution_id \
                   AND e.archived_at IS NULL \
                   AND c.state = 'computing' \
                   AND ((c.heartbeat_deadline IS NOT NULL AND c.heartbeat_deadline < $1) \
                        OR (c.heartbeat_deadline IS NULL \
                            AND c.deadline IS NOT NULL AND c.deadline < $1)) \
                 RETURNING c.execution_id, c.node_name",
            )
            .bind(now)
            .fetch_all(&mut *tx)
            .await?;

            let mut out = vec![];

            for row in rows {
                out.push((
                    ExecutionId(row.try_get("execution_id")?),
                    row.try_get("node_name")?,
                ));
            }

            Ok(out)
        })
    }

    async fn executions_with_pending_schedules(
        &self,
        cutoff: EpochSecs,
    ) -> Result<Vec<ExecutionId>, StoreError> {
        let rows = sqlx::query_scalar::<_, uuid::Uuid>(
            "SELECT DISTINCT e.id FROM executions e \
             JOIN computations c ON c.execution_id = e.id \
             WHERE e.archived_at IS NULL \
               AND e.updated_at >= $1 \
               AND c.state = 'not_set' \
               AND c.computation_type IN ('schedule_once', 'schedule_recurring')",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(rows.into_iter().map(ExecutionId).collect())
    }

    async fn executions_unblocked_by_schedule(
        &self,
        window_start: EpochSecs,
        window_end: EpochSecs,
    ) -> Result<Vec<ExecutionId>, StoreError> {
        // the filter is the pulse itself (node_value), not set_time
        let rows = sqlx::query_scalar::<_, uuid::Uuid>(
            "SELECT DISTINCT e.id FROM executions e \
             JOIN \"values\" v ON v.execution_id = e.id \
             WHERE e.archived_at IS NULL \
               AND v.node_type IN ('schedule_once', 'schedule_recurring') \
               AND v.set_time IS NOT NULL \
               AND jsonb_typeof(v.node_value) = 'number' \
               AND (v.node_value #>> '{}')::bigint >= $1 \
               AND (v.node_value #>> '{}')::bigint < $2",
        )
        .bind(window_start)
        .bind(window_end)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(rows.into_iter().map(ExecutionId).collect())
    }

    async fn executions_with_missed_schedules(
        &self,
        window_start: EpochSecs,
        window_end: EpochSecs,
    ) -> Result<Vec<ExecutionId>, StoreError> {
        let rows = sqlx::query_scalar::<_, uuid::Uuid>(
            "SELECT DISTINCT e.id FROM executions e \
             JOIN \"values\" v ON v.execution_id = e.id \
             WHERE e.archived_at IS NULL \
               AND v.node_type IN ('schedule_once', 'schedule_recurring') \
               AND v.set_time IS NOT NULL \
               AND jsonb_typeof(v.node_value) = 'number' \
               AND (v.node_value #>> '{}')::bigint >= $1 \
               AND (v.node_value #>> '{}')::bigint < $2 \
               AND EXISTS ( \
                 SELECT 1 FROM computations c \
                 WHERE c.execution_id = e.id AND c.state = 'not_set')",
        )
        .bind(window_start)
        .bind(window_end)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(rows.into_iter().map(ExecutionId).collect())
    }

    async fn stalled_executions(
        &self,
        idle_cutoff: EpochSecs,
    ) -> Result<Vec<ExecutionId>, StoreError> {
        let rows = sqlx::query_scalar::<_, uuid::Uuid>(
            "SELECT e.id FROM executions e \
             WHERE e.archived_at IS NULL \
               AND e.updated_at < $1 \
               AND EXISTS ( \
                 SELECT 1 FROM computations c \
                 WHERE c.execution_id = e.id AND c.state = 'not_set')",
        )
        .bind(idle_cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(rows.into_iter().map(ExecutionId).collect())
    }

    async fn regenerate_recurring_schedules(&self, now: EpochSecs) -> Result<usize, StoreError> {
        with_tx_retry!(self, |tx| {
            let due = sqlx::query(
                "SELECT v.execution_id, v.node_name FROM \"values\" v \
                 JOIN executions e ON e.id = v.execution_id \
                 WHERE e.archived_at IS NULL \
                   AND v.node_type = 'schedule_recurring' \
                   AND v.set_time IS NOT NULL \
                   AND jsonb_typeof(v.node_value) = 'number' \
                   AND (v.node_value #>> '{}')::bigint <= $1 \
                   AND NOT EXISTS ( \
                     SELECT 1 FROM computations c \
                     WHERE c.execution_id = v.execution_id \
                       AND c.node_name = v.node_name \
                       AND c.state IN ('not_set', 'computing'))",
            )
            .bind(now)
            .fetch_all(&mut *tx)
            .await?;

            let mut enqueued = 0;

            for row in due {
                let id = ExecutionId(row.try_get("execution_id")?);
                let node: String = row.try_get("node_name")?;

                let done = insert_not_set(
                    &mut tx,
                    id,
                    &node,
                    NodeType::ScheduleRecurring,
                    InsertGuard::PendingOnly,
                    now,
                )
                .await?;

                if done {
                    sqlx::query("UPDATE executions SET updated_at = $2 WHERE id = $1")
                        .bind(id.0)
                        .bind(now)
                        .execute(&mut *tx)
                        .await?;

                    enqueued += 1;
                }
            }

            Ok(enqueued)
        })
    }
}

fn push_value_filter(qb: &mut QueryBuilder<'_, sqlx::Postgres>, filter: &rill_core::ValueFilter) {
    match (&filter.op, &filter.operand) {
        (FilterOp::IsNil, _) => {
            qb.push(" AND NOT EXISTS (SELECT 1 FROM \"values\" v WHERE v.execution_id = e.id AND v.node_name = ");
            qb.push_bind(filter.node.clone());
            qb.push(" AND v.node_value IS NOT NULL)");
        }
        (FilterOp::IsNotNil, _) => {
            qb.push(" AND EXISTS (SELECT 1 FROM \"values\" v WHERE v.execution_id = e.id AND v.node_name = ");
            qb.push_bind(filter.node.clone());
            qb.push(" AND v.node_value IS NOT NULL)");
        }
        (op, FilterOperand::One(operand)) => {
            let cmp = match op {
                FilterOp::Eq => "=",
                FilterOp::Neq => "<>",
                FilterOp::Lt => "<",
                FilterOp::Lte => "<=",
                FilterOp::Gt => ">",
                FilterOp::Gte => ">=",
                _ => return,
            };

            qb.push(" AND EXISTS (SELECT 1 FROM \"values\" v WHERE v.execution_id = e.id AND v.node_name = ");
            qb.push_bind(filter.node.clone());
            qb.push(" AND v.node_value IS NOT NULL AND v.node_value ");
            qb.push(cmp);
            qb.push(" ");
            qb.push_bind(operand.clone());
            qb.push(")");
        }
        (op @ (FilterOp::In | FilterOp::NotIn), FilterOperand::Many(operands)) => {
            let negate = matches!(op, FilterOp::NotIn);

            qb.push(" AND EXISTS (SELECT 1 FROM \"values\" v WHERE v.execution_id = e.id AND v.node_name = ");
            qb.push_bind(filter.node.clone());
            qb.push(" AND v.node_value IS NOT NULL AND ");

            if negate {
                qb.push("NOT ");
            }

            qb.push("(");
            qb.push_bind(JsonValue::Array(operands.clone()));
            qb.push(" @> v.node_value))");
        }
        _ => {}
    }
}
