use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use rill_pg::PgWorkflowStore;

use crate::prelude::*;

/// Process-wide wiring: a store backend, the graph catalog and the runtime
/// configuration, shared by cheap clone.
#[derive(Clone)]
pub struct Runtime<S: WorkflowStore> {
    store: S,
    catalog: GraphCatalog,
    config: Arc<RuntimeConfig>,
}

impl<S: WorkflowStore> Runtime<S> {
    pub fn new(store: S, catalog: GraphCatalog, config: RuntimeConfig) -> Self {
        Self {
            store,
            catalog,
            config: Arc::new(config),
        }
    }
}

impl<S: WorkflowStore> Domain for Runtime<S> {
    type Store = S;

    fn store(&self) -> &S {
        &self.store
    }

    fn catalog(&self) -> &GraphCatalog {
        &self.catalog
    }

    fn runtime(&self) -> &RuntimeConfig {
        &self.config
    }
}

/// The production runtime: engine over the PostgreSQL backend.
pub type PgRuntime = Runtime<StoreAdapter>;

/// A persistent store for workflow state.
#[derive(Clone)]
#[non_exhaustive]
pub enum StoreAdapter {
    Pg(PgWorkflowStore),
}

impl WorkflowStore for StoreAdapter {
    async fn create_execution(&self, graph: &Graph) -> Result<ExecutionRecord, StoreError> {
        let out = match self {
            StoreAdapter::Pg(x) => x.create_execution(graph).await?,
        };

        Ok(out)
    }

    async fn load_execution(
        &self,
        id: ExecutionId,
        include_archived: bool,
    ) -> Result<Option<ExecutionRecord>, StoreError> {
        let out = match self {
            StoreAdapter::Pg(x) => x.load_execution(id, include_archived).await?,
        };

        Ok(out)
    }

    async fn list_executions(
        &self,
        opts: &ListOptions,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let out = match self {
            StoreAdapter::Pg(x) => x.list_executions(opts).await?,
        };

        Ok(out)
    }

    async fn archive_execution(&self, id: ExecutionId) -> Result<ExecutionRecord, StoreError> {
        let out = match self {
            StoreAdapter::Pg(x) => x.archive_execution(id).await?,
        };

        Ok(out)
    }

    async fn unarchive_execution(&self, id: ExecutionId) -> Result<ExecutionRecord, StoreError> {
        let out = match self {
            StoreAdapter::Pg(x) => x.unarchive_execution(id).await?,
        };

        Ok(out)
    }

    async fn set_value(
        &self,
        id: ExecutionId,
        node: &str,
        value: JsonValue,
    ) -> Result<SetOutcome, StoreError> {
        let out = match self {
            StoreAdapter::Pg(x) => x.set_value(id, node, value).await?,
        };

        Ok(out)
    }

    async fn unset_value(&self, id: ExecutionId, node: &str) -> Result<SetOutcome, StoreError> {
        let out = match self {
            StoreAdapter::Pg(x) => x.unset_value(id, node).await?,
        };

        Ok(out)
    }

    async fn load_values(
        &self,
        id: ExecutionId,
    ) -> Result<HashMap<String, ValueRecord>, StoreError> {
        let out = match self {
            StoreAdapter::Pg(x) => x.load_values(id).await?,
        };

        Ok(out)
    }

    async fn load_value(
        &self,
        id: ExecutionId,
        node: &str,
    ) -> Result<Option<ValueRecord>, StoreError> {
        let out = match self {
            StoreAdapter::Pg(x) => x.load_value(id, node).await?,
        };

        Ok(out)
    }

    async fn load_computations(
        &self,
        id: ExecutionId,
        node: Option<&str>,
    ) -> Result<Vec<ComputationRecord>, StoreError> {
        let out = match self {
            StoreAdapter::Pg(x) => x.load_computations(id, node).await?,
        };

        Ok(out)
    }

    async fn run_invalidation_pass(
        &self,
        id: ExecutionId,
        graph: &Graph,
        now: EpochSecs,
    ) -> Result<usize, StoreError> {
        let out = match self {
            StoreAdapter::Pg(x) => x.run_invalidation_pass(id, graph, now).await?,
        };

        Ok(out)
    }

    async fn enqueue_stale_recomputations(
        &self,
        id: ExecutionId,
        graph: &Graph,
        now: EpochSecs,
    ) -> Result<usize, StoreError> {
        let out = match self {
            StoreAdapter::Pg(x) => x.enqueue_stale_recomputations(id, graph, now).await?,
        };

        Ok(out)
    }

    async fn claim_ready(
        &self,
        id: ExecutionId,
        graph: &Graph,
        now: EpochSecs,
    ) -> Result<Vec<ClaimedComputation>, StoreError> {
        let out = match self {
            StoreAdapter::Pg(x) => x.claim_ready(id, graph, now).await?,
        };

        Ok(out)
    }

    async fn record_success(
        &self,
        computation: ComputationId,
        plan: &SuccessPlan,
        now: EpochSecs,
    ) -> Result<SuccessOutcome, StoreError> {
        let out = match self {
            StoreAdapter::Pg(x) => x.record_success(computation, plan, now).await?,
        };

        Ok(out)
    }

    async fn record_failure(
        &self,
        computation: ComputationId,
        node: &Node,
        error: &str,
        now: EpochSecs,
    ) -> Result<FailureOutcome, StoreError> {
        let out = match self {
            StoreAdapter::Pg(x) => x.record_failure(computation, node, error, now).await?,
        };

        Ok(out)
    }

    async fn beat(
        &self,
        computation: ComputationId,
        timeout_seconds: i64,
        buffer_seconds: i64,
        now: EpochSecs,
    ) -> Result<HeartbeatOutcome, StoreError> {
        let out = match self {
            StoreAdapter::Pg(x) => {
                x.beat(computation, timeout_seconds, buffer_seconds, now).await?
            }
        };

        Ok(out)
    }

    async fn last_sweep_started_at(
        &self,
        sweep_type: SweepType,
    ) -> Result<Option<EpochSecs>, StoreError> {
        let out = match self {
            StoreAdapter::Pg(x) => x.last_sweep_started_at(sweep_type).await?,
        };

        Ok(out)
    }

    async fn last_completed_sweep_started_at(
        &self,
        sweep_type: SweepType,
    ) -> Result<Option<EpochSecs>, StoreError> {
        let out = match self {
            StoreAdapter::Pg(x) => x.last_completed_sweep_started_at(sweep_type).await?,
        };

        Ok(out)
    }

    async fn begin_sweep(
        &self,
        sweep_type: SweepType,
        min_seconds_between_runs: i64,
        now: EpochSecs,
    ) -> Result<Option<i64>, StoreError> {
        let out = match self {
            StoreAdapter::Pg(x) => {
                x.begin_sweep(sweep_type, min_seconds_between_runs, now).await?
            }
        };

        Ok(out)
    }

    async fn complete_sweep(
        &self,
        run: i64,
        executions_processed: i64,
        now: EpochSecs,
    ) -> Result<(), StoreError> {
        match self {
            StoreAdapter::Pg(x) => x.complete_sweep(run, executions_processed, now).await?,
        }

        Ok(())
    }

    async fn sweep_runs(
        &self,
        sweep_type: Option<SweepType>,
    ) -> Result<Vec<SweepRun>, StoreError> {
        let out = match self {
            StoreAdapter::Pg(x) => x.sweep_runs(sweep_type).await?,
        };

        Ok(out)
    }

    async fn mark_abandoned_computations(
        &self,
        now: EpochSecs,
    ) -> Result<Vec<(ExecutionId, String)>, StoreError> {
        let out = match self {
            StoreAdapter::Pg(x) => x.mark_abandoned_computations(now).await?,
        };

        Ok(out)
    }

    async fn schedule_retry(
        &self,
        id: ExecutionId,
        node: &Node,
        now: EpochSecs,
    ) -> Result<bool, StoreError> {
        let out = match self {
            StoreAdapter::Pg(x) => x.schedule_retry(id, node, now).await?,
        };

        Ok(out)
    }

    async fn executions_with_pending_schedules(
        &self,
        cutoff: EpochSecs,
    ) -> Result<Vec<ExecutionId>, StoreError> {
        let out = match self {
            StoreAdapter::Pg(x) => x.executions_with_pending_schedules(cutoff).await?,
        };

        Ok(out)
    }

    async fn executions_unblocked_by_schedule(
        &self,
        window_start: EpochSecs,
        window_end: EpochSecs,
    ) -> Result<Vec<ExecutionId>, StoreError> {
        let out = match self {
            StoreAdapter::Pg(x) => {
                x.executions_unblocked_by_schedule(window_start, window_end).await?
            }
        };

        Ok(out)
    }

    async fn executions_with_missed_schedules(
        &self,
        window_start: EpochSecs,
        window_end: EpochSecs,
    ) -> Result<Vec<ExecutionId>, StoreError> {
        let out = match self {
            StoreAdapter::Pg(x) => {
                x.executions_with_missed_schedules(window_start, window_end).await?
            }
        };

        Ok(out)
    }

    async fn stalled_executions(
        &self,
        idle_cutoff: EpochSecs,
    ) -> Result<Vec<ExecutionId>, StoreError> {
        let out = match self {
            StoreAdapter::Pg(x) => x.stalled_executions(idle_cutoff).await?,
        };

        Ok(out)
    }

    async fn regenerate_recurring_schedules(&self, now: EpochSecs) -> Result<usize, StoreError> {
        let out = match self {
            StoreAdapter::Pg(x) => x.regenerate_recurring_schedules(now).await?,
        };

        Ok(out)
    }
}
