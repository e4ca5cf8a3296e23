//! The advance loop: one fixed-point step over an execution.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::prelude::*;

use super::worker;

/// Drive one cycle: invalidate stale values, enqueue recomputations, claim
/// ready computations and launch workers for them.
///
/// Safe to call from many tasks concurrently; the store's row locks and
/// conditional transitions guarantee each computation is claimed at most
/// once. Archived executions and executions whose graph is no longer
/// registered are skipped.
pub async fn advance<D: Domain>(domain: &D, id: ExecutionId) -> Result<(), Error> {
    let store = domain.store();

    let Some(execution) = store.load_execution(id, true).await? else {
        tracing::warn!(execution = %id, "advance on unknown execution");
        return Ok(());
    };

    if execution.is_archived() {
        return Ok(());
    }

    let Some(graph) = domain.graph_for(&execution) else {
        tracing::warn!(
            execution = %id,
            graph = %execution.graph_name,
            version = %execution.graph_version,
            "graph not registered, skipping advance"
        );
        return Ok(());
    };

    // invalidation runs to quiescence: clearing one value can unsatisfy
    // another gate
    loop {
        let cleared = store
            .run_invalidation_pass(id, &graph, now_secs())
            .await?;

        if cleared == 0 {
            break;
        }

        tracing::debug!(execution = %id, cleared, "invalidation pass");
    }

    let enqueued = store
        .enqueue_stale_recomputations(id, &graph, now_secs())
        .await?;

    if enqueued > 0 {
        tracing::debug!(execution = %id, enqueued, "enqueued recomputations");
    }

    let claimed = store.claim_ready(id, &graph, now_secs()).await?;

    for claim in claimed {
        tracing::debug!(
            execution = %id,
            node = %claim.computation.node_name,
            computation = %claim.computation.id,
            "claimed computation"
        );

        worker::spawn(domain, graph.clone(), claim);
    }

    Ok(())
}

/// Type-erased advance so worker futures can invoke it without creating a
/// recursive future type through `tokio::spawn`.
pub(crate) fn advance_boxed<D: Domain>(domain: D, id: ExecutionId) -> BoxFuture<'static, ()> {
    async move {
        if let Err(err) = advance(&domain, id).await {
            tracing::warn!(execution = %id, err = %err, "advance failed");
        }
    }
    .boxed()
}
