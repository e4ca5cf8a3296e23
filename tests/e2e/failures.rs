//! Failure lifecycle: user errors, retries, abandonment and permanent
//! failure surfacing through `get_value`.

use std::time::Duration;

use serde_json::json;

use rill::adapters::Runtime;
use rill::engine::{self, GetOpts};
use rill::prelude::*;
use rill::sweep;
use rill_testing::{failing_graph, slow_graph, MemoryStore};

fn runtime(graphs: Vec<Graph>) -> Runtime<MemoryStore> {
    Runtime::new(
        MemoryStore::new(),
        GraphCatalog::from_graphs(graphs),
        RuntimeConfig::default(),
    )
}

fn eager_settings() -> SweepSettings {
    SweepSettings {
        enabled: true,
        min_seconds_between_runs: 0,
        preferred_hour: None,
        lookback_days: None,
    }
}

#[tokio::test]
async fn failing_compute_retries_until_exhausted() {
    let graph = failing_graph(3);
    let rt = runtime(vec![graph.clone()]);
    let store = rt.store().clone();

    let e = engine::start_execution(&rt, &graph).await.unwrap();
    engine::set_value(&rt, e.id, "x", json!(1)).await.unwrap();

    // retries are scheduled from inside the failure transaction, so the
    // chain runs itself dry without any sweeper
    let mut exhausted = false;

    for _ in 0..100 {
        let comps = store.dump_computations();
        let failed = comps
            .iter()
            .filter(|c| c.node_name == "boom" && c.state == ComputationState::Failed)
            .count();
        let pending = comps
            .iter()
            .filter(|c| c.node_name == "boom" && c.state.is_pending())
            .count();

        if failed == 3 && pending == 0 {
            exhausted = true;
            break;
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert!(exhausted, "three attempts then nothing pending");

    let read = engine::get_value(
        &rt,
        e.id,
        "boom",
        GetOpts::wait_any(Duration::from_secs(2)),
    )
    .await;

    assert!(matches!(read, Err(Error::ComputationFailed)));
}

#[tokio::test]
async fn error_details_are_truncated() {
    let graph = Graph::new(
        "verbose",
        "v1",
        vec![
            graph::input("x"),
            graph::compute(
                "noisy",
                vec!["x"],
                |_: &ComputeInput| Err("e".repeat(5000)),
                NodeOptions::default().max_retries(1),
            ),
        ],
    )
    .unwrap();

    let rt = runtime(vec![graph.clone()]);
    let store = rt.store().clone();

    let e = engine::start_execution(&rt, &graph).await.unwrap();
    engine::set_value(&rt, e.id, "x", json!(1)).await.unwrap();

    let mut checked = false;

    for _ in 0..50 {
        let comps = store.dump_computations();

        if let Some(failed) = comps
            .iter()
            .find(|c| c.node_name == "noisy" && c.state == ComputationState::Failed)
        {
            assert_eq!(failed.error_details.as_ref().unwrap().len(), 1000);
            checked = true;
            break;
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert!(checked, "failure should be recorded");
}

#[tokio::test]
async fn abandoned_worker_is_recovered_by_the_sweeper() {
    // the function outlives its 1s deadline by far
    let graph = slow_graph(Duration::from_secs(3), 1, 1);
    let rt = runtime(vec![graph.clone()]);
    let store = rt.store().clone();

    let e = engine::start_execution(&rt, &graph).await.unwrap();
    engine::set_value(&rt, e.id, "x", json!(1)).await.unwrap();

    let mut abandoned = false;

    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(1100)).await;

        sweep::run_sweep(&rt, SweepType::Abandoned, &eager_settings())
            .await
            .unwrap();

        let comps = store.dump_computations();

        if comps
            .iter()
            .any(|c| c.node_name == "slow" && c.state == ComputationState::Abandoned)
        {
            abandoned = true;
            break;
        }
    }

    assert!(abandoned, "sweeper should abandon the overdue computation");

    // with max_retries = 1 the single abandoned attempt exhausts the node
    let read = engine::get_value(
        &rt,
        e.id,
        "slow",
        GetOpts::wait_any(Duration::from_secs(5)),
    )
    .await;

    assert!(matches!(read, Err(Error::ComputationFailed)));
}

#[tokio::test]
async fn abandonment_schedules_a_retry_when_attempts_remain() {
    let graph = slow_graph(Duration::from_secs(3), 1, 2);
    let rt = runtime(vec![graph.clone()]);
    let store = rt.store().clone();

    let e = engine::start_execution(&rt, &graph).await.unwrap();
    engine::set_value(&rt, e.id, "x", json!(1)).await.unwrap();

    let mut retried = false;

    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(1100)).await;

        sweep::run_sweep(&rt, SweepType::Abandoned, &eager_settings())
            .await
            .unwrap();

        let comps: Vec<_> = store
            .dump_computations()
            .into_iter()
            .filter(|c| c.node_name == "slow")
            .collect();

        let has_abandoned = comps.iter().any(|c| c.state == ComputationState::Abandoned);
        let has_follow_up = comps.len() >= 2;

        if has_abandoned && has_follow_up {
            retried = true;
            break;
        }
    }

    assert!(retried, "a second attempt should be enqueued after abandonment");
}

#[tokio::test]
async fn upstream_change_resets_exhausted_retries() {
    let graph = failing_graph(1);
    let rt = runtime(vec![graph.clone()]);

    let e = engine::start_execution(&rt, &graph).await.unwrap();
    engine::set_value(&rt, e.id, "x", json!(1)).await.unwrap();

    // wait until permanently failed
    let mut failed = false;

    for _ in 0..50 {
        match engine::get_value(&rt, e.id, "boom", GetOpts::no_wait()).await {
            Err(Error::ComputationFailed) => {
                failed = true;
                break;
            }
            _ => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }

    assert!(failed);

    let attempts_before = rt
        .store()
        .dump_computations()
        .iter()
        .filter(|c| c.node_name == "boom" && c.ex_revision_at_start.is_some())
        .count();

    // a new upstream revision makes the node eligible again
    engine::set_value(&rt, e.id, "x", json!(2)).await.unwrap();

    let mut eligible_again = false;

    for _ in 0..50 {
        let attempts_now = rt
            .store()
            .dump_computations()
            .iter()
            .filter(|c| c.node_name == "boom" && c.ex_revision_at_start.is_some())
            .count();

        if attempts_now > attempts_before {
            eligible_again = true;
            break;
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert!(eligible_again, "new revision level should earn a fresh attempt");
}
