//! Snapshot invariants over the persisted state after a mixed workload.

use std::time::Duration;

use serde_json::json;

use rill::adapters::Runtime;
use rill::engine::{self, GetOpts};
use rill::prelude::*;
use rill_testing::{adder_graph, bucket_graph, failing_graph, MemoryStore};

fn runtime(graphs: Vec<Graph>) -> Runtime<MemoryStore> {
    Runtime::new(
        MemoryStore::new(),
        GraphCatalog::from_graphs(graphs),
        RuntimeConfig::default(),
    )
}

async fn run_workload(rt: &Runtime<MemoryStore>) -> Vec<ExecutionId> {
    let adder = adder_graph();
    let bucket = bucket_graph();
    let failing = failing_graph(2);

    let e1 = engine::start_execution(rt, &adder).await.unwrap();
    engine::set_value(rt, e1.id, "a", json!(10)).await.unwrap();
    engine::set_value(rt, e1.id, "b", json!(20)).await.unwrap();
    engine::get_value(rt, e1.id, "sum", GetOpts::wait_any(Duration::from_secs(5)))
        .await
        .unwrap();
    engine::unset_value(rt, e1.id, "a").await.unwrap();
    engine::set_value(rt, e1.id, "a", json!(7)).await.unwrap();
    engine::get_value(rt, e1.id, "sum", GetOpts::wait_any(Duration::from_secs(5)))
        .await
        .unwrap();

    let e2 = engine::start_execution(rt, &bucket).await.unwrap();
    engine::set_value(rt, e2.id, "t", json!(10)).await.unwrap();
    engine::get_value(rt, e2.id, "alert", GetOpts::wait_any(Duration::from_secs(5)))
        .await
        .unwrap();
    engine::set_value(rt, e2.id, "t", json!(50)).await.unwrap();
    engine::set_value(rt, e2.id, "t", json!(50)).await.unwrap();

    let e3 = engine::start_execution(rt, &failing).await.unwrap();
    engine::set_value(rt, e3.id, "x", json!(1)).await.unwrap();

    // let the dust settle: pending work drains, retries run dry
    tokio::time::sleep(Duration::from_secs(2)).await;

    vec![e1.id, e2.id, e3.id]
}

#[tokio::test]
async fn snapshot_invariants_hold_after_a_mixed_workload() {
    let rt = runtime(vec![adder_graph(), bucket_graph(), failing_graph(2)]);
    let store = rt.store().clone();

    let executions = run_workload(&rt).await;

    let computations = store.dump_computations();

    for id in &executions {
        let execution = engine::load(&rt, *id, true).await.unwrap().unwrap();
        let values = engine::values_all(&rt, *id).await.unwrap();

        // at most one computation in {not_set, computing} per node
        let nodes: std::collections::BTreeSet<_> = computations
            .iter()
            .filter(|c| c.execution_id == *id)
            .map(|c| c.node_name.clone())
            .collect();

        for node in nodes {
            let pending = computations
                .iter()
                .filter(|c| {
                    c.execution_id == *id && c.node_name == node && c.state.is_pending()
                })
                .count();

            assert!(pending <= 1, "{node} has {pending} pending computations");
        }

        for (name, row) in &values {
            // set_time and node_value are nil together
            assert_eq!(
                row.set_time.is_none(),
                row.node_value.is_none(),
                "value shape broken for {name}"
            );

            // a set value never outruns its execution's revision
            if row.is_set() {
                assert!(
                    row.ex_revision <= execution.revision,
                    "{name} has revision {} beyond execution {}",
                    row.ex_revision,
                    execution.revision
                );
            }
        }

        for comp in computations.iter().filter(|c| c.execution_id == *id) {
            if comp.state == ComputationState::Success {
                let start = comp.ex_revision_at_start.expect("success has a start");
                let completion = comp
                    .ex_revision_at_completion
                    .expect("success has a completion");

                assert!(completion >= start);

                // captured upstream revisions never exceed the completion
                for (upstream, revision) in &comp.computed_with {
                    assert!(
                        *revision <= completion,
                        "{upstream} captured at {revision} beyond completion {completion}"
                    );
                }
            }
        }
    }
}

#[tokio::test]
async fn revisions_are_strictly_monotonic_per_execution() {
    let rt = runtime(vec![adder_graph()]);
    let graph = adder_graph();

    let e = engine::start_execution(&rt, &graph).await.unwrap();

    let mut last = engine::load(&rt, e.id, true).await.unwrap().unwrap().revision;

    for i in 0..10 {
        engine::set_value(&rt, e.id, "a", json!(i)).await.unwrap();

        let current = engine::load(&rt, e.id, true).await.unwrap().unwrap().revision;

        assert!(current > last, "revision must move forward on every write");
        last = current;
    }
}

#[tokio::test]
async fn last_updated_at_moves_with_every_bump() {
    let rt = runtime(vec![adder_graph()]);
    let graph = adder_graph();

    let e = engine::start_execution(&rt, &graph).await.unwrap();

    engine::set_value(&rt, e.id, "a", json!(1)).await.unwrap();

    let values = engine::values_all(&rt, e.id).await.unwrap();
    let touched = &values["last_updated_at"];

    assert!(touched.is_set());
    assert_eq!(
        touched.ex_revision,
        values["a"].ex_revision,
        "last_updated_at follows the same bump"
    );
}
