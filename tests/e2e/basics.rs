//! End-to-end flows over the in-memory backend: cascading computes,
//! idempotent writes, mutation semantics, invalidation and archival.

use std::time::Duration;

use serde_json::json;

use rill::adapters::Runtime;
use rill::engine::{self, GetOpts};
use rill::prelude::*;
use rill_testing::{
    adder_graph, archiving_graph, bucket_graph, counter_graph, historian_graph, MemoryStore,
};

fn runtime(graphs: Vec<Graph>) -> Runtime<MemoryStore> {
    Runtime::new(
        MemoryStore::new(),
        GraphCatalog::from_graphs(graphs),
        RuntimeConfig::default(),
    )
}

async fn wait_for(
    rt: &Runtime<MemoryStore>,
    id: ExecutionId,
    node: &str,
    secs: u64,
) -> engine::ReadValue {
    engine::get_value(rt, id, node, GetOpts::wait_any(Duration::from_secs(secs)))
        .await
        .unwrap_or_else(|err| panic!("waiting for {node}: {err}"))
}

#[tokio::test]
async fn sum_of_two_inputs() {
    let rt = runtime(vec![adder_graph()]);
    let graph = adder_graph();

    let e = engine::start_execution(&rt, &graph).await.unwrap();

    engine::set_value(&rt, e.id, "a", json!(10)).await.unwrap();
    engine::set_value(&rt, e.id, "b", json!(20)).await.unwrap();

    let sum = wait_for(&rt, e.id, "sum", 5).await;

    assert_eq!(sum.value, json!(30));
}

#[tokio::test]
async fn idempotent_compute_does_not_cascade() {
    let rt = runtime(vec![bucket_graph()]);
    let graph = bucket_graph();

    let e = engine::start_execution(&rt, &graph).await.unwrap();

    engine::set_value(&rt, e.id, "t", json!(10)).await.unwrap();

    let alert = wait_for(&rt, e.id, "alert", 5).await;
    assert_eq!(alert.value, json!("alert:low"));

    let bucket_before = wait_for(&rt, e.id, "bucket", 5).await;

    // same bucket, different input: downstream must not move
    engine::set_value(&rt, e.id, "t", json!(20)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let bucket_after = wait_for(&rt, e.id, "bucket", 5).await;
    let alert_after = wait_for(&rt, e.id, "alert", 5).await;

    assert_eq!(bucket_after.revision, bucket_before.revision);
    assert_eq!(alert_after.revision, alert.revision);
    assert_eq!(alert_after.value, json!("alert:low"));

    // crossing the threshold recomputes the whole chain
    engine::set_value(&rt, e.id, "t", json!(40)).await.unwrap();

    let newer = engine::get_value(
        &rt,
        e.id,
        "alert",
        GetOpts::wait_newer_than(alert.revision, Duration::from_secs(5)),
    )
    .await
    .unwrap();

    assert_eq!(newer.value, json!("alert:high"));
    assert!(newer.revision > alert.revision);

    let bucket_final = wait_for(&rt, e.id, "bucket", 5).await;
    assert_eq!(bucket_final.value, json!("high"));
    assert!(bucket_final.revision > bucket_before.revision);
}

#[tokio::test]
async fn mutate_without_revision_bump_stays_invisible_downstream() {
    let rt = runtime(vec![counter_graph()]);
    let graph = counter_graph();

    let e = engine::start_execution(&rt, &graph).await.unwrap();

    engine::set_value(&rt, e.id, "counter", json!(1)).await.unwrap();

    let display = wait_for(&rt, e.id, "display", 5).await;
    assert_eq!(display.value, json!("c=1"));

    let counter_before = wait_for(&rt, e.id, "counter", 5).await;

    engine::set_value(&rt, e.id, "trigger", json!("x")).await.unwrap();

    // the mutate node records that it ran
    let inc = wait_for(&rt, e.id, "inc", 5).await;
    assert_eq!(inc.value, json!("updated counter"));

    let counter_after = wait_for(&rt, e.id, "counter", 5).await;
    assert_eq!(counter_after.value, json!(2));
    assert_eq!(counter_after.revision, counter_before.revision);

    // no recompute happened downstream
    tokio::time::sleep(Duration::from_millis(500)).await;
    let display_after = wait_for(&rt, e.id, "display", 5).await;
    assert_eq!(display_after.value, json!("c=1"));
    assert_eq!(display_after.revision, display.revision);
}

#[tokio::test]
async fn unset_cascades_through_the_invalidator() {
    let rt = runtime(vec![adder_graph()]);
    let graph = adder_graph();

    let e = engine::start_execution(&rt, &graph).await.unwrap();

    engine::set_value(&rt, e.id, "a", json!(10)).await.unwrap();
    engine::set_value(&rt, e.id, "b", json!(20)).await.unwrap();
    wait_for(&rt, e.id, "sum", 5).await;

    engine::unset_value(&rt, e.id, "a").await.unwrap();

    let a = engine::get_value(&rt, e.id, "a", GetOpts::no_wait()).await;
    assert!(matches!(a, Err(Error::NotSet)));

    let sum = engine::get_value(&rt, e.id, "sum", GetOpts::no_wait()).await;
    assert!(matches!(sum, Err(Error::NotSet)));

    // setting the input again recomputes from the pending slot
    engine::set_value(&rt, e.id, "a", json!(5)).await.unwrap();
    let sum = wait_for(&rt, e.id, "sum", 5).await;
    assert_eq!(sum.value, json!(25));
}

#[tokio::test]
async fn values_round_trip_through_json() {
    let rt = runtime(vec![adder_graph()]);
    let graph = adder_graph();

    let e = engine::start_execution(&rt, &graph).await.unwrap();

    let payload = json!({"kind": "reading", "tags": ["a", "b"], "level": 3});
    engine::set_value(&rt, e.id, "a", payload.clone()).await.unwrap();

    let read = engine::get_value(&rt, e.id, "a", GetOpts::no_wait()).await.unwrap();
    assert_eq!(read.value, payload);
}

#[tokio::test]
async fn setting_the_same_value_twice_is_a_no_op() {
    let rt = runtime(vec![adder_graph()]);
    let graph = adder_graph();

    let e = engine::start_execution(&rt, &graph).await.unwrap();

    let first = engine::set_value(&rt, e.id, "a", json!(10)).await.unwrap();
    let second = engine::set_value(&rt, e.id, "a", json!(10)).await.unwrap();

    assert_eq!(first.revision, second.revision);

    let rows = engine::values_all(&rt, e.id).await.unwrap();
    assert_eq!(rows["a"].ex_revision, first.revision);
}

#[tokio::test]
async fn archive_load_unarchive_round_trip() {
    let rt = runtime(vec![adder_graph()]);
    let graph = adder_graph();

    let e = engine::start_execution(&rt, &graph).await.unwrap();

    engine::archive(&rt, e.id).await.unwrap();

    assert!(engine::load(&rt, e.id, false).await.unwrap().is_none());
    assert!(engine::load(&rt, e.id, true).await.unwrap().is_some());

    engine::unarchive(&rt, e.id).await.unwrap();
    assert!(engine::load(&rt, e.id, false).await.unwrap().is_some());
}

#[tokio::test]
async fn archive_node_archives_its_execution() {
    let rt = runtime(vec![archiving_graph()]);
    let graph = archiving_graph();

    let e = engine::start_execution(&rt, &graph).await.unwrap();

    engine::set_value(&rt, e.id, "done", json!(true)).await.unwrap();

    let mut archived = false;

    for _ in 0..50 {
        if engine::load(&rt, e.id, true).await.unwrap().unwrap().is_archived() {
            archived = true;
            break;
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert!(archived, "archive node should archive the execution");
}

#[tokio::test]
async fn user_values_exclude_system_keys() {
    let rt = runtime(vec![adder_graph()]);
    let graph = adder_graph();

    let e = engine::start_execution(&rt, &graph).await.unwrap();
    engine::set_value(&rt, e.id, "a", json!(1)).await.unwrap();

    let user = engine::values(&rt, e.id).await.unwrap();

    assert!(user.contains_key("a"));
    assert!(!user.contains_key("b"));
    assert!(!user.contains_key("execution_id"));
    assert!(!user.contains_key("last_updated_at"));

    let all = engine::values_all(&rt, e.id).await.unwrap();

    assert!(all.contains_key("b"));
    assert!(all["execution_id"].is_set());
    assert!(all["last_updated_at"].is_set());
}

#[tokio::test]
async fn historian_keeps_a_bounded_newest_first_log() {
    let rt = runtime(vec![historian_graph(Some(2))]);
    let graph = historian_graph(Some(2));

    let e = engine::start_execution(&rt, &graph).await.unwrap();

    for (i, reading) in [10, 20, 30].iter().enumerate() {
        engine::set_value(&rt, e.id, "reading", json!(reading)).await.unwrap();

        // wait until the historian caught this revision
        let expected_entries = (i + 1).min(2);

        let mut caught = false;

        for _ in 0..50 {
            let log = engine::get_value(&rt, e.id, "log", GetOpts::no_wait()).await;

            if let Ok(log) = log {
                let entries = log.value.as_array().cloned().unwrap_or_default();

                if entries.len() >= expected_entries
                    && entries[0]["values"]["reading"] == json!(reading)
                {
                    caught = true;
                    break;
                }
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        assert!(caught, "historian should log reading {reading}");
    }

    let log = engine::get_value(&rt, e.id, "log", GetOpts::no_wait()).await.unwrap();
    let entries = log.value.as_array().cloned().unwrap();

    assert_eq!(entries.len(), 2, "bounded by max_entries");
    assert_eq!(entries[0]["values"]["reading"], json!(30));
    assert_eq!(entries[1]["values"]["reading"], json!(20));
}

#[tokio::test]
async fn history_orders_events_by_revision() {
    let rt = runtime(vec![adder_graph()]);
    let graph = adder_graph();

    let e = engine::start_execution(&rt, &graph).await.unwrap();

    engine::set_value(&rt, e.id, "a", json!(10)).await.unwrap();
    engine::set_value(&rt, e.id, "b", json!(20)).await.unwrap();
    wait_for(&rt, e.id, "sum", 5).await;

    let history = engine::history(&rt, e.id).await.unwrap();

    let revisions: Vec<_> = history.iter().map(|h| h.revision).collect();
    let mut sorted = revisions.clone();
    sorted.sort();
    assert_eq!(revisions, sorted);

    assert!(history.iter().any(|h| h.node == "a"));
    assert!(history
        .iter()
        .any(|h| h.node == "sum" && h.event == engine::HistoryEvent::Computation(ComputationState::Success)));
}

#[tokio::test]
async fn list_executions_filters_and_sorts() {
    let rt = runtime(vec![adder_graph(), bucket_graph()]);
    let adder = adder_graph();
    let bucket = bucket_graph();

    let e1 = engine::start_execution(&rt, &adder).await.unwrap();
    let e2 = engine::start_execution(&rt, &adder).await.unwrap();
    let e3 = engine::start_execution(&rt, &bucket).await.unwrap();

    engine::set_value(&rt, e1.id, "a", json!(1)).await.unwrap();
    engine::set_value(&rt, e2.id, "a", json!(5)).await.unwrap();

    let all = engine::list_executions(&rt, &ListOptions::default()).await.unwrap();
    assert_eq!(all.len(), 3);

    let adders = engine::list_executions(
        &rt,
        &ListOptions {
            graph_name: Some("adder".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(adders.len(), 2);

    let high_a = engine::list_executions(
        &rt,
        &ListOptions {
            filter_by: vec![ValueFilter {
                node: "a".to_string(),
                op: FilterOp::Gte,
                operand: FilterOperand::One(json!(5)),
            }],
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(high_a.len(), 1);
    assert_eq!(high_a[0].id, e2.id);

    let unset_a = engine::list_executions(
        &rt,
        &ListOptions {
            graph_name: Some("adder".to_string()),
            filter_by: vec![ValueFilter {
                node: "a".to_string(),
                op: FilterOp::IsNil,
                operand: FilterOperand::None,
            }],
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert!(unset_a.is_empty());

    // archived executions only appear on request
    engine::archive(&rt, e3.id).await.unwrap();

    let active = engine::list_executions(&rt, &ListOptions::default()).await.unwrap();
    assert_eq!(active.len(), 2);

    let with_archived = engine::list_executions(
        &rt,
        &ListOptions {
            include_archived: true,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(with_archived.len(), 3);

    // version filter without a name is an argument error
    let err = engine::list_executions(
        &rt,
        &ListOptions {
            graph_version: Some("v1".to_string()),
            ..Default::default()
        },
    )
    .await;
    assert!(matches!(err, Err(Error::InvalidOperation(_))));
}

#[tokio::test]
async fn writes_to_non_input_nodes_are_rejected() {
    let rt = runtime(vec![adder_graph()]);
    let graph = adder_graph();

    let e = engine::start_execution(&rt, &graph).await.unwrap();

    let err = engine::set_value(&rt, e.id, "sum", json!(1)).await;
    assert!(matches!(err, Err(Error::InvalidOperation(_))));

    let err = engine::set_value(&rt, e.id, "ghost", json!(1)).await;
    assert!(matches!(err, Err(Error::UnknownNode { .. })));
}

#[tokio::test]
async fn unregistered_graph_cannot_start() {
    let rt = runtime(vec![]);
    let graph = adder_graph();

    let err = engine::start_execution(&rt, &graph).await;
    assert!(matches!(err, Err(Error::GraphNotRegistered { .. })));
}
