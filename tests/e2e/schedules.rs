//! Schedule nodes: pulses gating downstream work, sweeper-driven
//! unblocking, recurring regeneration and sweep throttling.

use std::time::Duration;

use serde_json::json;

use rill::adapters::Runtime;
use rill::engine::{self, GetOpts};
use rill::prelude::*;
use rill::sweep::{self, SweepDriver};
use rill_testing::{pulse_graph, recurring_graph, MemoryStore};
use tokio_util::sync::CancellationToken;

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

fn fast_sweep_config() -> SweepConfig {
    SweepConfig {
        tick_seconds: 1,
        abandoned: SweepSettings {
            min_seconds_between_runs: 1,
            ..eager_settings()
        },
        schedule_nodes: SweepSettings {
            min_seconds_between_runs: 1,
            ..eager_settings()
        },
        unblocked_by_schedule: SweepSettings {
            min_seconds_between_runs: 1,
            ..eager_settings()
        },
        missed_schedules_catchall: SweepSettings {
            enabled: false,
            ..eager_settings()
        },
        stalled_executions: SweepSettings {
            enabled: false,
            ..eager_settings()
        },
        regenerate_schedule_recurring: SweepSettings {
            min_seconds_between_runs: 1,
            ..eager_settings()
        },
    }
}

#[tokio::test]
async fn pulse_gates_downstream_until_due() {
    let graph = pulse_graph(2);
    let rt = runtime(vec![graph.clone()]);

    let exit = CancellationToken::new();
    let driver = tokio::spawn(<SweepDriver as Driver<_, CancelTokenImpl>>::run(
        fast_sweep_config(),
        rt.clone(),
        CancelTokenImpl(exit.clone()),
    ));

    let e = engine::start_execution(&rt, &graph).await.unwrap();
    engine::set_value(&rt, e.id, "name", json!("Mario")).await.unwrap();

    // the pulse itself lands quickly
    let soon = engine::get_value(&rt, e.id, "soon", GetOpts::wait_any(Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(soon.value.as_i64().unwrap() > 0);

    // downstream is gated on time, not mere presence
    let early = engine::get_value(&rt, e.id, "msg", GetOpts::no_wait()).await;
    assert!(matches!(early, Err(Error::NotSet)));

    let msg = engine::get_value(
        &rt,
        e.id,
        "msg",
        GetOpts::wait_any(Duration::from_secs(10)),
    )
    .await
    .unwrap();

    assert_eq!(msg.value, json!("hi Mario"));

    exit.cancel();
    driver.await.unwrap().unwrap();
}

#[tokio::test]
async fn recurring_schedule_regenerates_after_each_pulse() {
    let graph = recurring_graph(1);
    let rt = runtime(vec![graph.clone()]);
    let store = rt.store().clone();

    let e = engine::start_execution(&rt, &graph).await.unwrap();
    engine::set_value(&rt, e.id, "name", json!("tick")).await.unwrap();

    // first pulse computes on its own
    engine::get_value(&rt, e.id, "tick", GetOpts::wait_any(Duration::from_secs(5)))
        .await
        .unwrap();

    // drive the regeneration and dispatch sweeps by hand
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(1200)).await;

        sweep::run_sweep(&rt, SweepType::RegenerateScheduleRecurring, &eager_settings())
            .await
            .unwrap();
        sweep::run_sweep(&rt, SweepType::ScheduleNodes, &eager_settings())
            .await
            .unwrap();
    }

    let successes = store
        .dump_computations()
        .iter()
        .filter(|c| c.node_name == "tick" && c.state == ComputationState::Success)
        .count();

    assert!(
        successes >= 2,
        "recurring schedule should have fired more than once, got {successes}"
    );
}

#[tokio::test]
async fn sweep_throttling_allows_one_run_per_window() {
    let rt = runtime(vec![]);
    let store = rt.store().clone();

    let settings = SweepSettings {
        enabled: true,
        min_seconds_between_runs: 3600,
        preferred_hour: None,
        lookback_days: None,
    };

    let mut tasks = vec![];

    for _ in 0..10 {
        let rt = rt.clone();
        let settings = settings.clone();

        tasks.push(tokio::spawn(async move {
            sweep::run_sweep(&rt, SweepType::Abandoned, &settings).await
        }));
    }

    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let runs = store.dump_sweep_runs();

    assert_eq!(runs.len(), 1, "exactly one sweep run in the window");
}

#[tokio::test]
async fn sweep_runs_are_closed_with_ordered_timestamps() {
    let graph = pulse_graph(1);
    let rt = runtime(vec![graph.clone()]);
    let store = rt.store().clone();

    let e = engine::start_execution(&rt, &graph).await.unwrap();
    engine::set_value(&rt, e.id, "name", json!("x")).await.unwrap();

    sweep::run_sweep(&rt, SweepType::ScheduleNodes, &eager_settings())
        .await
        .unwrap();
    sweep::run_sweep(&rt, SweepType::UnblockedBySchedule, &eager_settings())
        .await
        .unwrap();

    let runs = store.dump_sweep_runs();
    assert!(!runs.is_empty());

    for run in runs {
        let completed = run.completed_at.expect("sweep run should be closed");
        assert!(completed >= run.started_at);
    }
}

#[tokio::test]
async fn preferred_hour_gates_the_catchall() {
    let rt = runtime(vec![]);
    let store = rt.store().clone();

    let wrong_hour = (chrono::Timelike::hour(&chrono::Utc::now()) + 1) % 24;

    let settings = SweepSettings {
        enabled: true,
        min_seconds_between_runs: 0,
        preferred_hour: Some(wrong_hour),
        lookback_days: Some(3),
    };

    let outcome = sweep::run_sweep(&rt, SweepType::MissedSchedulesCatchall, &settings)
        .await
        .unwrap();

    assert!(outcome.is_none());
    assert!(store.dump_sweep_runs().is_empty());
}
