//! Canonical graphs used across the test suites.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use rill_core::graph::{
    archive, compute, historian, input, mutate, schedule_once, schedule_recurring, ComputeInput,
    NodeOptions,
};
use rill_core::{now_secs, Graph};

/// `input(a), input(b), compute(sum = a + b)`
pub fn adder_graph() -> Graph {
    Graph::new(
        "adder",
        "v1",
        vec![
            input("a"),
            input("b"),
            compute(
                "sum",
                vec!["a", "b"],
                |m: &ComputeInput| Ok(json!(m.i64("a")? + m.i64("b")?)),
                NodeOptions::default(),
            ),
        ],
    )
    .expect("adder graph is valid")
}

/// Two-stage pipeline where the first stage collapses its input into a
/// coarse bucket, so most input changes leave downstream untouched.
pub fn bucket_graph() -> Graph {
    Graph::new(
        "bucket",
        "v1",
        vec![
            input("t"),
            compute(
                "bucket",
                vec!["t"],
                |m: &ComputeInput| {
                    let t = m.i64("t")?;
                    Ok(json!(if t < 30 { "low" } else { "high" }))
                },
                NodeOptions::default(),
            ),
            compute(
                "alert",
                vec!["bucket"],
                |m: &ComputeInput| Ok(json!(format!("alert:{}", m.str("bucket")?))),
                NodeOptions::default(),
            ),
        ],
    )
    .expect("bucket graph is valid")
}

/// Mutation with the default revision semantics: the counter is replaced
/// without a revision bump, so `display` never recomputes.
pub fn counter_graph() -> Graph {
    Graph::new(
        "counter",
        "v1",
        vec![
            input("counter"),
            input("trigger"),
            mutate(
                "inc",
                vec!["trigger"],
                |m: &ComputeInput| Ok(json!(m.i64("counter")? + 1)),
                "counter",
                false,
                NodeOptions::default(),
            ),
            compute(
                "display",
                vec!["counter"],
                |m: &ComputeInput| Ok(json!(format!("c={}", m.i64("counter")?))),
                NodeOptions::default(),
            ),
        ],
    )
    .expect("counter graph is valid")
}

/// A compute node that outlives its abandonment deadline.
pub fn slow_graph(sleep: Duration, abandon_after_seconds: i64, max_retries: u32) -> Graph {
    Graph::new(
        "slow",
        "v1",
        vec![
            input("x"),
            compute(
                "slow",
                vec!["x"],
                move |_: &ComputeInput| {
                    std::thread::sleep(sleep);
                    Ok(json!(1))
                },
                NodeOptions::default()
                    .abandon_after_seconds(abandon_after_seconds)
                    .max_retries(max_retries),
            ),
        ],
    )
    .expect("slow graph is valid")
}

/// A compute node that always fails.
pub fn failing_graph(max_retries: u32) -> Graph {
    Graph::new(
        "failing",
        "v1",
        vec![
            input("x"),
            compute(
                "boom",
                vec!["x"],
                |_: &ComputeInput| Err("boom".to_string()),
                NodeOptions::default().max_retries(max_retries),
            ),
        ],
    )
    .expect("failing graph is valid")
}

/// Greeting gated on a short pulse: `msg` waits for both the name and the
/// schedule to come due.
pub fn pulse_graph(delay_seconds: i64) -> Graph {
    Graph::new(
        "pulse",
        "v1",
        vec![
            input("name"),
            schedule_once(
                "soon",
                vec!["name"],
                move |_: &ComputeInput| Ok(json!(now_secs() + delay_seconds)),
                NodeOptions::default(),
            ),
            compute(
                "msg",
                vec!["name", "soon"],
                |m: &ComputeInput| Ok(json!(format!("hi {}", m.str("name")?))),
                NodeOptions::default(),
            ),
        ],
    )
    .expect("pulse graph is valid")
}

/// A recurring pulse ticking every `period_seconds`.
pub fn recurring_graph(period_seconds: i64) -> Graph {
    Graph::new(
        "recurring",
        "v1",
        vec![
            input("name"),
            schedule_recurring(
                "tick",
                vec!["name"],
                move |_: &ComputeInput| Ok(json!(now_secs() + period_seconds)),
                NodeOptions::default(),
            ),
        ],
    )
    .expect("recurring graph is valid")
}

/// A historian tracking every change of its upstream.
pub fn historian_graph(max_entries: Option<usize>) -> Graph {
    Graph::new(
        "tracked",
        "v1",
        vec![
            input("reading"),
            historian("log", vec!["reading"], max_entries, NodeOptions::default()),
        ],
    )
    .expect("historian graph is valid")
}

/// Archives the execution once `done` is provided.
pub fn archiving_graph() -> Graph {
    Graph::new(
        "archiving",
        "v1",
        vec![input("done"), archive("archived", vec!["done"])],
    )
    .expect("archiving graph is valid")
}

/// A graph whose compute counts invocations through a shared cell, used to
/// assert exactly-once claims under concurrency.
pub fn counting_graph(counter: Arc<std::sync::atomic::AtomicUsize>) -> Graph {
    Graph::new(
        "counting",
        "v1",
        vec![
            input("x"),
            compute(
                "probe",
                vec!["x"],
                move |m: &ComputeInput| {
                    counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(m.require("x")?.clone())
                },
                NodeOptions::default(),
            ),
        ],
    )
    .expect("counting graph is valid")
}
