//! Sibling task that keeps a computation's lease alive.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::prelude::*;

/// Beat every `interval_seconds` (±20% jitter) until the computation
/// reaches a terminal state or the worker cancels us. When the store
/// reports abandonment the shared token is cancelled, which kills the
/// linked worker.
pub(crate) async fn run<D: Domain>(
    domain: D,
    computation: ComputationId,
    interval_seconds: u64,
    timeout_seconds: i64,
    buffer_seconds: i64,
    token: CancellationToken,
) {
    loop {
        let sleep = jittered_interval(interval_seconds);

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(sleep) => {}
        }

        match domain
            .store()
            .beat(computation, timeout_seconds, buffer_seconds, now_secs())
            .await
        {
            Ok(HeartbeatOutcome::Extended) => continue,

            Ok(HeartbeatOutcome::Terminal) => return,

            Ok(HeartbeatOutcome::AlreadyAbandoned | HeartbeatOutcome::MarkedAbandoned) => {
                tracing::warn!(computation = %computation, "computation abandoned, killing worker");
                token.cancel();
                return;
            }

            Err(err) => {
                // transient store trouble: keep beating, the deadline is
                // still in the future
                tracing::warn!(computation = %computation, err = %err, "heartbeat failed");
                continue;
            }
        }
    }
}

fn jittered_interval(interval_seconds: u64) -> Duration {
    let base = interval_seconds.max(1) * 1000;
    let spread = base / 5;
    let low = base - spread;
    let high = base + spread;

    Duration::from_millis(rand::rng().random_range(low..=high))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_twenty_percent() {
        for _ in 0..100 {
            let d = jittered_interval(10);
            assert!(d >= Duration::from_millis(8_000));
            assert!(d <= Duration::from_millis(12_000));
        }
    }
}
