//! Background sweepers.
//!
//! Each sweep type is a throttled cluster-wide singleton: a quick throttle
//! check against the sweep-run log, then the sweep-type advisory lock and
//! an authoritative re-check inside `begin_sweep`, then the body, then the
//! run row is closed with the processed count. Archived executions are
//! excluded by every store query involved.

use std::collections::BTreeSet;

use chrono::Timelike;

use crate::engine::advance;
use crate::prelude::*;

/// Drives all enabled sweeps on a fixed tick.
pub struct SweepDriver;

impl<D: Domain, C: CancelToken> Driver<D, C> for SweepDriver {
    type Config = SweepConfig;

    async fn run(config: Self::Config, domain: D, cancel: C) -> Result<(), DriveError> {
        tracing::info!(tick = config.tick_seconds, "sweep driver started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("sweep driver exit requested");
                    return Ok(());
                }
                _ = tokio::time::sleep(std::time::Duration::from_secs(config.tick_seconds)) => {}
            }

            for sweep_type in SweepType::ALL {
                let settings = config.settings(sweep_type);

                if !settings.enabled {
                    continue;
                }

                if let Err(err) = run_sweep(&domain, sweep_type, settings).await {
                    tracing::warn!(sweep = %sweep_type, err = %err, "sweep failed");
                }
            }
        }
    }
}

/// Run one throttled sweep pass. Returns `None` when throttled (or gated
/// away from the preferred hour), otherwise the number of executions
/// processed.
pub async fn run_sweep<D: Domain>(
    domain: &D,
    sweep_type: SweepType,
    settings: &SweepSettings,
) -> Result<Option<i64>, Error> {
    let store = domain.store();
    let now = now_secs();

    if let Some(hour) = settings.preferred_hour {
        if chrono::Utc::now().hour() != hour {
            return Ok(None);
        }
    }

    // cheap check first, the lock-protected one lives in begin_sweep
    if let Some(last) = store.last_sweep_started_at(sweep_type).await? {
        if now - last <= settings.min_seconds_between_runs {
            return Ok(None);
        }
    }

    let Some(run_id) = store
        .begin_sweep(sweep_type, settings.min_seconds_between_runs, now)
        .await?
    else {
        return Ok(None);
    };

    tracing::debug!(sweep = %sweep_type, run = run_id, "sweep started");

    match sweep_body(domain, sweep_type, settings, now).await {
        Ok(processed) => {
            store.complete_sweep(run_id, processed, now_secs()).await?;

            if processed > 0 {
                tracing::info!(sweep = %sweep_type, processed, "sweep completed");
            }

            Ok(Some(processed))
        }
        Err(err) => {
            // close the run row before re-raising
            if let Err(close_err) = store.complete_sweep(run_id, 0, now_secs()).await {
                tracing::warn!(sweep = %sweep_type, err = %close_err, "closing failed sweep run");
            }

            Err(err)
        }
    }
}

async fn sweep_body<D: Domain>(
    domain: &D,
    sweep_type: SweepType,
    settings: &SweepSettings,
    now: EpochSecs,
) -> Result<i64, Error> {
    let store = domain.store();

    match sweep_type {
        SweepType::Abandoned => {
            let affected = store.mark_abandoned_computations(now).await?;

            let mut executions = BTreeSet::new();

            for (id, node_name) in affected {
                tracing::warn!(execution = %id, node = %node_name, "abandoned computation");

                // retry needs the node definition in hand
                if let Some(execution) = store.load_execution(id, false).await? {
                    if let Some(graph) = domain.graph_for(&execution) {
                        if let Some(node) = graph.node(&node_name) {
                            store.schedule_retry(id, node, now).await?;
                        }
                    }
                }

                executions.insert(id);
            }

            advance_all(domain, executions).await
        }

        SweepType::ScheduleNodes => {
            let cutoff = store
                .last_completed_sweep_started_at(SweepType::ScheduleNodes)
                .await?
                .unwrap_or(0);

            let ids = store.executions_with_pending_schedules(cutoff).await?;

            advance_all(domain, ids).await
        }

        SweepType::UnblockedBySchedule => {
            // pulses that came due in the recent past but have not caused
            // downstream advancement; the filter is on the pulse itself
            let window_start = now - 5 * settings.min_seconds_between_runs;

            let ids = store
                .executions_unblocked_by_schedule(window_start, now)
                .await?;

            advance_all(domain, ids).await
        }

        SweepType::MissedSchedulesCatchall => {
            let lookback_days = settings.lookback_days.unwrap_or(3) as i64;
            let window_start = now - lookback_days * 86_400;
            let window_end = now - 25 * 60;

            let ids = store
                .executions_with_missed_schedules(window_start, window_end)
                .await?;

            advance_all(domain, ids).await
        }

        SweepType::StalledExecutions => {
            let idle_days = settings.lookback_days.unwrap_or(1) as i64;
            let cutoff = now - idle_days * 86_400;

            let ids = store.stalled_executions(cutoff).await?;

            advance_all(domain, ids).await
        }

        SweepType::RegenerateScheduleRecurring => {
            // only re-enqueues and bumps updated_at; the schedule-nodes
            // sweep dispatches the new computations
            let enqueued = store.regenerate_recurring_schedules(now).await?;

            Ok(enqueued as i64)
        }
    }
}

async fn advance_all<D: Domain>(
    domain: &D,
    ids: impl IntoIterator<Item = ExecutionId>,
) -> Result<i64, Error> {
    let mut processed = 0;

    for id in ids {
        match advance(domain, id).await {
            Ok(()) => processed += 1,
            Err(err) => {
                tracing::warn!(execution = %id, err = %err, "advance during sweep failed");
            }
        }
    }

    Ok(processed)
}
