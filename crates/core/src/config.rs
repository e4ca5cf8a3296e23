//! Runtime configuration.
//!
//! Plain serde-deserializable structs with defaults. Loading them from a
//! file or environment is left to the embedding application.

use serde::{Deserialize, Serialize};

use crate::model::SweepType;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub reader: ReaderConfig,

    #[serde(default)]
    pub sweeps: SweepConfig,
}

/// Global heartbeat defaults; per-node options take precedence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    pub interval_seconds: u64,
    pub timeout_seconds: u64,

    /// Extensions are refused once the computation deadline is more than
    /// this many seconds in the past.
    pub deadline_buffer_seconds: i64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 15,
            timeout_seconds: 60,
            deadline_buffer_seconds: 5,
        }
    }
}

/// Backoff shape of the blocking reader's poll loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    pub poll_base_ms: u64,
    pub poll_cap_ms: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            poll_base_ms: 500,
            poll_cap_ms: 30_000,
        }
    }
}

fn default_tick_seconds() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// How often the sweep driver wakes up to consider each sweep type.
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,

    #[serde(default = "SweepSettings::abandoned")]
    pub abandoned: SweepSettings,

    #[serde(default = "SweepSettings::schedule_nodes")]
    pub schedule_nodes: SweepSettings,

    #[serde(default = "SweepSettings::unblocked_by_schedule")]
    pub unblocked_by_schedule: SweepSettings,

    #[serde(default = "SweepSettings::missed_schedules_catchall")]
    pub missed_schedules_catchall: SweepSettings,

    #[serde(default = "SweepSettings::stalled_executions")]
    pub stalled_executions: SweepSettings,

    #[serde(default = "SweepSettings::regenerate_schedule_recurring")]
    pub regenerate_schedule_recurring: SweepSettings,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            tick_seconds: 5,
            abandoned: SweepSettings::abandoned(),
            schedule_nodes: SweepSettings::schedule_nodes(),
            unblocked_by_schedule: SweepSettings::unblocked_by_schedule(),
            missed_schedules_catchall: SweepSettings::missed_schedules_catchall(),
            stalled_executions: SweepSettings::stalled_executions(),
            regenerate_schedule_recurring: SweepSettings::regenerate_schedule_recurring(),
        }
    }
}

impl SweepConfig {
    pub fn settings(&self, sweep_type: SweepType) -> &SweepSettings {
        match sweep_type {
            SweepType::Abandoned => &self.abandoned,
            SweepType::ScheduleNodes => &self.schedule_nodes,
            SweepType::UnblockedBySchedule => &self.unblocked_by_schedule,
            SweepType::MissedSchedulesCatchall => &self.missed_schedules_catchall,
            SweepType::StalledExecutions => &self.stalled_executions,
            SweepType::RegenerateScheduleRecurring => &self.regenerate_schedule_recurring,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepSettings {
    pub enabled: bool,
    pub min_seconds_between_runs: i64,

    /// When set, the sweep only runs during this UTC hour.
    pub preferred_hour: Option<u32>,

    /// Window size for sweeps that look back over history, in days. Also
    /// serves as the idle threshold for the stalled-executions sweep.
    pub lookback_days: Option<u32>,
}

impl SweepSettings {
    pub fn abandoned() -> Self {
        Self {
            enabled: true,
            min_seconds_between_runs: 60,
            preferred_hour: None,
            lookback_days: None,
        }
    }

    pub fn schedule_nodes() -> Self {
        Self {
            enabled: true,
            min_seconds_between_runs: 5,
            preferred_hour: None,
            lookback_days: None,
        }
    }

    pub fn unblocked_by_schedule() -> Self {
        Self {
            enabled: true,
            min_seconds_between_runs: 60,
            preferred_hour: None,
            lookback_days: None,
        }
    }

    pub fn missed_schedules_catchall() -> Self {
        Self {
            enabled: true,
            min_seconds_between_runs: 23 * 3600,
            preferred_hour: None,
            lookback_days: Some(3),
        }
    }

    pub fn stalled_executions() -> Self {
        Self {
            enabled: true,
            min_seconds_between_runs: 23 * 3600,
            preferred_hour: None,
            lookback_days: Some(1),
        }
    }

    pub fn regenerate_schedule_recurring() -> Self {
        Self {
            enabled: true,
            min_seconds_between_runs: 60,
            preferred_hour: None,
            lookback_days: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_deserialize_from_empty() {
        let config: RuntimeConfig = serde_json::from_str("{}").unwrap();

        assert_eq!(config.heartbeat.interval_seconds, 15);
        assert_eq!(config.reader.poll_base_ms, 500);
        assert!(config.sweeps.abandoned.enabled);
        assert_eq!(
            config.sweeps.missed_schedules_catchall.min_seconds_between_runs,
            23 * 3600
        );
    }
}
