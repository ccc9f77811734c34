pub mod backfill_executor;
pub mod backfill_processor;
pub mod device_rpc;
pub mod direct_backfill;
pub mod gap_detector;
pub mod queue;
pub mod retry_handler;
pub mod retry_policy;
pub mod runner;
pub mod stream;
pub mod test_doubles;

use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

/// Pipeline components, used as the `component` field of every log line
/// and metric they emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "kebab-case")]
pub enum Component {
    GapDetector,
    BackfillProcessor,
    BackfillExecutor,
    RetryHandler,
    DirectBackfill,
}

/// Upper bound of every configured timer. Delay queues cannot schedule much
/// further out than two years.
pub const MAX_TIMER_SECS: u64 = 365 * 24 * 3600;

fn default_data_gaps_ttl_secs() -> u64 {
    7 * 24 * 3600
}

fn default_initial_detection_invisible_secs() -> u64 {
    120
}

fn default_detection_retry_invisible_secs() -> u64 {
    1800
}

fn default_backfill_retry_visibility_secs() -> u64 {
    60
}

fn default_direct_method_response_timeout_secs() -> u64 {
    30
}

fn default_backfill_timeout_secs() -> u64 {
    1800
}

fn default_retry_delays_secs() -> Vec<u64> {
    vec![10, 60, 300]
}

/// Timers governing message visibility, expiry and leases, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerConfig {
    /// Lifetime of gap and retry messages; also the horizon the detector
    /// searches for gaps.
    #[serde(default = "default_data_gaps_ttl_secs")]
    pub data_gaps_ttl_secs: u64,
    /// Delay before a freshly detected gap is processed, giving in-flight
    /// data time to land.
    #[serde(default = "default_initial_detection_invisible_secs")]
    pub initial_detection_invisible_secs: u64,
    /// Delay before the executor's follow-up check of a dispatched request.
    #[serde(default = "default_detection_retry_invisible_secs")]
    pub detection_retry_invisible_secs: u64,
    /// Delay before a failed direct backfill is picked up by the retry
    /// handler.
    #[serde(default = "default_backfill_retry_visibility_secs")]
    pub backfill_retry_visibility_secs: u64,
    #[serde(default = "default_direct_method_response_timeout_secs")]
    pub direct_method_response_timeout_secs: u64,
    /// Lease of a ledger entry over its window.
    #[serde(default = "default_backfill_timeout_secs")]
    pub backfill_timeout_secs: u64,
    #[serde(default = "default_retry_delays_secs")]
    pub retry_delays_secs: Vec<u64>,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            data_gaps_ttl_secs: default_data_gaps_ttl_secs(),
            initial_detection_invisible_secs: default_initial_detection_invisible_secs(),
            detection_retry_invisible_secs: default_detection_retry_invisible_secs(),
            backfill_retry_visibility_secs: default_backfill_retry_visibility_secs(),
            direct_method_response_timeout_secs: default_direct_method_response_timeout_secs(),
            backfill_timeout_secs: default_backfill_timeout_secs(),
            retry_delays_secs: default_retry_delays_secs(),
        }
    }
}

impl TimerConfig {
    pub fn validate(&self) -> Result<()> {
        let timers = [
            ("data_gaps_ttl_secs", self.data_gaps_ttl_secs),
            (
                "initial_detection_invisible_secs",
                self.initial_detection_invisible_secs,
            ),
            (
                "detection_retry_invisible_secs",
                self.detection_retry_invisible_secs,
            ),
            (
                "backfill_retry_visibility_secs",
                self.backfill_retry_visibility_secs,
            ),
            (
                "direct_method_response_timeout_secs",
                self.direct_method_response_timeout_secs,
            ),
            ("backfill_timeout_secs", self.backfill_timeout_secs),
        ];
        if let Some((name, _)) = timers.iter().find(|(_, secs)| *secs == 0) {
            return Err(anyhow!("timer {name} must be a positive number of seconds"));
        }
        if let Some((name, secs)) = timers.iter().find(|(_, secs)| *secs > MAX_TIMER_SECS) {
            return Err(anyhow!(
                "timer {name} is {secs} seconds, more than the maximum of {MAX_TIMER_SECS}"
            ));
        }
        if self.retry_delays_secs.is_empty() {
            return Err(anyhow!("retry_delays_secs must contain at least one delay"));
        }
        if let Some(secs) = self.retry_delays_secs.iter().find(|secs| **secs > MAX_TIMER_SECS) {
            return Err(anyhow!(
                "retry delay of {secs} seconds is more than the maximum of {MAX_TIMER_SECS}"
            ));
        }
        Ok(())
    }

    pub fn data_gaps_ttl(&self) -> Duration {
        Duration::from_secs(self.data_gaps_ttl_secs)
    }

    pub fn initial_detection_invisible(&self) -> Duration {
        Duration::from_secs(self.initial_detection_invisible_secs)
    }

    pub fn detection_retry_invisible(&self) -> Duration {
        Duration::from_secs(self.detection_retry_invisible_secs)
    }

    pub fn backfill_retry_visibility(&self) -> Duration {
        Duration::from_secs(self.backfill_retry_visibility_secs)
    }

    pub fn direct_method_response_timeout(&self) -> Duration {
        Duration::from_secs(self.direct_method_response_timeout_secs)
    }

    pub fn backfill_timeout(&self) -> Duration {
        Duration::from_secs(self.backfill_timeout_secs)
    }

    pub fn retry_delays(&self) -> Vec<Duration> {
        self.retry_delays_secs
            .iter()
            .map(|secs| Duration::from_secs(*secs))
            .collect()
    }
}

/// Failures of several inputs of one invocation, re-raised together once
/// every input had its chance to run.
#[derive(Debug, thiserror::Error)]
#[error("{component} failed on {count} inputs: {summary}", count = .errors.len(), summary = summarize(.errors))]
pub struct AggregateError {
    pub component: Component,
    pub errors: Vec<anyhow::Error>,
}

fn summarize(errors: &[anyhow::Error]) -> String {
    errors
        .iter()
        .map(|err| format!("{err:#}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Surfaces the failures collected during an invocation: nothing when all
/// inputs succeeded, the failure itself when there was exactly one, an
/// [`AggregateError`] otherwise.
pub fn raise_collected(component: Component, mut errors: Vec<anyhow::Error>) -> Result<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(AggregateError { component, errors }.into()),
    }
}
