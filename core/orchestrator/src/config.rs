//! Orchestrator configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Configuration surface for the orchestrator.
///
/// Retry limits, backoff constants and failure thresholds are deployment
/// parameters, never hard-coded in components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Number of concurrent worker executors.
    pub worker_count: usize,
    /// Maximum sync attempts per run, including the first.
    pub max_attempts: u32,
    /// Initial backoff delay after a transient failure.
    pub initial_backoff: Duration,
    /// Backoff cap.
    pub max_backoff: Duration,
    /// Exponential backoff multiplier.
    pub backoff_multiplier: f64,
    /// Whether backoff delays get random jitter.
    pub backoff_jitter: bool,
    /// Deadline for one external sync invocation.
    pub external_deadline: Duration,
    /// Age after which a Running run with no state-store writes is
    /// considered orphaned by the recovery sweep.
    pub staleness_threshold: Duration,
    /// Per-subscriber event buffer capacity.
    pub event_capacity: usize,
    /// Tick interval of the periodic scheduler; None disables it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_tick: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            backoff_jitter: true,
            external_deadline: Duration::from_secs(30),
            staleness_threshold: Duration::from_secs(30 * 60),
            event_capacity: 256,
            schedule_tick: None,
        }
    }
}

impl OrchestratorConfig {
    /// The retry policy described by this configuration.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts)
            .with_initial_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_backoff_multiplier(self.backoff_multiplier)
            .with_jitter(self.backoff_jitter)
    }
}
