//! Sync run tracking and the run state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tradesync_common::{IntegrationId, Result, RunId};

/// Run state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Created, waiting to be claimed by a worker.
    Pending,
    /// Claimed by a worker, sync protocol in flight.
    Running,
    /// Transient failure recorded, waiting out the backoff delay.
    RetryScheduled,
    /// External sync completed.
    Succeeded,
    /// Permanently failed or retries exhausted.
    Failed,
    /// Cancelled before completion.
    Cancelled,
}

impl RunState {
    /// Returns true if this is a terminal state.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the transition from self to target is valid.
    ///
    /// Transitions are monotonic forward; nothing leaves a terminal state.
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Running | Self::Cancelled),
            Self::Running => matches!(
                target,
                Self::Succeeded | Self::Failed | Self::RetryScheduled | Self::Cancelled
            ),
            Self::RetryScheduled => {
                matches!(target, Self::Pending | Self::Failed | Self::Cancelled)
            }
            Self::Succeeded | Self::Failed | Self::Cancelled => false,
        }
    }

    /// Stable string form used for persistence.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::RetryScheduled => "retry_scheduled",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse the persisted string form.
    ///
    /// # Errors
    /// - Unknown state name
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "retry_scheduled" => Ok(Self::RetryScheduled),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(tradesync_common::Error::Serialization(format!(
                "Unknown run state: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Metadata applied alongside a state transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionMeta {
    /// Failure reason to record.
    pub failure_reason: Option<String>,
    /// Records processed, from the external outcome.
    pub records_processed: Option<u64>,
    /// New attempt count (set when a retry is scheduled).
    pub attempt: Option<u32>,
}

impl TransitionMeta {
    /// No metadata.
    pub fn none() -> Self {
        Self::default()
    }

    /// Record a failure reason.
    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Record a successful outcome.
    pub fn success(records_processed: u64) -> Self {
        Self {
            records_processed: Some(records_processed),
            ..Self::default()
        }
    }

    /// Bump the attempt count.
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }
}

/// One tracked attempt (with retries) to synchronize one integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRun {
    /// Unique run identifier.
    pub id: RunId,
    /// Owning integration.
    pub integration_id: IntegrationId,
    /// Deterministic key joining duplicate trigger requests.
    pub idempotency_key: String,
    /// Current lifecycle state.
    pub state: RunState,
    /// 1-indexed attempt number.
    pub attempt: u32,
    /// When the run was accepted and enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// When a worker first claimed the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Last state-store write; drives the recovery staleness check.
    pub updated_at: DateTime<Utc>,
    /// Why the run failed, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Records processed by the last successful external call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records_processed: Option<u64>,
    /// Cooperative cancellation flag, observed at worker checkpoints.
    #[serde(default)]
    pub cancel_requested: bool,
}

impl SyncRun {
    /// Create a new pending run.
    pub fn new(integration_id: IntegrationId, idempotency_key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::generate(),
            integration_id,
            idempotency_key: idempotency_key.into(),
            state: RunState::Pending,
            attempt: 1,
            enqueued_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            failure_reason: None,
            records_processed: None,
            cancel_requested: false,
        }
    }

    /// Returns true if the run is in a terminal state.
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Apply a validated transition in place.
    ///
    /// Callers (the state stores) have already checked the from-state;
    /// this applies target-state bookkeeping and metadata.
    pub(crate) fn apply_transition(&mut self, target: RunState, meta: TransitionMeta) {
        let now = Utc::now();

        match target {
            RunState::Running => {
                self.started_at = Some(now);
            }
            RunState::Succeeded | RunState::Failed | RunState::Cancelled => {
                self.completed_at = Some(now);
            }
            _ => {}
        }

        if let Some(reason) = meta.failure_reason {
            self.failure_reason = Some(reason);
        }
        if let Some(records) = meta.records_processed {
            self.records_processed = Some(records);
        }
        if let Some(attempt) = meta.attempt {
            self.attempt = attempt;
        }

        self.state = target;
        self.updated_at = now;
    }
}

/// Derive the idempotency key for a trigger request.
///
/// Deterministic over integration identity and the caller-supplied (or
/// time-bucketed) trigger token.
pub fn idempotency_key(integration_id: &IntegrationId, trigger_token: &str) -> String {
    format!("{}:{}", integration_id, trigger_token)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> SyncRun {
        let id = IntegrationId::new("erp-main").unwrap();
        SyncRun::new(id.clone(), idempotency_key(&id, "t1"))
    }

    #[test]
    fn terminal_states_admit_no_transitions() {
        for terminal in [RunState::Succeeded, RunState::Failed, RunState::Cancelled] {
            for target in [
                RunState::Pending,
                RunState::Running,
                RunState::RetryScheduled,
                RunState::Succeeded,
                RunState::Failed,
                RunState::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(target));
            }
        }
    }

    #[test]
    fn retry_loop_transitions_are_valid() {
        assert!(RunState::Pending.can_transition_to(RunState::Running));
        assert!(RunState::Running.can_transition_to(RunState::RetryScheduled));
        assert!(RunState::RetryScheduled.can_transition_to(RunState::Pending));
        assert!(RunState::RetryScheduled.can_transition_to(RunState::Cancelled));
        assert!(!RunState::Pending.can_transition_to(RunState::Succeeded));
        assert!(!RunState::RetryScheduled.can_transition_to(RunState::Running));
    }

    #[test]
    fn apply_transition_sets_timestamps() {
        let mut r = run();
        assert!(r.started_at.is_none());

        r.apply_transition(RunState::Running, TransitionMeta::none());
        assert!(r.started_at.is_some());
        assert!(r.completed_at.is_none());

        r.apply_transition(RunState::Succeeded, TransitionMeta::success(42));
        assert!(r.completed_at.is_some());
        assert_eq!(r.records_processed, Some(42));
        assert!(r.is_terminal());
    }

    #[test]
    fn state_round_trips_through_persistence_form() {
        for state in [
            RunState::Pending,
            RunState::Running,
            RunState::RetryScheduled,
            RunState::Succeeded,
            RunState::Failed,
            RunState::Cancelled,
        ] {
            assert_eq!(RunState::parse(state.as_str()).unwrap(), state);
        }
        assert!(RunState::parse("bogus").is_err());
    }

    #[test]
    fn idempotency_key_is_deterministic() {
        let id = IntegrationId::new("erp-main").unwrap();
        assert_eq!(idempotency_key(&id, "t1"), idempotency_key(&id, "t1"));
        assert_ne!(idempotency_key(&id, "t1"), idempotency_key(&id, "t2"));
    }
}
