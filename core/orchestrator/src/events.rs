//! Lifecycle events for live observers.
//!
//! The event stream is a convenience projection; the state store is the
//! authority. Delivery is best-effort and never blocks workers, and a
//! subscriber that attaches mid-run must query current state separately to
//! reconcile.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use tradesync_common::{IntegrationId, RunId};
use tradesync_store::{RunState, SyncRun};

/// What a lifecycle event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A worker claimed the run.
    Started,
    /// Records processed so far, mid-sync.
    Progress,
    /// A transient failure was recorded; a retry is waiting out backoff.
    RetryScheduled,
    /// The run completed.
    Succeeded,
    /// The run permanently failed.
    Failed,
    /// The run was cancelled.
    Cancelled,
}

/// One lifecycle transition, as broadcast to observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub kind: EventKind,
    pub run_id: RunId,
    pub integration_id: IntegrationId,
    pub state: RunState,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records_processed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl RunEvent {
    /// Build an event from a run snapshot.
    pub fn from_run(kind: EventKind, run: &SyncRun, message: Option<String>) -> Self {
        Self {
            kind,
            run_id: run.id.clone(),
            integration_id: run.integration_id.clone(),
            state: run.state,
            attempt: run.attempt,
            records_processed: run.records_processed,
            message,
            timestamp: Utc::now(),
        }
    }

    /// Build a mid-sync progress event.
    pub fn progress(
        run_id: RunId,
        integration_id: IntegrationId,
        attempt: u32,
        records_processed: u64,
    ) -> Self {
        Self {
            kind: EventKind::Progress,
            run_id,
            integration_id,
            state: RunState::Running,
            attempt,
            records_processed: Some(records_processed),
            message: None,
            timestamp: Utc::now(),
        }
    }
}

/// Fire-and-forget broadcast of run events.
#[derive(Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<RunEvent>,
}

impl EventPublisher {
    /// Create a publisher with the given per-subscriber buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Attach a new subscriber. Prior events are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all current subscribers.
    ///
    /// A publish with no subscribers is not an error and nothing is
    /// retried; run state is never affected.
    pub fn publish(&self, event: RunEvent) {
        let _ = self.tx.send(event);
    }
}
