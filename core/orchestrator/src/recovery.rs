//! Startup recovery sweep for orphaned runs.
//!
//! A worker that crashes mid-job leaves its run in `Running` with no one
//! to finish it, and a restart loses in-memory backoff timers. The sweep
//! re-examines every non-terminal run once, before workers start, and
//! resolves both without requiring worker-side heartbeats.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use tradesync_common::{Error, FailureClass, Result};
use tradesync_store::{
    IntegrationRegistry, RunState, StateStore, SyncRun, TransitionMeta, WorkQueue, WorkUnit,
};

use crate::events::{EventKind, EventPublisher, RunEvent};
use crate::retry::RetryPolicy;

/// What one sweep resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Pending or retry-scheduled runs put back on the queue.
    pub requeued: u32,
    /// Stale running runs given a fresh attempt.
    pub rescheduled: u32,
    /// Stale running runs failed with exhausted attempts.
    pub orphaned: u32,
}

/// Startup-time reconciliation of non-terminal runs.
pub struct RecoverySweep {
    registry: Arc<dyn IntegrationRegistry>,
    store: Arc<dyn StateStore>,
    queue: Arc<dyn WorkQueue>,
    policy: RetryPolicy,
    events: EventPublisher,
    staleness: Duration,
}

impl RecoverySweep {
    pub fn new(
        registry: Arc<dyn IntegrationRegistry>,
        store: Arc<dyn StateStore>,
        queue: Arc<dyn WorkQueue>,
        policy: RetryPolicy,
        events: EventPublisher,
        staleness: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            queue,
            policy,
            events,
            staleness,
        }
    }

    /// Run the sweep once.
    pub async fn run(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for run in self.store.list_non_terminal().await? {
            match run.state {
                RunState::Pending => {
                    // The queue message may not have survived; duplicates
                    // are dropped at claim time, so requeueing is safe.
                    self.enqueue(&run, run.attempt).await?;
                    report.requeued += 1;
                }
                RunState::RetryScheduled => {
                    // The backoff timer did not survive the restart.
                    match self
                        .store
                        .transition(
                            &run.id,
                            RunState::RetryScheduled,
                            RunState::Pending,
                            TransitionMeta::none(),
                        )
                        .await
                    {
                        Ok(_) => {
                            self.enqueue(&run, run.attempt).await?;
                            report.requeued += 1;
                        }
                        Err(Error::Conflict(_)) => {
                            debug!(run_id = %run.id, "Run moved on during sweep");
                        }
                        Err(e) => return Err(e),
                    }
                }
                RunState::Running => {
                    let age = (Utc::now() - run.updated_at).to_std().unwrap_or_default();
                    if age < self.staleness {
                        continue;
                    }
                    self.resolve_orphan(&run, &mut report).await?;
                }
                _ => {}
            }
        }

        info!(
            requeued = report.requeued,
            rescheduled = report.rescheduled,
            orphaned = report.orphaned,
            "Recovery sweep complete"
        );
        Ok(report)
    }

    /// Resolve a Running run whose worker is gone.
    ///
    /// With attempts remaining the run gets a fresh attempt through the
    /// normal retry edges, so terminal-state immutability holds; only an
    /// exhausted run is forced to Failed.
    async fn resolve_orphan(&self, run: &SyncRun, report: &mut SweepReport) -> Result<()> {
        if self.policy.should_retry(run.attempt, FailureClass::Transient) {
            let next_attempt = run.attempt + 1;
            match self
                .store
                .transition(
                    &run.id,
                    RunState::Running,
                    RunState::RetryScheduled,
                    TransitionMeta::failure("orphaned").with_attempt(next_attempt),
                )
                .await
            {
                Ok(_) => {}
                Err(Error::Conflict(_)) => {
                    debug!(run_id = %run.id, "Run moved on during sweep");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
            self.store
                .transition(
                    &run.id,
                    RunState::RetryScheduled,
                    RunState::Pending,
                    TransitionMeta::none(),
                )
                .await?;
            self.enqueue(run, next_attempt).await?;

            warn!(
                run_id = %run.id,
                attempt = next_attempt,
                "Orphaned run re-enqueued for {}",
                run.integration_id
            );
            report.rescheduled += 1;
        } else {
            let failed = match self
                .store
                .transition(
                    &run.id,
                    RunState::Running,
                    RunState::Failed,
                    TransitionMeta::failure("orphaned"),
                )
                .await
            {
                Ok(failed) => failed,
                Err(Error::Conflict(_)) => {
                    debug!(run_id = %run.id, "Run moved on during sweep");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            if let Err(e) = self
                .registry
                .record_failure(&run.integration_id, "orphaned")
                .await
            {
                warn!("Failed to record orphan for {}: {}", run.integration_id, e);
            }
            if let Err(e) = self
                .registry
                .clear_current_run(&run.integration_id, &run.id)
                .await
            {
                debug!(run_id = %run.id, "Current-run pointer not cleared: {}", e);
            }

            self.events.publish(RunEvent::from_run(
                EventKind::Failed,
                &failed,
                Some("orphaned".to_string()),
            ));
            warn!(run_id = %run.id, "Orphaned run failed for {}", run.integration_id);
            report.orphaned += 1;
        }
        Ok(())
    }

    async fn enqueue(&self, run: &SyncRun, attempt: u32) -> Result<()> {
        self.queue
            .enqueue(
                WorkUnit {
                    run_id: run.id.clone(),
                    integration_id: run.integration_id.clone(),
                    attempt,
                },
                None,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tradesync_client::Connection;
    use tradesync_common::IntegrationId;
    use tradesync_store::{
        idempotency_key, Integration, MemoryQueue, MemoryRegistry, MemoryStateStore,
    };

    struct Harness {
        registry: Arc<MemoryRegistry>,
        store: Arc<MemoryStateStore>,
        queue: Arc<MemoryQueue>,
        id: IntegrationId,
    }

    impl Harness {
        fn new() -> Self {
            let registry = Arc::new(MemoryRegistry::new());
            let id = IntegrationId::new("erp-main").unwrap();
            registry.insert(Integration::new(
                id.clone(),
                "Main ERP",
                Connection::new("http://erp.local", None),
            ));
            Self {
                registry,
                store: Arc::new(MemoryStateStore::new()),
                queue: Arc::new(MemoryQueue::new()),
                id,
            }
        }

        fn sweep(&self, max_attempts: u32) -> RecoverySweep {
            RecoverySweep::new(
                self.registry.clone(),
                self.store.clone(),
                self.queue.clone(),
                RetryPolicy::new(max_attempts).with_jitter(false),
                EventPublisher::new(16),
                Duration::ZERO,
            )
        }

        async fn run_in_state(&self, state: RunState, attempt: u32) -> SyncRun {
            let key = idempotency_key(&self.id, "t1");
            let run = self
                .store
                .create_run(&self.id, &key)
                .await
                .unwrap()
                .run()
                .clone();

            if matches!(state, RunState::Running | RunState::RetryScheduled) {
                self.store
                    .transition(
                        &run.id,
                        RunState::Pending,
                        RunState::Running,
                        TransitionMeta::none(),
                    )
                    .await
                    .unwrap();
            }
            if state == RunState::RetryScheduled {
                self.store
                    .transition(
                        &run.id,
                        RunState::Running,
                        RunState::RetryScheduled,
                        TransitionMeta::failure("timeout").with_attempt(attempt),
                    )
                    .await
                    .unwrap();
            }
            self.store.get(&run.id).await.unwrap()
        }
    }

    #[tokio::test]
    async fn pending_runs_are_requeued() {
        let h = Harness::new();
        let run = h.run_in_state(RunState::Pending, 1).await;

        let report = h.sweep(3).run().await.unwrap();
        assert_eq!(report.requeued, 1);

        let unit = h.queue.claim().await.unwrap();
        assert_eq!(unit.run_id, run.id);
    }

    #[tokio::test]
    async fn stale_running_run_gets_a_fresh_attempt() {
        let h = Harness::new();
        let run = h.run_in_state(RunState::Running, 1).await;

        let report = h.sweep(3).run().await.unwrap();
        assert_eq!(report.rescheduled, 1);

        let recovered = h.store.get(&run.id).await.unwrap();
        assert_eq!(recovered.state, RunState::Pending);
        assert_eq!(recovered.attempt, 2);
        assert_eq!(recovered.failure_reason.as_deref(), Some("orphaned"));

        let unit = h.queue.claim().await.unwrap();
        assert_eq!(unit.attempt, 2);
    }

    #[tokio::test]
    async fn exhausted_orphan_is_failed() {
        let h = Harness::new();
        let run = h.run_in_state(RunState::Running, 1).await;
        // Exhaust the budget: attempt already at the cap.
        let report = h.sweep(1).run().await.unwrap();
        assert_eq!(report.orphaned, 1);

        let failed = h.store.get(&run.id).await.unwrap();
        assert_eq!(failed.state, RunState::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("orphaned"));

        let integration = h.registry.get(&h.id).await.unwrap();
        assert_eq!(integration.failed_syncs, 1);
    }

    #[tokio::test]
    async fn fresh_running_run_is_left_alone() {
        let h = Harness::new();
        let run = h.run_in_state(RunState::Running, 1).await;

        let sweep = RecoverySweep::new(
            h.registry.clone(),
            h.store.clone(),
            h.queue.clone(),
            RetryPolicy::new(3),
            EventPublisher::new(16),
            Duration::from_secs(3600),
        );

        let report = sweep.run().await.unwrap();
        assert_eq!(report, SweepReport::default());
        assert_eq!(h.store.get(&run.id).await.unwrap().state, RunState::Running);
    }

    #[tokio::test]
    async fn interrupted_backoff_is_requeued() {
        let h = Harness::new();
        let run = h.run_in_state(RunState::RetryScheduled, 2).await;

        let report = h.sweep(3).run().await.unwrap();
        assert_eq!(report.requeued, 1);

        let recovered = h.store.get(&run.id).await.unwrap();
        assert_eq!(recovered.state, RunState::Pending);
        assert_eq!(recovered.attempt, 2);
    }
}
