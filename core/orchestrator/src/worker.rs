//! Worker pool: claims work units and drives the sync protocol.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tradesync_client::{ErpClient, SyncContext};
use tradesync_common::{Error, FailureClass, Result};
use tradesync_store::{
    IntegrationRegistry, RunState, StateStore, SyncRun, TransitionMeta, WorkQueue, WorkUnit,
};

use crate::events::{EventKind, EventPublisher, RunEvent};
use crate::retry::RetryPolicy;

/// Shared collaborators for all workers.
pub(crate) struct WorkerContext {
    pub registry: Arc<dyn IntegrationRegistry>,
    pub store: Arc<dyn StateStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub client: Arc<dyn ErpClient>,
    pub policy: RetryPolicy,
    pub events: EventPublisher,
    pub deadline: Duration,
}

/// A fixed-size pool of concurrent sync executors.
pub struct WorkerPool {
    ctx: Arc<WorkerContext>,
    size: usize,
}

impl WorkerPool {
    pub(crate) fn new(ctx: Arc<WorkerContext>, size: usize) -> Self {
        Self {
            ctx,
            size: size.max(1),
        }
    }

    /// Spawn the worker loops.
    pub(crate) fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.size)
            .map(|worker| {
                let ctx = self.ctx.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    run_loop(worker, ctx, shutdown).await;
                })
            })
            .collect()
    }
}

async fn run_loop(worker: usize, ctx: Arc<WorkerContext>, mut shutdown: watch::Receiver<bool>) {
    debug!(worker, "Worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            claimed = ctx.queue.claim() => {
                let unit = match claimed {
                    Ok(unit) => unit,
                    Err(e) => {
                        warn!(worker, "Queue claim failed: {}", e);
                        break;
                    }
                };

                if let Err(e) = process_unit(&ctx, &unit).await {
                    warn!(worker, run_id = %unit.run_id, "Unit processing failed: {}", e);
                }

                // Every handled delivery is acknowledged; outcome
                // transitions were recorded before we get here.
                if let Err(e) = ctx.queue.ack(&unit).await {
                    warn!(worker, "Ack failed: {}", e);
                }
            }
        }
    }

    debug!(worker, "Worker stopped");
}

/// Execute one claimed work unit end to end.
async fn process_unit(ctx: &WorkerContext, unit: &WorkUnit) -> Result<()> {
    // Claim the run. Only the first delivery wins; a redelivered or
    // duplicate unit conflicts here and is silently dropped, which is what
    // makes at-least-once delivery safe.
    let run = match ctx
        .store
        .transition(
            &unit.run_id,
            RunState::Pending,
            RunState::Running,
            TransitionMeta::none(),
        )
        .await
    {
        Ok(run) => run,
        Err(Error::Conflict(reason)) => {
            debug!(run_id = %unit.run_id, "Dropping stale unit: {}", reason);
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    ctx.events
        .publish(RunEvent::from_run(EventKind::Started, &run, None));
    info!(run_id = %run.id, attempt = run.attempt, "Sync started for {}", run.integration_id);

    // Cancellation checkpoint before the external call.
    if run.cancel_requested {
        return finish_cancelled(ctx, &run).await;
    }

    let integration = match ctx.registry.get(&unit.integration_id).await {
        Ok(integration) => integration,
        Err(e) => {
            return finish_failed(ctx, &run, &format!("Integration lookup failed: {}", e)).await;
        }
    };

    let sync_ctx = SyncContext {
        run_id: run.id.clone(),
        attempt: run.attempt,
        updated_since: integration.last_success_at,
        deadline: ctx.deadline,
    };

    let progress = {
        let events = ctx.events.clone();
        let run_id = run.id.clone();
        let integration_id = run.integration_id.clone();
        let attempt = run.attempt;
        move |records: u64| {
            events.publish(RunEvent::progress(
                run_id.clone(),
                integration_id.clone(),
                attempt,
                records,
            ));
        }
    };

    let outcome = match tokio::time::timeout(
        ctx.deadline,
        ctx.client
            .execute_sync(&integration.connection, &sync_ctx, &progress),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(Error::transient(format!(
            "Deadline of {:?} exceeded",
            ctx.deadline
        ))),
    };

    match outcome {
        Ok(result) => finish_succeeded(ctx, &run, result.records_processed).await,
        Err(err) => {
            // Checkpoint after the call: a cancellation observed here wins
            // over scheduling a retry.
            let current = ctx.store.get(&run.id).await?;
            if current.cancel_requested {
                return finish_cancelled(ctx, &current).await;
            }

            let class = err.failure_class().unwrap_or(FailureClass::Permanent);
            let reason = err.to_string();

            if ctx.policy.should_retry(current.attempt, class) {
                schedule_retry(ctx, &current, reason).await
            } else {
                finish_failed(ctx, &current, &reason).await
            }
        }
    }
}

async fn finish_succeeded(ctx: &WorkerContext, run: &SyncRun, records: u64) -> Result<()> {
    let updated = ctx
        .store
        .transition(
            &run.id,
            RunState::Running,
            RunState::Succeeded,
            TransitionMeta::success(records),
        )
        .await?;

    if let Err(e) = ctx
        .registry
        .record_success(&run.integration_id, Utc::now())
        .await
    {
        warn!("Failed to record success for {}: {}", run.integration_id, e);
    }
    clear_pointer(ctx, run).await;

    ctx.events
        .publish(RunEvent::from_run(EventKind::Succeeded, &updated, None));
    info!(
        run_id = %run.id,
        records,
        attempt = updated.attempt,
        "Sync succeeded for {}",
        run.integration_id
    );
    Ok(())
}

async fn finish_failed(ctx: &WorkerContext, run: &SyncRun, reason: &str) -> Result<()> {
    let updated = ctx
        .store
        .transition(
            &run.id,
            RunState::Running,
            RunState::Failed,
            TransitionMeta::failure(reason),
        )
        .await?;

    if let Err(e) = ctx.registry.record_failure(&run.integration_id, reason).await {
        warn!("Failed to record failure for {}: {}", run.integration_id, e);
    }
    clear_pointer(ctx, run).await;

    ctx.events.publish(RunEvent::from_run(
        EventKind::Failed,
        &updated,
        Some(reason.to_string()),
    ));
    warn!(run_id = %run.id, "Sync failed for {}: {}", run.integration_id, reason);
    Ok(())
}

async fn finish_cancelled(ctx: &WorkerContext, run: &SyncRun) -> Result<()> {
    let updated = ctx
        .store
        .transition(
            &run.id,
            RunState::Running,
            RunState::Cancelled,
            TransitionMeta::none(),
        )
        .await?;

    clear_pointer(ctx, run).await;
    ctx.events.publish(RunEvent::from_run(
        EventKind::Cancelled,
        &updated,
        Some("cancellation requested".to_string()),
    ));
    info!(run_id = %run.id, "Sync cancelled for {}", run.integration_id);
    Ok(())
}

/// Record a transient failure and schedule the delayed re-enqueue.
///
/// Waiting happens on a timer, never on a held worker. The same run is
/// re-enqueued with a bumped attempt count; a new run is never created.
async fn schedule_retry(ctx: &WorkerContext, run: &SyncRun, reason: String) -> Result<()> {
    let next_attempt = run.attempt + 1;
    let scheduled = ctx
        .store
        .transition(
            &run.id,
            RunState::Running,
            RunState::RetryScheduled,
            TransitionMeta::failure(reason.clone()).with_attempt(next_attempt),
        )
        .await?;

    let delay = ctx.policy.next_delay(run.attempt);
    ctx.events.publish(RunEvent::from_run(
        EventKind::RetryScheduled,
        &scheduled,
        Some(format!("Retrying in {:?}", delay)),
    ));
    warn!(
        run_id = %run.id,
        attempt = run.attempt,
        "Transient failure, retrying in {:?}: {}",
        delay,
        reason
    );

    let store = ctx.store.clone();
    let queue = ctx.queue.clone();
    let unit = WorkUnit {
        run_id: run.id.clone(),
        integration_id: run.integration_id.clone(),
        attempt: next_attempt,
    };

    tokio::spawn(async move {
        tokio::time::sleep(delay).await;

        match store
            .transition(
                &unit.run_id,
                RunState::RetryScheduled,
                RunState::Pending,
                TransitionMeta::none(),
            )
            .await
        {
            Ok(_) => {
                if let Err(e) = queue.enqueue(unit, None).await {
                    warn!("Re-enqueue failed: {}", e);
                }
            }
            Err(Error::Conflict(_)) => {
                // Cancelled (or otherwise moved on) during backoff.
                debug!(run_id = %unit.run_id, "Backoff elapsed but run moved on");
            }
            Err(e) => warn!(run_id = %unit.run_id, "Retry wake-up failed: {}", e),
        }
    });

    Ok(())
}

async fn clear_pointer(ctx: &WorkerContext, run: &SyncRun) {
    if let Err(e) = ctx
        .registry
        .clear_current_run(&run.integration_id, &run.id)
        .await
    {
        // The pointer may already reference a newer run.
        debug!(run_id = %run.id, "Current-run pointer not cleared: {}", e);
    }
}
