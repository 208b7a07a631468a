//! Orchestrator facade: the single entry point for callers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use chrono::Utc;
use tradesync_client::ErpClient;
use tradesync_common::{Error, IntegrationId, Result, RunId};
use tradesync_store::{
    IntegrationRegistry, RunState, StateStore, SyncRun, TransitionMeta, WorkQueue,
};

use crate::config::OrchestratorConfig;
use crate::dispatcher::{Dispatcher, RunHandle};
use crate::events::{EventKind, EventPublisher, RunEvent};
use crate::recovery::{RecoverySweep, SweepReport};
use crate::worker::{WorkerContext, WorkerPool};

/// Composes the registry, state store, queue, worker pool, retry policy
/// and event publisher behind one API: request a sync, query status,
/// cancel, subscribe to events.
pub struct Orchestrator {
    registry: Arc<dyn IntegrationRegistry>,
    store: Arc<dyn StateStore>,
    queue: Arc<dyn WorkQueue>,
    client: Arc<dyn ErpClient>,
    config: OrchestratorConfig,
    events: EventPublisher,
    dispatcher: Dispatcher,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Wire up an orchestrator over the shared collaborators.
    ///
    /// Nothing runs until [`start`](Self::start) is called.
    pub fn new(
        registry: Arc<dyn IntegrationRegistry>,
        store: Arc<dyn StateStore>,
        queue: Arc<dyn WorkQueue>,
        client: Arc<dyn ErpClient>,
        config: OrchestratorConfig,
    ) -> Self {
        let events = EventPublisher::new(config.event_capacity);
        let dispatcher = Dispatcher::new(registry.clone(), store.clone(), queue.clone());
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            registry,
            store,
            queue,
            client,
            config,
            events,
            dispatcher,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Run the recovery sweep, then start workers and the scheduler.
    ///
    /// The sweep runs before any worker so orphans are resolved exactly
    /// once, against a quiet store.
    pub async fn start(&self) -> Result<SweepReport> {
        let sweep = RecoverySweep::new(
            self.registry.clone(),
            self.store.clone(),
            self.queue.clone(),
            self.config.retry_policy(),
            self.events.clone(),
            self.config.staleness_threshold,
        );
        let report = sweep.run().await?;

        let ctx = Arc::new(WorkerContext {
            registry: self.registry.clone(),
            store: self.store.clone(),
            queue: self.queue.clone(),
            client: self.client.clone(),
            policy: self.config.retry_policy(),
            events: self.events.clone(),
            deadline: self.config.external_deadline,
        });

        let pool = WorkerPool::new(ctx, self.config.worker_count);
        let mut tasks = pool.spawn(self.shutdown_tx.subscribe());

        if let Some(tick) = self.config.schedule_tick {
            tasks.push(self.spawn_scheduler(tick));
        }

        self.tasks.lock().unwrap().extend(tasks);
        info!(
            workers = self.config.worker_count,
            "Orchestrator started"
        );
        Ok(report)
    }

    /// Request a sync; duplicate triggers join the in-flight run.
    pub async fn request_sync(
        &self,
        integration_id: &IntegrationId,
        trigger_token: &str,
    ) -> Result<RunHandle> {
        self.dispatcher
            .request_sync(integration_id, trigger_token)
            .await
    }

    /// Current projection of a run.
    pub async fn status(&self, run_id: &RunId) -> Result<SyncRun> {
        self.store.get(run_id).await
    }

    /// Best-effort cancellation.
    ///
    /// A run not yet claimed is cancelled outright. A running run gets a
    /// cooperative flag the worker observes at its next checkpoint, since
    /// an in-flight external call cannot be aborted mid-protocol.
    ///
    /// # Errors
    /// - `NotCancellable` if the run is already terminal
    pub async fn cancel(&self, run_id: &RunId) -> Result<SyncRun> {
        let run = self.store.get(run_id).await?;

        match run.state {
            RunState::Pending | RunState::RetryScheduled => {
                match self
                    .store
                    .transition(run_id, run.state, RunState::Cancelled, TransitionMeta::none())
                    .await
                {
                    Ok(cancelled) => {
                        if let Err(e) = self
                            .registry
                            .clear_current_run(&cancelled.integration_id, run_id)
                            .await
                        {
                            tracing::debug!(%run_id, "Current-run pointer not cleared: {}", e);
                        }
                        self.events.publish(RunEvent::from_run(
                            EventKind::Cancelled,
                            &cancelled,
                            Some("cancelled before execution".to_string()),
                        ));
                        info!(%run_id, "Run cancelled");
                        Ok(cancelled)
                    }
                    Err(Error::Conflict(_)) => {
                        // A worker claimed it first; fall back to the flag.
                        self.store.request_cancel(run_id).await
                    }
                    Err(e) => Err(e),
                }
            }
            RunState::Running => self.store.request_cancel(run_id).await,
            RunState::Succeeded | RunState::Failed | RunState::Cancelled => {
                Err(Error::NotCancellable(format!(
                    "Run {} already {}",
                    run_id, run.state
                )))
            }
        }
    }

    /// Attach a live observer to the event stream.
    ///
    /// Events published before attaching are not replayed; reconcile with
    /// [`status`](Self::status).
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Probe an integration's external endpoint.
    pub async fn check_health(&self, integration_id: &IntegrationId) -> Result<bool> {
        let integration = self.registry.get(integration_id).await?;
        self.client.health_check(&integration.connection).await
    }

    /// Stop workers and the scheduler, waiting for in-flight units.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<_> = {
            let mut guard = self.tasks.lock().unwrap();
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        info!("Orchestrator stopped");
    }

    /// Periodic trigger loop.
    ///
    /// Each tick fires at most one sync per integration per interval
    /// bucket; the time-bucketed trigger token means a duplicate firing
    /// collapses onto the in-flight run through the normal idempotency
    /// path.
    fn spawn_scheduler(&self, tick: std::time::Duration) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let dispatcher = self.dispatcher.clone();
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut fired: HashMap<IntegrationId, i64> = HashMap::new();
            let mut interval = tokio::time::interval(tick);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = interval.tick() => {
                        let integrations = match registry.list_enabled().await {
                            Ok(integrations) => integrations,
                            Err(e) => {
                                warn!("Scheduler could not list integrations: {}", e);
                                continue;
                            }
                        };

                        for integration in integrations {
                            let Some(secs) = integration.sync_interval_secs else {
                                continue;
                            };
                            if secs == 0 {
                                continue;
                            }

                            let bucket = Utc::now().timestamp() / secs as i64;
                            if fired.get(&integration.id) == Some(&bucket) {
                                continue;
                            }

                            let token = format!("scheduled-{}", bucket);
                            match dispatcher.request_sync(&integration.id, &token).await {
                                Ok(handle) => {
                                    fired.insert(integration.id.clone(), bucket);
                                    if !handle.joined {
                                        info!(
                                            run_id = %handle.run_id,
                                            "Scheduled sync fired for {}",
                                            integration.id
                                        );
                                    }
                                }
                                Err(e) => {
                                    warn!("Scheduled sync for {} failed: {}", integration.id, e);
                                }
                            }
                        }
                    }
                }
            }
        })
    }
}
