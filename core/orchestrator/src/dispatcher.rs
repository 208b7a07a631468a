//! Task dispatcher: accepts sync requests and enqueues work units.

use std::sync::Arc;
use tracing::{debug, info, warn};

use tradesync_common::{Error, IntegrationId, Result, RunId};
use tradesync_store::{
    idempotency_key, IntegrationRegistry, RunCreation, StateStore, WorkQueue, WorkUnit,
};

/// What a caller gets back from a sync request.
///
/// `joined` distinguishes a fresh run from an attach onto an in-flight
/// one; callers may ignore it.
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub run_id: RunId,
    pub joined: bool,
}

/// Serializes per-integration submissions and publishes work units.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<dyn IntegrationRegistry>,
    store: Arc<dyn StateStore>,
    queue: Arc<dyn WorkQueue>,
}

impl Dispatcher {
    /// Create a dispatcher over the shared collaborators.
    pub fn new(
        registry: Arc<dyn IntegrationRegistry>,
        store: Arc<dyn StateStore>,
        queue: Arc<dyn WorkQueue>,
    ) -> Self {
        Self {
            registry,
            store,
            queue,
        }
    }

    /// Request a sync for an integration.
    ///
    /// Duplicate requests while a run is in flight join that run instead
    /// of creating a new one. On creation, the run record is durably
    /// written before the work unit is published, so a worker can never
    /// race ahead of the bookkeeping.
    ///
    /// # Errors
    /// - `NotFound` for an unknown integration
    /// - `InvalidInput` for a disabled integration
    pub async fn request_sync(
        &self,
        integration_id: &IntegrationId,
        trigger_token: &str,
    ) -> Result<RunHandle> {
        let integration = self.registry.get(integration_id).await?;
        if !integration.enabled {
            return Err(Error::InvalidInput(format!(
                "Integration {} is disabled",
                integration_id
            )));
        }

        let key = idempotency_key(integration_id, trigger_token);

        match self.store.create_run(integration_id, &key).await? {
            RunCreation::Joined(run) => {
                debug!(
                    run_id = %run.id,
                    "Request joined in-flight run for {}",
                    integration_id
                );
                Ok(RunHandle {
                    run_id: run.id,
                    joined: true,
                })
            }
            RunCreation::Created(run) => {
                self.point_current_run(integration_id, integration.current_run.as_ref(), &run.id)
                    .await;

                // Write-then-enqueue: the store already holds the run.
                self.queue
                    .enqueue(
                        WorkUnit {
                            run_id: run.id.clone(),
                            integration_id: integration_id.clone(),
                            attempt: run.attempt,
                        },
                        None,
                    )
                    .await?;

                info!(run_id = %run.id, "Sync run created for {}", integration_id);
                Ok(RunHandle {
                    run_id: run.id,
                    joined: false,
                })
            }
        }
    }

    /// Move the registry's current-run pointer to the new run.
    ///
    /// The pointer is bookkeeping; single-flight is enforced by the store,
    /// so a lost race here is logged, not surfaced.
    async fn point_current_run(
        &self,
        integration_id: &IntegrationId,
        expected: Option<&RunId>,
        new: &RunId,
    ) {
        match self
            .registry
            .set_current_run(integration_id, expected, new)
            .await
        {
            Ok(()) => {}
            Err(Error::Conflict(_)) => {
                // The snapshot was stale; reread and retry once.
                let fresh = match self.registry.get(integration_id).await {
                    Ok(integration) => integration.current_run,
                    Err(e) => {
                        warn!("Failed to reread {} for pointer update: {}", integration_id, e);
                        return;
                    }
                };
                if let Err(e) = self
                    .registry
                    .set_current_run(integration_id, fresh.as_ref(), new)
                    .await
                {
                    warn!(
                        "Current-run pointer update lost for {}: {}",
                        integration_id, e
                    );
                }
            }
            Err(e) => warn!(
                "Current-run pointer update failed for {}: {}",
                integration_id, e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tradesync_client::Connection;
    use tradesync_store::{Integration, MemoryQueue, MemoryRegistry, MemoryStateStore};

    fn harness() -> (Dispatcher, Arc<MemoryStateStore>, Arc<MemoryQueue>, IntegrationId) {
        let registry = Arc::new(MemoryRegistry::new());
        let store = Arc::new(MemoryStateStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let id = IntegrationId::new("erp-main").unwrap();

        registry.insert(Integration::new(
            id.clone(),
            "Main ERP",
            Connection::new("http://erp.local", None),
        ));

        let dispatcher = Dispatcher::new(registry, store.clone(), queue.clone());
        (dispatcher, store, queue, id)
    }

    #[tokio::test]
    async fn duplicate_request_joins_existing_run() {
        let (dispatcher, _store, queue, id) = harness();

        let first = dispatcher.request_sync(&id, "t1").await.unwrap();
        assert!(!first.joined);

        let second = dispatcher.request_sync(&id, "t1").await.unwrap();
        assert!(second.joined);
        assert_eq!(second.run_id, first.run_id);

        // Exactly one work unit was published.
        let unit = queue.claim().await.unwrap();
        assert_eq!(unit.run_id, first.run_id);
    }

    #[tokio::test]
    async fn unknown_integration_is_surfaced() {
        let (dispatcher, _, _, _) = harness();
        let ghost = IntegrationId::new("ghost").unwrap();
        assert!(matches!(
            dispatcher.request_sync(&ghost, "t1").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn disabled_integration_is_rejected() {
        let registry = Arc::new(MemoryRegistry::new());
        let id = IntegrationId::new("erp-off").unwrap();
        let mut integration = Integration::new(
            id.clone(),
            "Disabled ERP",
            Connection::new("http://erp.local", None),
        );
        integration.enabled = false;
        registry.insert(integration);

        let dispatcher = Dispatcher::new(
            registry,
            Arc::new(MemoryStateStore::new()),
            Arc::new(MemoryQueue::new()),
        );

        assert!(matches!(
            dispatcher.request_sync(&id, "t1").await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_requests_collapse_to_one_run() {
        let (dispatcher, _, _, id) = harness();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let dispatcher = dispatcher.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                dispatcher.request_sync(&id, "t1").await.unwrap()
            }));
        }

        let mut run_ids = Vec::new();
        let mut fresh = 0;
        for handle in handles {
            let result = handle.await.unwrap();
            if !result.joined {
                fresh += 1;
            }
            run_ids.push(result.run_id);
        }

        assert_eq!(fresh, 1);
        assert!(run_ids.windows(2).all(|w| w[0] == w[1]));
    }
}
