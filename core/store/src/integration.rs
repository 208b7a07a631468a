//! Integration records and the registry contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

use tradesync_client::Connection;
use tradesync_common::{Error, IntegrationId, Result, RunId};

/// A configured connection to one external system instance.
///
/// Created by configuration management; mutated only through registry
/// operations. Never deleted while a run references it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Integration {
    /// Unique integration identifier.
    pub id: IntegrationId,
    /// Human-readable name.
    pub name: String,
    /// Endpoint descriptor, owned by the client collaborator.
    pub connection: Connection,
    /// Disabled integrations are skipped by triggers and schedules.
    pub enabled: bool,
    /// Reference to the run currently owning this integration, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_run: Option<RunId>,
    /// When the last sync succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
    /// Why the last sync failed, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,
    /// Lifetime sync counters.
    #[serde(default)]
    pub total_syncs: u64,
    #[serde(default)]
    pub successful_syncs: u64,
    #[serde(default)]
    pub failed_syncs: u64,
    /// Periodic sync interval in seconds; None disables scheduling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_interval_secs: Option<u64>,
}

impl Integration {
    /// Create an enabled integration with empty history.
    pub fn new(id: IntegrationId, name: impl Into<String>, connection: Connection) -> Self {
        Self {
            id,
            name: name.into(),
            connection,
            enabled: true,
            current_run: None,
            last_success_at: None,
            last_failure: None,
            total_syncs: 0,
            successful_syncs: 0,
            failed_syncs: 0,
            sync_interval_secs: None,
        }
    }

    /// Enable periodic syncs at the given interval.
    pub fn with_sync_interval(mut self, secs: u64) -> Self {
        self.sync_interval_secs = Some(secs);
        self
    }
}

/// Registry of configured integrations.
///
/// The current-run pointer only moves through compare-and-set so that
/// concurrent dispatchers cannot clobber each other.
#[async_trait]
pub trait IntegrationRegistry: Send + Sync {
    /// Fetch an integration by id.
    ///
    /// # Errors
    /// - `NotFound` when the integration is unknown
    async fn get(&self, id: &IntegrationId) -> Result<Integration>;

    /// All enabled integrations.
    async fn list_enabled(&self) -> Result<Vec<Integration>>;

    /// Point the integration at a new current run.
    ///
    /// # Errors
    /// - `NotFound` for an unknown integration
    /// - `Conflict` when the existing pointer does not match `expected`
    async fn set_current_run(
        &self,
        id: &IntegrationId,
        expected: Option<&RunId>,
        new: &RunId,
    ) -> Result<()>;

    /// Clear the current-run pointer.
    ///
    /// # Errors
    /// - `NotFound` for an unknown integration
    /// - `Conflict` when the pointer does not reference `expected`
    async fn clear_current_run(&self, id: &IntegrationId, expected: &RunId) -> Result<()>;

    /// Record a successful sync: bumps counters, clears the last failure.
    async fn record_success(&self, id: &IntegrationId, at: DateTime<Utc>) -> Result<()>;

    /// Record a failed sync: bumps counters, keeps the failure reason.
    async fn record_failure(&self, id: &IntegrationId, reason: &str) -> Result<()>;
}

/// In-memory registry.
///
/// Useful for testing and single-process deployments. All data is lost on
/// drop.
pub struct MemoryRegistry {
    integrations: RwLock<HashMap<IntegrationId, Integration>>,
}

impl MemoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            integrations: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace an integration.
    pub fn insert(&self, integration: Integration) {
        self.integrations
            .write()
            .unwrap()
            .insert(integration.id.clone(), integration);
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IntegrationRegistry for MemoryRegistry {
    async fn get(&self, id: &IntegrationId) -> Result<Integration> {
        self.integrations
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Integration not found: {}", id)))
    }

    async fn list_enabled(&self) -> Result<Vec<Integration>> {
        Ok(self
            .integrations
            .read()
            .unwrap()
            .values()
            .filter(|i| i.enabled)
            .cloned()
            .collect())
    }

    async fn set_current_run(
        &self,
        id: &IntegrationId,
        expected: Option<&RunId>,
        new: &RunId,
    ) -> Result<()> {
        let mut integrations = self.integrations.write().unwrap();
        let integration = integrations
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Integration not found: {}", id)))?;

        if integration.current_run.as_ref() != expected {
            return Err(Error::Conflict(format!(
                "Current-run pointer for {} moved concurrently",
                id
            )));
        }

        integration.current_run = Some(new.clone());
        Ok(())
    }

    async fn clear_current_run(&self, id: &IntegrationId, expected: &RunId) -> Result<()> {
        let mut integrations = self.integrations.write().unwrap();
        let integration = integrations
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Integration not found: {}", id)))?;

        if integration.current_run.as_ref() != Some(expected) {
            return Err(Error::Conflict(format!(
                "Current-run pointer for {} does not reference {}",
                id, expected
            )));
        }

        integration.current_run = None;
        Ok(())
    }

    async fn record_success(&self, id: &IntegrationId, at: DateTime<Utc>) -> Result<()> {
        let mut integrations = self.integrations.write().unwrap();
        let integration = integrations
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Integration not found: {}", id)))?;

        integration.total_syncs += 1;
        integration.successful_syncs += 1;
        integration.last_success_at = Some(at);
        integration.last_failure = None;
        Ok(())
    }

    async fn record_failure(&self, id: &IntegrationId, reason: &str) -> Result<()> {
        let mut integrations = self.integrations.write().unwrap();
        let integration = integrations
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Integration not found: {}", id)))?;

        integration.total_syncs += 1;
        integration.failed_syncs += 1;
        integration.last_failure = Some(reason.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(id: &str) -> (MemoryRegistry, IntegrationId) {
        let registry = MemoryRegistry::new();
        let id = IntegrationId::new(id).unwrap();
        registry.insert(Integration::new(
            id.clone(),
            "Main ERP",
            Connection::new("http://erp.local", None),
        ));
        (registry, id)
    }

    #[tokio::test]
    async fn get_unknown_integration_is_not_found() {
        let registry = MemoryRegistry::new();
        let id = IntegrationId::new("ghost").unwrap();
        assert!(matches!(
            registry.get(&id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn current_run_pointer_is_compare_and_set() {
        let (registry, id) = registry_with("erp-main");
        let run_a = RunId::generate();
        let run_b = RunId::generate();

        registry.set_current_run(&id, None, &run_a).await.unwrap();

        // A second writer with a stale expectation loses the race.
        let err = registry.set_current_run(&id, None, &run_b).await;
        assert!(matches!(err, Err(Error::Conflict(_))));

        // Clearing against the wrong run is also a conflict.
        let err = registry.clear_current_run(&id, &run_b).await;
        assert!(matches!(err, Err(Error::Conflict(_))));

        registry.clear_current_run(&id, &run_a).await.unwrap();
        assert!(registry.get(&id).await.unwrap().current_run.is_none());
    }

    #[tokio::test]
    async fn counters_track_outcomes() {
        let (registry, id) = registry_with("erp-main");

        registry.record_failure(&id, "timeout").await.unwrap();
        registry.record_success(&id, Utc::now()).await.unwrap();

        let integration = registry.get(&id).await.unwrap();
        assert_eq!(integration.total_syncs, 2);
        assert_eq!(integration.successful_syncs, 1);
        assert_eq!(integration.failed_syncs, 1);
        assert!(integration.last_failure.is_none());
        assert!(integration.last_success_at.is_some());
    }
}
