//! External-system client trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use tradesync_common::{Result, RunId};

/// Connection descriptor for one external system instance.
///
/// Owned by the integration configuration; the orchestrator core passes it
/// through without interpreting it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    /// Base URL of the external system's API publication.
    pub base_url: String,
    /// API key sent with every request, if the endpoint requires one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Connection {
    /// Create a connection descriptor.
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
        }
    }
}

/// Per-invocation context for a sync call.
#[derive(Debug, Clone)]
pub struct SyncContext {
    /// Run this invocation belongs to.
    pub run_id: RunId,
    /// 1-indexed attempt number.
    pub attempt: u32,
    /// Only fetch records changed after this instant (incremental sync).
    pub updated_since: Option<DateTime<Utc>>,
    /// Deadline for the whole sync protocol.
    pub deadline: Duration,
}

/// Result of a completed sync protocol run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncOutcome {
    /// Total records fetched and handed to the platform.
    pub records_processed: u64,
}

/// Callback invoked with the running record count as pages complete.
pub type ProgressSink<'a> = &'a (dyn Fn(u64) + Send + Sync);

/// Client for one kind of external enterprise system.
///
/// Implementations own their wire protocol and authentication. Failures
/// must be reported as `Error::External` with an accurate
/// [`FailureClass`](tradesync_common::FailureClass) so the orchestrator can
/// decide whether to retry.
#[async_trait]
pub trait ErpClient: Send + Sync {
    /// Client kind name (e.g. "onec-http", "mock").
    fn name(&self) -> &str;

    /// Probe the external system for liveness.
    ///
    /// # Errors
    /// - Network/transport failures
    async fn health_check(&self, conn: &Connection) -> Result<bool>;

    /// Run the sync protocol against the external system.
    ///
    /// # Preconditions
    /// - `conn` describes a reachable endpoint
    ///
    /// # Postconditions
    /// - On success, every available record page has been fetched
    /// - `progress` was invoked at least once per fetched page
    ///
    /// # Errors
    /// - `Error::External { class: Transient, .. }` for timeouts and
    ///   connection-level failures
    /// - `Error::External { class: Permanent, .. }` for rejections
    async fn execute_sync(
        &self,
        conn: &Connection,
        ctx: &SyncContext,
        progress: ProgressSink<'_>,
    ) -> Result<SyncOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_serialization_skips_absent_key() {
        let conn = Connection::new("http://erp.local/hs/api", None);
        let json = serde_json::to_string(&conn).unwrap();
        assert!(!json.contains("api_key"));

        let conn = Connection::new("http://erp.local/hs/api", Some("k-1".into()));
        let json = serde_json::to_string(&conn).unwrap();
        let restored: Connection = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.api_key.as_deref(), Some("k-1"));
    }
}
