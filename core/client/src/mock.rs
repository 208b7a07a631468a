//! In-memory mock client for testing and development.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use tradesync_common::{Error, Result};

use crate::client::{Connection, ErpClient, ProgressSink, SyncContext, SyncOutcome};

/// One scripted response for the mock client.
///
/// When the script runs out, further calls succeed with the default
/// record count.
#[derive(Debug, Clone)]
pub enum ScriptedCall {
    /// Succeed, reporting this many records.
    Succeed(u64),
    /// Fail with a transient error (timeout/network class).
    FailTransient(&'static str),
    /// Fail with a permanent error (rejected by the external system).
    FailPermanent(&'static str),
}

/// Mock implementation of [`ErpClient`].
///
/// Useful for tests and development. Outcomes are scripted per call and
/// every invocation is counted.
pub struct MockErpClient {
    script: Mutex<VecDeque<ScriptedCall>>,
    calls: AtomicU32,
    healthy: bool,
    default_records: u64,
    latency: Option<std::time::Duration>,
}

impl MockErpClient {
    /// Create a mock that always succeeds.
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
            healthy: true,
            default_records: 100,
            latency: None,
        }
    }

    /// Script the outcomes of the next calls, in order.
    pub fn with_script(self, calls: impl IntoIterator<Item = ScriptedCall>) -> Self {
        self.script.lock().unwrap().extend(calls);
        self
    }

    /// Set the health probe result.
    pub fn with_health(mut self, healthy: bool) -> Self {
        self.healthy = healthy;
        self
    }

    /// Set the record count reported once the script is exhausted.
    pub fn with_default_records(mut self, records: u64) -> Self {
        self.default_records = records;
        self
    }

    /// Simulate a slow external system.
    pub fn with_latency(mut self, latency: std::time::Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of `execute_sync` invocations so far.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockErpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ErpClient for MockErpClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn health_check(&self, _conn: &Connection) -> Result<bool> {
        Ok(self.healthy)
    }

    async fn execute_sync(
        &self,
        _conn: &Connection,
        _ctx: &SyncContext,
        progress: ProgressSink<'_>,
    ) -> Result<SyncOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(ScriptedCall::Succeed(records)) => {
                progress(records);
                Ok(SyncOutcome {
                    records_processed: records,
                })
            }
            Some(ScriptedCall::FailTransient(message)) => Err(Error::transient(message)),
            Some(ScriptedCall::FailPermanent(message)) => Err(Error::permanent(message)),
            None => {
                progress(self.default_records);
                Ok(SyncOutcome {
                    records_processed: self.default_records,
                })
            }
        }
    }
}
