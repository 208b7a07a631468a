//! Sync state store: the source of truth for run lifecycle.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use tradesync_common::{Error, IntegrationId, Result, RunId};

use crate::run::{RunState, SyncRun, TransitionMeta};

/// Result of asking the store to create a run.
#[derive(Debug, Clone)]
pub enum RunCreation {
    /// A fresh run was created; the caller owns enqueueing exactly one
    /// work unit for it.
    Created(SyncRun),
    /// A non-terminal run already existed for the integration; the request
    /// joins it. Nothing was written.
    Joined(SyncRun),
}

impl RunCreation {
    /// The run this request resolved to, created or joined.
    pub fn run(&self) -> &SyncRun {
        match self {
            Self::Created(run) | Self::Joined(run) => run,
        }
    }

    /// Whether the request joined an existing run.
    pub const fn joined(&self) -> bool {
        matches!(self, Self::Joined(_))
    }
}

/// Durable record of runs and their lifecycle states.
///
/// Transitions on a single run are totally ordered by the store's atomic
/// compare-and-set; two workers racing on the same run produce exactly one
/// winner and one `Conflict`.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Create a pending run for the integration.
    ///
    /// Acts as the single-flight guard: if a non-terminal run already
    /// exists for the integration, no new run is created and the existing
    /// one is returned as [`RunCreation::Joined`].
    async fn create_run(
        &self,
        integration_id: &IntegrationId,
        idempotency_key: &str,
    ) -> Result<RunCreation>;

    /// Atomically transition a run from `from` to `to`.
    ///
    /// # Errors
    /// - `NotFound` for an unknown run
    /// - `Conflict` if the run is not currently in `from`, or the
    ///   transition is not a valid edge of the state machine. The caller
    ///   must reread and retry its own logic, never blindly overwrite.
    async fn transition(
        &self,
        run_id: &RunId,
        from: RunState,
        to: RunState,
        meta: TransitionMeta,
    ) -> Result<SyncRun>;

    /// Fetch a run by id.
    async fn get(&self, run_id: &RunId) -> Result<SyncRun>;

    /// All runs not yet in a terminal state.
    ///
    /// Used by the startup recovery sweep to find orphans.
    async fn list_non_terminal(&self) -> Result<Vec<SyncRun>>;

    /// Set the cooperative cancellation flag on a non-terminal run.
    ///
    /// # Errors
    /// - `NotFound` for an unknown run
    /// - `NotCancellable` if the run is already terminal
    async fn request_cancel(&self, run_id: &RunId) -> Result<SyncRun>;
}

/// In-memory state store.
///
/// Every operation runs under one lock scope, which is what makes the
/// per-run compare-and-set atomic.
pub struct MemoryStateStore {
    runs: Mutex<HashMap<RunId, SyncRun>>,
}

impl MemoryStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn create_run(
        &self,
        integration_id: &IntegrationId,
        idempotency_key: &str,
    ) -> Result<RunCreation> {
        let mut runs = self.runs.lock().unwrap();

        if let Some(existing) = runs
            .values()
            .find(|r| &r.integration_id == integration_id && !r.is_terminal())
        {
            return Ok(RunCreation::Joined(existing.clone()));
        }

        let run = SyncRun::new(integration_id.clone(), idempotency_key);
        runs.insert(run.id.clone(), run.clone());
        Ok(RunCreation::Created(run))
    }

    async fn transition(
        &self,
        run_id: &RunId,
        from: RunState,
        to: RunState,
        meta: TransitionMeta,
    ) -> Result<SyncRun> {
        let mut runs = self.runs.lock().unwrap();
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| Error::NotFound(format!("Run not found: {}", run_id)))?;

        if run.state != from {
            return Err(Error::Conflict(format!(
                "Run {} is {}, not {}",
                run_id, run.state, from
            )));
        }
        if !from.can_transition_to(to) {
            return Err(Error::Conflict(format!(
                "Invalid transition {} -> {} for run {}",
                from, to, run_id
            )));
        }

        run.apply_transition(to, meta);
        Ok(run.clone())
    }

    async fn get(&self, run_id: &RunId) -> Result<SyncRun> {
        self.runs
            .lock()
            .unwrap()
            .get(run_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Run not found: {}", run_id)))
    }

    async fn list_non_terminal(&self) -> Result<Vec<SyncRun>> {
        Ok(self
            .runs
            .lock()
            .unwrap()
            .values()
            .filter(|r| !r.is_terminal())
            .cloned()
            .collect())
    }

    async fn request_cancel(&self, run_id: &RunId) -> Result<SyncRun> {
        let mut runs = self.runs.lock().unwrap();
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| Error::NotFound(format!("Run not found: {}", run_id)))?;

        if run.is_terminal() {
            return Err(Error::NotCancellable(format!(
                "Run {} already {}",
                run_id, run.state
            )));
        }

        run.cancel_requested = true;
        Ok(run.clone())
    }
}
