//! SQLite-backed state store for durable run records.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection as DbConnection, Row};
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

use tradesync_common::{Error, IntegrationId, Result, RunId};

use crate::run::{RunState, SyncRun, TransitionMeta};
use crate::store::{RunCreation, StateStore};

/// Durable [`StateStore`] over SQLite.
///
/// Operations hold the connection lock for their whole read-check-write
/// sequence, and every state change additionally guards with
/// `WHERE state = ?` so the compare-and-set survives other processes
/// sharing the database file.
pub struct SqliteStateStore {
    conn: Mutex<DbConnection>,
}

impl SqliteStateStore {
    /// Create or open the run database.
    ///
    /// # Errors
    /// - Database creation or schema bootstrap failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = DbConnection::open(db_path).map_err(db_err)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sync_runs (
                id TEXT PRIMARY KEY,
                integration_id TEXT NOT NULL,
                idempotency_key TEXT NOT NULL,
                state TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                enqueued_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                updated_at TEXT NOT NULL,
                failure_reason TEXT,
                records_processed INTEGER,
                cancel_requested INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_runs_integration
                ON sync_runs(integration_id);
            CREATE INDEX IF NOT EXISTS idx_runs_state
                ON sync_runs(state);
            "#,
        )
        .map_err(db_err)?;

        info!("Run database opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn insert(conn: &DbConnection, run: &SyncRun) -> Result<()> {
        conn.execute(
            r#"
            INSERT INTO sync_runs
            (id, integration_id, idempotency_key, state, attempt, enqueued_at,
             started_at, completed_at, updated_at, failure_reason,
             records_processed, cancel_requested)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                run.id.as_str(),
                run.integration_id.as_str(),
                run.idempotency_key,
                run.state.as_str(),
                run.attempt,
                run.enqueued_at.to_rfc3339(),
                run.started_at.map(|t| t.to_rfc3339()),
                run.completed_at.map(|t| t.to_rfc3339()),
                run.updated_at.to_rfc3339(),
                run.failure_reason,
                run.records_processed.map(|n| n as i64),
                run.cancel_requested as i32,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn fetch(conn: &DbConnection, run_id: &RunId) -> Result<SyncRun> {
        let mut stmt = conn
            .prepare(
                r#"
                SELECT id, integration_id, idempotency_key, state, attempt,
                       enqueued_at, started_at, completed_at, updated_at,
                       failure_reason, records_processed, cancel_requested
                FROM sync_runs WHERE id = ?1
                "#,
            )
            .map_err(db_err)?;

        match stmt.query_row([run_id.as_str()], run_from_row) {
            Ok(run) => run,
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                Err(Error::NotFound(format!("Run not found: {}", run_id)))
            }
            Err(e) => Err(db_err(e)),
        }
    }

    fn update(conn: &DbConnection, run: &SyncRun, expected_state: RunState) -> Result<usize> {
        conn.execute(
            r#"
            UPDATE sync_runs
            SET state = ?1, attempt = ?2, started_at = ?3, completed_at = ?4,
                updated_at = ?5, failure_reason = ?6, records_processed = ?7,
                cancel_requested = ?8
            WHERE id = ?9 AND state = ?10
            "#,
            params![
                run.state.as_str(),
                run.attempt,
                run.started_at.map(|t| t.to_rfc3339()),
                run.completed_at.map(|t| t.to_rfc3339()),
                run.updated_at.to_rfc3339(),
                run.failure_reason,
                run.records_processed.map(|n| n as i64),
                run.cancel_requested as i32,
                run.id.as_str(),
                expected_state.as_str(),
            ],
        )
        .map_err(db_err)
    }
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::Database(e.to_string())
}

fn parse_timestamp(raw: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Serialization(format!("Bad timestamp {}: {}", raw, e)))
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<Result<SyncRun>> {
    let id: String = row.get(0)?;
    let integration_id: String = row.get(1)?;
    let idempotency_key: String = row.get(2)?;
    let state: String = row.get(3)?;
    let attempt: u32 = row.get(4)?;
    let enqueued_at: String = row.get(5)?;
    let started_at: Option<String> = row.get(6)?;
    let completed_at: Option<String> = row.get(7)?;
    let updated_at: String = row.get(8)?;
    let failure_reason: Option<String> = row.get(9)?;
    let records_processed: Option<u64> = row.get::<_, Option<i64>>(10)?.map(|n| n as u64);
    let cancel_requested: i32 = row.get(11)?;

    Ok(build_run(
        id,
        integration_id,
        idempotency_key,
        state,
        attempt,
        enqueued_at,
        started_at,
        completed_at,
        updated_at,
        failure_reason,
        records_processed,
        cancel_requested != 0,
    ))
}

#[allow(clippy::too_many_arguments)]
fn build_run(
    id: String,
    integration_id: String,
    idempotency_key: String,
    state: String,
    attempt: u32,
    enqueued_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    updated_at: String,
    failure_reason: Option<String>,
    records_processed: Option<u64>,
    cancel_requested: bool,
) -> Result<SyncRun> {
    Ok(SyncRun {
        id: RunId::new(id)?,
        integration_id: IntegrationId::new(integration_id)?,
        idempotency_key,
        state: RunState::parse(&state)?,
        attempt,
        enqueued_at: parse_timestamp(enqueued_at)?,
        started_at: started_at.map(parse_timestamp).transpose()?,
        completed_at: completed_at.map(parse_timestamp).transpose()?,
        updated_at: parse_timestamp(updated_at)?,
        failure_reason,
        records_processed,
        cancel_requested,
    })
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn create_run(
        &self,
        integration_id: &IntegrationId,
        idempotency_key: &str,
    ) -> Result<RunCreation> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn
            .prepare(
                r#"
                SELECT id FROM sync_runs
                WHERE integration_id = ?1
                  AND state NOT IN ('succeeded', 'failed', 'cancelled')
                LIMIT 1
                "#,
            )
            .map_err(db_err)?;

        let existing: Option<String> = match stmt.query_row([integration_id.as_str()], |row| {
            row.get(0)
        }) {
            Ok(id) => Some(id),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(db_err(e)),
        };
        drop(stmt);

        if let Some(id) = existing {
            let run = Self::fetch(&conn, &RunId::new(id)?)?;
            return Ok(RunCreation::Joined(run));
        }

        let run = SyncRun::new(integration_id.clone(), idempotency_key);
        Self::insert(&conn, &run)?;
        Ok(RunCreation::Created(run))
    }

    async fn transition(
        &self,
        run_id: &RunId,
        from: RunState,
        to: RunState,
        meta: TransitionMeta,
    ) -> Result<SyncRun> {
        let conn = self.conn.lock().unwrap();
        let mut run = Self::fetch(&conn, run_id)?;

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

        // The state guard in the WHERE clause makes this safe against
        // writers outside this connection lock.
        if Self::update(&conn, &run, from)? != 1 {
            return Err(Error::Conflict(format!(
                "Run {} changed state concurrently",
                run_id
            )));
        }

        Ok(run)
    }

    async fn get(&self, run_id: &RunId) -> Result<SyncRun> {
        let conn = self.conn.lock().unwrap();
        Self::fetch(&conn, run_id)
    }

    async fn list_non_terminal(&self) -> Result<Vec<SyncRun>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT id, integration_id, idempotency_key, state, attempt,
                       enqueued_at, started_at, completed_at, updated_at,
                       failure_reason, records_processed, cancel_requested
                FROM sync_runs
                WHERE state NOT IN ('succeeded', 'failed', 'cancelled')
                "#,
            )
            .map_err(db_err)?;

        let rows = stmt.query_map([], run_from_row).map_err(db_err)?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.map_err(db_err)??);
        }
        Ok(runs)
    }

    async fn request_cancel(&self, run_id: &RunId) -> Result<SyncRun> {
        let conn = self.conn.lock().unwrap();
        let run = Self::fetch(&conn, run_id)?;

        if run.is_terminal() {
            return Err(Error::NotCancellable(format!(
                "Run {} already {}",
                run_id, run.state
            )));
        }

        conn.execute(
            "UPDATE sync_runs SET cancel_requested = 1 WHERE id = ?1",
            [run_id.as_str()],
        )
        .map_err(db_err)?;

        Self::fetch(&conn, run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::idempotency_key;

    fn integration_id() -> IntegrationId {
        IntegrationId::new("erp-main").unwrap()
    }

    #[tokio::test]
    async fn run_round_trips_through_sqlite() {
        let store = SqliteStateStore::in_memory().unwrap();
        let id = integration_id();

        let created = store
            .create_run(&id, &idempotency_key(&id, "t1"))
            .await
            .unwrap();
        assert!(!created.joined());

        let fetched = store.get(&created.run().id).await.unwrap();
        assert_eq!(fetched.state, RunState::Pending);
        assert_eq!(fetched.attempt, 1);
        assert_eq!(fetched.idempotency_key, idempotency_key(&id, "t1"));
        assert!(!fetched.cancel_requested);
    }

    #[tokio::test]
    async fn single_flight_guard_holds_in_sqlite() {
        let store = SqliteStateStore::in_memory().unwrap();
        let id = integration_id();

        let first = store
            .create_run(&id, &idempotency_key(&id, "t1"))
            .await
            .unwrap();
        let second = store
            .create_run(&id, &idempotency_key(&id, "t2"))
            .await
            .unwrap();

        assert!(second.joined());
        assert_eq!(second.run().id, first.run().id);
    }

    #[tokio::test]
    async fn transition_cas_guards_against_stale_writers() {
        let store = SqliteStateStore::in_memory().unwrap();
        let id = integration_id();
        let run = store
            .create_run(&id, &idempotency_key(&id, "t1"))
            .await
            .unwrap()
            .run()
            .clone();

        store
            .transition(&run.id, RunState::Pending, RunState::Running, TransitionMeta::none())
            .await
            .unwrap();

        // A second claim of the same run loses.
        let err = store
            .transition(&run.id, RunState::Pending, RunState::Running, TransitionMeta::none())
            .await;
        assert!(matches!(err, Err(Error::Conflict(_))));

        let done = store
            .transition(
                &run.id,
                RunState::Running,
                RunState::Succeeded,
                TransitionMeta::success(12),
            )
            .await
            .unwrap();
        assert_eq!(done.records_processed, Some(12));
        assert!(done.completed_at.is_some());

        // Terminal runs are immutable.
        let err = store
            .transition(&run.id, RunState::Succeeded, RunState::Pending, TransitionMeta::none())
            .await;
        assert!(matches!(err, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn cancel_and_sweep_queries() {
        let store = SqliteStateStore::in_memory().unwrap();
        let id = integration_id();
        let run = store
            .create_run(&id, &idempotency_key(&id, "t1"))
            .await
            .unwrap()
            .run()
            .clone();

        let flagged = store.request_cancel(&run.id).await.unwrap();
        assert!(flagged.cancel_requested);
        assert_eq!(store.list_non_terminal().await.unwrap().len(), 1);

        store
            .transition(&run.id, RunState::Pending, RunState::Cancelled, TransitionMeta::none())
            .await
            .unwrap();
        assert!(store.list_non_terminal().await.unwrap().is_empty());
        assert!(matches!(
            store.request_cancel(&run.id).await,
            Err(Error::NotCancellable(_))
        ));
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.db");
        let id = integration_id();

        let run_id = {
            let store = SqliteStateStore::open(&path).unwrap();
            let run = store
                .create_run(&id, &idempotency_key(&id, "t1"))
                .await
                .unwrap()
                .run()
                .clone();
            store
                .transition(&run.id, RunState::Pending, RunState::Running, TransitionMeta::none())
                .await
                .unwrap();
            run.id
        };

        let store = SqliteStateStore::open(&path).unwrap();
        let recovered = store.get(&run_id).await.unwrap();
        assert_eq!(recovered.state, RunState::Running);
        assert_eq!(store.list_non_terminal().await.unwrap().len(), 1);
    }
}
