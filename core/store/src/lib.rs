//! TradeSync durable state: integrations, sync runs and the work queue.
//!
//! This crate owns the data model and every mutable shared resource of the
//! orchestrator core:
//! - The integration registry with its compare-and-set current-run pointer
//! - The sync-run state machine and the optimistic-transition state store
//! - The durable work queue contract
//!
//! All mutation goes through atomic, conflict-detecting operations; there
//! is no external locking primitive.

pub mod integration;
pub mod queue;
pub mod run;
pub mod sqlite;
pub mod store;

pub use integration::{Integration, IntegrationRegistry, MemoryRegistry};
pub use queue::{MemoryQueue, WorkQueue, WorkUnit};
pub use run::{idempotency_key, RunState, SyncRun, TransitionMeta};
pub use sqlite::SqliteStateStore;
pub use store::{MemoryStateStore, RunCreation, StateStore};
