//! TradeSync Sync Job Orchestrator
//!
//! This crate coordinates sync jobs between the platform and external
//! enterprise systems:
//! - Per-integration single-flight dispatch over a durable work queue
//! - A fixed-size worker pool executing the sync protocol
//! - Exponential backoff with jitter on transient failures
//! - Fire-and-forget lifecycle events for live observers
//! - A startup recovery sweep for runs orphaned by a crashed worker

pub mod config;
pub mod dispatcher;
pub mod events;
pub mod facade;
pub mod recovery;
pub mod retry;
pub(crate) mod worker;

// Re-export main types
pub use config::OrchestratorConfig;
pub use dispatcher::{Dispatcher, RunHandle};
pub use events::{EventKind, EventPublisher, RunEvent};
pub use facade::Orchestrator;
pub use recovery::{RecoverySweep, SweepReport};
pub use retry::RetryPolicy;
