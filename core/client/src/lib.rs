//! TradeSync external-system client boundary.
//!
//! This crate defines the contract the orchestrator core depends on to talk
//! to an external enterprise system, plus the two shipped implementations:
//! - An HTTP client for 1C-style REST publication endpoints
//! - An in-memory mock with scripted outcomes for tests and development
//!
//! The core treats the external system as a black box beyond classifying
//! its failures as transient vs. permanent.

pub mod client;
pub mod http;
pub mod mock;

pub use client::{Connection, ErpClient, ProgressSink, SyncContext, SyncOutcome};
pub use http::HttpErpClient;
pub use mock::{MockErpClient, ScriptedCall};
