//! Durable work queue contract and the in-memory implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use tradesync_common::{Error, IntegrationId, Result, RunId};

/// The message dispatched to workers: a pointer to a run, never a copy of
/// its data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Run to execute.
    pub run_id: RunId,
    /// Integration the run belongs to.
    pub integration_id: IntegrationId,
    /// Attempt number this unit was enqueued for.
    pub attempt: u32,
}

/// Durable task-delivery contract.
///
/// The broker is assumed to provide at-least-once delivery with no
/// ordering guarantee; duplicate and redelivered units are made safe by
/// the state store's conflict-guarded claim transition, not by the queue.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Publish a work unit, optionally after a delay.
    ///
    /// The delay is a scheduled timer, never a held worker.
    async fn enqueue(&self, unit: WorkUnit, delay: Option<Duration>) -> Result<()>;

    /// Claim the next available unit, waiting until one arrives.
    ///
    /// # Errors
    /// - `Queue` when the queue has shut down
    async fn claim(&self) -> Result<WorkUnit>;

    /// Acknowledge a processed unit.
    ///
    /// Callers must only acknowledge after the outcome transition is
    /// durably recorded.
    async fn ack(&self, unit: &WorkUnit) -> Result<()>;
}

/// In-memory queue over an unbounded channel.
///
/// Useful for testing and single-process deployments.
pub struct MemoryQueue {
    tx: mpsc::UnboundedSender<WorkUnit>,
    rx: Mutex<mpsc::UnboundedReceiver<WorkUnit>>,
    acked: AtomicU64,
}

impl MemoryQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            acked: AtomicU64::new(0),
        }
    }

    /// Number of acknowledged units so far.
    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::SeqCst)
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(&self, unit: WorkUnit, delay: Option<Duration>) -> Result<()> {
        match delay {
            None => self
                .tx
                .send(unit)
                .map_err(|e| Error::Queue(format!("Queue closed: {}", e))),
            Some(delay) => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if tx.send(unit).is_err() {
                        debug!("Queue closed before delayed unit was published");
                    }
                });
                Ok(())
            }
        }
    }

    async fn claim(&self) -> Result<WorkUnit> {
        let mut rx = self.rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| Error::Queue("Queue closed".to_string()))
    }

    async fn ack(&self, _unit: &WorkUnit) -> Result<()> {
        self.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn unit(attempt: u32) -> WorkUnit {
        WorkUnit {
            run_id: RunId::generate(),
            integration_id: IntegrationId::new("erp-main").unwrap(),
            attempt,
        }
    }

    #[tokio::test]
    async fn enqueue_then_claim() {
        let queue = MemoryQueue::new();
        let sent = unit(1);

        queue.enqueue(sent.clone(), None).await.unwrap();
        let claimed = queue.claim().await.unwrap();
        assert_eq!(claimed, sent);

        queue.ack(&claimed).await.unwrap();
        assert_eq!(queue.acked(), 1);
    }

    #[tokio::test]
    async fn delayed_enqueue_waits_out_the_delay() {
        let queue = MemoryQueue::new();
        let start = Instant::now();

        queue
            .enqueue(unit(2), Some(Duration::from_millis(50)))
            .await
            .unwrap();
        let claimed = queue.claim().await.unwrap();

        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(claimed.attempt, 2);
    }

    #[tokio::test]
    async fn claim_blocks_until_a_unit_arrives() {
        let queue = std::sync::Arc::new(MemoryQueue::new());

        let claimer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.claim().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(unit(1), None).await.unwrap();

        let claimed = claimer.await.unwrap().unwrap();
        assert_eq!(claimed.attempt, 1);
    }
}
