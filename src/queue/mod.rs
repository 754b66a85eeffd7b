//! Delayed notification channel.
//!
//! A message published with a delay becomes visible to consumers no earlier
//! than that delay later. Consumers pull [`Delivery`] values and must settle
//! each one with [`Delivery::ack`] or [`Delivery::nack`]; anything left
//! unsettled is handed out again after [`DelayedQueue::recover`], so delivery
//! is at-least-once.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;

pub use self::memory::MemoryQueue;
pub use self::redis::RedisDelayedQueue;

#[async_trait]
pub trait DelayedQueue: Send + Sync {
    /// Schedules `payload` for delivery after `delay`.
    async fn publish(&self, payload: &str, delay: Duration) -> Result<()>;

    /// Pulls up to `max` due messages without blocking. Each returned
    /// delivery stays in flight until it is settled.
    async fn fetch(&self, max: usize) -> Result<Vec<Delivery>>;

    /// Makes this consumer's unsettled deliveries visible again and returns
    /// how many there were.
    async fn recover(&self) -> Result<usize>;
}

/// How a queue implementation settles a delivery it handed out.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, envelope: &Envelope) -> Result<()>;
    async fn nack(&self, envelope: &Envelope, requeue: bool) -> Result<()>;
}

/// What actually travels through the queue: the payload plus bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub payload: String,
    #[serde(default)]
    pub redeliveries: u32,
}

impl Envelope {
    pub fn new(payload: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload: payload.to_string(),
            redeliveries: 0,
        }
    }

    pub fn redelivered(&self) -> Self {
        Self {
            redeliveries: self.redeliveries.saturating_add(1),
            ..self.clone()
        }
    }
}

pub struct Delivery {
    envelope: Envelope,
    acker: Arc<dyn Acknowledger>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("id", &self.envelope.id)
            .field("redeliveries", &self.envelope.redeliveries)
            .finish()
    }
}

impl Delivery {
    pub fn new(envelope: Envelope, acker: Arc<dyn Acknowledger>) -> Self {
        Self { envelope, acker }
    }

    pub fn id(&self) -> Uuid {
        self.envelope.id
    }

    pub fn payload(&self) -> &str {
        &self.envelope.payload
    }

    /// How many times this message was handed back with `nack(true)`.
    pub fn redeliveries(&self) -> u32 {
        self.envelope.redeliveries
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack(&self.envelope).await
    }

    /// `requeue = false` sends the message to the dead-letter store.
    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acker.nack(&self.envelope, requeue).await
    }
}

/// Starts a pump that pulls due messages into a bounded channel until
/// `shutdown` fires or the receiver is dropped.
///
/// The channel capacity caps how many deliveries sit fetched but unprocessed.
pub fn subscribe(
    queue: Arc<dyn DelayedQueue>,
    capacity: usize,
    poll_interval: Duration,
    shutdown: CancellationToken,
) -> (mpsc::Receiver<Delivery>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));

    let handle = tokio::spawn(async move {
        loop {
            if shutdown.is_cancelled() || tx.is_closed() {
                break;
            }

            let room = tx.capacity();
            let batch = if room == 0 {
                Vec::new()
            } else {
                match queue.fetch(room).await {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!(error = %e, "Failed to fetch from delayed queue");
                        Vec::new()
                    }
                }
            };

            let idle = batch.is_empty();
            for delivery in batch {
                // Место зарезервировано заранее, send не заблокируется надолго
                if let Err(mpsc::error::SendError(delivery)) = tx.send(delivery).await {
                    // Получатель ушёл: вернём сообщение в очередь
                    if let Err(e) = delivery.nack(true).await {
                        warn!(error = %e, "Failed to requeue undelivered message");
                    }
                }
            }

            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }
        debug!("Delayed queue subscription stopped");
    });

    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redelivery_keeps_identity() {
        let envelope = Envelope::new("{}");
        let again = envelope.redelivered().redelivered();
        assert_eq!(again.id, envelope.id);
        assert_eq!(again.payload, "{}");
        assert_eq!(again.redeliveries, 2);
    }

    #[test]
    fn envelope_without_counter_decodes() {
        let id = Uuid::new_v4();
        let raw = format!(r#"{{"id":"{id}","payload":"x"}}"#);
        let envelope: Envelope = serde_json::from_str(&raw).unwrap();
        assert_eq!(envelope.redeliveries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pump_forwards_due_messages_and_stops() {
        let queue = Arc::new(MemoryQueue::new(Duration::from_millis(10)));
        queue.publish("a", Duration::ZERO).await.unwrap();
        queue.publish("b", Duration::from_secs(60)).await.unwrap();

        let shutdown = CancellationToken::new();
        let (mut rx, handle) =
            subscribe(queue.clone(), 4, Duration::from_millis(50), shutdown.clone());

        let first = rx.recv().await.unwrap();
        assert_eq!(first.payload(), "a");
        first.ack().await.unwrap();

        let second = rx.recv().await.unwrap();
        assert_eq!(second.payload(), "b");
        second.ack().await.unwrap();

        shutdown.cancel();
        handle.await.unwrap();
        assert!(rx.recv().await.is_none());
        assert_eq!(queue.in_flight_len(), 0);
    }
}
