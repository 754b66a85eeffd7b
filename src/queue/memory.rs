//! In-process [`DelayedQueue`] with the same two-stage shape as the Redis
//! queue: a holding area keyed by due time and a ready list. Uses
//! `tokio::time::Instant`, so tests can drive it with a paused clock.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use super::{Acknowledger, DelayedQueue, Delivery, Envelope};
use crate::error::{Error, Result};

#[derive(Default)]
struct State {
    waiting: Vec<(Instant, Envelope)>,
    ready: VecDeque<Envelope>,
    in_flight: HashMap<Uuid, Envelope>,
    dead: Vec<Envelope>,
}

impl State {
    fn promote_due(&mut self, now: Instant) {
        let (mut due, waiting): (Vec<_>, Vec<_>) =
            self.waiting.drain(..).partition(|(at, _)| *at <= now);
        self.waiting = waiting;
        due.sort_by_key(|(at, _)| *at);
        self.ready.extend(due.into_iter().map(|(_, envelope)| envelope));
    }
}

struct Shared {
    state: Mutex<State>,
    redelivery_delay: Duration,
    fail_publish: AtomicBool,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Acknowledger for Shared {
    async fn ack(&self, envelope: &Envelope) -> Result<()> {
        self.state().in_flight.remove(&envelope.id);
        Ok(())
    }

    async fn nack(&self, envelope: &Envelope, requeue: bool) -> Result<()> {
        let mut state = self.state();
        state.in_flight.remove(&envelope.id);
        if requeue {
            let due = Instant::now() + self.redelivery_delay;
            state.waiting.push((due, envelope.redelivered()));
        } else {
            state.dead.push(envelope.clone());
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct MemoryQueue {
    shared: Arc<Shared>,
}

impl MemoryQueue {
    pub fn new(redelivery_delay: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                redelivery_delay,
                fail_publish: AtomicBool::new(false),
            }),
        }
    }

    /// Makes `publish` fail as if the broker were unreachable.
    pub fn fail_publishes(&self, fail: bool) {
        self.shared.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Makes every waiting message due right now, as if its delay had run out.
    pub fn fire_all(&self) {
        let mut state = self.shared.state();
        let now = Instant::now();
        for (due, _) in state.waiting.iter_mut() {
            *due = now;
        }
        state.promote_due(now);
    }

    pub fn waiting_len(&self) -> usize {
        self.shared.state().waiting.len()
    }

    pub fn ready_len(&self) -> usize {
        self.shared.state().ready.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.shared.state().in_flight.len()
    }

    pub fn dead_letters(&self) -> Vec<Envelope> {
        self.shared.state().dead.clone()
    }
}

#[async_trait]
impl DelayedQueue for MemoryQueue {
    async fn publish(&self, payload: &str, delay: Duration) -> Result<()> {
        if self.shared.fail_publish.load(Ordering::SeqCst) {
            return Err(Error::ChannelUnavailable("publish failed (injected)".to_string()));
        }
        let due = Instant::now() + delay;
        self.shared.state().waiting.push((due, Envelope::new(payload)));
        Ok(())
    }

    async fn fetch(&self, max: usize) -> Result<Vec<Delivery>> {
        let mut state = self.shared.state();
        state.promote_due(Instant::now());

        let mut batch = Vec::new();
        while batch.len() < max {
            let Some(envelope) = state.ready.pop_front() else {
                break;
            };
            state.in_flight.insert(envelope.id, envelope.clone());
            let acker: Arc<dyn Acknowledger> = self.shared.clone();
            batch.push(Delivery::new(envelope, acker));
        }
        Ok(batch)
    }

    async fn recover(&self) -> Result<usize> {
        let mut state = self.shared.state();
        let stranded: Vec<Envelope> = state.in_flight.drain().map(|(_, e)| e).collect();
        let count = stranded.len();
        for envelope in stranded {
            state.ready.push_front(envelope);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn nothing_is_delivered_before_the_delay() {
        let queue = MemoryQueue::new(Duration::from_secs(1));
        queue.publish("late", Duration::from_secs(60)).await.unwrap();

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(queue.fetch(10).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        let batch = queue.fetch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload(), "late");
        assert_eq!(queue.in_flight_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn due_messages_come_out_in_due_order() {
        let queue = MemoryQueue::new(Duration::from_secs(1));
        queue.publish("second", Duration::from_secs(20)).await.unwrap();
        queue.publish("first", Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        let batch = queue.fetch(10).await.unwrap();
        let payloads: Vec<&str> = batch.iter().map(|d| d.payload()).collect();
        assert_eq!(payloads, ["first", "second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn nack_requeues_after_redelivery_delay() {
        let queue = MemoryQueue::new(Duration::from_secs(5));
        queue.publish("retry-me", Duration::ZERO).await.unwrap();

        let delivery = queue.fetch(1).await.unwrap().pop().unwrap();
        let id = delivery.id();
        delivery.nack(true).await.unwrap();
        assert_eq!(queue.in_flight_len(), 0);
        assert!(queue.fetch(1).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(5)).await;
        let again = queue.fetch(1).await.unwrap().pop().unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(again.redeliveries(), 1);
    }

    #[tokio::test]
    async fn rejected_messages_are_dead_lettered() {
        let queue = MemoryQueue::new(Duration::from_secs(5));
        queue.publish("poison", Duration::ZERO).await.unwrap();

        let delivery = queue.fetch(1).await.unwrap().pop().unwrap();
        delivery.nack(false).await.unwrap();

        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].payload, "poison");
        assert_eq!(queue.waiting_len() + queue.ready_len() + queue.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn recover_hands_out_unsettled_deliveries_again() {
        let queue = MemoryQueue::new(Duration::from_secs(5));
        queue.publish("a", Duration::ZERO).await.unwrap();
        queue.publish("b", Duration::ZERO).await.unwrap();

        let batch = queue.fetch(2).await.unwrap();
        assert_eq!(batch.len(), 2);
        drop(batch);

        assert_eq!(queue.recover().await.unwrap(), 2);
        assert_eq!(queue.ready_len(), 2);
        assert_eq!(queue.fetch(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn fire_all_skips_the_wait() {
        let queue = MemoryQueue::new(Duration::from_secs(5));
        queue.publish("x", Duration::from_secs(3600)).await.unwrap();
        queue.fire_all();
        assert_eq!(queue.waiting_len(), 0);
        assert_eq!(queue.fetch(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn injected_publish_failure() {
        let queue = MemoryQueue::new(Duration::from_secs(5));
        queue.fail_publishes(true);
        let err = queue.publish("x", Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, Error::ChannelUnavailable(_)));
        assert!(err.is_retryable());
        assert_eq!(queue.waiting_len(), 0);
    }
}
