//! Consumer of expiry notices: cancels bookings still pending when their
//! notice arrives and returns their tickets.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::Error;
use crate::models::ExpiryNotice;
use crate::queue::{subscribe, DelayedQueue, Delivery};
use crate::store::{Storage, Transition};

/// What to do with a delivery once it has been processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Hand back for another attempt later.
    Requeue,
    /// Drop to the dead-letter store; retrying cannot help.
    Reject,
}

pub struct ExpiryWorker {
    store: Arc<dyn Storage>,
    queue: Arc<dyn DelayedQueue>,
    config: WorkerConfig,
    poll_interval: Duration,
}

impl ExpiryWorker {
    pub fn new(
        store: Arc<dyn Storage>,
        queue: Arc<dyn DelayedQueue>,
        config: WorkerConfig,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            config,
            poll_interval,
        }
    }

    /// Decides one notice. Safe to call any number of times for the same
    /// booking: only the first call that finds it pending returns a ticket.
    pub async fn process(&self, payload: &str) -> Disposition {
        let notice = match ExpiryNotice::decode(payload) {
            Ok(notice) => notice,
            Err(e) => {
                error!(error = %e, payload, "Malformed expiry notice");
                return Disposition::Reject;
            }
        };
        let booking_id = notice.booking_id;

        let booking = match self.store.get_booking(booking_id).await {
            Ok(booking) => booking,
            Err(Error::NotFound { .. }) => {
                error!(booking_id = %booking_id, event_id = %notice.event_id, "Expiry notice for unknown booking");
                return Disposition::Reject;
            }
            Err(e) if e.is_retryable() => {
                warn!(booking_id = %booking_id, error = %e, "Failed to load booking, will retry");
                return Disposition::Requeue;
            }
            Err(e) => {
                error!(booking_id = %booking_id, error = %e, "Failed to load booking, dropping notice");
                return Disposition::Reject;
            }
        };

        if booking.status.is_terminal() {
            debug!(booking_id = %booking_id, status = %booking.status, "Booking already settled, skipping");
            return Disposition::Ack;
        }

        // Отмена и возврат билета коммитятся вместе, повтор не вернёт билет дважды
        match self.store.reclaim_pending(booking_id).await {
            Ok(Transition::Applied(booking)) => {
                info!(
                    booking_id = %booking_id,
                    event_id = %booking.event_id,
                    user_id = %booking.user_id,
                    "Pending booking expired, ticket returned"
                );
                Disposition::Ack
            }
            Ok(Transition::AlreadySettled(status)) => {
                debug!(booking_id = %booking_id, status = %status, "Booking settled concurrently, skipping");
                Disposition::Ack
            }
            Err(e) if e.is_retryable() => {
                warn!(booking_id = %booking_id, error = %e, "Failed to reclaim booking, will retry");
                Disposition::Requeue
            }
            Err(e) => {
                error!(booking_id = %booking_id, error = %e, "Failed to reclaim booking, dropping notice");
                Disposition::Reject
            }
        }
    }

    /// Processes one delivery and settles it.
    pub async fn handle(&self, delivery: Delivery) {
        let message_id = delivery.id();
        let redeliveries = delivery.redeliveries();

        let mut disposition = self.process(delivery.payload()).await;
        if disposition == Disposition::Requeue && redeliveries >= self.config.max_redeliveries {
            error!(
                message_id = %message_id,
                redeliveries,
                "Expiry notice keeps failing, moving to dead letters"
            );
            disposition = Disposition::Reject;
        }

        let settled = match disposition {
            Disposition::Ack => delivery.ack().await,
            Disposition::Requeue => delivery.nack(true).await,
            Disposition::Reject => delivery.nack(false).await,
        };
        if let Err(e) = settled {
            // Не подтверждённое сообщение вернётся через recover
            warn!(message_id = %message_id, error = %e, "Failed to settle delivery");
        }
    }

    /// Consumes notices until `shutdown` fires, then finishes whatever is in
    /// flight and hands buffered deliveries back to the queue.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        self.recover("start-up").await;

        let pump_stop = shutdown.child_token();
        let (mut inbox, pump) = subscribe(
            self.queue.clone(),
            self.config.buffer,
            self.poll_interval,
            pump_stop.clone(),
        );
        let permits = Arc::new(Semaphore::new(self.config.concurrency));
        let mut tasks = JoinSet::new();

        info!(
            concurrency = self.config.concurrency,
            buffer = self.config.buffer,
            "Expiry worker started"
        );

        loop {
            let delivery = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                delivery = inbox.recv() => delivery,
            };
            let Some(delivery) = delivery else {
                break;
            };

            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let worker = self.clone();
            tasks.spawn(async move {
                worker.handle(delivery).await;
                drop(permit);
            });

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Expiry task failed");
                }
            }
        }

        // Больше не забираем сообщения, дожидаемся начатых
        pump_stop.cancel();
        if let Err(e) = pump.await {
            error!(error = %e, "Queue pump failed");
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Expiry task failed");
            }
        }

        inbox.close();
        let mut buffered = 0usize;
        while inbox.try_recv().is_ok() {
            buffered += 1;
        }
        if buffered > 0 {
            debug!(buffered, "Dropping buffered deliveries before recovery");
        }
        self.recover("shutdown").await;

        info!("Expiry worker stopped");
    }

    async fn recover(&self, stage: &str) {
        match self.queue.recover().await {
            Ok(0) => {}
            Ok(moved) => info!(moved, stage, "Requeued unacknowledged expiry notices"),
            Err(e) => warn!(error = %e, stage, "Failed to requeue unacknowledged expiry notices"),
        }
    }
}
