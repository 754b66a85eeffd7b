use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::config::{BookingConfig, Scheduling};
use crate::error::{Error, Result};
use crate::models::{Booking, BookingStatus, Event, ExpiryNotice, NewEvent, OutboxEntry};
use crate::queue::DelayedQueue;
use crate::store::{Storage, Transition};

/// Entry point for everything a client can do: manage the event catalogue,
/// book a ticket and confirm the booking.
#[derive(Clone)]
pub struct BookingService {
    store: Arc<dyn Storage>,
    queue: Arc<dyn DelayedQueue>,
    ttl: Duration,
    scheduling: Scheduling,
}

impl BookingService {
    pub fn new(store: Arc<dyn Storage>, queue: Arc<dyn DelayedQueue>, policy: &BookingConfig) -> Self {
        Self {
            store,
            queue,
            ttl: policy.ttl(),
            scheduling: policy.scheduling,
        }
    }

    /* ---------- EVENTS ---------- */

    pub async fn create_event(&self, new: NewEvent) -> Result<Event> {
        new.validate()?;
        let event = Event::from_new(new);
        self.store.create_event(&event).await?;
        info!(event_id = %event.id, tickets = event.available_tickets, "Event created");
        Ok(event)
    }

    pub async fn get_event(&self, id: Uuid) -> Result<Event> {
        self.store.get_event(id).await
    }

    pub async fn list_events(&self) -> Result<Vec<Event>> {
        self.store.list_events().await
    }

    /* ---------- BOOKINGS ---------- */

    pub async fn get_booking(&self, id: Uuid) -> Result<Booking> {
        self.store.get_booking(id).await
    }

    /// Takes a ticket and creates a pending booking that expires after the
    /// configured TTL unless confirmed first.
    ///
    /// Either the booking exists together with its scheduled expiry, or the
    /// call fails and the ticket count is unchanged.
    pub async fn book(&self, event_id: Uuid, user_id: &str) -> Result<Booking> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(Error::Validation("user_id must not be empty".to_string()));
        }

        let booking = Booking::pending(event_id, user_id);
        let notice = ExpiryNotice::for_booking(&booking);

        let remaining = match self.scheduling {
            Scheduling::Outbox => {
                // Уведомление пишется в той же транзакции, публикует его ретранслятор
                let entry = OutboxEntry::for_notice(&notice, self.ttl)?;
                self.store.reserve(&booking, Some(&entry)).await?
            }
            Scheduling::Direct => {
                let payload = notice.encode()?;
                let remaining = self.store.reserve(&booking, None).await?;
                self.schedule_or_release(&booking, &notice, &payload).await?;
                remaining
            }
        };

        info!(
            booking_id = %booking.id,
            event_id = %event_id,
            remaining,
            "Booking created"
        );
        Ok(booking)
    }

    async fn schedule_or_release(
        &self,
        booking: &Booking,
        notice: &ExpiryNotice,
        payload: &str,
    ) -> Result<()> {
        let Err(err) = self.queue.publish(payload, self.ttl).await else {
            return Ok(());
        };

        error!(booking_id = %booking.id, error = %err, "Failed to schedule expiry, releasing ticket");
        if let Err(undo) = self.store.release(booking.id).await {
            // Бронь осталась: пусть её отменит ретранслятор через outbox
            warn!(
                booking_id = %booking.id,
                error = %undo,
                "Failed to release booking, falling back to outbox expiry"
            );
            let fallback = match OutboxEntry::for_notice(notice, self.ttl) {
                Ok(entry) => self.store.enqueue(&entry).await,
                Err(e) => Err(e),
            };
            if let Err(e) = fallback {
                error!(
                    booking_id = %booking.id,
                    error = %e,
                    "Failed to write fallback expiry; booking has no expiry"
                );
            }
        }

        Err(match err {
            Error::ChannelUnavailable(_) => err,
            other => Error::ChannelUnavailable(other.to_string()),
        })
    }

    /// Moves a pending booking to `confirmed`. Confirming twice is a no-op;
    /// confirming a cancelled booking is an error.
    pub async fn confirm(&self, booking_id: Uuid) -> Result<Booking> {
        let booking = self.store.get_booking(booking_id).await?;
        if booking.status == BookingStatus::Confirmed {
            debug!(booking_id = %booking_id, "Booking already confirmed");
            return Ok(booking);
        }
        if !booking.status.can_transition_to(BookingStatus::Confirmed) {
            return Err(Error::InvalidTransition {
                booking_id,
                from: booking.status,
                to: BookingStatus::Confirmed,
            });
        }

        // Между чтением и записью бронь могла истечь: решает условный UPDATE
        match self.store.confirm_pending(booking_id).await? {
            Transition::Applied(booking) => {
                info!(booking_id = %booking_id, event_id = %booking.event_id, "Booking confirmed");
                Ok(booking)
            }
            Transition::AlreadySettled(BookingStatus::Confirmed) => {
                self.store.get_booking(booking_id).await
            }
            Transition::AlreadySettled(from) => Err(Error::InvalidTransition {
                booking_id,
                from,
                to: BookingStatus::Confirmed,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;
    use crate::store::{BookingStore, EventStore, MemoryStore, OutboxStore};

    fn policy(scheduling: Scheduling) -> BookingConfig {
        BookingConfig {
            ttl_secs: 60,
            scheduling,
        }
    }

    fn concert(tickets: i32) -> NewEvent {
        NewEvent {
            name: "Concert".to_string(),
            description: "Open air".to_string(),
            is_free: false,
            price: 25.0,
            available_tickets: tickets,
        }
    }

    fn setup(scheduling: Scheduling) -> (BookingService, Arc<MemoryStore>, MemoryQueue) {
        let store = Arc::new(MemoryStore::new());
        let queue = MemoryQueue::new(Duration::from_secs(1));
        let service = BookingService::new(
            store.clone(),
            Arc::new(queue.clone()),
            &policy(scheduling),
        );
        (service, store, queue)
    }

    #[tokio::test]
    async fn create_event_validates_input() {
        let (service, _, _) = setup(Scheduling::Outbox);

        let mut bad = concert(10);
        bad.name = String::new();
        assert!(matches!(service.create_event(bad).await, Err(Error::Validation(_))));

        let mut negative = concert(10);
        negative.available_tickets = -1;
        assert!(matches!(service.create_event(negative).await, Err(Error::Validation(_))));

        let event = service.create_event(concert(10)).await.unwrap();
        assert_eq!(service.get_event(event.id).await.unwrap(), event);
        assert_eq!(service.list_events().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn outbox_booking_writes_notice_with_booking() {
        let (service, store, queue) = setup(Scheduling::Outbox);
        let event = service.create_event(concert(2)).await.unwrap();

        let booking = service.book(event.id, "user-1").await.unwrap();
        assert_eq!(booking.status, BookingStatus::Pending);
        assert_eq!(store.get_event(event.id).await.unwrap().available_tickets, 1);
        assert_eq!(store.unpublished_count(), 1);
        // В очередь уходит только через ретранслятор
        assert_eq!(queue.waiting_len(), 0);
    }

    #[tokio::test]
    async fn direct_booking_publishes_immediately() {
        let (service, store, queue) = setup(Scheduling::Direct);
        let event = service.create_event(concert(2)).await.unwrap();

        service.book(event.id, "user-1").await.unwrap();
        assert_eq!(queue.waiting_len(), 1);
        assert_eq!(store.outbox_len(), 0);
    }

    #[tokio::test]
    async fn direct_publish_failure_rolls_back() {
        let (service, store, queue) = setup(Scheduling::Direct);
        let event = service.create_event(concert(1)).await.unwrap();
        queue.fail_publishes(true);

        let err = service.book(event.id, "user-1").await.unwrap_err();
        assert!(matches!(err, Error::ChannelUnavailable(_)));
        assert_eq!(store.booking_count(), 0);
        assert_eq!(store.get_event(event.id).await.unwrap().available_tickets, 1);
    }

    #[tokio::test]
    async fn failed_release_falls_back_to_outbox_expiry() {
        let (service, store, queue) = setup(Scheduling::Direct);
        let event = service.create_event(concert(1)).await.unwrap();
        queue.fail_publishes(true);
        store.fail_releases(true);

        let err = service.book(event.id, "user-1").await.unwrap_err();
        assert!(matches!(err, Error::ChannelUnavailable(_)));
        // Бронь не удалась откатить, но её истечение записано в outbox
        assert_eq!(store.booking_count(), 1);
        assert_eq!(store.unpublished_count(), 1);

        let entry = store
            .claim_unpublished(10, Duration::from_secs(30))
            .await
            .unwrap()
            .pop()
            .unwrap();
        let notice = ExpiryNotice::decode(&entry.payload).unwrap();
        assert_eq!(store.get_booking(notice.booking_id).await.unwrap().status, BookingStatus::Pending);
        assert!(entry.deliver_at > chrono::Utc::now());
    }

    #[tokio::test]
    async fn outbox_write_failure_rolls_back() {
        let (service, store, _) = setup(Scheduling::Outbox);
        let event = service.create_event(concert(1)).await.unwrap();
        store.fail_outbox_writes(true);

        assert!(service.book(event.id, "user-1").await.is_err());
        assert_eq!(store.booking_count(), 0);
        assert_eq!(store.get_event(event.id).await.unwrap().available_tickets, 1);
    }

    #[tokio::test]
    async fn sold_out_and_unknown_event() {
        let (service, _, _) = setup(Scheduling::Outbox);
        let event = service.create_event(concert(1)).await.unwrap();

        service.book(event.id, "user-1").await.unwrap();
        assert!(matches!(
            service.book(event.id, "user-2").await,
            Err(Error::Exhausted { .. })
        ));
        assert!(matches!(
            service.book(Uuid::new_v4(), "user-2").await,
            Err(Error::NotFound { entity: "event", .. })
        ));
        assert!(matches!(service.book(event.id, "  ").await, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn confirm_is_idempotent_but_never_revives() {
        let (service, store, _) = setup(Scheduling::Outbox);
        let event = service.create_event(concert(2)).await.unwrap();

        let kept = service.book(event.id, "user-1").await.unwrap();
        let first = service.confirm(kept.id).await.unwrap();
        assert_eq!(first.status, BookingStatus::Confirmed);
        assert_eq!(service.confirm(kept.id).await.unwrap().status, BookingStatus::Confirmed);

        let expired = service.book(event.id, "user-2").await.unwrap();
        store.reclaim_pending(expired.id).await.unwrap();
        assert!(matches!(
            service.confirm(expired.id).await,
            Err(Error::InvalidTransition {
                from: BookingStatus::Cancelled,
                to: BookingStatus::Confirmed,
                ..
            })
        ));

        assert!(matches!(
            service.confirm(Uuid::new_v4()).await,
            Err(Error::NotFound { entity: "booking", .. })
        ));
    }
}
