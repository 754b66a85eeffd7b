//! Storage contracts for events, bookings and the expiry outbox.
//!
//! The single-entity traits mirror the individual operations the booking
//! lifecycle needs. [`Storage`] adds the multi-step operations that must
//! commit or roll back as one unit; the booking service and the expiry worker
//! go through those, never through a sequence of single-entity calls.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Booking, BookingStatus, Event, OutboxEntry};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Fails with `Conflict` if the id is taken.
    async fn create_event(&self, event: &Event) -> Result<()>;
    async fn get_event(&self, id: Uuid) -> Result<Event>;
    /// Oldest first.
    async fn list_events(&self) -> Result<Vec<Event>>;
}

#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Takes one ticket if any is left and returns how many remain.
    /// `Exhausted` when the counter is already zero, `NotFound` when the
    /// event does not exist.
    async fn decrement_if_available(&self, event_id: Uuid) -> Result<i32>;

    /// Returns one ticket, yielding the new count.
    async fn increment(&self, event_id: Uuid) -> Result<i32>;
}

#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Fails with `Conflict` if the id is taken.
    async fn insert_booking(&self, booking: &Booking) -> Result<()>;
    async fn get_booking(&self, id: Uuid) -> Result<Booking>;

    /// Unconditional write. Callers check the current status first; prefer
    /// the compare-and-set operations on [`Storage`].
    async fn transition_status(&self, id: Uuid, status: BookingStatus) -> Result<()>;
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Leases up to `limit` unpublished entries for `lease`. Entries whose
    /// lease ran out are handed out again.
    async fn claim_unpublished(&self, limit: i64, lease: Duration) -> Result<Vec<OutboxEntry>>;
    /// Adds an entry outside any booking transaction.
    async fn enqueue(&self, entry: &OutboxEntry) -> Result<()>;
    async fn mark_published(&self, id: Uuid) -> Result<()>;
    /// Deletes entries published before `cutoff`, returning how many went.
    async fn purge_published(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Result of a conditional `pending -> X` transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The booking was pending and now holds the target status.
    Applied(Booking),
    /// Someone else settled the booking first; nothing was written.
    AlreadySettled(BookingStatus),
}

#[async_trait]
pub trait Storage: EventStore + InventoryStore + BookingStore + OutboxStore {
    /// Decrements the event's inventory, inserts the pending booking and,
    /// when given, the outbox entry, all in one transaction. Returns the
    /// tickets left.
    async fn reserve(&self, booking: &Booking, expiry: Option<&OutboxEntry>) -> Result<i32>;

    /// Undoes a `reserve` whose expiry could not be scheduled: deletes the
    /// booking if still pending and returns its ticket.
    async fn release(&self, booking_id: Uuid) -> Result<()>;

    /// `pending -> confirmed`. Inventory is untouched.
    async fn confirm_pending(&self, booking_id: Uuid) -> Result<Transition>;

    /// `pending -> cancelled` plus the ticket returned to the event, in one
    /// transaction. A booking that is no longer pending is left alone, so a
    /// repeated call never increments twice.
    async fn reclaim_pending(&self, booking_id: Uuid) -> Result<Transition>;
}
