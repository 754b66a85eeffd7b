//! In-process [`Storage`] with the same contract as the PostgreSQL store.
//!
//! One mutex guards all tables, so every operation (including the composite
//! ones) is atomic. Faults can be injected to exercise rollback and retry
//! paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

use super::{BookingStore, EventStore, InventoryStore, OutboxStore, Storage, Transition};
use crate::error::{Error, Result};
use crate::models::{Booking, BookingStatus, Event, OutboxEntry};

#[derive(Debug, Clone)]
struct OutboxRecord {
    entry: OutboxEntry,
    locked_until: Option<DateTime<Utc>>,
    published_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Tables {
    events: HashMap<Uuid, Event>,
    bookings: HashMap<Uuid, Booking>,
    outbox: Vec<OutboxRecord>,
}

impl Tables {
    fn take_ticket(&mut self, event_id: Uuid) -> Result<i32> {
        let event = self
            .events
            .get_mut(&event_id)
            .ok_or_else(|| Error::event_not_found(event_id))?;
        if event.available_tickets <= 0 {
            return Err(Error::Exhausted { event_id });
        }
        event.available_tickets -= 1;
        Ok(event.available_tickets)
    }

    fn return_ticket(&mut self, event_id: Uuid) -> Result<i32> {
        let event = self
            .events
            .get_mut(&event_id)
            .ok_or_else(|| Error::event_not_found(event_id))?;
        event.available_tickets += 1;
        Ok(event.available_tickets)
    }

    fn status_of(&self, booking_id: Uuid) -> Result<BookingStatus> {
        self.bookings
            .get(&booking_id)
            .map(|b| b.status)
            .ok_or_else(|| Error::booking_not_found(booking_id))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_outbox_writes: AtomicBool,
    fail_reads: AtomicBool,
    fail_releases: AtomicBool,
    failing_reclaims: AtomicU32,
    permanent_faults: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every outbox write inside `reserve` fail.
    pub fn fail_outbox_writes(&self, fail: bool) {
        self.fail_outbox_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes `get_booking` fail as if the database were unreachable.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Makes `release` fail, leaving the booking in place.
    pub fn fail_releases(&self, fail: bool) {
        self.fail_releases.store(fail, Ordering::SeqCst);
    }

    /// Fails the next `n` calls to `reclaim_pending`.
    pub fn fail_next_reclaims(&self, n: u32) {
        self.failing_reclaims.store(n, Ordering::SeqCst);
    }

    /// Injected failures report corrupt data instead of an unreachable
    /// database, so retrying them cannot help.
    pub fn permanent_faults(&self, permanent: bool) {
        self.permanent_faults.store(permanent, Ordering::SeqCst);
    }

    pub fn booking_count(&self) -> usize {
        self.tables().bookings.len()
    }

    pub fn unpublished_count(&self) -> usize {
        self.tables()
            .outbox
            .iter()
            .filter(|r| r.published_at.is_none())
            .count()
    }

    pub fn outbox_len(&self) -> usize {
        self.tables().outbox.len()
    }

    fn fault(&self, what: &str) -> Error {
        if self.permanent_faults.load(Ordering::SeqCst) {
            Error::DataCorruption(format!("{what} returned garbage (injected)"))
        } else {
            Error::StorageUnavailable(format!("{what} failed (injected)"))
        }
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn create_event(&self, event: &Event) -> Result<()> {
        let mut tables = self.tables();
        if tables.events.contains_key(&event.id) {
            return Err(Error::Conflict { entity: "event", id: event.id });
        }
        tables.events.insert(event.id, event.clone());
        Ok(())
    }

    async fn get_event(&self, id: Uuid) -> Result<Event> {
        self.tables()
            .events
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::event_not_found(id))
    }

    async fn list_events(&self) -> Result<Vec<Event>> {
        let mut events: Vec<Event> = self.tables().events.values().cloned().collect();
        events.sort_by_key(|e| e.created_at);
        Ok(events)
    }
}

#[async_trait]
impl InventoryStore for MemoryStore {
    async fn decrement_if_available(&self, event_id: Uuid) -> Result<i32> {
        self.tables().take_ticket(event_id)
    }

    async fn increment(&self, event_id: Uuid) -> Result<i32> {
        self.tables().return_ticket(event_id)
    }
}

#[async_trait]
impl BookingStore for MemoryStore {
    async fn insert_booking(&self, booking: &Booking) -> Result<()> {
        let mut tables = self.tables();
        if tables.bookings.contains_key(&booking.id) {
            return Err(Error::Conflict { entity: "booking", id: booking.id });
        }
        tables.bookings.insert(booking.id, booking.clone());
        Ok(())
    }

    async fn get_booking(&self, id: Uuid) -> Result<Booking> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(self.fault("get_booking"));
        }
        self.tables()
            .bookings
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::booking_not_found(id))
    }

    async fn transition_status(&self, id: Uuid, status: BookingStatus) -> Result<()> {
        let mut tables = self.tables();
        let booking = tables
            .bookings
            .get_mut(&id)
            .ok_or_else(|| Error::booking_not_found(id))?;
        booking.status = status;
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn claim_unpublished(&self, limit: i64, lease: Duration) -> Result<Vec<OutboxEntry>> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::zero());
        let limit = usize::try_from(limit).unwrap_or(0);

        let mut tables = self.tables();
        let mut claimed = Vec::new();
        for record in tables.outbox.iter_mut() {
            if claimed.len() >= limit {
                break;
            }
            let free = record.locked_until.map_or(true, |until| until < now);
            if record.published_at.is_none() && free {
                record.locked_until = Some(now + lease);
                record.entry.attempts += 1;
                claimed.push(record.entry.clone());
            }
        }
        Ok(claimed)
    }

    async fn enqueue(&self, entry: &OutboxEntry) -> Result<()> {
        if self.fail_outbox_writes.load(Ordering::SeqCst) {
            return Err(self.fault("outbox write"));
        }
        let mut tables = self.tables();
        if tables.outbox.iter().any(|r| r.entry.id == entry.id) {
            return Err(Error::Conflict { entity: "outbox entry", id: entry.id });
        }
        tables.outbox.push(OutboxRecord {
            entry: entry.clone(),
            locked_until: None,
            published_at: None,
        });
        Ok(())
    }

    async fn mark_published(&self, id: Uuid) -> Result<()> {
        let mut tables = self.tables();
        if let Some(record) = tables.outbox.iter_mut().find(|r| r.entry.id == id) {
            record.published_at = Some(Utc::now());
            record.locked_until = None;
        }
        Ok(())
    }

    async fn purge_published(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables();
        let before = tables.outbox.len();
        tables
            .outbox
            .retain(|r| r.published_at.map_or(true, |at| at >= cutoff));
        Ok((before - tables.outbox.len()) as u64)
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn reserve(&self, booking: &Booking, expiry: Option<&OutboxEntry>) -> Result<i32> {
        let mut tables = self.tables();

        // Все проверки до первой записи: так откат не нужен
        if tables.bookings.contains_key(&booking.id) {
            return Err(Error::Conflict { entity: "booking", id: booking.id });
        }
        if expiry.is_some() && self.fail_outbox_writes.load(Ordering::SeqCst) {
            return Err(self.fault("outbox write"));
        }

        let remaining = tables.take_ticket(booking.event_id)?;
        tables.bookings.insert(booking.id, booking.clone());
        if let Some(entry) = expiry {
            tables.outbox.push(OutboxRecord {
                entry: entry.clone(),
                locked_until: None,
                published_at: None,
            });
        }
        Ok(remaining)
    }

    async fn release(&self, booking_id: Uuid) -> Result<()> {
        if self.fail_releases.load(Ordering::SeqCst) {
            return Err(self.fault("release"));
        }
        let mut tables = self.tables();
        let event_id = match tables.bookings.get(&booking_id) {
            Some(b) if b.is_pending() => b.event_id,
            _ => return Ok(()),
        };
        tables.return_ticket(event_id)?;
        tables.bookings.remove(&booking_id);
        tables.outbox.retain(|r| r.entry.booking_id != booking_id);
        Ok(())
    }

    async fn confirm_pending(&self, booking_id: Uuid) -> Result<Transition> {
        let mut tables = self.tables();
        let status = tables.status_of(booking_id)?;
        if status != BookingStatus::Pending {
            return Ok(Transition::AlreadySettled(status));
        }
        let booking = tables
            .bookings
            .get_mut(&booking_id)
            .ok_or_else(|| Error::booking_not_found(booking_id))?;
        booking.status = BookingStatus::Confirmed;
        Ok(Transition::Applied(booking.clone()))
    }

    async fn reclaim_pending(&self, booking_id: Uuid) -> Result<Transition> {
        let failing = self
            .failing_reclaims
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(self.fault("reclaim"));
        }

        let mut tables = self.tables();
        let status = tables.status_of(booking_id)?;
        if status != BookingStatus::Pending {
            return Ok(Transition::AlreadySettled(status));
        }

        let mut booking = tables.bookings[&booking_id].clone();
        tables.return_ticket(booking.event_id)?;
        booking.status = BookingStatus::Cancelled;
        tables.bookings.insert(booking_id, booking.clone());
        Ok(Transition::Applied(booking))
    }
}
