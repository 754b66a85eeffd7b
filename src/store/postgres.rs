use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use std::time::Duration;
use uuid::Uuid;

use super::{BookingStore, EventStore, InventoryStore, OutboxStore, Storage, Transition};
use crate::database::Database;
use crate::error::{on_insert, Error, Result};
use crate::models::{Booking, BookingStatus, Event, OutboxEntry};

const BOOKING_COLUMNS: &str = "id, user_id, event_id, status, created_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(db: &Database) -> Self {
        Self { pool: db.pool.clone() }
    }

    async fn current_status(&self, booking_id: Uuid) -> Result<BookingStatus> {
        sqlx::query_scalar::<_, BookingStatus>("SELECT status FROM bookings WHERE id = $1")
            .bind(booking_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::booking_not_found(booking_id))
    }
}

/* ---------- helpers shared by pool and transaction paths ---------- */

// Условный декремент одним UPDATE: конкурирующие брони сериализуются на строке события
async fn take_ticket(conn: &mut PgConnection, event_id: Uuid) -> Result<i32> {
    let remaining = sqlx::query_scalar::<_, i32>(
        r#"
        UPDATE events
        SET available_tickets = available_tickets - 1
        WHERE id = $1 AND available_tickets > 0
        RETURNING available_tickets
        "#,
    )
    .bind(event_id)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(remaining) = remaining {
        return Ok(remaining);
    }

    // Пустой результат: либо билетов нет, либо события нет
    let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM events WHERE id = $1)")
        .bind(event_id)
        .fetch_one(&mut *conn)
        .await?;

    if exists {
        Err(Error::Exhausted { event_id })
    } else {
        Err(Error::event_not_found(event_id))
    }
}

async fn return_ticket(conn: &mut PgConnection, event_id: Uuid) -> Result<i32> {
    sqlx::query_scalar::<_, i32>(
        r#"
        UPDATE events
        SET available_tickets = available_tickets + 1
        WHERE id = $1
        RETURNING available_tickets
        "#,
    )
    .bind(event_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| Error::event_not_found(event_id))
}

async fn settle_pending(
    conn: &mut PgConnection,
    booking_id: Uuid,
    target: BookingStatus,
) -> Result<Option<Booking>> {
    let query = format!(
        "UPDATE bookings SET status = $1 WHERE id = $2 AND status = $3 RETURNING {BOOKING_COLUMNS}"
    );
    let booking = sqlx::query_as::<_, Booking>(&query)
        .bind(target)
        .bind(booking_id)
        .bind(BookingStatus::Pending)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(booking)
}

/* ---------- EVENTS ---------- */

#[async_trait]
impl EventStore for PgStore {
    async fn create_event(&self, event: &Event) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO events (id, name, description, is_free, price, available_tickets, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.id)
        .bind(&event.name)
        .bind(&event.description)
        .bind(event.is_free)
        .bind(event.price)
        .bind(event.available_tickets)
        .bind(event.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| on_insert(e, "event", event.id))?;
        Ok(())
    }

    async fn get_event(&self, id: Uuid) -> Result<Event> {
        sqlx::query_as::<_, Event>(
            "SELECT id, name, description, is_free, price, available_tickets, created_at
             FROM events WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::event_not_found(id))
    }

    async fn list_events(&self) -> Result<Vec<Event>> {
        let events = sqlx::query_as::<_, Event>(
            "SELECT id, name, description, is_free, price, available_tickets, created_at
             FROM events ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }
}

/* ---------- INVENTORY ---------- */

#[async_trait]
impl InventoryStore for PgStore {
    async fn decrement_if_available(&self, event_id: Uuid) -> Result<i32> {
        let mut conn = self.pool.acquire().await?;
        take_ticket(&mut conn, event_id).await
    }

    async fn increment(&self, event_id: Uuid) -> Result<i32> {
        let mut conn = self.pool.acquire().await?;
        return_ticket(&mut conn, event_id).await
    }
}

/* ---------- BOOKINGS ---------- */

#[async_trait]
impl BookingStore for PgStore {
    async fn insert_booking(&self, booking: &Booking) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        insert_booking(&mut conn, booking).await
    }

    async fn get_booking(&self, id: Uuid) -> Result<Booking> {
        let query = format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1");
        sqlx::query_as::<_, Booking>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::booking_not_found(id))
    }

    async fn transition_status(&self, id: Uuid, status: BookingStatus) -> Result<()> {
        let updated = sqlx::query("UPDATE bookings SET status = $1 WHERE id = $2")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if updated == 0 {
            return Err(Error::booking_not_found(id));
        }
        Ok(())
    }
}

async fn insert_booking(conn: &mut PgConnection, booking: &Booking) -> Result<()> {
    sqlx::query(
        "INSERT INTO bookings (id, user_id, event_id, status, created_at) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(booking.id)
    .bind(&booking.user_id)
    .bind(booking.event_id)
    .bind(booking.status)
    .bind(booking.created_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| on_insert(e, "booking", booking.id))?;
    Ok(())
}

async fn insert_outbox(conn: &mut PgConnection, entry: &OutboxEntry) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO expiry_outbox (id, booking_id, payload, deliver_at, created_at, attempts)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(entry.id)
    .bind(entry.booking_id)
    .bind(&entry.payload)
    .bind(entry.deliver_at)
    .bind(entry.created_at)
    .bind(entry.attempts)
    .execute(&mut *conn)
    .await
    .map_err(|e| on_insert(e, "outbox entry", entry.id))?;
    Ok(())
}

/* ---------- OUTBOX ---------- */

#[async_trait]
impl OutboxStore for PgStore {
    async fn claim_unpublished(&self, limit: i64, lease: Duration) -> Result<Vec<OutboxEntry>> {
        // SKIP LOCKED: несколько ретрансляторов не заберут одну и ту же запись
        let entries = sqlx::query_as::<_, OutboxEntry>(
            r#"
            UPDATE expiry_outbox
            SET locked_until = NOW() + make_interval(secs => $2),
                attempts = attempts + 1
            WHERE id IN (
                SELECT id FROM expiry_outbox
                WHERE published_at IS NULL
                  AND (locked_until IS NULL OR locked_until < NOW())
                ORDER BY created_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, booking_id, payload, deliver_at, created_at, attempts
            "#,
        )
        .bind(limit)
        .bind(lease.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    async fn enqueue(&self, entry: &OutboxEntry) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        insert_outbox(&mut conn, entry).await
    }

    async fn mark_published(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE expiry_outbox SET published_at = NOW(), locked_until = NULL WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_published(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let deleted = sqlx::query(
            "DELETE FROM expiry_outbox WHERE published_at IS NOT NULL AND published_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(deleted)
    }
}

/* ---------- TRANSACTIONAL OPERATIONS ---------- */

#[async_trait]
impl Storage for PgStore {
    async fn reserve(&self, booking: &Booking, expiry: Option<&OutboxEntry>) -> Result<i32> {
        // Любой `?` ниже роняет транзакцию, и sqlx откатывает её в Drop
        let mut tx = self.pool.begin().await?;

        let remaining = take_ticket(&mut tx, booking.event_id).await?;
        insert_booking(&mut tx, booking).await?;
        if let Some(entry) = expiry {
            insert_outbox(&mut tx, entry).await?;
        }

        tx.commit().await?;
        Ok(remaining)
    }

    async fn release(&self, booking_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let event_id = sqlx::query_scalar::<_, Uuid>(
            "DELETE FROM bookings WHERE id = $1 AND status = $2 RETURNING event_id",
        )
        .bind(booking_id)
        .bind(BookingStatus::Pending)
        .fetch_optional(&mut *tx)
        .await?;

        // Бронь уже не pending или её нет: возвращать нечего
        let Some(event_id) = event_id else {
            return Ok(());
        };

        return_ticket(&mut tx, event_id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn confirm_pending(&self, booking_id: Uuid) -> Result<Transition> {
        let mut conn = self.pool.acquire().await?;
        match settle_pending(&mut conn, booking_id, BookingStatus::Confirmed).await? {
            Some(booking) => Ok(Transition::Applied(booking)),
            None => Ok(Transition::AlreadySettled(self.current_status(booking_id).await?)),
        }
    }

    async fn reclaim_pending(&self, booking_id: Uuid) -> Result<Transition> {
        let mut tx = self.pool.begin().await?;

        let Some(booking) = settle_pending(&mut tx, booking_id, BookingStatus::Cancelled).await?
        else {
            tx.rollback().await?;
            return Ok(Transition::AlreadySettled(self.current_status(booking_id).await?));
        };

        return_ticket(&mut tx, booking.event_id).await?;
        tx.commit().await?;
        Ok(Transition::Applied(booking))
    }
}
