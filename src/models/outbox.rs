use chrono::{DateTime, Utc};
use sqlx::FromRow;
use std::time::Duration;
use uuid::Uuid;

use super::ExpiryNotice;
use crate::error::{Error, Result};

/// Expiry notice persisted in the same transaction as its booking, waiting
/// for the relay to hand it to the delayed queue.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub payload: String,
    pub deliver_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub attempts: i32,
}

impl OutboxEntry {
    pub fn for_notice(notice: &ExpiryNotice, ttl: Duration) -> Result<Self> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|_| Error::Validation(format!("booking ttl {ttl:?} is out of range")))?;
        Ok(Self {
            id: Uuid::new_v4(),
            booking_id: notice.booking_id,
            payload: notice.encode()?,
            deliver_at: notice.booked_at + ttl,
            created_at: Utc::now(),
            attempts: 0,
        })
    }

    /// Time left until delivery is due, zero once it has passed.
    pub fn remaining_delay(&self, now: DateTime<Utc>) -> Duration {
        (self.deliver_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Booking;

    #[test]
    fn delivery_is_ttl_after_booking() {
        let booking = Booking::pending(Uuid::new_v4(), "user-1");
        let notice = ExpiryNotice::for_booking(&booking);
        let entry = OutboxEntry::for_notice(&notice, Duration::from_secs(900)).unwrap();

        assert_eq!(entry.booking_id, booking.id);
        assert_eq!(entry.deliver_at - booking.created_at, chrono::Duration::seconds(900));
        assert_eq!(
            entry.remaining_delay(booking.created_at),
            Duration::from_secs(900)
        );
    }

    #[test]
    fn overdue_entry_has_no_delay() {
        let booking = Booking::pending(Uuid::new_v4(), "user-1");
        let notice = ExpiryNotice::for_booking(&booking);
        let entry = OutboxEntry::for_notice(&notice, Duration::from_secs(60)).unwrap();

        let later = booking.created_at + chrono::Duration::minutes(5);
        assert_eq!(entry.remaining_delay(later), Duration::ZERO);
    }
}
