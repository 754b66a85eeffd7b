use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Booking;
use crate::error::{Error, Result};

/// Payload of the "check for expiry" message scheduled for every new booking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpiryNotice {
    pub booking_id: Uuid,
    pub event_id: Uuid,
    pub user_id: String,
    pub booked_at: DateTime<Utc>,
}

impl ExpiryNotice {
    pub fn for_booking(booking: &Booking) -> Self {
        Self {
            booking_id: booking.id,
            event_id: booking.event_id,
            user_id: booking.user_id.clone(),
            booked_at: booking.created_at,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// A payload that does not decode is never going to: report it as
    /// corruption rather than a retryable error.
    pub fn decode(payload: &str) -> Result<Self> {
        serde_json::from_str(payload).map_err(|e| Error::DataCorruption(e.to_string()))
    }
}
