use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

/// A bookable event. `available_tickets` only ever changes through the
/// inventory store's atomic increment/decrement.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub is_free: bool,
    pub price: f64,
    pub available_tickets: i32,
    pub created_at: DateTime<Utc>,
}

// Входные данные для создания события
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewEvent {
    #[validate(length(min = 1, max = 255, message = "name must be 1-255 characters"))]
    pub name: String,
    #[serde(default)]
    #[validate(length(max = 4096))]
    pub description: String,
    #[serde(default)]
    pub is_free: bool,
    #[serde(default)]
    #[validate(range(min = 0.0, message = "price must not be negative"))]
    pub price: f64,
    #[validate(range(min = 0, message = "available_tickets must not be negative"))]
    pub available_tickets: i32,
}

impl Event {
    pub fn from_new(new: NewEvent) -> Self {
        // Бесплатное событие не может иметь цену
        let price = if new.is_free { 0.0 } else { new.price };
        Self {
            id: Uuid::new_v4(),
            name: new.name,
            description: new.description,
            is_free: new.is_free,
            price,
            available_tickets: new.available_tickets,
            created_at: Utc::now(),
        }
    }
}
