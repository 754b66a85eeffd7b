pub mod booking;
pub mod expiry;
pub mod outbox;

pub use booking::BookingService;
pub use expiry::{Disposition, ExpiryWorker};
pub use outbox::OutboxRelay;
