pub mod booking;
pub mod event;
pub mod notice;
pub mod outbox;

pub use booking::{Booking, BookingStatus};
pub use event::{Event, NewEvent};
pub use notice::ExpiryNotice;
pub use outbox::OutboxEntry;
