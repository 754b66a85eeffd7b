use uuid::Uuid;

use crate::models::BookingStatus;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong between the HTTP layer, the stores and the
/// delayed queue.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("event {event_id} is sold out")]
    Exhausted { event_id: Uuid },

    #[error("{entity} {id} already exists")]
    Conflict { entity: &'static str, id: Uuid },

    #[error("booking {booking_id} cannot move from {from} to {to}")]
    InvalidTransition {
        booking_id: Uuid,
        from: BookingStatus,
        to: BookingStatus,
    },

    #[error("notification channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("malformed message: {0}")]
    DataCorruption(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error(transparent)]
    Database(sqlx::Error),

    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn event_not_found(id: Uuid) -> Self {
        Error::NotFound { entity: "event", id }
    }

    pub fn booking_not_found(id: Uuid) -> Self {
        Error::NotFound { entity: "booking", id }
    }

    /// Transient failures worth another attempt. Domain outcomes and bad
    /// payloads will fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ChannelUnavailable(_) | Error::StorageUnavailable(_) => true,
            Error::Database(err) => sqlx_is_transient(err),
            Error::Redis(err) => {
                err.is_io_error()
                    || err.is_connection_dropped()
                    || err.is_connection_refusal()
                    || err.is_timeout()
            }
            _ => false,
        }
    }
}

// Обрыв соединения, конфликт сериализации, дедлок: следующая попытка может пройти
fn sqlx_is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db
            .code()
            .is_some_and(|code| code.starts_with("08") || code == "40001" || code == "40P01"),
        _ => false,
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                Error::StorageUnavailable(err.to_string())
            }
            other => Error::Database(other),
        }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(errors: validator::ValidationErrors) -> Self {
        Error::Validation(errors.to_string())
    }
}

/// Maps a unique-violation on insert to `Conflict`, anything else through `From`.
pub(crate) fn on_insert(err: sqlx::Error, entity: &'static str, id: Uuid) -> Error {
    if let sqlx::Error::Database(ref db) = err {
        if db.code().as_deref() == Some("23505") {
            return Error::Conflict { entity, id };
        }
    }
    Error::from(err)
}
