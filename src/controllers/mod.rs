pub mod bookings;
pub mod events;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tracing::error;

use crate::error::Error;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(events::routes())
        .merge(bookings::routes())
}

/* ---------- error mapping ---------- */

impl Error {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Error::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            Error::Exhausted { .. } => (StatusCode::CONFLICT, "sold_out"),
            Error::Conflict { .. } => (StatusCode::CONFLICT, "conflict"),
            Error::InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
            Error::Validation(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        // Детали внутренних ошибок остаются в логах
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "Request failed");
            "internal server error".to_string()
        } else {
            self.to_string()
        };

        (status, Json(json!({ "error": code, "message": message }))).into_response()
    }
}
