use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;
use crate::models::NewEvent;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/events", get(list_events).post(create_event))
        .route("/events/{id}", get(get_event))
        .route("/events/{id}/book", post(book_event))
}

/* ---------- EVENTS ---------- */

// POST /api/events
async fn create_event(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewEvent>,
) -> Result<impl IntoResponse> {
    let event = state.bookings.create_event(req).await?;
    Ok((StatusCode::CREATED, Json(event)))
}

// GET /api/events
async fn list_events(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    let events = state.bookings.list_events().await?;
    Ok(Json(events))
}

// GET /api/events/{id}
async fn get_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let event = state.bookings.get_event(id).await?;
    Ok(Json(event))
}

/* ---------- BOOKING ---------- */

#[derive(Debug, Deserialize)]
struct BookRequest {
    user_id: String,
}

// POST /api/events/{id}/book
async fn book_event(
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<Uuid>,
    Json(req): Json<BookRequest>,
) -> Result<impl IntoResponse> {
    let booking = state.bookings.book(event_id, &req.user_id).await?;
    Ok((StatusCode::CREATED, Json(booking)))
}
