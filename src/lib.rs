pub mod config;
pub mod controllers;
pub mod database;
pub mod error;
pub mod models;
pub mod queue;
pub mod redis_client;
pub mod services;
pub mod store;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::queue::DelayedQueue;
use crate::services::BookingService;
use crate::store::Storage;

// Shared state для всего приложения
#[derive(Clone)]
pub struct AppState {
    pub bookings: BookingService,
}

impl AppState {
    pub fn new(
        config: &config::Config,
        store: Arc<dyn Storage>,
        queue: Arc<dyn DelayedQueue>,
    ) -> Arc<Self> {
        let bookings = BookingService::new(store, queue, &config.booking);
        Arc::new(Self { bookings })
    }
}

/// The full HTTP surface: banner, health check and the `/api` routes.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(|| async { "Event Booker API v1.0" }))
        .route("/health", get(|| async { "OK" }))
        .nest("/api", controllers::routes())
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
