//! API route modules.

pub mod health;
pub mod logging;
pub mod recordings;

use axum::Router;

use crate::api::server::AppState;

/// Create the API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(recordings::router())
        .nest("/health", health::router())
        .nest("/logging", logging::router())
        .with_state(state)
}
