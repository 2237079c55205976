//! API route modules.
//!
//! Organizes routes by resource type.

pub mod artifacts;
pub mod convert;
pub mod download;
pub mod health;
pub mod info;

use axum::Router;

use crate::api::server::AppState;

/// Create the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/convert", convert::router())
        .nest("/download", download::router())
        .nest("/artifacts", artifacts::router())
        .nest("/info", info::router())
        .nest("/health", health::router())
        .with_state(state)
}
