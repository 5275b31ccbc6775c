//! HTTP API routes and handlers for the HTTP transport.
//!
//! - `command` - Host commands
//! - `events` - Server-Sent-Events stream
//! - `health` - Service health checks
//! - `error` - API error types
//! - `openapi` - OpenAPI specification generation

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::HttpState;

pub mod command;
pub mod error;
pub mod events;
pub mod health;
pub mod openapi;

pub use error::{ApiError, ApiResult};
// Re-exported for the gen-openapi binary
pub use openapi::get_openapi_json;

/// Creates the combined router.
///
/// # Route Structure
///
/// ```text
/// /command        - POST a request envelope, get the reply envelope
/// /events         - SSE stream of detections and heartbeats
/// /health         - Health check
/// /openapi.json   - OpenAPI specification
/// ```
pub fn create_router(state: HttpState) -> Router {
    Router::new()
        .route("/command", post(command::post_command))
        .route("/events", get(events::stream_events))
        .route("/openapi.json", get(openapi::get_openapi_spec))
        .nest("/health", health::router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
