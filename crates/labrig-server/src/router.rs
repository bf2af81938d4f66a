//! Router assembly for the lock API.
//!
//! [`build_router`] wires all handler functions to their routes with
//! CORS and tracing middleware layers.

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Builds the complete axum router with all API routes.
///
/// Routes use axum 0.8 `/{param}` path syntax.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/lock",
            get(handlers::locks::list_locks).post(handlers::locks::lock_many),
        )
        .route(
            "/lock/{name}",
            get(handlers::locks::get_lock)
                .post(handlers::locks::set_lock)
                .put(handlers::locks::update_lock),
        )
        .route("/add", post(handlers::machines::add_machine))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
