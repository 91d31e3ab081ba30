// src/routes.rs

use axum::{
    Router, http::Method,
    routing::{get, post},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    handlers::{block, session},
    state::AppState,
};

/// Assembles the Time Authority router.
///
/// * Exposes the session fetch/save/submit surface plus the block protocol.
/// * Applies global middleware (Trace, CORS).
/// * Injects global state (Database Pool + Config).
pub fn create_router(state: AppState) -> Router {
    let origins = [
        "http://localhost:3000".parse().unwrap(),
        "http://127.0.0.1:3000".parse().unwrap(),
    ];

    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderName::from_static("x-student-id"),
        ]);

    let quiz_routes = Router::new()
        .route("/{id}", get(session::fetch_session))
        .route("/{id}/save-progress", post(session::save_progress))
        .route("/{id}/submit", post(session::submit_session))
        .route("/{id}/block", post(block::create_block))
        .route("/{id}/block-status", get(block::block_status));

    Router::new()
        .nest("/api/quiz", quiz_routes)
        // Global Middleware (applied from outside in)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
