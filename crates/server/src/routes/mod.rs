use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;

use crate::AppState;

pub mod diagnostics;
pub mod events;
pub mod health;
pub mod services;
pub mod terminals;
pub mod tools;

/// The command surface exposed to the UI, registered during the `ipc`
/// boot step.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(health::health_check))
        .merge(services::router())
        .merge(tools::router())
        .merge(terminals::router())
        .merge(diagnostics::router())
        .merge(events::router())
        .with_state(state);

    // The webview loads from a custom scheme; loopback requests need
    // permissive CORS.
    Router::new().nest("/api", api).layer(CorsLayer::permissive())
}
