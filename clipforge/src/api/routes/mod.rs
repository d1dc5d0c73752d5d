//! API route modules.

pub mod health;
pub mod render;

use axum::{Router, middleware};
use tower_http::services::ServeDir;

use crate::api::middleware::api_key_auth;
use crate::api::server::AppState;

/// Create the main API router with all routes.
///
/// Health and outputs are unauthenticated; render routes require the API key
/// when one is configured.
pub fn create_router(state: AppState) -> Router {
    let render = render::router().layer(middleware::from_fn_with_state(
        state.auth.clone(),
        api_key_auth,
    ));

    Router::new()
        .nest("/render", render)
        .nest("/health", health::router())
        .nest_service("/outputs", ServeDir::new(&state.output_dir))
        .with_state(state)
}
