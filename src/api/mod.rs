//! HTTP surface: the deploy webhook plus read-only build status endpoints

pub mod status;
pub mod webhook;

use axum::{Router, routing};

use crate::SharedState;

pub use status::{get_build, health, list_builds, root};
pub use webhook::handle_webhook;

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/", routing::get(root))
        .route("/health", routing::get(health))
        .route("/deploy/webhook", routing::post(handle_webhook))
        .route("/deploy/builds", routing::get(list_builds))
        .route("/deploy/builds/{id}", routing::get(get_build))
        .with_state(state)
}
