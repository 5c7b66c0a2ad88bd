//! Health and build status endpoints

use axum::{
    Json,
    extract::{Path, Query, State as AxumState},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;

use crate::SharedState;
use crate::build::DEFAULT_MAX_BUILDS;

/// Root health check endpoint
pub async fn root() -> &'static str {
    "deploy_hook - healthy"
}

pub async fn health(AxumState(state): AxumState<SharedState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "started_at": state.started_at,
        "uptime_seconds": state.start_time.elapsed().as_secs(),
    }))
}

/// Query parameters for build listing
#[derive(Debug, Deserialize)]
pub struct BuildsQuery {
    /// Number of builds to return (default and max: the registry size)
    pub limit: Option<usize>,
}

/// GET /deploy/builds - most recent builds, newest first
pub async fn list_builds(
    AxumState(state): AxumState<SharedState>,
    Query(params): Query<BuildsQuery>,
) -> impl IntoResponse {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_MAX_BUILDS)
        .min(DEFAULT_MAX_BUILDS);
    let builds = state.dispatcher.builds().recent(limit);

    Json(json!({
        "builds": builds,
        "count": builds.len(),
    }))
}

/// GET /deploy/builds/{id} - one build by id or build id
pub async fn get_build(
    AxumState(state): AxumState<SharedState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.dispatcher.builds().get(&id) {
        Some(build) => Json(build).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("Build {} not found", id) })),
        )
            .into_response(),
    }
}
