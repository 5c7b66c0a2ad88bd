//! Webhook handler for GitHub deliveries

use axum::{
    body::Bytes,
    extract::State as AxumState,
    http::{HeaderMap, StatusCode},
};
use tracing::{debug, error, info, warn};

use crate::SharedState;
use crate::dispatcher::DispatchOutcome;
use crate::error::DeployError;
use crate::utils::verify_github_signature;
use crate::webhook::{HEADER_EVENT, HEADER_SIGNATURE, WebhookData};

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Handles `POST /deploy/webhook`.
///
/// Authenticate, filter by event, extract, dispatch. Every step is terminal
/// on failure. The build itself runs detached, so the response only says
/// whether it was started.
pub async fn handle_webhook(
    AxumState(state): AxumState<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, String) {
    // Verify the raw wire bytes before looking at anything else
    let signature = header(&headers, HEADER_SIGNATURE).unwrap_or("");
    if !verify_github_signature(state.config.webhook_secret.as_bytes(), &body, signature) {
        warn!("Signature verification failed, rejecting webhook");
        return (StatusCode::FORBIDDEN, "Invalid signature.".to_string());
    }

    let event = header(&headers, HEADER_EVENT).unwrap_or("");
    if event != state.config.trigger_event {
        info!(
            "Not {} event; Received {:?} event",
            state.config.trigger_event, event
        );
        return (StatusCode::OK, "Ignored".to_string());
    }

    let data = match WebhookData::from_body(&body) {
        Ok(data) => data,
        Err(e) => {
            error!("Could not parse webhook payload: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };
    debug!("{:?}", data);

    if data.is_branch_deletion() {
        info!(
            "Branch deletion for {} ({:?}), nothing to build",
            data.repository_url, data.git_ref
        );
        return (StatusCode::OK, "Ignored".to_string());
    }

    match state.dispatcher.dispatch_target(data.build_target()).await {
        Ok(DispatchOutcome::Accepted(run)) => (
            StatusCode::OK,
            format!(
                "Deployment handled and rebuild started (build {}).",
                run.build_id
            ),
        ),
        Ok(DispatchOutcome::TooEarly { retry_after }) => {
            info!("Debounced webhook, next build allowed in {:?}", retry_after);
            (StatusCode::OK, "Too early".to_string())
        }
        // Details are in the server log; git output may name hosts and paths
        Err(DeployError::Workspace(_)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to prepare build workspace.".to_string(),
        ),
        Err(e) => {
            error!("Dispatch failed: {:?}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to start rebuild: {}", e),
            )
        }
    }
}
