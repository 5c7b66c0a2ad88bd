//! Webhook related structures

use serde::Deserialize;

use crate::dispatcher::BuildTarget;
use crate::error::DeployError;

/// Header carrying the GitHub event name
pub const HEADER_EVENT: &str = "x-github-event";
/// Header carrying the HMAC-SHA256 signature of the body
pub const HEADER_SIGNATURE: &str = "x-hub-signature-256";
/// `after` value GitHub sends when a branch is deleted
pub const NULL_SHA: &str = "0000000000000000000000000000000000000000";

#[derive(Debug, Deserialize)]
struct PushPayload {
    repository: RepositoryInfo,
    after: String,
    #[serde(rename = "ref")]
    git_ref: Option<String>,
    #[serde(default)]
    deleted: bool,
}

#[derive(Debug, Deserialize)]
struct RepositoryInfo {
    ssh_url: Option<String>,
    clone_url: Option<String>,
    name: Option<String>,
}

/// Data extracted from a push-style webhook payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookData {
    pub project_name: Option<String>,
    pub repository_url: String,
    pub revision: String,
    pub git_ref: Option<String>,
    pub deleted: bool,
}

impl WebhookData {
    /// Parses the exact bytes that were signature-checked; the body is never
    /// re-serialized in between.
    pub fn from_body(body: &[u8]) -> Result<Self, DeployError> {
        let payload: PushPayload = serde_json::from_slice(body)
            .map_err(|e| DeployError::PayloadError(e.to_string()))?;

        let repository_url = payload
            .repository
            .ssh_url
            .or(payload.repository.clone_url)
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| {
                DeployError::PayloadError("repository.ssh_url is missing".to_string())
            })?;

        Ok(Self {
            project_name: payload.repository.name,
            repository_url,
            revision: payload.after,
            git_ref: payload.git_ref,
            deleted: payload.deleted,
        })
    }

    /// A push that removed the branch; there is nothing to build.
    pub fn is_branch_deletion(&self) -> bool {
        self.deleted || self.revision == NULL_SHA
    }

    pub fn build_target(&self) -> BuildTarget {
        let target = BuildTarget::new(&self.repository_url, &self.revision);
        match &self.project_name {
            Some(name) => target.with_project(name),
            None => target,
        }
    }
}
