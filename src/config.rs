//! Environment-driven service configuration

use std::path::PathBuf;
use std::time::Duration;

use crate::error::DeployError;

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8001";
pub const DEFAULT_REBUILD_SCRIPT: &str = "./rebuild.sh";
pub const DEFAULT_TRIGGER_EVENT: &str = "push";
pub const DEFAULT_DEBOUNCE_SECS: u64 = 60;
pub const DEFAULT_CLONE_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_WORKSPACE_MAX_AGE_HOURS: u64 = 24;
/// Subdirectory of the OS temp dir used when `WORKSPACE_ROOT` is not set
pub const DEFAULT_WORKSPACE_DIR: &str = "deploy_hook";

#[derive(Debug, Clone)]
pub struct Config {
    pub webhook_secret: String,
    pub repository_path: String,
    pub web_install_path: PathBuf,
    pub logs_path: PathBuf,
    pub bind_address: String,
    pub rebuild_script: PathBuf,
    pub trigger_event: String,
    pub debounce_window: Duration,
    pub clone_timeout: Duration,
    pub workspace_root: PathBuf,
    pub workspace_max_age: Duration,
    pub keep_workspaces: bool,
}

impl Config {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, DeployError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    ///
    /// Required keys must be present and non-empty. Optional keys fall back to
    /// their defaults when absent, but a present value that does not parse is
    /// an error rather than a silent default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, DeployError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| -> Result<String, DeployError> {
            match lookup(key) {
                Some(value) if !value.trim().is_empty() => Ok(value),
                _ => Err(DeployError::ConfigError(format!("{} is not set", key))),
            }
        };
        let optional = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let webhook_secret = required("GITHUB_WEBHOOK_SECRET")?;
        let repository_path = required("REPOSITORY_PATH")?;
        let web_install_path = PathBuf::from(required("WEB_INSTALL_PATH")?);
        let logs_path = PathBuf::from(required("LOGS_PATH")?);

        let debounce_secs = parse_u64("DEBOUNCE_SECONDS", optional("DEBOUNCE_SECONDS"))?
            .unwrap_or(DEFAULT_DEBOUNCE_SECS);
        let clone_timeout_secs =
            parse_u64("CLONE_TIMEOUT_SECONDS", optional("CLONE_TIMEOUT_SECONDS"))?
                .unwrap_or(DEFAULT_CLONE_TIMEOUT_SECS);
        let max_age_hours =
            parse_u64("WORKSPACE_MAX_AGE_HOURS", optional("WORKSPACE_MAX_AGE_HOURS"))?
                .unwrap_or(DEFAULT_WORKSPACE_MAX_AGE_HOURS);
        let workspace_max_age = max_age_hours
            .checked_mul(3600)
            .map(Duration::from_secs)
            .ok_or_else(|| {
                DeployError::ConfigError(format!(
                    "WORKSPACE_MAX_AGE_HOURS is too large: {}",
                    max_age_hours
                ))
            })?;
        let keep_workspaces =
            parse_bool("KEEP_WORKSPACES", optional("KEEP_WORKSPACES"))?.unwrap_or(false);

        Ok(Self {
            webhook_secret,
            repository_path,
            web_install_path,
            logs_path,
            bind_address: optional("BIND_ADDRESS")
                .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string()),
            rebuild_script: PathBuf::from(
                optional("REBUILD_SCRIPT").unwrap_or_else(|| DEFAULT_REBUILD_SCRIPT.to_string()),
            ),
            trigger_event: optional("TRIGGER_EVENT")
                .unwrap_or_else(|| DEFAULT_TRIGGER_EVENT.to_string()),
            debounce_window: Duration::from_secs(debounce_secs),
            clone_timeout: Duration::from_secs(clone_timeout_secs),
            workspace_root: optional("WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_WORKSPACE_DIR)),
            workspace_max_age,
            keep_workspaces,
        })
    }
}

fn parse_u64(key: &str, value: Option<String>) -> Result<Option<u64>, DeployError> {
    value
        .map(|v| {
            v.trim().parse::<u64>().map_err(|e| {
                DeployError::ConfigError(format!("{} must be a whole number ({:?}): {}", key, v, e))
            })
        })
        .transpose()
}

fn parse_bool(key: &str, value: Option<String>) -> Result<Option<bool>, DeployError> {
    value
        .map(|v| match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(DeployError::ConfigError(format!(
                "{} must be a boolean, got {:?}",
                key, v
            ))),
        })
        .transpose()
}
