pub mod api;
pub mod build;
pub mod config;
pub mod debounce;
pub mod dispatcher;
pub mod error;
pub mod logging;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod utils;
pub mod webhook;
pub mod workspace;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;

use build::BuildRegistry;
use config::Config;
use debounce::Debouncer;
use dispatcher::{Dispatcher, DispatcherConfig};
use workspace::GitWorkspaceFactory;

pub struct AppState {
    pub config: Config,
    pub dispatcher: Dispatcher,
    pub start_time: Instant,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: Config, dispatcher: Dispatcher) -> Self {
        Self {
            config,
            dispatcher,
            start_time: Instant::now(),
            started_at: Utc::now(),
        }
    }

    /// Wires the production dispatcher: real git workspaces under the
    /// configured root and the wall-clock debouncer.
    pub fn from_config(config: Config) -> Self {
        let workspaces = Arc::new(GitWorkspaceFactory::new(
            config.workspace_root.clone(),
            config.clone_timeout,
        ));
        let dispatcher = Dispatcher::new(
            DispatcherConfig::from(&config),
            Debouncer::new(config.debounce_window),
            workspaces,
            Arc::new(BuildRegistry::default()),
        );
        Self::new(config, dispatcher)
    }
}

pub type SharedState = Arc<AppState>;
