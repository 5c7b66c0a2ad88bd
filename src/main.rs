use deploy_hook::api::build_router;
use deploy_hook::build::BuildRegistry;
use deploy_hook::config::Config;
use deploy_hook::logging::{FileLogger, setup_logging};
use deploy_hook::workspace::reap_stale_workspaces;
use deploy_hook::{AppState, SharedState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info, warn};

const REAPER_INTERVAL: Duration = Duration::from_secs(3600);

/// Periodically removes workspaces left behind by crashed or killed builds
fn start_workspace_reaper(
    root: PathBuf,
    max_age: Duration,
    builds: Arc<BuildRegistry>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(REAPER_INTERVAL);
        loop {
            ticker.tick().await;
            let in_use = builds.active_workspaces();
            match reap_stale_workspaces(&root, max_age, &in_use).await {
                Ok(0) => {}
                Ok(n) => info!("Removed {} stale workspace(s) under {:?}", n, root),
                Err(e) => warn!("Workspace reaper failed for {:?}: {}", root, e),
            }
        }
    })
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    let _log_guard = match setup_logging(&FileLogger::new(config.logs_path.clone())) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to set up logging in {:?}: {}", config.logs_path, e);
            std::process::exit(1);
        }
    };

    if !config.rebuild_script.exists() {
        warn!(
            "Rebuild script {:?} does not exist yet; builds will fail until it does",
            config.rebuild_script
        );
    }

    if let Err(e) = std::fs::create_dir_all(&config.workspace_root) {
        error!(
            "Failed to create workspace root {:?}: {}",
            config.workspace_root, e
        );
        std::process::exit(1);
    }

    let bind_address = config.bind_address.clone();
    info!("Repository path: {}", config.repository_path);
    info!("Web install path: {:?}", config.web_install_path);
    info!("Logs path: {:?}", config.logs_path);
    info!(
        "Triggering on {:?} events, debounce window {:?}, workspaces under {:?}",
        config.trigger_event, config.debounce_window, config.workspace_root
    );

    let workspace_root = config.workspace_root.clone();
    let workspace_max_age = config.workspace_max_age;
    let state: SharedState = Arc::new(AppState::from_config(config));
    start_workspace_reaper(
        workspace_root,
        workspace_max_age,
        state.dispatcher.builds().clone(),
    );
    let app = build_router(state);

    let listener = match tokio::net::TcpListener::bind(&bind_address).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", bind_address, e);
            std::process::exit(1);
        }
    };
    info!("Listening on {}", bind_address);
    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}
