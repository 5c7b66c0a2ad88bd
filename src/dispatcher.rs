//! Build dispatcher: debounce, clone, spawn, and forget.
//!
//! `dispatch` returns as soon as the rebuild script is running. The setup
//! itself runs on its own task, so a caller that goes away mid-clone does not
//! abandon a half-made workspace. A detached watcher task drains the script's
//! output into the build log, records the exit status in the registry and
//! removes the workspace. Nothing in the HTTP path waits for it, and the
//! service does not otherwise track the process.

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_stream::{Stream, StreamExt};
use tracing::{Level, error, info, warn};

use crate::build::{BuildIdGenerator, BuildRegistry, BuildRun};
use crate::config::Config;
use crate::debounce::{Admission, Debouncer};
use crate::error::DeployError;
use crate::logging::BuildLog;
use crate::utils::project_name_from_url;
use crate::workspace::{Workspace, WorkspaceFactory};

/// Longest single log entry taken from the script's output; longer lines are
/// split into several entries.
pub const MAX_OUTPUT_LINE_BYTES: usize = 16 * 1024;

/// How long output is still collected after the script exits. Background
/// processes it started may keep the pipes open indefinitely.
pub const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub rebuild_script: PathBuf,
    pub logs_path: PathBuf,
    pub keep_workspaces: bool,
}

impl From<&Config> for DispatcherConfig {
    fn from(config: &Config) -> Self {
        Self {
            rebuild_script: config.rebuild_script.clone(),
            logs_path: config.logs_path.clone(),
            keep_workspaces: config.keep_workspaces,
        }
    }
}

/// What the dispatcher did with a request
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// The rebuild script is running against a fresh workspace.
    Accepted(BuildRun),
    /// Another build started less than the debounce window ago.
    TooEarly { retry_after: Duration },
}

/// Repository and revision a build should run against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTarget {
    pub project: String,
    pub repository_url: String,
    pub revision: String,
}

impl BuildTarget {
    pub fn new(repository_url: &str, revision: &str) -> Self {
        Self {
            project: project_name_from_url(repository_url),
            repository_url: repository_url.to_string(),
            revision: revision.to_string(),
        }
    }

    pub fn with_project(mut self, project: &str) -> Self {
        if !project.trim().is_empty() {
            self.project = project.to_string();
        }
        self
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    config: DispatcherConfig,
    debouncer: Debouncer,
    workspaces: Arc<dyn WorkspaceFactory>,
    ids: BuildIdGenerator,
    builds: Arc<BuildRegistry>,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        debouncer: Debouncer,
        workspaces: Arc<dyn WorkspaceFactory>,
        builds: Arc<BuildRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                config,
                debouncer,
                workspaces,
                ids: BuildIdGenerator::new(),
                builds,
            }),
        }
    }

    pub fn builds(&self) -> &Arc<BuildRegistry> {
        &self.inner.builds
    }

    /// Starts a rebuild of `url` at `revision`.
    pub async fn dispatch(
        &self,
        url: &str,
        revision: &str,
    ) -> Result<DispatchOutcome, DeployError> {
        self.dispatch_target(BuildTarget::new(url, revision)).await
    }

    /// Debounce, clone and spawn on a separate task. Dropping the returned
    /// future does not cancel the dispatch.
    pub async fn dispatch_target(
        &self,
        target: BuildTarget,
    ) -> Result<DispatchOutcome, DeployError> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.dispatch(target).await })
            .await
            .map_err(|e| {
                error!("Dispatch task did not complete: {}", e);
                DeployError::TaskFailed(e.to_string())
            })?
    }
}

impl DispatcherInner {
    async fn dispatch(&self, target: BuildTarget) -> Result<DispatchOutcome, DeployError> {
        let epoch = match self.debouncer.try_admit() {
            Admission::Accepted { epoch } => epoch,
            Admission::TooEarly { retry_after } => {
                info!(
                    "Build for {} at {} rejected: previous build started less than {:?} ago",
                    target.project,
                    target.revision,
                    self.debouncer.window()
                );
                return Ok(DispatchOutcome::TooEarly { retry_after });
            }
        };

        let build_id = self.ids.next_id();
        let mut workspace = self
            .workspaces
            .create(&build_id.value, &target.project, &target.revision);

        if let Err(e) = workspace
            .clone_at(&target.repository_url, &target.revision)
            .await
        {
            error!(
                "Build {} aborted, could not prepare workspace {:?}: {}",
                build_id.value,
                workspace.path(),
                e
            );
            return Err(DeployError::Workspace(e));
        }

        let log_path = self
            .config
            .logs_path
            .join(format!("{}.log", build_id.value));
        let log = match BuildLog::create(&log_path) {
            Ok(log) => log,
            Err(e) => {
                error!("Build {} could not open log {:?}: {}", build_id.value, log_path, e);
                discard_workspace(&mut *workspace).await;
                return Err(DeployError::IoError(e));
            }
        };

        let child = match self.spawn_rebuild(&*workspace) {
            Ok(child) => child,
            Err(e) => {
                error!(
                    "Build {} could not start {:?}: {}",
                    build_id.value, self.config.rebuild_script, e
                );
                discard_workspace(&mut *workspace).await;
                return Err(DeployError::SpawnFailed(e.to_string()));
            }
        };

        let mut run = BuildRun::new(
            build_id,
            target.project,
            target.revision,
            target.repository_url,
            workspace.path().to_path_buf(),
            log_path,
            epoch,
        );
        run.pid = child.id();
        self.builds.insert(run.clone());

        info!(
            "Build {} started (pid {:?}) for {} at {} in {:?}, logging to {:?}",
            run.build_id, run.pid, run.project, run.revision, run.workspace_path, run.log_path
        );

        // Fire and forget: the handle is only kept by the watcher for diagnostics
        tokio::spawn(watch_build(
            child,
            log,
            workspace,
            self.builds.clone(),
            run.id.clone(),
            run.build_id.clone(),
            self.config.keep_workspaces,
        ));

        Ok(DispatchOutcome::Accepted(run))
    }

    fn spawn_rebuild(&self, workspace: &dyn Workspace) -> io::Result<Child> {
        let mut cmd = Command::new(&self.config.rebuild_script);
        cmd.arg(workspace.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        // Own process group, so signals aimed at the service leave the build alone
        #[cfg(unix)]
        cmd.process_group(0);

        cmd.spawn()
    }
}

async fn discard_workspace(workspace: &mut dyn Workspace) {
    if let Err(e) = workspace.clean().await {
        warn!("Failed to remove workspace {:?}: {}", workspace.path(), e);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn as_str(self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }

    fn level(self) -> Level {
        match self {
            OutputStream::Stdout => Level::INFO,
            OutputStream::Stderr => Level::WARN,
        }
    }
}

type OutputLines = Pin<Box<dyn Stream<Item = io::Result<(OutputStream, String)>> + Send>>;

/// Reads up to the next newline, or `max` bytes if no newline comes first.
/// Returns `None` at end of input.
async fn read_capped_line<R>(reader: &mut R, max: usize) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok((!line.is_empty()).then_some(line));
        }
        let room = max.saturating_sub(line.len()).max(1);
        // One byte past the room, so a newline right at the cap ends this line
        let window = &available[..available.len().min(room + 1)];
        match window.iter().position(|&b| b == b'\n') {
            Some(end) => {
                line.extend_from_slice(&window[..end]);
                reader.consume(end + 1);
                return Ok(Some(line));
            }
            None => {
                let taken = window.len().min(room);
                line.extend_from_slice(&window[..taken]);
                reader.consume(taken);
                if line.len() >= max {
                    return Ok(Some(line));
                }
            }
        }
    }
}

fn output_lines<R>(reader: Option<R>, stream: OutputStream) -> OutputLines
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(reader) = reader else {
        return Box::pin(tokio_stream::empty());
    };
    Box::pin(futures::stream::unfold(
        Some(BufReader::new(reader)),
        move |reader| async move {
            let mut reader = reader?;
            match read_capped_line(&mut reader, MAX_OUTPUT_LINE_BYTES).await {
                Ok(Some(bytes)) => {
                    let line = String::from_utf8_lossy(&bytes).into_owned();
                    Some((Ok((stream, line)), Some(reader)))
                }
                Ok(None) => None,
                // Report the error once, then end the stream
                Err(e) => Some((Err(e), None)),
            }
        },
    ))
}

fn record_output(
    log: &mut BuildLog,
    build_id: &str,
    item: io::Result<(OutputStream, String)>,
) {
    match item {
        Ok((stream, line)) => {
            match stream {
                OutputStream::Stdout => info!(target: "rebuild", build = %build_id, "{}", line),
                OutputStream::Stderr => warn!(target: "rebuild", build = %build_id, "{}", line),
            }
            if let Err(e) = log.write_line(stream.level(), stream.as_str(), &line) {
                warn!("Build {} could not write to {:?}: {}", build_id, log.path(), e);
            }
        }
        Err(e) => warn!("Build {} output stream error: {}", build_id, e),
    }
}

async fn watch_build(
    mut child: Child,
    mut log: BuildLog,
    mut workspace: Box<dyn Workspace>,
    builds: Arc<BuildRegistry>,
    run_id: String,
    build_id: String,
    keep_workspace: bool,
) {
    let stdout = output_lines(child.stdout.take(), OutputStream::Stdout);
    let stderr = output_lines(child.stderr.take(), OutputStream::Stderr);
    let mut output = stdout.merge(stderr);
    let mut output_open = true;

    // The script's exit ends the build, not the pipes closing
    let exit = loop {
        tokio::select! {
            item = output.next(), if output_open => match item {
                Some(item) => record_output(&mut log, &build_id, item),
                None => output_open = false,
            },
            status = child.wait() => break status,
        }
    };

    if output_open {
        let deadline = Instant::now() + OUTPUT_DRAIN_TIMEOUT;
        loop {
            match tokio::time::timeout_at(deadline, output.next()).await {
                Ok(Some(item)) => record_output(&mut log, &build_id, item),
                Ok(None) => break,
                Err(_) => {
                    info!(
                        "Build {} output still open after exit, no longer collecting it",
                        build_id
                    );
                    break;
                }
            }
        }
    }
    drop(output);

    match exit {
        Ok(status) => {
            let level = if status.success() {
                Level::INFO
            } else {
                Level::ERROR
            };
            let summary = format!("rebuild script exited: {}", status);
            if let Err(e) = log.write_line(level, "system", &summary) {
                warn!("Build {} could not write to {:?}: {}", build_id, log.path(), e);
            }
            if status.success() {
                info!("Build {} completed successfully.", build_id);
            } else {
                error!("Build {} failed: {}", build_id, status);
            }
            let code = status.code();
            builds.update(&run_id, |run| run.mark_finished(code));
        }
        Err(e) => {
            builds.update(&run_id, |run| run.mark_failed());
            error!("Build {} could not be awaited: {}", build_id, e);
        }
    }

    if keep_workspace {
        info!("Keeping workspace {:?}", workspace.path());
    } else {
        discard_workspace(&mut *workspace).await;
    }
}
