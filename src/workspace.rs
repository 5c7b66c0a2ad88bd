//! Isolated per-build git clones.
//!
//! Cloning and checkout shell out to the `git` executable so that the
//! service user's SSH keys and config apply unchanged. Once a workspace
//! exists, inspection goes through `git2` on the local clone.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use git2::{Repository, Sort};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::build::BUILD_ID_TIME_FORMAT;
use crate::error::WorkspaceError;
use crate::utils::sanitize_path_component;

/// Every workspace directory starts with this prefix; the reaper relies on it.
pub const WORKSPACE_PREFIX: &str = "git_";

/// Metadata for one commit in a workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub sha: String,
    pub message: String,
    pub author: String,
    pub time: i64,
}

impl CommitInfo {
    fn from_commit(commit: &git2::Commit<'_>) -> Self {
        Self {
            sha: commit.id().to_string(),
            message: String::from_utf8_lossy(commit.message_bytes()).into_owned(),
            author: String::from_utf8_lossy(commit.author().name_bytes()).into_owned(),
            time: commit.time().seconds(),
        }
    }
}

/// Lazy, single-pass sequence of commits, newest first.
pub type CommitIter<'a> = Box<dyn Iterator<Item = CommitInfo> + 'a>;

/// Capabilities of a build workspace.
///
/// Fallible operations report failure through `WorkspaceError`; none of them
/// panic, so callers can treat an `Err` as the only failure signal.
#[async_trait]
pub trait Workspace: Send {
    fn path(&self) -> &Path;

    /// Full clone of `url` followed by a checkout of `revision`.
    async fn clone_at(&mut self, url: &str, revision: &str) -> Result<(), WorkspaceError>;

    /// Clone without a working tree, for inspection only.
    async fn bare_clone(&mut self, url: &str) -> Result<(), WorkspaceError>;

    /// Removes the workspace directory. Succeeds if it is already gone.
    async fn clean(&mut self) -> Result<(), WorkspaceError>;

    fn current_revision(&self) -> Result<String, WorkspaceError>;

    fn current_message(&self) -> Result<String, WorkspaceError>;

    /// Message of an arbitrary revision, `None` if it cannot be resolved.
    fn message_for_revision(&self, revision: &str) -> Option<String>;

    /// Commits in `from..to`: reachable from `to` but not from `from`.
    fn commit_range(&self, from: &str, to: &str) -> Result<CommitIter<'_>, WorkspaceError>;

    fn message_range(
        &self,
        from: &str,
        to: &str,
    ) -> Result<Box<dyn Iterator<Item = String> + '_>, WorkspaceError> {
        let commits = self.commit_range(from, to)?;
        Ok(Box::new(commits.map(|c| c.message)))
    }
}

/// Creates workspaces for builds. The dispatcher only talks to this seam.
pub trait WorkspaceFactory: Send + Sync {
    fn create(&self, id: &str, project: &str, revision: &str) -> Box<dyn Workspace>;
}

/// Directory name for a build workspace: `git_<project>_<revision>_<id>`.
pub fn workspace_dir_name(id: &str, project: &str, revision: &str) -> String {
    format!(
        "{}{}_{}_{}",
        WORKSPACE_PREFIX,
        sanitize_path_component(project),
        sanitize_path_component(revision),
        sanitize_path_component(id)
    )
}

/// Length of the `YYYY_MM_DD__HH_MM_SS` part of a build id
const BUILD_STAMP_LEN: usize = "2025_01_01__00_00_00".len();

/// True only for names `workspace_dir_name` produces for a generated build
/// id: `git_<project>_<revision>_<YYYY_MM_DD__HH_MM_SS>_<seq>`.
fn is_workspace_dir_name(name: &str) -> bool {
    let Some(rest) = name.strip_prefix(WORKSPACE_PREFIX) else {
        return false;
    };
    let Some((head, seq)) = rest.rsplit_once('_') else {
        return false;
    };
    if seq.len() < 4 || !seq.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    let Some(stamp_start) = head.len().checked_sub(BUILD_STAMP_LEN) else {
        return false;
    };
    let (Some(target), Some(stamp)) = (head.get(..stamp_start), head.get(stamp_start..)) else {
        return false;
    };
    // `<project>_<revision>_`, each part non-empty
    target.len() >= 4
        && target.ends_with('_')
        && NaiveDateTime::parse_from_str(stamp, BUILD_ID_TIME_FORMAT).is_ok()
}

/// Rejects revisions git could mistake for an option.
fn validate_revision(revision: &str) -> Result<(), WorkspaceError> {
    let revision = revision.trim();
    if revision.is_empty() || revision.starts_with('-') {
        return Err(WorkspaceError::InvalidRevision(revision.to_string()));
    }
    Ok(())
}

pub struct GitWorkspaceFactory {
    root: PathBuf,
    clone_timeout: Duration,
}

impl GitWorkspaceFactory {
    pub fn new(root: impl Into<PathBuf>, clone_timeout: Duration) -> Self {
        Self {
            root: root.into(),
            clone_timeout,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl WorkspaceFactory for GitWorkspaceFactory {
    fn create(&self, id: &str, project: &str, revision: &str) -> Box<dyn Workspace> {
        let path = self.root.join(workspace_dir_name(id, project, revision));
        Box::new(GitWorkspace::new(path, self.clone_timeout))
    }
}

/// A workspace backed by a real git clone on disk
pub struct GitWorkspace {
    path: PathBuf,
    clone_timeout: Duration,
    repo: Option<Repository>,
}

impl GitWorkspace {
    pub fn new(path: PathBuf, clone_timeout: Duration) -> Self {
        Self {
            path,
            clone_timeout,
            repo: None,
        }
    }

    fn repo(&self) -> Result<&Repository, WorkspaceError> {
        self.repo.as_ref().ok_or(WorkspaceError::NotCloned)
    }

    async fn try_clone(
        &mut self,
        url: &str,
        revision: Option<&str>,
    ) -> Result<(), WorkspaceError> {
        if let Some(revision) = revision {
            validate_revision(revision)?;
        }

        // Clone and checkout share one budget
        let deadline = Instant::now() + self.clone_timeout;
        let target = self.path.to_string_lossy().into_owned();
        let mut args = vec!["clone", "--quiet"];
        if revision.is_none() {
            args.push("--bare");
        }
        args.extend(["--", url, target.as_str()]);
        run_git(deadline, self.clone_timeout, None, &args).await?;

        if let Some(revision) = revision {
            let path = self.path.clone();
            run_git(
                deadline,
                self.clone_timeout,
                Some(&path),
                &["checkout", "--quiet", "--detach", revision.trim()],
            )
            .await?;
        }

        self.repo = Some(Repository::open(&self.path)?);
        Ok(())
    }

    async fn clone_inner(
        &mut self,
        url: &str,
        revision: Option<&str>,
    ) -> Result<(), WorkspaceError> {
        match self.try_clone(url, revision).await {
            Ok(()) => {
                info!("Workspace ready at {:?}", self.path);
                Ok(())
            }
            Err(e) => {
                error!("Git failed for workspace {:?}: {}", self.path, e);
                self.repo = None;
                // Never leave a half-written clone behind
                if let Err(clean_err) = remove_dir_if_present(&self.path).await {
                    warn!(
                        "Could not remove partial workspace {:?}: {}",
                        self.path, clean_err
                    );
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Workspace for GitWorkspace {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn clone_at(&mut self, url: &str, revision: &str) -> Result<(), WorkspaceError> {
        self.clone_inner(url, Some(revision)).await
    }

    async fn bare_clone(&mut self, url: &str) -> Result<(), WorkspaceError> {
        self.clone_inner(url, None).await
    }

    async fn clean(&mut self) -> Result<(), WorkspaceError> {
        self.repo = None;
        remove_dir_if_present(&self.path).await?;
        debug!("Removed workspace {:?}", self.path);
        Ok(())
    }

    fn current_revision(&self) -> Result<String, WorkspaceError> {
        let commit = self.repo()?.head()?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    fn current_message(&self) -> Result<String, WorkspaceError> {
        let commit = self.repo()?.head()?.peel_to_commit()?;
        Ok(String::from_utf8_lossy(commit.message_bytes()).into_owned())
    }

    fn message_for_revision(&self, revision: &str) -> Option<String> {
        let lookup = || -> Result<String, WorkspaceError> {
            let commit = self.repo()?.revparse_single(revision)?.peel_to_commit()?;
            Ok(String::from_utf8_lossy(commit.message_bytes()).into_owned())
        };
        match lookup() {
            Ok(message) => Some(message),
            Err(e) => {
                warn!("Git failed to resolve revision {:?}: {}", revision, e);
                None
            }
        }
    }

    fn commit_range(&self, from: &str, to: &str) -> Result<CommitIter<'_>, WorkspaceError> {
        let repo = self.repo()?;
        let mut walk = repo.revwalk()?;
        walk.set_sorting(Sort::TIME)?;
        walk.push_range(&format!("{}..{}", from, to))?;

        Ok(Box::new(walk.filter_map(move |oid| {
            match oid.and_then(|oid| repo.find_commit(oid)) {
                Ok(commit) => Some(CommitInfo::from_commit(&commit)),
                Err(e) => {
                    warn!("Skipping unreadable commit in range: {}", e);
                    None
                }
            }
        })))
    }
}

/// Runs one git command that must finish by `deadline`. The child is killed
/// if the deadline passes; `budget` is the total time reported on timeout.
async fn run_git(
    deadline: Instant,
    budget: Duration,
    cwd: Option<&Path>,
    args: &[&str],
) -> Result<(), WorkspaceError> {
    let operation = format!("git {}", args.join(" "));
    if Instant::now() >= deadline {
        return Err(WorkspaceError::Timeout {
            operation,
            timeout: budget,
        });
    }
    info!("Running (cwd = {:?}): {}", cwd, operation);

    let mut cmd = Command::new("git");
    cmd.args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let output = match tokio::time::timeout_at(deadline, cmd.output()).await {
        Ok(result) => result.map_err(|e| WorkspaceError::GitOperationFailed {
            operation: operation.clone(),
            message: format!("failed to start: {}", e),
        })?,
        Err(_) => {
            return Err(WorkspaceError::Timeout {
                operation,
                timeout: budget,
            });
        }
    };

    if !output.status.success() {
        return Err(WorkspaceError::GitOperationFailed {
            operation,
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    debug!("{} output:\n{}", operation, String::from_utf8_lossy(&output.stdout));
    Ok(())
}

async fn remove_dir_if_present(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Removes workspace directories under `root` that have not been modified
/// for longer than `max_age`. Only names this service generates are touched,
/// and paths in `in_use` are skipped. Returns how many were removed.
pub async fn reap_stale_workspaces(
    root: &Path,
    max_age: Duration,
    in_use: &[PathBuf],
) -> std::io::Result<usize> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let now = SystemTime::now();
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if !is_workspace_dir_name(&name.to_string_lossy()) {
            continue;
        }
        let path = entry.path();
        if in_use.contains(&path) {
            debug!("Workspace {:?} belongs to a running build", path);
            continue;
        }
        let metadata = match entry.metadata().await {
            Ok(m) if m.is_dir() => m,
            _ => continue,
        };
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }

        match remove_dir_if_present(&path).await {
            Ok(()) => {
                info!("Reaped stale workspace {:?} (age {:?})", path, age);
                removed += 1;
            }
            Err(e) => warn!("Failed to reap workspace {:?}: {}", path, e),
        }
    }
    Ok(removed)
}
