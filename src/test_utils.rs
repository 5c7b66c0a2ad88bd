//! Test doubles shared by unit and integration tests.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::WorkspaceError;
use crate::workspace::{CommitIter, Workspace, WorkspaceFactory, workspace_dir_name};

type CloneLog = Arc<Mutex<Vec<(String, String)>>>;

/// A workspace factory that records every clone request and, instead of
/// running git, just creates the workspace directory.
pub struct SpyWorkspaceFactory {
    root: PathBuf,
    clones: CloneLog,
    created: Mutex<Vec<PathBuf>>,
    fail: Arc<AtomicBool>,
    delay: Arc<Mutex<Duration>>,
}

impl SpyWorkspaceFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            clones: Arc::new(Mutex::new(Vec::new())),
            created: Mutex::new(Vec::new()),
            fail: Arc::new(AtomicBool::new(false)),
            delay: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Makes every later clone take `delay` before it finishes.
    pub fn delay_clones(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Makes every later clone fail like an unreachable remote would.
    pub fn fail_clones(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// `(url, revision)` of every clone attempted so far
    pub fn clones(&self) -> Vec<(String, String)> {
        self.clones.lock().unwrap().clone()
    }

    pub fn created_paths(&self) -> Vec<PathBuf> {
        self.created.lock().unwrap().clone()
    }
}

impl WorkspaceFactory for SpyWorkspaceFactory {
    fn create(&self, id: &str, project: &str, revision: &str) -> Box<dyn Workspace> {
        let path = self.root.join(workspace_dir_name(id, project, revision));
        self.created.lock().unwrap().push(path.clone());
        Box::new(FakeWorkspace {
            path,
            clones: self.clones.clone(),
            fail: self.fail.clone(),
            delay: *self.delay.lock().unwrap(),
            revision: None,
        })
    }
}

pub struct FakeWorkspace {
    path: PathBuf,
    clones: CloneLog,
    fail: Arc<AtomicBool>,
    delay: Duration,
    revision: Option<String>,
}

impl FakeWorkspace {
    async fn fake_clone(&mut self, url: &str, revision: &str) -> Result<(), WorkspaceError> {
        self.clones
            .lock()
            .unwrap()
            .push((url.to_string(), revision.to_string()));
        if !self.delay.is_zero() {
            tokio::fs::create_dir_all(&self.path).await?;
            tokio::time::sleep(self.delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(WorkspaceError::GitOperationFailed {
                operation: format!("git clone {}", url),
                message: "fatal: Could not read from remote repository.".to_string(),
            });
        }
        tokio::fs::create_dir_all(&self.path).await?;
        self.revision = Some(revision.to_string());
        Ok(())
    }
}

#[async_trait]
impl Workspace for FakeWorkspace {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn clone_at(&mut self, url: &str, revision: &str) -> Result<(), WorkspaceError> {
        self.fake_clone(url, revision).await
    }

    async fn bare_clone(&mut self, url: &str) -> Result<(), WorkspaceError> {
        self.fake_clone(url, "HEAD").await
    }

    async fn clean(&mut self) -> Result<(), WorkspaceError> {
        self.revision = None;
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn current_revision(&self) -> Result<String, WorkspaceError> {
        self.revision.clone().ok_or(WorkspaceError::NotCloned)
    }

    fn current_message(&self) -> Result<String, WorkspaceError> {
        self.revision
            .as_ref()
            .map(|rev| format!("commit {}\n", rev))
            .ok_or(WorkspaceError::NotCloned)
    }

    fn message_for_revision(&self, _revision: &str) -> Option<String> {
        None
    }

    fn commit_range(&self, _from: &str, _to: &str) -> Result<CommitIter<'_>, WorkspaceError> {
        Ok(Box::new(std::iter::empty()))
    }
}

/// Polls `condition` until it holds or ten seconds pass.
pub async fn wait_for<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// Writes an executable `/bin/sh` script and returns its path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}
