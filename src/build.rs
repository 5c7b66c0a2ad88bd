use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// How many finished or running builds the registry remembers
pub const DEFAULT_MAX_BUILDS: usize = 24;

/// Timestamp part of a build id
pub const BUILD_ID_TIME_FORMAT: &str = "%Y_%m_%d__%H_%M_%S";

/// Represents the status of a rebuild
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Success,
    Failure,
}

/// One rebuild attempt, from acceptance to process exit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRun {
    pub id: String,
    pub build_id: String,
    pub project: String,
    pub revision: String,
    pub repository_url: String,
    pub workspace_path: PathBuf,
    pub log_path: PathBuf,
    pub pid: Option<u32>,
    pub status: BuildStatus,
    pub exit_code: Option<i32>,
    pub epoch: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BuildRun {
    /// Create a new build in Pending status
    pub fn new(
        build_id: BuildId,
        project: String,
        revision: String,
        repository_url: String,
        workspace_path: PathBuf,
        log_path: PathBuf,
        epoch: u64,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            build_id: build_id.value,
            project,
            revision,
            repository_url,
            workspace_path,
            log_path,
            pid: None,
            status: BuildStatus::Pending,
            exit_code: None,
            epoch,
            started_at: build_id.started_at,
            finished_at: None,
        }
    }

    /// Mark build as finished with the process exit code. A missing code
    /// (killed by a signal) counts as failure.
    pub fn mark_finished(&mut self, exit_code: Option<i32>) {
        self.status = match exit_code {
            Some(0) => BuildStatus::Success,
            _ => BuildStatus::Failure,
        };
        self.exit_code = exit_code;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self) {
        self.status = BuildStatus::Failure;
        self.finished_at = Some(Utc::now());
    }
}

/// Timestamp-based build identifier, e.g. `2025_09_19__14_00_00_0003`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildId {
    pub value: String,
    pub started_at: DateTime<Utc>,
}

/// Hands out build identifiers that stay unique even when two builds start
/// within the same second.
#[derive(Debug, Default)]
pub struct BuildIdGenerator {
    sequence: AtomicU64,
}

impl BuildIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> BuildId {
        self.next_at(Utc::now())
    }

    pub fn next_at(&self, started_at: DateTime<Utc>) -> BuildId {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        BuildId {
            value: format!("{}_{:04}", started_at.format(BUILD_ID_TIME_FORMAT), seq),
            started_at,
        }
    }
}

/// In-memory record of recent builds, newest first
pub struct BuildRegistry {
    builds: Mutex<VecDeque<BuildRun>>,
    max_builds: usize,
}

impl BuildRegistry {
    pub fn new(max_builds: usize) -> Self {
        Self {
            builds: Mutex::new(VecDeque::new()),
            max_builds: max_builds.max(1),
        }
    }

    pub fn insert(&self, build: BuildRun) {
        let mut builds = self.builds.lock().unwrap_or_else(|e| e.into_inner());
        builds.push_front(build);
        builds.truncate(self.max_builds);
    }

    /// Applies `update` to the build with the given id. Returns false if the
    /// build has already been evicted.
    pub fn update<F>(&self, id: &str, update: F) -> bool
    where
        F: FnOnce(&mut BuildRun),
    {
        let mut builds = self.builds.lock().unwrap_or_else(|e| e.into_inner());
        match builds.iter_mut().find(|b| b.id == id) {
            Some(build) => {
                update(build);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<BuildRun> {
        let builds = self.builds.lock().unwrap_or_else(|e| e.into_inner());
        builds.iter().find(|b| b.id == id || b.build_id == id).cloned()
    }

    pub fn recent(&self, limit: usize) -> Vec<BuildRun> {
        let builds = self.builds.lock().unwrap_or_else(|e| e.into_inner());
        builds.iter().take(limit).cloned().collect()
    }

    /// Workspaces of builds that have not finished yet
    pub fn active_workspaces(&self) -> Vec<PathBuf> {
        let builds = self.builds.lock().unwrap_or_else(|e| e.into_inner());
        builds
            .iter()
            .filter(|b| b.status == BuildStatus::Pending)
            .map(|b| b.workspace_path.clone())
            .collect()
    }
}

impl Default for BuildRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUILDS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(ids: &BuildIdGenerator) -> BuildRun {
        BuildRun::new(
            ids.next_id(),
            "app".to_string(),
            "abc123".to_string(),
            "git@x:y.git".to_string(),
            PathBuf::from("/tmp/ws"),
            PathBuf::from("/tmp/log"),
            1,
        )
    }

    #[test]
    fn ids_in_the_same_second_differ() {
        let ids = BuildIdGenerator::new();
        let at = Utc.with_ymd_and_hms(2025, 9, 19, 14, 0, 0).unwrap();
        let a = ids.next_at(at);
        let b = ids.next_at(at);
        assert_eq!(a.value, "2025_09_19__14_00_00_0000");
        assert_eq!(b.value, "2025_09_19__14_00_00_0001");
    }

    #[test]
    fn finished_build_status_follows_exit_code() {
        let ids = BuildIdGenerator::new();
        let mut ok = sample(&ids);
        ok.mark_finished(Some(0));
        assert_eq!(ok.status, BuildStatus::Success);
        assert!(ok.finished_at.is_some());

        let mut failed = sample(&ids);
        failed.mark_finished(Some(2));
        assert_eq!(failed.status, BuildStatus::Failure);

        let mut killed = sample(&ids);
        killed.mark_finished(None);
        assert_eq!(killed.status, BuildStatus::Failure);
    }

    #[test]
    fn registry_keeps_newest_first_and_evicts_oldest() {
        let ids = BuildIdGenerator::new();
        let registry = BuildRegistry::new(2);
        let first = sample(&ids);
        let second = sample(&ids);
        let third = sample(&ids);
        let first_id = first.id.clone();
        registry.insert(first);
        registry.insert(second.clone());
        registry.insert(third.clone());

        let recent = registry.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, third.id);
        assert_eq!(recent[1].id, second.id);
        assert!(registry.get(&first_id).is_none());
        assert!(!registry.update(&first_id, |b| b.mark_finished(Some(0))));
    }

    #[test]
    fn registry_updates_in_place() {
        let ids = BuildIdGenerator::new();
        let registry = BuildRegistry::default();
        let build = sample(&ids);
        let id = build.id.clone();
        let build_id = build.build_id.clone();
        registry.insert(build);

        assert!(registry.update(&id, |b| b.mark_finished(Some(0))));
        assert_eq!(registry.get(&id).unwrap().status, BuildStatus::Success);
        assert_eq!(registry.get(&build_id).unwrap().id, id);
    }

    #[test]
    fn only_pending_builds_hold_workspaces() {
        let ids = BuildIdGenerator::new();
        let registry = BuildRegistry::default();
        let mut done = sample(&ids);
        done.workspace_path = PathBuf::from("/tmp/done");
        done.mark_finished(Some(0));
        let mut running = sample(&ids);
        running.workspace_path = PathBuf::from("/tmp/running");
        registry.insert(done);
        registry.insert(running);

        assert_eq!(
            registry.active_workspaces(),
            vec![PathBuf::from("/tmp/running")]
        );
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&BuildStatus::Pending).unwrap(),
            "\"pending\""
        );
    }
}
