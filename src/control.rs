//! Inspecting and stopping a loop from outside the stop hook.

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::{resolve_in_project, ProjectConfig};
use crate::error::{RalphError, Result};
use crate::features::{FeatureOracle, FeatureProgress};
use crate::lock::{AcquireOptions, LockInfo, LockManager, ReleaseOptions};
use crate::state::{self, LoopState};

/// Name matched against registered Stop hook commands.
pub const HOOK_COMMAND_NEEDLE: &str = "ralph-loop";

/// Snapshot of a project's loop.
#[derive(Debug, Clone)]
pub struct LoopStatus {
    pub state_path: PathBuf,
    /// `None` when no loop is active.
    pub state: Option<LoopState>,
    /// Set when a state file exists but cannot be parsed.
    pub corruption: Option<String>,
    pub features: Option<FeatureProgress>,
    pub lock_holder: Option<LockInfo>,
    pub hook_registered: bool,
}

impl LoopStatus {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.as_ref().is_some_and(|s| s.active)
    }
}

/// Outcome of `cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    NotActive,
    /// Cancelled at this iteration (`None` if the state was unreadable).
    Cancelled { iteration: Option<u32> },
}

/// Loop maintenance for one project.
#[derive(Debug, Clone)]
pub struct LoopControl {
    project_dir: PathBuf,
    config: ProjectConfig,
    locks: LockManager,
}

impl LoopControl {
    #[must_use]
    pub fn new(project_dir: impl Into<PathBuf>, config: ProjectConfig) -> Self {
        let locks = LockManager::new().with_poll_interval(config.ralph_loop.poll_interval());
        Self {
            project_dir: project_dir.into(),
            config,
            locks,
        }
    }

    #[must_use]
    pub fn with_lock_manager(mut self, locks: LockManager) -> Self {
        self.locks = locks;
        self
    }

    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.config.ralph_loop.state_file_path(&self.project_dir)
    }

    pub async fn status(&self) -> Result<LoopStatus> {
        let state_path = self.state_path();
        let (loop_state, corruption) = match state::read_state_file(&state_path).await? {
            None => (None, None),
            Some(text) => match state::parse(&text) {
                Ok(Some(s)) => (Some(s), None),
                Ok(None) => (None, Some("state file has no frontmatter".to_string())),
                Err(e) => (None, Some(e.to_string())),
            },
        };

        let features = match &loop_state {
            Some(s) => {
                let path = resolve_in_project(&self.project_dir, &s.feature_list_path);
                let oracle =
                    FeatureOracle::new(self.locks.clone(), self.config.ralph_loop.write_lock_timeout());
                oracle.progress(&path).await.unwrap_or_else(|e| {
                    warn!("Cannot read feature list {}: {}", path.display(), e);
                    None
                })
            }
            None => None,
        };

        Ok(LoopStatus {
            lock_holder: self.locks.read_holder(&state_path).await,
            state_path,
            state: loop_state,
            corruption,
            features,
            hook_registered: self.config.has_stop_hook(HOOK_COMMAND_NEEDLE),
        })
    }

    /// Delete the state file under its lock.
    ///
    /// # Errors
    ///
    /// [`RalphError::LockTimeout`] if a live process holds the state lock
    /// for longer than the configured lock timeout.
    pub async fn cancel(&self) -> Result<CancelOutcome> {
        let state_path = self.state_path();
        if !state_path.exists() {
            return Ok(CancelOutcome::NotActive);
        }

        let opts = AcquireOptions::default().with_timeout(std::time::Duration::from_millis(
            self.config.ralph_loop.lock_timeout_ms,
        ));
        self.locks
            .with_lock(&state_path, &opts, || cancel_locked(&state_path))
            .await
    }

    /// Remove stale locks from `directory` (the state file's directory by
    /// default).
    pub async fn clean_locks(&self, directory: Option<&Path>) -> Result<usize> {
        let directory = match directory {
            Some(dir) => resolve_in_project(&self.project_dir, dir),
            None => self
                .state_path()
                .parent()
                .map_or_else(|| self.project_dir.clone(), Path::to_path_buf),
        };
        debug!("Cleaning stale locks in {}", directory.display());
        self.locks.cleanup_stale(&directory).await
    }

    /// Remove the lock on `resource`.
    ///
    /// Without `force`, only a lock whose holder is gone may be removed.
    ///
    /// # Errors
    ///
    /// [`RalphError::LockOwnership`] if the lock belongs to a live process
    /// and `force` is not set.
    pub async fn release_lock(&self, resource: &Path, force: bool) -> Result<bool> {
        let resource = resolve_in_project(&self.project_dir, resource);
        let Some(holder) = self.locks.read_holder(&resource).await else {
            return Ok(self.locks.release(&resource, ReleaseOptions::force()).await);
        };

        if !force && holder.pid != self.locks.pid() && self.locks.holder_alive(&holder) {
            return Err(RalphError::LockOwnership {
                path: resource,
                holder_pid: holder.pid,
            });
        }
        Ok(self.locks.release(&resource, ReleaseOptions::force()).await)
    }
}

async fn cancel_locked(state_path: &Path) -> Result<CancelOutcome> {
    let Some(text) = state::read_state_file(state_path).await? else {
        return Ok(CancelOutcome::NotActive);
    };
    let iteration = state::parse(&text).ok().flatten().map(|s| s.iteration);
    state::remove_state_file(state_path).await?;
    Ok(CancelOutcome::Cancelled { iteration })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::lock_path_for;
    use crate::testing::{LoopFixture, MockProcessProbe};

    fn control(fixture: &LoopFixture) -> LoopControl {
        LoopControl::new(fixture.path(), ProjectConfig::default())
    }

    #[tokio::test]
    async fn test_status_without_loop() {
        let fixture = LoopFixture::new();
        let status = control(&fixture).status().await.unwrap();
        assert!(!status.is_active());
        assert!(status.corruption.is_none());
        assert!(status.lock_holder.is_none());
        assert!(!status.hook_registered);
    }

    #[tokio::test]
    async fn test_status_reports_state_and_features() {
        let fixture = LoopFixture::new();
        let mut loop_state = LoopState::new("task").with_max_iterations(0);
        loop_state.iteration = 4;
        fixture.write_state(&loop_state);
        fixture.write_features(&[true, false, true]);

        let status = control(&fixture).status().await.unwrap();

        assert!(status.is_active());
        assert_eq!(status.state.unwrap().iteration, 4);
        assert_eq!(status.features, Some(FeatureProgress { total: 3, passing: 2 }));
    }

    #[tokio::test]
    async fn test_status_reports_corruption() {
        let fixture = LoopFixture::new();
        fixture.write_state_text("---\niteration: -1\n---\n\ntask\n");

        let status = control(&fixture).status().await.unwrap();

        assert!(!status.is_active());
        assert!(status.corruption.unwrap().contains("iteration"));
    }

    #[tokio::test]
    async fn test_cancel_active_loop() {
        let fixture = LoopFixture::new();
        let mut loop_state = LoopState::new("task");
        loop_state.iteration = 7;
        fixture.write_state(&loop_state);

        let outcome = control(&fixture).cancel().await.unwrap();

        assert_eq!(outcome, CancelOutcome::Cancelled { iteration: Some(7) });
        assert!(!fixture.state_path().exists());
        assert!(!lock_path_for(&fixture.state_path()).exists());
    }

    #[tokio::test]
    async fn test_cancel_without_loop() {
        let fixture = LoopFixture::new();
        assert_eq!(control(&fixture).cancel().await.unwrap(), CancelOutcome::NotActive);
    }

    #[tokio::test]
    async fn test_cancel_corrupted_state_still_deletes() {
        let fixture = LoopFixture::new();
        fixture.write_state_text("garbage");

        let outcome = control(&fixture).cancel().await.unwrap();

        assert_eq!(outcome, CancelOutcome::Cancelled { iteration: None });
        assert!(!fixture.state_path().exists());
    }

    #[tokio::test]
    async fn test_clean_locks_defaults_to_state_dir() {
        let fixture = LoopFixture::new();
        fixture.write_state(&LoopState::new("task"));
        let lock = lock_path_for(&fixture.state_path());
        std::fs::write(&lock, "not json").unwrap();

        let removed = control(&fixture).clean_locks(None).await.unwrap();

        assert_eq!(removed, 1);
        assert!(!lock.exists());
    }

    #[tokio::test]
    async fn test_release_live_lock_needs_force() {
        let fixture = LoopFixture::new();
        fixture.write_features(&[false]);
        let probe = MockProcessProbe::alive([1001, 2002]);
        let holder = LockManager::new().with_identity(1001, None).with_probe(probe.clone());
        assert!(holder.try_acquire(&fixture.feature_list_path(), None).await.acquired);
        let ctl = control(&fixture)
            .with_lock_manager(LockManager::new().with_identity(2002, None).with_probe(probe));

        let err = ctl
            .release_lock(Path::new("feature_list.json"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, RalphError::LockOwnership { holder_pid: 1001, .. }));
        assert!(lock_path_for(&fixture.feature_list_path()).exists());

        assert!(ctl.release_lock(Path::new("feature_list.json"), true).await.unwrap());
        assert!(!lock_path_for(&fixture.feature_list_path()).exists());
    }

    #[tokio::test]
    async fn test_release_dead_holder_without_force() {
        let fixture = LoopFixture::new();
        fixture.write_features(&[false]);
        let probe = MockProcessProbe::alive([1001, 2002]);
        let holder = LockManager::new().with_identity(1001, None).with_probe(probe.clone());
        assert!(holder.try_acquire(&fixture.feature_list_path(), None).await.acquired);
        probe.kill(1001);
        let ctl = control(&fixture)
            .with_lock_manager(LockManager::new().with_identity(2002, None).with_probe(probe));

        assert!(ctl.release_lock(Path::new("feature_list.json"), false).await.unwrap());
    }
}
