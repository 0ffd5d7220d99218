//! Setup: create the initial loop state.
//!
//! Setup runs before any stop hook exists for the loop, so the state file is
//! normally uncontended. It still goes through the state file's lock and
//! falls back to a plain write if another process is sitting on it.

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::{resolve_in_project, LoopSettings, ProjectConfig};
use crate::error::{RalphError, Result};
use crate::lock::{AcquireOptions, LockManager};
use crate::state::{self, LoopState};

/// User-supplied options for a new loop.
#[derive(Debug, Clone, Default)]
pub struct SetupOptions {
    /// Task prompt. Empty means "use the default prompt".
    pub prompt: String,
    /// 0 = run until the feature list passes.
    pub max_iterations: u32,
    pub completion_promise: Option<String>,
    /// Overrides the configured feature list path.
    pub feature_list_path: Option<String>,
}

impl SetupOptions {
    /// Options with the prompt words joined by single spaces.
    #[must_use]
    pub fn from_words<S: AsRef<str>>(words: &[S]) -> Self {
        Self {
            prompt: words
                .iter()
                .map(AsRef::as_ref)
                .collect::<Vec<_>>()
                .join(" "),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    #[must_use]
    pub fn with_completion_promise(mut self, promise: Option<String>) -> Self {
        self.completion_promise = promise;
        self
    }

    #[must_use]
    pub fn with_feature_list_path(mut self, path: Option<String>) -> Self {
        self.feature_list_path = path;
        self
    }
}

/// What setup did.
#[derive(Debug, Clone)]
pub struct SetupReport {
    pub state: LoopState,
    pub state_path: PathBuf,
    pub used_default_prompt: bool,
    /// An earlier loop's state file was overwritten.
    pub replaced_existing: bool,
}

/// Normalize a completion promise so it survives the state file encoding.
///
/// Blank promises mean "no promise". Promises containing a double quote or
/// a line break cannot be stored, and `null` would read back as "no
/// promise".
pub fn validate_promise(promise: Option<&str>) -> Result<Option<String>> {
    let Some(promise) = promise.map(str::trim).filter(|p| !p.is_empty()) else {
        return Ok(None);
    };

    let invalid = |reason: &str| RalphError::InvalidPromise {
        reason: reason.to_string(),
    };
    if promise.contains('"') {
        return Err(invalid("must not contain double quotes"));
    }
    if promise.contains(['\n', '\r']) {
        return Err(invalid("must be a single line"));
    }
    if promise == "null" {
        return Err(invalid("\"null\" is reserved"));
    }

    Ok(Some(promise.split_whitespace().collect::<Vec<_>>().join(" ")))
}

/// How to get past a missing feature list.
#[must_use]
pub fn missing_feature_list_help(path: &Path) -> String {
    format!(
        "The default prompt works through a feature list, but {} does not exist.\n\
         Either:\n  \
         1. create it (a JSON array of {{\"description\": ..., \"passes\": false}} entries),\n  \
         2. point at an existing list with --feature-list <PATH>, or\n  \
         3. pass your own prompt: ralph-loop setup \"<task>\"",
        path.display()
    )
}

/// Creates loop state files.
#[derive(Debug, Clone)]
pub struct SetupController {
    project_dir: PathBuf,
    settings: LoopSettings,
    locks: LockManager,
}

impl SetupController {
    #[must_use]
    pub fn new(project_dir: impl Into<PathBuf>, config: &ProjectConfig) -> Self {
        let settings = config.ralph_loop.clone();
        let locks = LockManager::new().with_poll_interval(settings.poll_interval());
        Self {
            project_dir: project_dir.into(),
            settings,
            locks,
        }
    }

    #[must_use]
    pub fn with_lock_manager(mut self, locks: LockManager) -> Self {
        self.locks = locks;
        self
    }

    /// Write a fresh loop state.
    ///
    /// # Errors
    ///
    /// - [`RalphError::InvalidPromise`] if the promise cannot be stored.
    /// - [`RalphError::MissingFeatureList`] if `default_prompt` was needed
    ///   and the feature list does not exist. Nothing is written.
    /// - I/O errors from the final write.
    pub async fn run(&self, opts: SetupOptions, default_prompt: &str) -> Result<SetupReport> {
        let promise = validate_promise(opts.completion_promise.as_deref())?;
        let feature_list = opts
            .feature_list_path
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| self.settings.feature_list.clone());

        let used_default_prompt = opts.prompt.trim().is_empty();
        let prompt = if used_default_prompt {
            let list_path = resolve_in_project(&self.project_dir, &feature_list);
            if !list_path.exists() {
                return Err(RalphError::MissingFeatureList { path: list_path });
            }
            default_prompt.to_string()
        } else {
            opts.prompt
        };

        let loop_state = LoopState::new(prompt)
            .with_max_iterations(opts.max_iterations)
            .with_completion_promise(promise)
            .with_feature_list_path(feature_list);

        let state_path = self.settings.state_file_path(&self.project_dir);
        let replaced_existing = state_path.exists();
        if replaced_existing {
            info!("Replacing existing loop at {}", state_path.display());
        }

        self.write(&state_path, &state::serialize(&loop_state)).await?;
        debug!(
            max_iterations = loop_state.max_iterations,
            promise = ?loop_state.completion_promise,
            "Loop state written to {}",
            state_path.display()
        );

        Ok(SetupReport {
            state: loop_state,
            state_path,
            used_default_prompt,
            replaced_existing,
        })
    }

    async fn write(&self, state_path: &Path, text: &str) -> Result<()> {
        if let Some(parent) = state_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let opts = AcquireOptions::default().with_timeout(self.settings.write_lock_timeout());
        match self
            .locks
            .with_lock(state_path, &opts, || state::write_state_file(state_path, text))
            .await
        {
            Err(RalphError::LockTimeout { holder_pid, .. }) => {
                warn!(?holder_pid, "State file is locked, writing without lock");
                state::write_state_file(state_path, text).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::lock_path_for;
    use crate::testing::{LoopFixture, MockProcessProbe};
    use std::time::Duration;

    const DEFAULT_PROMPT: &str = "Work through feature_list.json.";

    fn controller(fixture: &LoopFixture) -> SetupController {
        SetupController::new(fixture.path(), &ProjectConfig::default())
    }

    #[tokio::test]
    async fn test_setup_writes_initial_state() {
        let fixture = LoopFixture::new();
        let opts = SetupOptions::from_words(&["fix", "bug"]).with_max_iterations(3);

        let report = controller(&fixture).run(opts, DEFAULT_PROMPT).await.unwrap();

        assert!(!report.used_default_prompt);
        assert!(!report.replaced_existing);
        assert_eq!(report.state_path, fixture.state_path());
        let loop_state = fixture.state().unwrap();
        assert!(loop_state.active);
        assert_eq!(loop_state.iteration, 1);
        assert_eq!(loop_state.max_iterations, 3);
        assert_eq!(loop_state.completion_promise, None);
        assert_eq!(loop_state.prompt, "fix bug");
        assert!(!lock_path_for(&fixture.state_path()).exists());
    }

    #[tokio::test]
    async fn test_setup_records_promise_and_feature_list() {
        let fixture = LoopFixture::new();
        let opts = SetupOptions::from_words(&["ship it"])
            .with_completion_promise(Some("  ALL   DONE ".into()))
            .with_feature_list_path(Some("docs/features.json".into()));

        controller(&fixture).run(opts, DEFAULT_PROMPT).await.unwrap();

        let loop_state = fixture.state().unwrap();
        assert_eq!(loop_state.completion_promise.as_deref(), Some("ALL DONE"));
        assert_eq!(loop_state.feature_list_path, "docs/features.json");
    }

    #[tokio::test]
    async fn test_default_prompt_requires_feature_list() {
        let fixture = LoopFixture::new();

        let err = controller(&fixture)
            .run(SetupOptions::default(), DEFAULT_PROMPT)
            .await
            .unwrap_err();

        assert!(matches!(err, RalphError::MissingFeatureList { ref path } if *path == fixture.feature_list_path()));
        assert!(!fixture.path().join(".claude").exists(), "no side effects");
    }

    #[tokio::test]
    async fn test_default_prompt_with_feature_list() {
        let fixture = LoopFixture::new();
        fixture.write_features(&[false]);

        let report = controller(&fixture)
            .run(SetupOptions::from_words(&["   "]), DEFAULT_PROMPT)
            .await
            .unwrap();

        assert!(report.used_default_prompt);
        assert_eq!(fixture.state().unwrap().prompt, DEFAULT_PROMPT);
    }

    #[tokio::test]
    async fn test_invalid_promise_writes_nothing() {
        let fixture = LoopFixture::new();
        let opts = SetupOptions::from_words(&["task"])
            .with_completion_promise(Some("say \"done\"".into()));

        let err = controller(&fixture).run(opts, DEFAULT_PROMPT).await.unwrap_err();

        assert!(matches!(err, RalphError::InvalidPromise { .. }));
        assert!(!fixture.state_path().exists());
    }

    #[tokio::test]
    async fn test_setup_replaces_existing_loop() {
        let fixture = LoopFixture::new();
        fixture.write_state(&LoopState::new("old task"));

        let report = controller(&fixture)
            .run(SetupOptions::from_words(&["new task"]), DEFAULT_PROMPT)
            .await
            .unwrap();

        assert!(report.replaced_existing);
        assert_eq!(fixture.state().unwrap().prompt, "new task");
    }

    #[tokio::test]
    async fn test_setup_falls_back_when_state_locked() {
        let fixture = LoopFixture::new();
        std::fs::create_dir_all(fixture.state_path().parent().unwrap()).unwrap();
        let probe = MockProcessProbe::alive([1001, 1002]);
        let holder = LockManager::new().with_identity(1001, None).with_probe(probe.clone());
        assert!(holder.try_acquire(&fixture.state_path(), None).await.acquired);

        let mut config = ProjectConfig::default();
        config.ralph_loop.write_lock_timeout_ms = 30;
        let setup = SetupController::new(fixture.path(), &config).with_lock_manager(
            LockManager::new()
                .with_identity(1002, None)
                .with_probe(probe)
                .with_poll_interval(Duration::from_millis(5)),
        );

        setup
            .run(SetupOptions::from_words(&["task"]), DEFAULT_PROMPT)
            .await
            .unwrap();

        assert_eq!(fixture.state().unwrap().prompt, "task");
        assert!(lock_path_for(&fixture.state_path()).exists());
    }

    #[test]
    fn test_validate_promise() {
        assert_eq!(validate_promise(None).unwrap(), None);
        assert_eq!(validate_promise(Some("  ")).unwrap(), None);
        assert_eq!(validate_promise(Some("DONE")).unwrap().as_deref(), Some("DONE"));
        assert!(validate_promise(Some("two\nlines")).is_err());
        assert!(validate_promise(Some("null")).is_err());
    }

    #[test]
    fn test_missing_feature_list_help_names_path() {
        let help = missing_feature_list_help(Path::new("/p/feature_list.json"));
        assert!(help.contains("/p/feature_list.json"));
        assert!(help.contains("--feature-list"));
    }
}
