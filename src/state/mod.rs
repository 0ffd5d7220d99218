//! Loop state and its on-disk representation.
//!
//! The state file is the only memory the loop has. It is Markdown with a
//! small frontmatter block:
//!
//! ```text
//! ---
//! active: true
//! iteration: 3
//! max_iterations: 10
//! completion_promise: "ALL TESTS PASS"
//! feature_list_path: "feature_list.json"
//! started_at: "2026-01-05T09:30:00Z"
//! ---
//!
//! Fix the flaky integration tests.
//! ```
//!
//! Nothing keeps a copy of this state in memory between invocations; every
//! reader goes back to disk. See [`codec`] for the exact grammar.

pub mod codec;

use chrono::{SecondsFormat, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::config::DEFAULT_FEATURE_LIST;
use crate::error::Result;

pub use codec::{parse, prompt_body, serialize, set_iteration};

/// Persistent state of one continuation loop.
///
/// # Example
///
/// ```
/// use ralph_loop::state::LoopState;
///
/// let state = LoopState::new("fix bug").with_max_iterations(3);
/// assert_eq!(state.iteration, 1);
/// assert!(!state.max_iterations_reached());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopState {
    pub active: bool,
    /// 1-based iteration currently in progress.
    pub iteration: u32,
    /// Iteration cap; 0 means run until the feature list passes.
    pub max_iterations: u32,
    pub completion_promise: Option<String>,
    pub feature_list_path: String,
    pub started_at: String,
    /// Task prompt re-injected on every iteration. Stored trimmed.
    pub prompt: String,
}

impl LoopState {
    /// Fresh, active loop at iteration 1.
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            active: true,
            iteration: 1,
            max_iterations: 0,
            completion_promise: None,
            feature_list_path: DEFAULT_FEATURE_LIST.to_string(),
            started_at: now_timestamp(),
            prompt: prompt.into().trim().to_string(),
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
    pub fn with_feature_list_path(mut self, path: impl Into<String>) -> Self {
        self.feature_list_path = path.into();
        self
    }

    /// No iteration cap: the loop ends when every feature passes.
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.max_iterations == 0
    }

    /// The current iteration is the last one allowed.
    #[must_use]
    pub fn max_iterations_reached(&self) -> bool {
        self.max_iterations > 0 && self.iteration >= self.max_iterations
    }
}

/// Current time in the format written to `started_at`.
#[must_use]
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Temporary file suffix for atomic writes.
const TMP_SUFFIX: &str = ".tmp";

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}{TMP_SUFFIX}", std::process::id()));
    PathBuf::from(name)
}

/// Read the raw state document, or `None` if there is no state file.
pub async fn read_state_file(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Replace the state document atomically, creating parent directories.
pub async fn write_state_file(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }

    let tmp_path = tmp_path_for(path);
    let mut tmp_file = fs::File::create(&tmp_path).await?;
    tmp_file.write_all(text.as_bytes()).await?;
    tmp_file.sync_all().await?;
    drop(tmp_file);

    if let Err(e) = fs::rename(&tmp_path, path).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }
    Ok(())
}

/// Delete the state file. Returns `false` if it was already gone.
pub async fn remove_state_file(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
