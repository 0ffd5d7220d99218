//! Stop hook: the continuation loop's state machine.
//!
//! The host runtime starts a fresh process every time the agent tries to
//! end its turn. That process runs [`StopHook::run`] once and exits, so
//! everything is re-derived from disk on every call:
//!
//! ```text
//!   stdin JSON ──┐
//!   state file ──┼──> StopHook::run ──> Transition
//!   transcript ──┤                        ├─ NoLoop       (nothing printed)
//!   features  ───┘                        ├─ Halted(..)   (state deleted)
//!                                         └─ Continued    (iteration+1, JSON printed)
//! ```
//!
//! Anything uncertain ends the loop: a state file that cannot be trusted is
//! deleted and the agent is allowed to stop. Only a fully validated state
//! produces a `Continued` transition.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::{resolve_in_project, LoopSettings, ProjectConfig};
use crate::error::{RalphError, Result};
use crate::features::FeatureOracle;
use crate::lock::{AcquireOptions, LockManager};
use crate::state::{self, LoopState};
use crate::transcript;

/// Payload the host runtime writes to the hook's stdin.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HookInput {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub transcript_path: Option<PathBuf>,
}

impl HookInput {
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| RalphError::host_input(e.to_string()))
    }
}

/// Instruction printed to stdout to keep the agent working.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookResponse {
    pub decision: String,
    /// Prompt re-injected as the agent's next task.
    pub reason: String,
    pub system_message: String,
}

impl HookResponse {
    #[must_use]
    pub fn block(prompt: impl Into<String>, system_message: impl Into<String>) -> Self {
        Self {
            decision: "block".to_string(),
            reason: prompt.into(),
            system_message: system_message.into(),
        }
    }
}

/// Why a loop was ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    MaxIterations { iteration: u32, max: u32 },
    FeaturesComplete { total: usize },
    PromiseFulfilled { promise: String },
    Corrupted { reason: String },
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxIterations { iteration, max } => {
                write!(f, "max iterations reached ({iteration}/{max})")
            }
            Self::FeaturesComplete { total } => write!(f, "all {total} features passing"),
            Self::PromiseFulfilled { promise } => {
                write!(f, "completion promise fulfilled: <promise>{promise}</promise>")
            }
            Self::Corrupted { reason } => write!(f, "state not trustworthy: {reason}"),
        }
    }
}

/// Result of one stop-hook invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// No active loop; the agent may stop.
    NoLoop,
    /// The state file was deleted; the agent may stop.
    Halted(HaltReason),
    /// The iteration was advanced; the agent must keep going.
    Continued {
        iteration: u32,
        response: HookResponse,
    },
}

impl Transition {
    /// JSON to print on stdout, if any.
    #[must_use]
    pub fn response(&self) -> Option<&HookResponse> {
        match self {
            Self::Continued { response, .. } => Some(response),
            _ => None,
        }
    }
}

/// Status line shown to the user alongside the re-injected prompt.
#[must_use]
pub fn status_message(state: &LoopState, iteration: u32) -> String {
    let head = if state.max_iterations > 0 {
        format!("Ralph iteration {iteration} of {}", state.max_iterations)
    } else {
        format!("Ralph iteration {iteration}")
    };

    match &state.completion_promise {
        Some(promise) => format!(
            "{head} | To stop: output <promise>{promise}</promise> (ONLY when the statement is TRUE - do not lie to exit!)"
        ),
        None if state.is_unlimited() => format!(
            "{head} | No completion promise set - loop runs until every feature in {} passes",
            state.feature_list_path
        ),
        None => format!("{head} | No completion promise set"),
    }
}

fn corrupted(reason: impl Into<String>) -> HaltReason {
    HaltReason::Corrupted {
        reason: reason.into(),
    }
}

/// Outcome of advancing the iteration recorded on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Advance {
    /// The state file now records this iteration.
    Recorded(u32),
    /// Another hook reached the limit first.
    LimitReached { iteration: u32, max: u32 },
    /// The state file disappeared in the meantime.
    Gone,
}

/// Increment the iteration stored in the state file at `path`.
///
/// The count comes from the file as it is now, not from the hook's earlier
/// read, so two hooks serialized by the lock never record the same value.
async fn bump_iteration(path: &Path) -> Result<Advance> {
    let Some(text) = state::read_state_file(path).await? else {
        return Ok(Advance::Gone);
    };
    let current = state::parse(&text)?
        .ok_or_else(|| RalphError::corrupted("frontmatter vanished before update"))?;
    if current.max_iterations_reached() {
        return Ok(Advance::LimitReached {
            iteration: current.iteration,
            max: current.max_iterations,
        });
    }

    let next = current.iteration.saturating_add(1);
    let patched = state::set_iteration(&text, next)
        .ok_or_else(|| RalphError::corrupted("frontmatter vanished before update"))?;
    state::write_state_file(path, &patched).await?;
    Ok(Advance::Recorded(next))
}

/// The continuation controller for one project.
#[derive(Debug, Clone)]
pub struct StopHook {
    project_dir: PathBuf,
    settings: LoopSettings,
    locks: LockManager,
}

impl StopHook {
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

    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.settings.state_file_path(&self.project_dir)
    }

    /// Handle one stop event. Never fails: every error path resolves to
    /// [`Transition::NoLoop`] or [`Transition::Halted`].
    pub async fn run(&self, raw_input: &str) -> Transition {
        let input = match HookInput::parse(raw_input) {
            Ok(input) => input,
            Err(e) => {
                debug!("{}; treating as no active loop", e);
                return Transition::NoLoop;
            }
        };

        let transition = self.evaluate(&input).await;
        match &transition {
            Transition::NoLoop => debug!("No active loop"),
            Transition::Halted(reason) => info!("Loop ended: {}", reason),
            Transition::Continued { iteration, .. } => info!(iteration, "Loop continues"),
        }
        transition
    }

    async fn evaluate(&self, input: &HookInput) -> Transition {
        let state_path = self.state_path();

        let text = match state::read_state_file(&state_path).await {
            Ok(Some(text)) => text,
            Ok(None) => return Transition::NoLoop,
            Err(e) => return self.halt(corrupted(format!("unreadable state file: {e}"))).await,
        };

        let loop_state = match state::parse(&text) {
            Ok(Some(loop_state)) => loop_state,
            Ok(None) => return self.halt(corrupted("state file has no frontmatter")).await,
            Err(e) => return self.halt(corrupted(e.to_string())).await,
        };

        if loop_state.max_iterations_reached() {
            return self
                .halt(HaltReason::MaxIterations {
                    iteration: loop_state.iteration,
                    max: loop_state.max_iterations,
                })
                .await;
        }

        if loop_state.is_unlimited() {
            if let Some(total) = self.completed_features(&loop_state).await {
                return self.halt(HaltReason::FeaturesComplete { total }).await;
            }
        }

        let Some(transcript_path) = input.transcript_path.as_deref() else {
            return self.halt(corrupted("hook input has no transcript_path")).await;
        };
        if !transcript_path.exists() {
            return self
                .halt(corrupted(format!(
                    "transcript not found: {}",
                    transcript_path.display()
                )))
                .await;
        }

        let last_text = match transcript::read_last_assistant_text(transcript_path).await {
            Ok(Some(text)) if !text.trim().is_empty() => text,
            Ok(Some(_)) => return self.halt(corrupted("last assistant message has no text")).await,
            Ok(None) => return self.halt(corrupted("transcript has no assistant message")).await,
            Err(e) => return self.halt(corrupted(format!("unreadable transcript: {e}"))).await,
        };

        if let Some(promise) = &loop_state.completion_promise {
            if transcript::extract_promise(&last_text).as_deref() == Some(promise.as_str()) {
                return self
                    .halt(HaltReason::PromiseFulfilled {
                        promise: promise.clone(),
                    })
                    .await;
            }
        }

        let prompt = state::prompt_body(&text).unwrap_or_default();
        if prompt.is_empty() {
            return self.halt(corrupted("state file has an empty prompt")).await;
        }

        match self.advance(&state_path, input.session_id.clone()).await {
            Ok(Advance::Recorded(iteration)) => Transition::Continued {
                iteration,
                response: HookResponse::block(prompt, status_message(&loop_state, iteration)),
            },
            Ok(Advance::LimitReached { iteration, max }) => {
                self.halt(HaltReason::MaxIterations { iteration, max }).await
            }
            Ok(Advance::Gone) => {
                debug!("State file removed while advancing; loop already ended");
                Transition::NoLoop
            }
            Err(e) => {
                self.halt(corrupted(format!("could not advance iteration: {e}")))
                    .await
            }
        }
    }

    /// `Some(total)` when the loop's feature list exists and fully passes.
    async fn completed_features(&self, loop_state: &LoopState) -> Option<usize> {
        let path = resolve_in_project(&self.project_dir, &loop_state.feature_list_path);
        let oracle = FeatureOracle::new(self.locks.clone(), self.settings.write_lock_timeout());

        match oracle.progress(&path).await {
            Ok(Some(progress)) if progress.is_complete() => Some(progress.total),
            Ok(Some(progress)) if progress.is_empty() => {
                warn!(
                    "Feature list {} is empty; not treating it as complete",
                    path.display()
                );
                None
            }
            Ok(Some(progress)) => {
                debug!("{} ({} remaining)", progress, progress.remaining());
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Ignoring unreadable feature list {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Bump the recorded iteration, under the state file's lock when possible.
    async fn advance(&self, state_path: &Path, session_id: Option<String>) -> Result<Advance> {
        let opts = AcquireOptions::default()
            .with_timeout(self.settings.write_lock_timeout())
            .with_session_id(session_id);

        match self
            .locks
            .with_lock(state_path, &opts, || bump_iteration(state_path))
            .await
        {
            Err(RalphError::LockTimeout { holder_pid, .. }) => {
                warn!(?holder_pid, "State file is locked, writing without lock");
                bump_iteration(state_path).await
            }
            other => other,
        }
    }

    async fn halt(&self, reason: HaltReason) -> Transition {
        let state_path = self.state_path();
        if let Err(e) = state::remove_state_file(&state_path).await {
            warn!("Failed to delete {}: {}", state_path.display(), e);
        }
        Transition::Halted(reason)
    }
}
