//! Ralph loop - stop-hook continuation loop for Claude Code
//!
//! Keeps an agent working on the same task, turn after turn, until a
//! stopping condition holds. There is no daemon: the host runtime invokes
//! the stop hook as a fresh process whenever the agent tries to end its
//! turn, and the hook re-derives everything from files on disk.
//!
//! # Architecture
//!
//! - [`lock`] - Advisory PID-based file locks (`<resource>.lock`)
//! - [`state`] - Loop state and its frontmatter-over-Markdown encoding
//! - [`setup`] - Creating the initial loop state
//! - [`hooks`] - The stop-hook state machine
//! - [`features`] - Feature-list completion oracle
//! - [`transcript`] - Last assistant message and `<promise>` extraction
//! - [`control`] - Status, cancel and lock maintenance
//! - [`config`] - Settings from `.claude/settings.json`
//! - [`error`] - Custom error types and handling
//! - [`testing`] - Testing infrastructure (mocks, fixtures)
//!
//! # Example
//!
//! ```rust,ignore
//! use ralph_loop::config::ProjectConfig;
//! use ralph_loop::hooks::StopHook;
//!
//! let config = ProjectConfig::load_or_default(".".as_ref());
//! let transition = StopHook::new(".", &config).run(&stdin).await;
//! if let Some(response) = transition.response() {
//!     println!("{}", serde_json::to_string(response)?);
//! }
//! ```

pub mod config;
pub mod control;
pub mod error;
pub mod features;
pub mod hooks;
pub mod lock;
pub mod setup;
pub mod state;
pub mod testing;
pub mod transcript;

// Re-export commonly used types
pub use error::{RalphError, Result};

pub use config::{LoopSettings, ProjectConfig};
pub use hooks::{HaltReason, HookInput, HookResponse, StopHook, Transition};
pub use lock::{LockInfo, LockManager, LockResult};
pub use setup::{SetupController, SetupOptions, SetupReport};
pub use state::LoopState;
