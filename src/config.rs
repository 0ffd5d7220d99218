//! Configuration management for the continuation loop.
//!
//! Settings live in the project's `.claude/settings.json`, the same file the
//! host runtime reads its hook registrations from. Everything is optional;
//! a missing file or section yields the defaults below.
//!
//! # Example settings.json
//!
//! ```json
//! {
//!   "hooks": {
//!     "Stop": [
//!       { "matcher": "", "hooks": [{ "type": "command", "command": "ralph-loop hook stop" }] }
//!     ]
//!   },
//!   "ralphLoop": {
//!     "featureList": "docs/feature_list.json",
//!     "writeLockTimeoutMs": 2000
//!   }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::error::{RalphError, Result};

/// Default state file location, relative to the project directory.
pub const DEFAULT_STATE_FILE: &str = ".claude/ralph-loop.local.md";

/// Default feature list location, relative to the project directory.
pub const DEFAULT_FEATURE_LIST: &str = "feature_list.json";

/// Default timeout for general lock acquisition.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 30_000;

/// Default timeout for the state/feature-list locks taken by setup and the hook.
pub const DEFAULT_WRITE_LOCK_TIMEOUT_MS: u64 = 5_000;

/// Default polling interval while waiting on a held lock.
pub const DEFAULT_LOCK_POLL_MS: u64 = 100;

/// Project configuration loaded from .claude/settings.json
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub hooks: HooksConfig,

    /// Loop settings.
    #[serde(default, rename = "ralphLoop")]
    pub ralph_loop: LoopSettings,
}

/// Tunables for the loop's files and locks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopSettings {
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    #[serde(default = "default_feature_list")]
    pub feature_list: String,

    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    #[serde(default = "default_write_lock_timeout_ms")]
    pub write_lock_timeout_ms: u64,

    #[serde(default = "default_lock_poll_ms")]
    pub lock_poll_ms: u64,
}

fn default_state_file() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_FILE)
}

fn default_feature_list() -> String {
    DEFAULT_FEATURE_LIST.to_string()
}

fn default_lock_timeout_ms() -> u64 {
    DEFAULT_LOCK_TIMEOUT_MS
}

fn default_write_lock_timeout_ms() -> u64 {
    DEFAULT_WRITE_LOCK_TIMEOUT_MS
}

fn default_lock_poll_ms() -> u64 {
    DEFAULT_LOCK_POLL_MS
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            feature_list: default_feature_list(),
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            write_lock_timeout_ms: DEFAULT_WRITE_LOCK_TIMEOUT_MS,
            lock_poll_ms: DEFAULT_LOCK_POLL_MS,
        }
    }
}

impl LoopSettings {
    /// Location of the loop state file for a project.
    #[must_use]
    pub fn state_file_path(&self, project_dir: &Path) -> PathBuf {
        resolve_in_project(project_dir, &self.state_file)
    }

    /// Timeout used for locked state writes and feature-list reads.
    #[must_use]
    pub fn write_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.write_lock_timeout_ms)
    }

    /// Interval between acquisition attempts.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HooksConfig {
    #[serde(rename = "Stop", default)]
    pub stop: Vec<HookMatcher>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookMatcher {
    #[serde(default)]
    pub matcher: String,
    pub hooks: Vec<HookCommand>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookCommand {
    #[serde(rename = "type")]
    pub hook_type: String,
    pub command: String,
}

impl ProjectConfig {
    /// Load configuration from a project directory
    pub fn load(project_dir: &Path) -> Result<Self> {
        let settings_path = Self::settings_path(project_dir);

        if !settings_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&settings_path)?;
        serde_json::from_str(&content)
            .map_err(|e| RalphError::config_with_path(e.to_string(), settings_path))
    }

    /// Load configuration, falling back to defaults when the settings file
    /// is unreadable. The stop hook must never fail on a bad settings file.
    #[must_use]
    pub fn load_or_default(project_dir: &Path) -> Self {
        match Self::load(project_dir) {
            Ok(config) => config,
            Err(e) => {
                warn!("Ignoring unreadable settings: {}", e);
                Self::default()
            }
        }
    }

    /// Get the settings.json path for a project
    pub fn settings_path(project_dir: &Path) -> PathBuf {
        project_dir.join(".claude/settings.json")
    }

    /// Check whether a Stop hook command containing `needle` is registered.
    #[must_use]
    pub fn has_stop_hook(&self, needle: &str) -> bool {
        self.hooks
            .stop
            .iter()
            .flat_map(|m| m.hooks.iter())
            .any(|h| h.hook_type == "command" && h.command.contains(needle))
    }
}

/// Resolve a possibly-relative path against the project directory.
#[must_use]
pub fn resolve_in_project(project_dir: &Path, path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        project_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_loop_settings_defaults() {
        let settings = LoopSettings::default();
        assert_eq!(settings.state_file, PathBuf::from(DEFAULT_STATE_FILE));
        assert_eq!(settings.feature_list, DEFAULT_FEATURE_LIST);
        assert_eq!(settings.write_lock_timeout(), Duration::from_secs(5));
        assert_eq!(settings.poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_project_config_load_missing() {
        let temp = TempDir::new().unwrap();
        let config = ProjectConfig::load(temp.path()).unwrap();
        assert_eq!(config.ralph_loop, LoopSettings::default());
        assert!(config.hooks.stop.is_empty());
    }

    #[test]
    fn test_project_config_load_partial_section() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join(".claude")).unwrap();
        std::fs::write(
            temp.path().join(".claude/settings.json"),
            r#"{"permissions": {"allow": []}, "ralphLoop": {"featureList": "docs/features.json", "lockPollMs": 25}}"#,
        )
        .unwrap();

        let config = ProjectConfig::load(temp.path()).unwrap();
        assert_eq!(config.ralph_loop.feature_list, "docs/features.json");
        assert_eq!(config.ralph_loop.lock_poll_ms, 25);
        assert_eq!(
            config.ralph_loop.write_lock_timeout_ms,
            DEFAULT_WRITE_LOCK_TIMEOUT_MS
        );
    }

    #[test]
    fn test_project_config_invalid_json_is_config_error() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join(".claude")).unwrap();
        std::fs::write(temp.path().join(".claude/settings.json"), "{ nope").unwrap();

        let err = ProjectConfig::load(temp.path()).unwrap_err();
        assert!(matches!(err, RalphError::Config { path: Some(_), .. }));

        let config = ProjectConfig::load_or_default(temp.path());
        assert_eq!(config.ralph_loop, LoopSettings::default());
    }

    #[test]
    fn test_has_stop_hook() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join(".claude")).unwrap();
        std::fs::write(
            temp.path().join(".claude/settings.json"),
            r#"{"hooks": {"Stop": [{"matcher": "", "hooks": [{"type": "command", "command": "ralph-loop hook stop"}]}]}}"#,
        )
        .unwrap();

        let config = ProjectConfig::load(temp.path()).unwrap();
        assert!(config.has_stop_hook("ralph-loop"));
        assert!(!config.has_stop_hook("other-tool"));
    }

    #[test]
    fn test_state_file_path_resolves_in_project() {
        let mut settings = LoopSettings::default();
        assert_eq!(
            settings.state_file_path(Path::new("/work/project")),
            PathBuf::from("/work/project/.claude/ralph-loop.local.md")
        );

        settings.state_file = PathBuf::from("/var/run/loop.md");
        assert_eq!(
            settings.state_file_path(Path::new("/work/project")),
            PathBuf::from("/var/run/loop.md")
        );
    }

    #[test]
    fn test_resolve_in_project_keeps_absolute() {
        let project = Path::new("/work/project");
        assert_eq!(
            resolve_in_project(project, "/tmp/features.json"),
            PathBuf::from("/tmp/features.json")
        );
        assert_eq!(
            resolve_in_project(project, "feature_list.json"),
            PathBuf::from("/work/project/feature_list.json")
        );
    }
}
