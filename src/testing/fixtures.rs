//! Test fixtures for creating reproducible test environments.
//!
//! Provides a throwaway project directory with helpers for the files the
//! stop hook reads: the state file, the transcript, and the feature list.

use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::config::{DEFAULT_FEATURE_LIST, DEFAULT_STATE_FILE};
use crate::state::{self, LoopState};

/// A temporary project directory.
///
/// Automatically cleans up when dropped.
///
/// # Example
///
/// ```rust,ignore
/// let fixture = LoopFixture::new();
/// fixture.write_state(&LoopState::new("fix bug").with_max_iterations(3));
/// let transcript = fixture.write_transcript(&["working on it"]);
/// let input = fixture.hook_input(&transcript);
/// ```
pub struct LoopFixture {
    temp_dir: TempDir,
}

impl LoopFixture {
    /// # Panics
    ///
    /// Panics if temporary directory creation fails.
    #[must_use]
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.path().join(DEFAULT_STATE_FILE)
    }

    #[must_use]
    pub fn feature_list_path(&self) -> PathBuf {
        self.path().join(DEFAULT_FEATURE_LIST)
    }

    pub fn write_state(&self, state: &LoopState) {
        self.write_state_text(&state::serialize(state));
    }

    pub fn write_state_text(&self, text: &str) {
        let path = self.state_path();
        std::fs::create_dir_all(path.parent().expect("state path has parent"))
            .expect("Failed to create state directory");
        std::fs::write(path, text).expect("Failed to write state file");
    }

    #[must_use]
    pub fn state_text(&self) -> Option<String> {
        std::fs::read_to_string(self.state_path()).ok()
    }

    #[must_use]
    pub fn state(&self) -> Option<LoopState> {
        self.state_text()
            .and_then(|text| state::parse(&text).expect("state should parse"))
    }

    /// Write a feature list with one entry per flag.
    pub fn write_features(&self, passes: &[bool]) {
        let records: Vec<serde_json::Value> = passes
            .iter()
            .enumerate()
            .map(|(i, p)| serde_json::json!({"description": format!("feature {i}"), "passes": p}))
            .collect();
        self.write_features_raw(&serde_json::to_string_pretty(&records).expect("serialize features"));
    }

    pub fn write_features_raw(&self, text: &str) {
        std::fs::write(self.feature_list_path(), text).expect("Failed to write feature list");
    }

    /// Write a transcript alternating user prompts and the given assistant
    /// replies. Returns its path.
    pub fn write_transcript(&self, assistant_texts: &[&str]) -> PathBuf {
        let lines: Vec<String> = assistant_texts
            .iter()
            .flat_map(|text| [user_line("continue"), assistant_line(text)])
            .collect();
        self.write_transcript_lines(&lines)
    }

    pub fn write_transcript_lines(&self, lines: &[String]) -> PathBuf {
        let path = self.path().join("transcript.jsonl");
        std::fs::write(&path, lines.join("\n") + "\n").expect("Failed to write transcript");
        path
    }

    /// Hook payload as the host runtime would send it on stdin.
    #[must_use]
    pub fn hook_input(&self, transcript: &Path) -> String {
        serde_json::json!({
            "session_id": "test-session",
            "transcript_path": transcript,
            "hook_event_name": "Stop",
            "stop_hook_active": false,
        })
        .to_string()
    }
}

impl Default for LoopFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Transcript record for an assistant message.
#[must_use]
pub fn assistant_line(text: &str) -> String {
    serde_json::json!({
        "type": "assistant",
        "message": {"role": "assistant", "content": [{"type": "text", "text": text}]}
    })
    .to_string()
}

/// Transcript record for a user message.
#[must_use]
pub fn user_line(text: &str) -> String {
    serde_json::json!({
        "type": "user",
        "message": {"role": "user", "content": [{"type": "text", "text": text}]}
    })
    .to_string()
}
