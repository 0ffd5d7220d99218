//! Reading the agent transcript.
//!
//! The host runtime records the conversation as newline-delimited JSON. The
//! stop hook only needs the text of the most recent assistant message and,
//! inside it, the first `<promise>...</promise>` span.

use serde_json::Value;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::Result;

fn promise_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<promise>(.*?)</promise>").expect("static promise pattern"))
}

fn is_assistant(record: &Value) -> bool {
    let is = |v: Option<&Value>| v.and_then(Value::as_str) == Some("assistant");
    is(record.get("role"))
        || is(record.get("type"))
        || is(record.get("message").and_then(|m| m.get("role")))
}

/// Concatenated text blocks of one transcript record.
fn record_text(record: &Value) -> String {
    let content = record
        .get("message")
        .and_then(|m| m.get("content"))
        .or_else(|| record.get("content"));

    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Text of the last assistant-authored record, or `None` if there is none.
///
/// Lines that are not valid JSON are skipped.
///
/// # Example
///
/// ```
/// use ralph_loop::transcript::last_assistant_text;
///
/// let transcript = concat!(
///     r#"{"role":"user","message":{"content":[{"type":"text","text":"go"}]}}"#, "\n",
///     r#"{"role":"assistant","message":{"content":[{"type":"text","text":"done"}]}}"#, "\n",
/// );
/// assert_eq!(last_assistant_text(transcript).as_deref(), Some("done"));
/// ```
#[must_use]
pub fn last_assistant_text(transcript: &str) -> Option<String> {
    transcript
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter(is_assistant)
        .last()
        .map(|record| record_text(&record))
}

/// Read a transcript file and return its last assistant text.
pub async fn read_last_assistant_text(path: &Path) -> Result<Option<String>> {
    let transcript = tokio::fs::read_to_string(path).await?;
    Ok(last_assistant_text(&transcript))
}

/// The first `<promise>` span of `text`, trimmed, with internal whitespace
/// runs collapsed to single spaces.
///
/// # Example
///
/// ```
/// use ralph_loop::transcript::extract_promise;
///
/// assert_eq!(
///     extract_promise("All set.\n<promise>  ALL\n  DONE </promise>").as_deref(),
///     Some("ALL DONE")
/// );
/// assert_eq!(extract_promise("no promise"), None);
/// ```
#[must_use]
pub fn extract_promise(text: &str) -> Option<String> {
    let caps = promise_re().captures(text)?;
    let inner = caps.get(1)?.as_str();
    Some(inner.split_whitespace().collect::<Vec<_>>().join(" "))
}
