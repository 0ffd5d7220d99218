//! Text encoding of [`LoopState`].
//!
//! Grammar (after CRLF is normalized to LF):
//!
//! ```text
//! ---\n <frontmatter lines> \n---\n <prompt body>
//! ```
//!
//! Both delimiters are required. Frontmatter lines have the form
//! `key: value`; surrounding quotes on the value are stripped and unknown
//! keys are ignored. The body is everything after the closing delimiter,
//! including any further `---` lines, trimmed at its outer edges only.
//!
//! Promises are written double-quoted without escaping, so a promise
//! containing `"` does not survive a round trip.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use super::{now_timestamp, LoopState};
use crate::config::DEFAULT_FEATURE_LIST;
use crate::error::{RalphError, Result};

/// Frontmatter value meaning "no completion promise".
const NULL_SENTINEL: &str = "null";

fn document_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)\A---\n(?:(.*?)\n)?---(?:\n(.*))?\z").expect("static document pattern")
    })
}

fn field_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*):\s*(.*)$").expect("static field pattern")
    })
}

fn normalize(text: &str) -> Cow<'_, str> {
    if text.contains("\r\n") {
        Cow::Owned(text.replace("\r\n", "\n"))
    } else {
        Cow::Borrowed(text)
    }
}

fn strip_quotes(value: &str) -> &str {
    let value = value.trim();
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// First occurrence of each frontmatter key.
fn parse_fields(frontmatter: &str) -> HashMap<&str, &str> {
    let mut fields = HashMap::new();
    for line in frontmatter.lines() {
        if let Some(caps) = field_re().captures(line) {
            if let (Some(key), Some(value)) = (caps.get(1), caps.get(2)) {
                fields
                    .entry(key.as_str())
                    .or_insert_with(|| strip_quotes(value.as_str()));
            }
        }
    }
    fields
}

fn parse_count(fields: &HashMap<&str, &str>, key: &str, default: u32) -> Result<u32> {
    let Some(raw) = fields.get(key) else {
        return Ok(default);
    };
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RalphError::corrupted(format!(
            "{key} is not a non-negative integer: {raw:?}"
        )));
    }
    raw.parse()
        .map_err(|_| RalphError::corrupted(format!("{key} is out of range: {raw}")))
}

/// Parse a state document.
///
/// Returns `Ok(None)` when the text has no complete frontmatter block, and
/// [`RalphError::StateCorruption`] when `iteration` or `max_iterations` is
/// present but not a non-negative integer.
///
/// # Example
///
/// ```
/// use ralph_loop::state::{parse, serialize, LoopState};
///
/// let state = LoopState::new("fix bug").with_max_iterations(3);
/// assert_eq!(parse(&serialize(&state)).unwrap(), Some(state));
/// assert_eq!(parse("no frontmatter here").unwrap(), None);
/// ```
pub fn parse(text: &str) -> Result<Option<LoopState>> {
    let text = normalize(text);
    let Some(caps) = document_re().captures(&text) else {
        return Ok(None);
    };
    let frontmatter = caps.get(1).map_or("", |m| m.as_str());
    let body = caps.get(2).map_or("", |m| m.as_str());
    let fields = parse_fields(frontmatter);

    let completion_promise = fields
        .get("completion_promise")
        .filter(|v| **v != NULL_SENTINEL)
        .map(|v| (*v).to_string());

    Ok(Some(LoopState {
        active: fields.get("active").map_or(true, |v| *v != "false"),
        iteration: parse_count(&fields, "iteration", 1)?,
        max_iterations: parse_count(&fields, "max_iterations", 0)?,
        completion_promise,
        feature_list_path: fields
            .get("feature_list_path")
            .map_or_else(|| DEFAULT_FEATURE_LIST.to_string(), |v| (*v).to_string()),
        started_at: fields
            .get("started_at")
            .map_or_else(now_timestamp, |v| (*v).to_string()),
        prompt: body.trim().to_string(),
    }))
}

/// Encode a state document, fields in fixed order, trailing newline.
#[must_use]
pub fn serialize(state: &LoopState) -> String {
    let promise = match &state.completion_promise {
        Some(p) => format!("\"{p}\""),
        None => NULL_SENTINEL.to_string(),
    };
    format!(
        "---\nactive: {}\niteration: {}\nmax_iterations: {}\ncompletion_promise: {}\nfeature_list_path: \"{}\"\nstarted_at: \"{}\"\n---\n\n{}\n",
        state.active,
        state.iteration,
        state.max_iterations,
        promise,
        state.feature_list_path,
        state.started_at,
        state.prompt,
    )
}

/// The prompt body of a state document, without interpreting any fields.
///
/// Returns `None` if the text has no complete frontmatter block.
#[must_use]
pub fn prompt_body(text: &str) -> Option<String> {
    let text = normalize(text);
    let caps = document_re().captures(&text)?;
    Some(caps.get(2).map_or("", |m| m.as_str()).trim().to_string())
}

/// Rewrite the `iteration:` line of a state document.
///
/// Only the first `iteration:` line inside the frontmatter changes; every
/// other byte is preserved, line endings included, so the prompt body is
/// never re-encoded. If the frontmatter has no `iteration:` line, one is
/// appended to it using the document's line ending. Returns `None` if the
/// text has no complete frontmatter.
///
/// # Example
///
/// ```
/// use ralph_loop::state::set_iteration;
///
/// let doc = "---\nactive: true\niteration: 2\n---\n\niteration: 2 is also in the body\n";
/// assert_eq!(
///     set_iteration(doc, 3).unwrap(),
///     "---\nactive: true\niteration: 3\n---\n\niteration: 2 is also in the body\n"
/// );
/// ```
#[must_use]
pub fn set_iteration(text: &str, iteration: u32) -> Option<String> {
    if !document_re().is_match(&normalize(text)) {
        return None;
    }
    let replacement = format!("iteration: {iteration}");

    let mut lines = text.split_inclusive('\n');
    let opening = lines.next()?;
    let (_, newline) = split_line_ending(opening);
    let mut patched = String::with_capacity(text.len() + 16);
    patched.push_str(opening);

    let mut replaced = false;
    while let Some(line) = lines.next() {
        let (content, ending) = split_line_ending(line);
        if content == "---" {
            if !replaced {
                patched.push_str(&replacement);
                patched.push_str(newline);
            }
            patched.push_str(line);
            patched.extend(&mut lines);
            return Some(patched);
        }
        if !replaced && content.starts_with("iteration:") {
            patched.push_str(&replacement);
            patched.push_str(ending);
            replaced = true;
        } else {
            patched.push_str(line);
        }
    }
    None
}

/// Split a line produced by `split_inclusive('\n')` into content and ending.
fn split_line_ending(line: &str) -> (&str, &str) {
    if let Some(content) = line.strip_suffix("\r\n") {
        (content, "\r\n")
    } else if let Some(content) = line.strip_suffix('\n') {
        (content, "\n")
    } else {
        (line, "")
    }
}
