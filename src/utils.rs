//! Shared utilities: host environment capabilities, template text helpers,
//! and bounded output truncation.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Marker spliced between the head and tail of a truncated buffer.
pub const TRUNCATION_MARKER: &str = "...";

/// Capabilities declared by the host editor.
///
/// Each flag independently enables a code path: persisting agent state into
/// cell metadata, asking the user to confirm a stage, asking the user for
/// supplementary information, and inserting/replacing cells.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EnvironmentCapabilities {
    #[serde(default)]
    pub save_metadata: bool,
    #[serde(default)]
    pub user_confirm: bool,
    #[serde(default)]
    pub user_supply_info: bool,
    #[serde(default)]
    pub set_cell_content: bool,
}

static ENV_CAPABILITIES: Lazy<RwLock<EnvironmentCapabilities>> =
    Lazy::new(|| RwLock::new(EnvironmentCapabilities::default()));

/// Serialises tests that touch process-wide state (the sink, the
/// dispatcher, the capability flags).
#[cfg(test)]
pub(crate) static GLOBAL_TEST_LOCK: Lazy<parking_lot::Mutex<()>> =
    Lazy::new(|| parking_lot::Mutex::new(()));

/// Get the process-wide host capabilities.
pub fn get_env_capabilities() -> EnvironmentCapabilities {
    *ENV_CAPABILITIES.read()
}

/// Replace the process-wide host capabilities.
pub fn set_env_capabilities(capabilities: EnvironmentCapabilities) {
    *ENV_CAPABILITIES.write() = capabilities;
}

// ---------------------------------------------------------------------------
// Template text helpers
// ---------------------------------------------------------------------------

static LEADING_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^[ \t]+").expect("static regex"));

/// Strip leading whitespace from every line.
///
/// Lets multi-line template literals be indented with the surrounding code
/// without the indentation leaking into the rendered prompt.
pub fn no_indent(text: &str) -> String {
    LEADING_WS.replace_all(text, "").into_owned()
}

// ---------------------------------------------------------------------------
// Output truncation
// ---------------------------------------------------------------------------

/// Truncate `text` to at most `limit + TRUNCATION_MARKER.len()` bytes,
/// keeping the head and tail halves around the marker.
///
/// Idempotent: a buffer that already fits (including one that this function
/// produced) is returned unchanged.
pub fn truncate_middle(text: &str, limit: usize) -> String {
    if text.len() <= limit + TRUNCATION_MARKER.len() {
        return text.to_string();
    }
    let half = limit / 2;
    let head_end = floor_char_boundary(text, half);
    let tail_start = ceil_char_boundary(text, text.len() - half);
    format!(
        "{}{}{}",
        &text[..head_end],
        TRUNCATION_MARKER,
        &text[tail_start..]
    )
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(text: &str, mut index: usize) -> usize {
    while index < text.len() && !text.is_char_boundary(index) {
        index += 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_default_off() {
        let caps = EnvironmentCapabilities::default();
        assert!(!caps.save_metadata);
        assert!(!caps.user_confirm);
        assert!(!caps.user_supply_info);
        assert!(!caps.set_cell_content);
    }

    #[test]
    fn test_no_indent() {
        let text = "    line one\n\tline two\nline three";
        assert_eq!(no_indent(text), "line one\nline two\nline three");
    }

    #[test]
    fn test_truncate_short_input_untouched() {
        assert_eq!(truncate_middle("hello", 100), "hello");
    }

    #[test]
    fn test_truncate_keeps_head_and_tail() {
        let text = "a".repeat(50) + &"b".repeat(50);
        let out = truncate_middle(&text, 20);
        assert!(out.starts_with("aaaaaaaaaa"));
        assert!(out.ends_with("bbbbbbbbbb"));
        assert!(out.contains(TRUNCATION_MARKER));
        assert!(out.len() <= 20 + TRUNCATION_MARKER.len());
    }

    #[test]
    fn test_truncate_is_idempotent() {
        let text = "x".repeat(4096);
        let once = truncate_middle(&text, 100);
        let twice = truncate_middle(&once, 100);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let text = "é".repeat(200);
        let out = truncate_middle(&text, 21);
        assert!(out.len() <= 21 + TRUNCATION_MARKER.len());
        // Must still be valid UTF-8 (guaranteed by construction, exercised here).
        assert!(out.contains(TRUNCATION_MARKER));
    }
}
