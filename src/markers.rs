//! Hidden chart markers.
//!
//! After a chart tool call the relay appends `<!-- CHART_DATA:{args} -->` to
//! the assistant text. Markdown renderers hide HTML comments, while the model
//! still sees its own chart intent when the turn is replayed as history.

use crate::constants::{CHART_MARKER_PREFIX, CHART_MARKER_SUFFIX};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

lazy_static! {
    static ref CHART_MARKER_REGEX: Regex = Regex::new(r"(?s)\s*<!-- CHART_DATA:(.*?) -->")
        .expect("Invalid chart marker regex");
}

/// `>` only occurs inside JSON strings, so escaping it keeps the body valid
/// JSON while no string value can close the comment early.
pub fn chart_marker(args: &Value) -> String {
    let body = args.to_string().replace('>', "\\u003e");
    format!("\n\n{}{}{}", CHART_MARKER_PREFIX, body, CHART_MARKER_SUFFIX)
}

/// Removes every chart marker (and the whitespace leading into it).
pub fn strip_chart_markers(text: &str) -> String {
    CHART_MARKER_REGEX.replace_all(text, "").into_owned()
}

/// Recovers the chart arguments embedded in a message, in order.
/// Markers whose body is not valid JSON are skipped.
pub fn extract_chart_markers(text: &str) -> Vec<Value> {
    CHART_MARKER_REGEX
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .filter_map(|m| match serde_json::from_str::<Value>(m.as_str()) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::debug!("Ignoring unparsable chart marker: {}", e);
                None
            }
        })
        .collect()
}
