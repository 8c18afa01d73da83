//! Char-boundary-safe string helpers for log snippets, titles and
//! incremental terminal output.

use std::borrow::Cow;

/// At most `max_chars` leading characters, never splitting a code point.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    s.char_indices()
        .nth(max_chars)
        .map(|(idx, _)| &s[..idx])
        .unwrap_or(s)
}

/// Bounded snippet for logs; borrows when nothing is cut.
pub fn first_n_chars_lossy(s: &str, n: usize) -> Cow<'_, str> {
    let prefix = prefix_chars(s, n);
    if prefix.len() == s.len() {
        Cow::Borrowed(s)
    } else {
        Cow::Owned(format!("{}…", prefix))
    }
}

/// `s[start..end]` when both offsets are in range and on char boundaries.
pub fn slice_bytes_safe(s: &str, start: usize, end: usize) -> Option<&str> {
    if start <= end && end <= s.len() && s.is_char_boundary(start) && s.is_char_boundary(end) {
        Some(&s[start..end])
    } else {
        None
    }
}
