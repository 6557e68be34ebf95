//! Small helpers shared across the engine.

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Normalize message text for echo and duplicate comparison.
///
/// Lowercases, strips whitespace and punctuation, but keeps symbol and emoji
/// code points so that emoji control commands survive normalization.
pub fn normalize_text(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace() && !is_punctuation(*c))
        .flat_map(char::to_lowercase)
        .collect()
}

fn is_punctuation(c: char) -> bool {
    // ASCII punctuation plus the typographic marks messaging clients
    // substitute on re-rendering. Emoji are symbols, not punctuation, and
    // must pass through untouched.
    c.is_ascii_punctuation()
        || matches!(
            c,
            '¡' | '¿'
                | '…'
                | '–'
                | '—'
                | '«'
                | '»'
                | '\u{2018}'
                | '\u{2019}'
                | '\u{201C}'
                | '\u{201D}'
        )
}

/// Truncate a string to at most `max_chars` characters, appending "..." if truncated.
///
/// Safe for multi-byte UTF-8 (emoji, CJK) because it cuts on character
/// boundaries, never byte indices. Used when quoting message bodies in logs.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", s[..idx].trim_end()),
        None => s.to_string(),
    }
}
