//! Control directives the response generator embeds in its reply text.
//!
//! Directives are instructions for this system, not for the end user, and
//! are stripped from the outgoing text after being acted upon. Two kinds:
//!
//! - `[ORDER] ... [/ORDER]` — capture an order summary for human follow-up
//! - `[LABEL: name]` — assign a gateway label to the conversation

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Order details captured from the reply.
    OrderCapture(String),
    /// A label the conversation should receive.
    AssignLabel(String),
}

#[derive(Debug, Clone, Default)]
pub struct ParsedReply {
    /// The user-facing text with all directives removed.
    pub clean_text: String,
    pub directives: Vec<Directive>,
}

/// Scan a generated reply for embedded directives and strip them out.
///
/// Malformed blocks (an `[ORDER]` with no closing tag, an empty label) are
/// left in place or dropped rather than failing the turn; the generator's
/// text is untrusted input here.
pub fn parse_reply(text: &str) -> ParsedReply {
    let (text, orders) = extract_blocks(text, "[ORDER]", "[/ORDER]");
    let (text, labels) = extract_labels(&text);

    let mut directives = Vec::new();
    directives.extend(orders.into_iter().map(Directive::OrderCapture));
    directives.extend(labels.into_iter().map(Directive::AssignLabel));

    ParsedReply {
        clean_text: collapse_blank_runs(&text),
        directives,
    }
}

fn extract_blocks(text: &str, open: &str, close: &str) -> (String, Vec<String>) {
    let mut cleaned = String::new();
    let mut found = Vec::new();
    let mut remaining = text;

    while let Some(start) = remaining.find(open) {
        cleaned.push_str(&remaining[..start]);
        let after_open = &remaining[start + open.len()..];
        match after_open.find(close) {
            Some(end) => {
                let inner = after_open[..end].trim();
                if !inner.is_empty() {
                    found.push(inner.to_string());
                }
                remaining = &after_open[end + close.len()..];
            }
            None => {
                // Unterminated block: keep the text as-is from the open tag.
                cleaned.push_str(&remaining[start..]);
                remaining = "";
                break;
            }
        }
    }
    cleaned.push_str(remaining);
    (cleaned, found)
}

fn extract_labels(text: &str) -> (String, Vec<String>) {
    const OPEN: &str = "[LABEL:";
    let mut cleaned = String::new();
    let mut found = Vec::new();
    let mut remaining = text;

    while let Some(start) = remaining.find(OPEN) {
        cleaned.push_str(&remaining[..start]);
        let after_open = &remaining[start + OPEN.len()..];
        match after_open.find(']') {
            Some(end) => {
                let name = after_open[..end].trim();
                if !name.is_empty() {
                    found.push(name.to_string());
                }
                remaining = &after_open[end + 1..];
            }
            None => {
                cleaned.push_str(&remaining[start..]);
                remaining = "";
                break;
            }
        }
    }
    cleaned.push_str(remaining);
    (cleaned, found)
}

/// Stripping directives leaves blank lines behind; collapse runs of them so
/// the user never sees the seams.
fn collapse_blank_runs(text: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut last_blank = false;
    for line in text.lines() {
        let blank = line.trim().is_empty();
        if blank && last_blank {
            continue;
        }
        out.push(line.trim_end());
        last_blank = blank;
    }
    out.join("\n").trim().to_string()
}
