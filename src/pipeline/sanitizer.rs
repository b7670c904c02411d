//! Content sanitizer — reduces an admitted message to plain text.
//!
//! Attachments and link-preview metadata never reach the output: only the
//! text body is read, and any attachment reference the platform echoed into
//! the body is cut out. The result is capped at a fixed character budget.

use crate::pipeline::types::RawMessage;

/// Telegram's `sendMessage` text limit, in characters.
pub const DEFAULT_MAX_TEXT_CHARS: usize = 4096;

/// Share of the budget (from the end) searched for a whitespace cut point.
const TRUNCATE_LOOKBACK_DIVISOR: usize = 10;

/// Strips media and preview data, normalizes whitespace, truncates.
#[derive(Debug, Clone, Copy)]
pub struct ContentSanitizer {
    max_chars: usize,
}

impl ContentSanitizer {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars: max_chars.max(1),
        }
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    /// Sanitized text body of a raw message.
    pub fn sanitize(&self, message: &RawMessage) -> String {
        let mut text = message.text.clone();
        for attachment in &message.attachments {
            text = remove_reference(&text, &attachment.reference);
        }
        self.sanitize_text(&text)
    }

    /// Normalize and truncate a text body. Idempotent.
    pub fn sanitize_text(&self, text: &str) -> String {
        let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
        // At most one blank line between paragraphs.
        let mut lines: Vec<&str> = Vec::new();
        for line in normalized.lines().map(str::trim_end) {
            let previous_blank = lines.last().is_some_and(|l| l.is_empty());
            if line.is_empty() && previous_blank {
                continue;
            }
            lines.push(line);
        }
        truncate_chars(lines.join("\n").trim(), self.max_chars)
    }

    /// Cap already-clean text at the character budget.
    pub fn truncate(&self, text: &str) -> String {
        truncate_chars(text, self.max_chars)
    }
}

impl Default for ContentSanitizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TEXT_CHARS)
    }
}

/// Remove every occurrence of `reference` together with one leading space.
fn remove_reference(text: &str, reference: &str) -> String {
    let reference = reference.trim();
    if reference.is_empty() {
        return text.to_string();
    }
    text.replace(&format!(" {reference}"), "")
        .replace(reference, "")
}

/// Truncate to at most `max_chars` characters.
///
/// Cuts at the last whitespace within the final tenth of the budget when
/// there is one, otherwise hard-cuts at the budget. Trailing whitespace is
/// trimmed so the result is stable under re-sanitizing.
fn truncate_chars(text: &str, max_chars: usize) -> String {
    let Some((cut, _)) = text.char_indices().nth(max_chars) else {
        return text.to_string();
    };

    let head = &text[..cut];
    let lookback = (max_chars / TRUNCATE_LOOKBACK_DIVISOR).max(1);
    let window_start = head
        .char_indices()
        .nth(max_chars.saturating_sub(lookback))
        .map(|(i, _)| i)
        .unwrap_or(0);

    let split_at = head[window_start..]
        .rfind(char::is_whitespace)
        .map(|i| window_start + i)
        .filter(|&i| i > 0)
        .unwrap_or(cut);

    text[..split_at].trim_end().to_string()
}
