//! Reply sanitation and the silent-reply sentinel.

/// The silent-reply sentinel. Case-insensitive, optionally wrapped in
/// whitespace, quotes or a trailing period.
const SILENT_SENTINEL: &str = "NO_REPLY";

/// Sanitize model output into user-facing text:
/// - strip zero-width and other control characters,
/// - collapse runs of 3+ newlines to 2,
/// - trim surrounding whitespace.
///
/// Media lines are removed separately (see [`crate::media`]) so artifacts
/// are collected before sanitation.
pub fn sanitize_reply(text: &str) -> String {
    let mut cleaned = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            // Zero-width characters models occasionally emit.
            '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}' => {}
            // Keep newlines and tabs, drop other control characters.
            c if c.is_control() && c != '\n' && c != '\t' => {}
            c => cleaned.push(c),
        }
    }

    // Collapse excessive blank lines.
    let mut out = String::with_capacity(cleaned.len());
    let mut newline_run = 0;
    for c in cleaned.chars() {
        if c == '\n' {
            newline_run += 1;
            if newline_run <= 2 {
                out.push(c);
            }
        } else {
            newline_run = 0;
            out.push(c);
        }
    }

    out.trim().to_string()
}

/// Whether sanitized content is the silent-reply sentinel.
pub fn is_silent(text: &str) -> bool {
    let trimmed = text
        .trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '`')
        .trim()
        .trim_end_matches('.');
    trimmed.eq_ignore_ascii_case(SILENT_SENTINEL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_trims_and_collapses() {
        let raw = "  Hello!\n\n\n\n\nWorld  ";
        assert_eq!(sanitize_reply(raw), "Hello!\n\nWorld");
    }

    #[test]
    fn test_sanitize_strips_zero_width() {
        let raw = "He\u{200B}llo\u{FEFF}!";
        assert_eq!(sanitize_reply(raw), "Hello!");
    }

    #[test]
    fn test_sanitize_strips_control_chars_keeps_tabs() {
        let raw = "a\u{0007}b\tc";
        assert_eq!(sanitize_reply(raw), "ab\tc");
    }

    #[test]
    fn test_sanitize_plain_text_unchanged() {
        assert_eq!(sanitize_reply("Just a reply."), "Just a reply.");
    }

    #[test]
    fn test_silent_sentinel_exact() {
        assert!(is_silent("NO_REPLY"));
    }

    #[test]
    fn test_silent_sentinel_variants() {
        assert!(is_silent("no_reply"));
        assert!(is_silent("  NO_REPLY  "));
        assert!(is_silent("\"NO_REPLY\""));
        assert!(is_silent("No_Reply."));
    }

    #[test]
    fn test_non_silent_content() {
        assert!(!is_silent("NO_REPLY needed here, let me explain"));
        assert!(!is_silent("I will reply"));
        assert!(!is_silent(""));
    }
}
