//! Post-processing: deterministic cleanup of LLM-rewritten narration.
//!
//! ## Why is post-processing necessary?
//!
//! Even well-prompted models occasionally wrap their answer in artefacts that
//! are harmless on screen but get read aloud by a synthesiser:
//!
//! - Quoting the whole answer (`"…"`, `“…”`, `「…」`)
//! - A boilerplate preamble ("Here is the spoken version:") before the text
//! - Markdown fences around plain prose
//! - Zero-width characters and BOMs copied from the source text
//!
//! Each rule is a pure `&str → String` function so the order is easy to
//! reason about and every rule is independently testable.
//!
//! ## Rule Order
//!
//! Fences go first so the preamble check sees the real first line; quotes are
//! stripped after the preamble because the preamble usually sits outside them.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply all cleanup rules to a raw rewrite.
///
/// Rules (applied in order):
/// 1. Strip outer markdown fences
/// 2. Normalise line endings (CRLF → LF)
/// 3. Remove a boilerplate preamble line
/// 4. Strip wrapping quotes
/// 5. Strip invisible Unicode
/// 6. Collapse runs of spaces and blank lines
pub fn clean_narration(input: &str) -> String {
    let s = strip_fences(input);
    let s = normalise_line_endings(&s);
    let s = remove_preamble(&s);
    let s = strip_wrapping_quotes(&s);
    let s = remove_invisible_chars(&s);
    collapse_whitespace(&s)
}

// ── Rule 1: Strip outer fences ───────────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[a-zA-Z]*\n(.*)\n```\s*$").unwrap());

fn strip_fences(input: &str) -> String {
    match RE_OUTER_FENCES.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

// ── Rule 2: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 3: Remove boilerplate preamble ──────────────────────────────────────
//
// Models like to announce the answer. The preamble is a short first line
// ending in a colon that talks about the conversion itself.

static RE_PREAMBLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?ix)^\s*(?:
            (?:here\s+is|here's|below\s+is)[^\n]{0,80}?(?:version|narration|text|rewrite|rendition)[^\n]{0,20}[:：]
          | 以下是[^\n]{0,40}?[：:]
        )\s*",
    )
    .unwrap()
});

fn remove_preamble(input: &str) -> String {
    RE_PREAMBLE.replace(input, "").to_string()
}

// ── Rule 4: Strip wrapping quotes ────────────────────────────────────────────

const QUOTE_PAIRS: &[(char, char)] = &[
    ('"', '"'),
    ('\'', '\''),
    ('“', '”'),
    ('‘', '’'),
    ('「', '」'),
    ('『', '』'),
];

fn strip_wrapping_quotes(input: &str) -> String {
    let trimmed = input.trim();
    for (open, close) in QUOTE_PAIRS {
        if let Some(inner) = trimmed
            .strip_prefix(*open)
            .and_then(|s| s.strip_suffix(*close))
        {
            // Only when the quote wraps the whole text, not two quoted phrases.
            if !inner.contains(*close) {
                return inner.trim().to_string();
            }
        }
    }
    trimmed.to_string()
}

// ── Rule 5: Remove invisible Unicode characters ──────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 6: Collapse whitespace ──────────────────────────────────────────────

static RE_SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]+").unwrap());
static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n+").unwrap());

fn collapse_whitespace(input: &str) -> String {
    let s = RE_SPACES.replace_all(input, " ");
    let s = RE_BLANK_LINES.replace_all(&s, "\n");
    s.lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_quotes() {
        assert_eq!(strip_wrapping_quotes("\"Hello there.\""), "Hello there.");
        assert_eq!(strip_wrapping_quotes("“你好。”"), "你好。");
        assert_eq!(
            strip_wrapping_quotes("\"A\" and \"B\""),
            "\"A\" and \"B\""
        );
    }

    #[test]
    fn test_remove_english_preamble() {
        let raw = "Here is the spoken version:\nThe rain kept falling.";
        assert_eq!(clean_narration(raw), "The rain kept falling.");
    }

    #[test]
    fn test_remove_cjk_preamble() {
        let raw = "以下是转换后的口语化表达：雨一直在下。";
        assert_eq!(clean_narration(raw), "雨一直在下。");
        let raw = "以下是适合有声书朗读的口语化表达：\n雨一直在下。";
        assert_eq!(clean_narration(raw), "雨一直在下。");
    }

    #[test]
    fn test_preamble_only_at_start() {
        let raw = "She said: here is the text: nothing more.";
        assert_eq!(clean_narration(raw), raw);
    }

    #[test]
    fn test_strip_fences() {
        assert_eq!(clean_narration("```\nJust prose.\n```"), "Just prose.");
    }

    #[test]
    fn test_remove_invisible_and_whitespace() {
        let raw = "  One\u{200B}  two\r\n\r\n\r\nthree\u{FEFF} ";
        assert_eq!(clean_narration(raw), "One two\nthree");
    }

    #[test]
    fn test_empty_stays_empty() {
        assert_eq!(clean_narration("  \"\"  "), "");
    }
}
