//! Cleanup pipeline for text returned by the transform service.
//!
//! Models frequently wrap their answer in a code fence or quotes even when told
//! not to. Each pass is a function `&str -> String` applied in sequence.

use std::sync::LazyLock;

use regex::Regex;

/// Run the full cleanup pipeline on a raw transform response.
pub fn normalize_response(raw: &str) -> String {
    let mut result = raw.trim().to_string();

    result = strip_code_fence(&result);
    result = strip_wrapping_quotes(&result);

    result.trim().to_string()
}

/// Re-attach the leading and trailing whitespace of `source` to a normalized
/// response.
///
/// Chunk boundaries fall on line starts, so the whitespace around a chunk is
/// what separates it from its neighbours once the article is reassembled.
pub fn restore_edges(source: &str, normalized: &str) -> String {
    let body = normalized.trim();
    let lead = &source[..source.len() - source.trim_start().len()];
    let tail = &source[source.trim_end().len()..];
    format!("{lead}{body}{tail}")
}

// ---------------------------------------------------------------------------
// Pass 1: Unwrap a single enclosing code fence
// ---------------------------------------------------------------------------

/// Remove a fence that encloses the whole response (```` ```html ... ``` ````).
fn strip_code_fence(text: &str) -> String {
    static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?s)\A```[A-Za-z0-9_-]*[ \t]*\r?\n(.*?)\r?\n?```\z").expect("valid regex")
    });

    match FENCE_RE.captures(text) {
        Some(caps) => caps[1].to_string(),
        None => text.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Pass 2: Strip wrapping quotes
// ---------------------------------------------------------------------------

/// Strip quote characters (`"`, `'`, `` ` ``) from both ends.
///
/// Only applies when the text both starts and ends with a quote character, so
/// content that legitimately ends in a quoted phrase is left alone.
fn strip_wrapping_quotes(text: &str) -> String {
    const QUOTES: &[char] = &['"', '\'', '`'];

    if text.starts_with(QUOTES) && text.ends_with(QUOTES) {
        text.trim_matches(QUOTES).to_string()
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restores_line_breaks_around_chunk() {
        let source = "# One\ntext\n\n";
        assert_eq!(restore_edges(source, "# Uno\ntexto"), "# Uno\ntexto\n\n");
        assert_eq!(restore_edges("\n## Two\nmore", "## Dos\nmás  "), "\n## Dos\nmás");
        assert_eq!(restore_edges("plain", "llano"), "llano");
    }

    #[test]
    fn plain_text_is_only_trimmed() {
        assert_eq!(normalize_response("  <p>Hola</p>\n\n"), "<p>Hola</p>");
    }

    #[test]
    fn unwraps_html_fence() {
        let raw = "```html\n<h2>Título</h2>\n<p>Texto</p>\n```";
        assert_eq!(normalize_response(raw), "<h2>Título</h2>\n<p>Texto</p>");
    }

    #[test]
    fn unwraps_bare_fence() {
        let raw = "```\n<p>x</p>\n```";
        assert_eq!(normalize_response(raw), "<p>x</p>");
    }

    #[test]
    fn inner_fences_are_kept() {
        let raw = "<p>Example:</p>\n```rust\nfn main() {}\n```\n<p>done</p>";
        assert_eq!(normalize_response(raw), raw);
    }

    #[test]
    fn strips_wrapping_quotes() {
        assert_eq!(normalize_response("'''<p>a</p>'''"), "<p>a</p>");
        assert_eq!(normalize_response("\"<p>b</p>\""), "<p>b</p>");
    }

    #[test]
    fn keeps_trailing_quote_without_leading_quote() {
        let raw = "<p>He said \"hi\"";
        assert_eq!(normalize_response(raw), raw);
    }
}
