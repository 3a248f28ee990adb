//! Locally derived article metadata and content hashing.
//!
//! Used when the metadata-extraction call cannot accept the assembled article
//! (too large, rejected), so a fully transformed job still gets a title,
//! description and slug.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use relingo_shared::ArticleMetadata;

/// Maximum description length, in characters.
const DESCRIPTION_MAX_CHARS: usize = 155;

/// Compute the SHA-256 hash of content, hex encoded.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Derive title, description and slug from the article body.
///
/// Title is the first heading (HTML or Markdown), falling back to
/// `fallback_title`. Description is the first non-heading text, truncated.
pub fn fallback_metadata(content: &str, fallback_title: &str) -> ArticleMetadata {
    let title = first_heading(content).unwrap_or_else(|| fallback_title.to_string());
    let description = first_text(content)
        .map(|t| truncate_chars(&t, DESCRIPTION_MAX_CHARS))
        .unwrap_or_else(|| title.clone());
    let slug = slugify(&title);

    ArticleMetadata {
        title,
        description,
        slug,
    }
}

/// Convert free text to a kebab-case slug (`"¡Hola, Mundo!"` → `"hola-mundo"`).
pub fn slugify(text: &str) -> String {
    let lowered = text.to_lowercase();
    let mut slug = String::with_capacity(lowered.len());
    let mut pending_dash = false;

    for c in lowered.chars() {
        if c.is_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else {
            pending_dash = true;
        }
    }

    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    }
}

/// Tag-stripped, whitespace-collapsed text of an HTML or Markdown document.
pub fn plain_text(content: &str) -> String {
    collapse_whitespace(&strip_tags(content))
}

fn first_heading(content: &str) -> Option<String> {
    static HTML_H_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?is)<h[1-6](?:\s[^>]*)?>(.*?)</h[1-6]\s*>").expect("valid regex")
    });
    static MD_H_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?m)^#{1,6}[ \t]+(.+?)[ \t]*#*[ \t]*$").expect("valid regex"));

    let html = HTML_H_RE.captures(content).and_then(|c| c.get(1));
    let md = MD_H_RE.captures(content).and_then(|c| c.get(1));

    // Whichever appears first in the document wins.
    let found = match (html, md) {
        (Some(h), Some(m)) => Some(if h.start() <= m.start() { h } else { m }),
        (h, m) => h.or(m),
    }?;

    let text = collapse_whitespace(&strip_tags(found.as_str()));
    (!text.is_empty()).then_some(text)
}

fn first_text(content: &str) -> Option<String> {
    static HEADING_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)<h[1-6](?:\s[^>]*)?>(?s:.*?)</h[1-6]\s*>|(?m)^#{1,6}[ \t][^\n]*$")
            .expect("valid regex")
    });

    let without_headings = HEADING_BLOCK_RE.replace_all(content, "\n");
    without_headings
        .split("\n")
        .map(|line| collapse_whitespace(&strip_tags(line)))
        .find(|line| !line.is_empty())
}

fn strip_tags(html: &str) -> String {
    static TAG_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));
    TAG_RE.replace_all(html, " ").to_string()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].trim_end().to_string(),
        None => text.to_string(),
    }
}
