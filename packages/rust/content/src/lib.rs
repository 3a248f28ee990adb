//! Content partitioning and transform-response cleanup.
//!
//! Splits scraped article content into ordered chunks at section boundaries
//! (HTML `<h1>`..`<h6>` tags and Markdown ATX headings), and normalizes the
//! text that comes back from the transform service before it is stored.

mod cleanup;
mod metadata;

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

pub use cleanup::{normalize_response, restore_edges};
pub use metadata::{content_hash, fallback_metadata, plain_text, slugify};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Options for [`partition_with`].
#[derive(Debug, Clone)]
pub struct PartitionOptions {
    /// Deepest heading level that starts a new chunk (1..=6).
    pub max_heading_level: u8,
}

impl Default for PartitionOptions {
    fn default() -> Self {
        Self {
            max_heading_level: 6,
        }
    }
}

// ---------------------------------------------------------------------------
// Partitioner
// ---------------------------------------------------------------------------

/// Split `raw` into ordered chunks, cutting before every heading.
///
/// The concatenation of the returned chunks is exactly `raw`. Every chunk is
/// non-empty. Content without any heading yields a single chunk, and empty
/// input yields no chunks.
pub fn partition(raw: &str) -> Vec<String> {
    partition_with(raw, &PartitionOptions::default())
}

/// [`partition`] with explicit options.
pub fn partition_with(raw: &str, opts: &PartitionOptions) -> Vec<String> {
    if raw.is_empty() {
        return Vec::new();
    }

    let max_level = opts.max_heading_level.clamp(1, 6);
    let mut cuts = boundaries(raw, max_level);
    cuts.retain(|&c| c > 0);
    cuts.sort_unstable();
    cuts.dedup();

    let mut chunks = Vec::with_capacity(cuts.len() + 1);
    let mut last = 0;
    for cut in cuts {
        chunks.push(raw[last..cut].to_string());
        last = cut;
    }
    chunks.push(raw[last..].to_string());

    debug!(len = raw.len(), chunks = chunks.len(), "partitioned content");
    chunks
}

/// Byte offsets where a new section starts.
fn boundaries(raw: &str, max_level: u8) -> Vec<usize> {
    static HTML_HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)<h([1-6])(?:\s[^>]*)?>").expect("valid regex")
    });

    let (mut cuts, fences) = markdown_boundaries(raw, max_level);

    for caps in HTML_HEADING_RE.captures_iter(raw) {
        let (Some(whole), Some(level)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let level: u8 = level.as_str().parse().unwrap_or(u8::MAX);
        let start = whole.start();
        if level <= max_level && !fences.iter().any(|f| f.contains(&start)) {
            cuts.push(start);
        }
    }

    cuts
}

/// Line-start offsets of Markdown ATX headings, plus the byte ranges of fenced
/// code blocks (which never contain boundaries).
fn markdown_boundaries(raw: &str, max_level: u8) -> (Vec<usize>, Vec<Range<usize>>) {
    let mut cuts = Vec::new();
    let mut fences = Vec::new();
    let mut fence_start: Option<usize> = None;
    let mut offset = 0;

    for line in raw.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            match fence_start.take() {
                Some(start) => fences.push(start..offset + line.len()),
                None => fence_start = Some(offset),
            }
        } else if fence_start.is_none() {
            if let Some(level) = atx_level(line) {
                if level <= max_level {
                    cuts.push(offset);
                }
            }
        }
        offset += line.len();
    }

    // Unterminated fence runs to the end of the content.
    if let Some(start) = fence_start {
        fences.push(start..raw.len());
    }

    (cuts, fences)
}

/// Heading level of a Markdown ATX heading line (`## Title`), if it is one.
fn atx_level(line: &str) -> Option<u8> {
    let hashes = line.bytes().take_while(|&b| b == b'#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    match line.as_bytes().get(hashes) {
        None | Some(b' ') | Some(b'\t') | Some(b'\n') | Some(b'\r') => Some(hashes as u8),
        _ => None,
    }
}
