//! Paragraph-boundary text chunker with overlap.
//!
//! Splits extracted document text into size-bounded chunks on paragraph
//! boundaries (`\n\n`). Paragraphs are greedily packed while the chunk
//! stays under `max_size` characters; an oversized paragraph is windowed
//! into consecutive `max_size` slices with `overlap` characters of
//! backward overlap, and each freshly started chunk carries the trailing
//! `overlap` characters of its predecessor for context continuity.
//!
//! Chunk indices are contiguous from 0 in output order. For identical
//! input and config the output is byte-identical.

use crate::models::Metadata;

#[derive(Debug, Clone, Copy)]
pub struct ChunkerConfig {
    /// Maximum chunk length in characters.
    pub max_size: usize,
    /// Backward overlap in characters.
    pub overlap: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_size: 800,
            overlap: 150,
        }
    }
}

/// A chunk of text before embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub text: String,
    pub chunk_index: i64,
    pub token_count: i64,
    pub metadata: Metadata,
}

/// Split text into chunks. Returns an empty vector when the input has no
/// non-whitespace content; callers treat that as a chunking failure.
pub fn chunk_text(text: &str, doc_metadata: &Metadata, config: &ChunkerConfig) -> Vec<TextChunk> {
    let max_size = config.max_size.max(1);
    let overlap = config.overlap.min(max_size.saturating_sub(1));

    let mut pieces: Vec<String> = Vec::new();
    let mut current = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let para_len = trimmed.chars().count();

        // A paragraph that alone exceeds the limit is windowed.
        if para_len > max_size {
            if !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
            }
            split_windows(trimmed, max_size, overlap, &mut pieces);
            continue;
        }

        let current_len = current.chars().count();
        let would_be = if current.is_empty() {
            para_len
        } else {
            current_len + 2 + para_len
        };

        if would_be > max_size && !current.is_empty() {
            let carry = tail_chars(&current, overlap);
            pieces.push(std::mem::take(&mut current));
            if !carry.is_empty() {
                current.push_str(&carry);
                current.push_str("\n\n");
            }
            current.push_str(trimmed);
            continue;
        }

        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(trimmed);
    }

    if !current.is_empty() {
        pieces.push(current);
    }

    let mut page: Option<u32> = None;
    pieces
        .into_iter()
        .enumerate()
        .map(|(index, text)| {
            // Label the chunk with the page it starts on; carry the last
            // marker forward for chunks that span a page break.
            let own_page = find_page_marker(&text).or(page);
            if let Some(marker) = find_last_page_marker(&text) {
                page = Some(marker);
            }
            let token_count = (text.chars().count() as i64 + 3) / 4;
            let metadata = chunk_metadata(&text, own_page, doc_metadata);
            TextChunk {
                text,
                chunk_index: index as i64,
                token_count,
                metadata,
            }
        })
        .collect()
}

/// Window an oversized paragraph into `max_size` slices, each starting
/// `overlap` characters before the previous window's end.
fn split_windows(para: &str, max_size: usize, overlap: usize, out: &mut Vec<String>) {
    let chars: Vec<char> = para.chars().collect();
    let mut start = 0usize;

    loop {
        let end = (start + max_size).min(chars.len());
        out.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start = end - overlap;
    }
}

/// The trailing `n` characters of a string.
fn tail_chars(s: &str, n: usize) -> String {
    if n == 0 {
        return String::new();
    }
    let chars: Vec<char> = s.chars().collect();
    let start = chars.len().saturating_sub(n);
    chars[start..].iter().collect()
}

/// First `[Page N]` marker in the text, if any.
fn find_page_marker(text: &str) -> Option<u32> {
    page_markers(text).next()
}

/// Last `[Page N]` marker in the text, if any.
fn find_last_page_marker(text: &str) -> Option<u32> {
    page_markers(text).last()
}

fn page_markers(text: &str) -> impl Iterator<Item = u32> + '_ {
    let mut rest = text;
    std::iter::from_fn(move || {
        while let Some(pos) = rest.find("[Page ") {
            let after = &rest[pos + 6..];
            rest = after;
            if let Some(close) = after.find(']') {
                if let Ok(n) = after[..close].trim().parse::<u32>() {
                    return Some(n);
                }
            }
        }
        None
    })
}

/// Per-chunk metadata: page marker, short uppercase first line as heading,
/// and the document-level fields search and rescoring read.
fn chunk_metadata(text: &str, page: Option<u32>, doc: &Metadata) -> Metadata {
    let heading = text.lines().next().and_then(|line| {
        let line = line.trim();
        let short = line.chars().count() <= 100;
        let starts_upper = line.chars().next().map(|c| c.is_uppercase()).unwrap_or(false);
        if !line.is_empty() && short && starts_upper {
            Some(line.to_string())
        } else {
            None
        }
    });

    Metadata {
        source_quality: doc.source_quality,
        last_verified: doc.last_verified.clone(),
        published_date: doc.published_date.clone(),
        framework: doc.framework.clone(),
        framework_version: doc.framework_version.clone(),
        language: doc.language.clone(),
        doc_type: doc.doc_type.clone(),
        tags: doc.tags.clone(),
        page,
        heading,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(max_size: usize, overlap: usize) -> ChunkerConfig {
        ChunkerConfig { max_size, overlap }
    }

    #[test]
    fn small_text_single_chunk() {
        let chunks = chunk_text("Hello, world!", &Metadata::default(), &cfg(800, 150));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!(chunks[0].token_count, 4); // ceil(13/4)
    }

    #[test]
    fn blank_input_yields_nothing() {
        assert!(chunk_text("", &Metadata::default(), &cfg(800, 150)).is_empty());
        assert!(chunk_text("  \n\n \n ", &Metadata::default(), &cfg(800, 150)).is_empty());
    }

    #[test]
    fn paragraphs_pack_under_limit() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let chunks = chunk_text(text, &Metadata::default(), &cfg(800, 150));
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("First paragraph."));
        assert!(chunks[0].text.contains("Third paragraph."));
    }

    #[test]
    fn indices_contiguous_from_zero() {
        let text = (0..40)
            .map(|i| format!("Paragraph number {} with some filler text.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk_text(&text, &Metadata::default(), &cfg(120, 20));
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
        }
    }

    #[test]
    fn oversized_paragraph_windows_with_overlap() {
        let para: String = "abcdefghij".repeat(30); // 300 chars, no blank lines
        let chunks = chunk_text(&para, &Metadata::default(), &cfg(100, 20));

        assert!(chunks.len() > 1);
        assert_eq!(chunks[0].text.chars().count(), 100);
        // Each subsequent window starts 20 chars before the previous end.
        let first: Vec<char> = chunks[0].text.chars().collect();
        let second: Vec<char> = chunks[1].text.chars().collect();
        let tail: String = first[80..].iter().collect();
        let head: String = second[..20].iter().collect();
        assert_eq!(tail, head);
    }

    #[test]
    fn new_chunk_carries_overlap_tail() {
        let a = "A".repeat(90);
        let b = "B".repeat(90);
        let text = format!("{}\n\n{}", a, b);
        let chunks = chunk_text(&text, &Metadata::default(), &cfg(100, 30));

        assert_eq!(chunks.len(), 2);
        // Second chunk starts with the 30-char tail of the first.
        assert!(chunks[1].text.starts_with(&"A".repeat(30)));
        assert!(chunks[1].text.contains(&"B".repeat(90)));
    }

    #[test]
    fn deterministic_output() {
        let text = "Alpha paragraph content.\n\nBeta paragraph content.\n\nGamma paragraph content.";
        let c1 = chunk_text(text, &Metadata::default(), &cfg(40, 10));
        let c2 = chunk_text(text, &Metadata::default(), &cfg(40, 10));
        assert_eq!(c1, c2);
    }

    #[test]
    fn page_markers_tracked_across_chunks() {
        let text = format!(
            "[Page 1] Introduction text here.\n\n{}\n\n[Page 2] Second page begins.\n\nMore text on page two.",
            "Filler. ".repeat(30)
        );
        let chunks = chunk_text(&text, &Metadata::default(), &cfg(120, 20));
        assert!(chunks.len() >= 2);
        assert_eq!(chunks[0].metadata.page, Some(1));
        assert_eq!(chunks.last().unwrap().metadata.page, Some(2));
    }

    #[test]
    fn heading_detected_on_short_uppercase_first_line() {
        let text = "Installation Guide\nFollow these steps to install.";
        let chunks = chunk_text(text, &Metadata::default(), &cfg(800, 150));
        assert_eq!(
            chunks[0].metadata.heading.as_deref(),
            Some("Installation Guide")
        );

        let lower = "installation guide\nsteps follow.";
        let chunks = chunk_text(lower, &Metadata::default(), &cfg(800, 150));
        assert!(chunks[0].metadata.heading.is_none());
    }

    #[test]
    fn document_fields_propagate() {
        let mut doc = Metadata::default();
        doc.framework = Some("axum".to_string());
        doc.last_verified = Some("2026-01-01".to_string());

        let chunks = chunk_text("Some content here.", &doc, &cfg(800, 150));
        assert_eq!(chunks[0].metadata.framework.as_deref(), Some("axum"));
        assert_eq!(
            chunks[0].metadata.last_verified.as_deref(),
            Some("2026-01-01")
        );
    }
}
