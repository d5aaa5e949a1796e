//! Prompt and citation formatting shared by every use case

use serde::{Deserialize, Serialize};

use super::models::{Citation, ContentChunk};

/// Length limits applied when rendering evidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatLimits {
    /// Characters kept per chunk; longer chunks are cut on a char boundary
    pub max_chunk_chars: Option<usize>,
    /// Characters for the whole evidence block; later chunks are dropped
    pub max_total_chars: Option<usize>,
    /// Characters of excerpt carried in each citation
    pub excerpt_chars: usize,
}

impl Default for FormatLimits {
    fn default() -> Self {
        Self {
            max_chunk_chars: None,
            max_total_chars: None,
            excerpt_chars: 160,
        }
    }
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Render chunks as labelled evidence: `[n] (Section: …)` then the content.
///
/// Labels are 1-based and follow the given order, which is also the order the
/// model cites them by.
pub fn format_chunks(chunks: &[ContentChunk], limits: &FormatLimits) -> String {
    let mut out = String::new();
    let mut total = 0usize;

    for (i, chunk) in chunks.iter().enumerate() {
        let body = match limits.max_chunk_chars {
            Some(max) => truncate_chars(&chunk.content, max),
            None => chunk.content.as_str(),
        };

        let mut header = format!("[{}]", i + 1);
        if let Some(section) = &chunk.section {
            header.push_str(&format!(" (Section: {})", section));
        }
        if let Some(page) = chunk.locator.page_number {
            header.push_str(&format!(" (Page {})", page));
        }

        let entry = format!("{}\n{}\n\n", header, body);
        let entry_chars = entry.chars().count();
        if let Some(max_total) = limits.max_total_chars {
            if total + entry_chars > max_total && total > 0 {
                break;
            }
        }
        total += entry_chars;
        out.push_str(&entry);
    }

    out.trim_end().to_string()
}

/// Map the model's `sources` entries onto the chunks it was shown.
///
/// Entries may be 1-based labels (`1`, `"[2]"`, `"3"`) or chunk ids. Unknown
/// entries are ignored and duplicates collapse to the first occurrence.
pub fn resolve_citations(
    sources: &[String],
    chunks: &[ContentChunk],
    limits: &FormatLimits,
) -> Vec<Citation> {
    let mut citations: Vec<Citation> = Vec::new();

    for source in sources {
        let trimmed = source.trim().trim_start_matches('[').trim_end_matches(']');
        let found = trimmed
            .parse::<usize>()
            .ok()
            .filter(|n| *n >= 1 && *n <= chunks.len())
            .map(|n| (n, &chunks[n - 1]))
            .or_else(|| {
                chunks
                    .iter()
                    .enumerate()
                    .find(|(_, c)| c.id == trimmed)
                    .map(|(i, c)| (i + 1, c))
            });

        if let Some((index, chunk)) = found {
            if citations.iter().any(|c| c.chunk_id == chunk.id) {
                continue;
            }
            citations.push(Citation {
                index,
                chunk_id: chunk.id.clone(),
                section: chunk.section.clone(),
                document_order_index: chunk.document_order_index,
                locator: chunk.locator.clone(),
                excerpt: truncate_chars(&chunk.content, limits.excerpt_chars).to_string(),
            });
        }
    }

    citations
}
