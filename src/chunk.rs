//! Overlapping fixed-window text chunker.
//!
//! Splits loader-produced document text into [`Chunk`]s of at most
//! `chunk_chars` characters. Adjacent chunks share `overlap_chars` of text so
//! evidence sitting on a window boundary is still retrievable as one piece.
//! Windows prefer to break at whitespace near the boundary rather than
//! mid-word.

use uuid::Uuid;

use crate::models::Chunk;

/// Split text into overlapping windows. Ordinals are contiguous from 0.
/// Whitespace-only input produces no chunks.
pub fn chunk_text(document_id: &str, text: &str, chunk_chars: usize, overlap_chars: usize) -> Vec<Chunk> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    // Work on char boundaries; byte slicing would split multi-byte characters.
    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut ordinal: i64 = 0;

    while start < chars.len() {
        let hard_end = (start + chunk_chars).min(chars.len());

        // Prefer a whitespace break in the tail quarter of the window.
        let end = if hard_end < chars.len() {
            let search_from = start + (chunk_chars * 3) / 4;
            chars[search_from..hard_end]
                .iter()
                .rposition(|c| c.is_whitespace())
                .map(|pos| search_from + pos + 1)
                .unwrap_or(hard_end)
        } else {
            hard_end
        };

        let piece: String = chars[start..end].iter().collect();
        let trimmed = piece.trim();
        if !trimmed.is_empty() {
            chunks.push(make_chunk(document_id, ordinal, trimmed));
            ordinal += 1;
        }

        if end == chars.len() {
            break;
        }
        // Step back by the overlap, but always move forward.
        start = end.saturating_sub(overlap_chars).max(start + 1);
    }

    chunks
}

fn make_chunk(document_id: &str, ordinal: i64, text: &str) -> Chunk {
    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        ordinal,
        text: text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_text_single_chunk() {
        let chunks = chunk_text("doc1", "Hello, world!", 1000, 100);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].ordinal, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
    }

    #[test]
    fn empty_text_no_chunks() {
        assert!(chunk_text("doc1", "", 1000, 100).is_empty());
        assert!(chunk_text("doc1", "   \n\t  ", 1000, 100).is_empty());
    }

    #[test]
    fn long_text_splits_with_contiguous_ordinals() {
        let text = "word ".repeat(500);
        let chunks = chunk_text("doc1", &text, 200, 20);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.ordinal, i as i64, "ordinal mismatch at {}", i);
            assert!(c.text.chars().count() <= 200);
        }
    }

    #[test]
    fn adjacent_chunks_overlap() {
        let text = "alpha beta gamma delta ".repeat(100);
        let chunks = chunk_text("doc1", &text, 120, 40);
        assert!(chunks.len() > 2);
        for pair in chunks.windows(2) {
            // The tail of each chunk reappears at the head of the next.
            let tail: String = pair[0].text.chars().rev().take(10).collect::<String>()
                .chars().rev().collect();
            assert!(
                pair[1].text.contains(tail.trim()),
                "no overlap between consecutive chunks"
            );
        }
    }

    #[test]
    fn breaks_at_whitespace_not_mid_word() {
        let text = "supercalifragilistic expialidocious ".repeat(50);
        let chunks = chunk_text("doc1", &text, 100, 10);
        for c in &chunks[..chunks.len() - 1] {
            assert!(
                !c.text.ends_with("supercalifragilisti"),
                "chunk ends mid-word: {:?}",
                &c.text[c.text.len().saturating_sub(25)..]
            );
        }
    }

    #[test]
    fn multibyte_text_does_not_panic() {
        let text = "日本語のテキスト ".repeat(200);
        let chunks = chunk_text("doc1", &text, 50, 10);
        assert!(!chunks.is_empty());
        for c in &chunks {
            assert!(c.text.chars().count() <= 50);
        }
    }

    #[test]
    fn deterministic_texts() {
        let text = "Alpha beta gamma delta epsilon. ".repeat(80);
        let a = chunk_text("doc1", &text, 150, 30);
        let b = chunk_text("doc1", &text, 150, 30);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.text, y.text);
            assert_eq!(x.ordinal, y.ordinal);
        }
    }
}
