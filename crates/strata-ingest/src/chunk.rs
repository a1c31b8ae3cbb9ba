//! Boundary-aware chunking of message text for embedding generation.
//!
//! Long message bodies are split into overlapping windows sized for the
//! embedding model. Cuts prefer a sentence boundary near the window end,
//! then a word boundary, and fall back to a hard cut only when the
//! window tail contains neither.
//!
//! # Example
//!
//! ```rust,ignore
//! use strata_ingest::chunk::{BoundaryChunker, ChunkerConfig};
//!
//! let chunker = BoundaryChunker::new(ChunkerConfig::default());
//! for chunk in chunker.chunk("Your text here.") {
//!     println!("[{}] {}..{}", chunk.chunk_index, chunk.start_offset, chunk.end_offset);
//! }
//! ```

use strata_core::defaults;

/// Configuration for the chunker. Sizes and offsets are bytes; cut
/// positions are always snapped to UTF-8 character boundaries.
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Maximum size of a chunk.
    pub chunk_size: usize,
    /// Bytes of context carried over between consecutive chunks.
    pub overlap: usize,
    /// Fraction of the window in which boundary cuts are considered;
    /// `0.8` means only the last 20% of the window is searched.
    pub boundary_zone: f64,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: defaults::CHUNK_SIZE,
            overlap: defaults::CHUNK_OVERLAP,
            boundary_zone: defaults::CHUNK_BOUNDARY_ZONE,
        }
    }
}

/// A slice of the source text destined for one embedding.
///
/// Offsets locate the trimmed content in the original text, so
/// `&source[start_offset..end_offset] == content` always holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 0-based position within the parent text, monotonic.
    pub chunk_index: usize,
    pub content: String,
    pub start_offset: usize,
    pub end_offset: usize,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// Find UTF-8 safe boundary at or before the given position.
fn find_char_boundary_before(text: &str, mut pos: usize) -> usize {
    while pos > 0 && !text.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

/// Sliding-window chunker that cuts at sentence or word boundaries in
/// the window tail when one exists.
#[derive(Debug, Clone)]
pub struct BoundaryChunker {
    config: ChunkerConfig,
}

impl BoundaryChunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(ChunkerConfig::default())
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Split `text` into chunks. Deterministic; whitespace-only slices
    /// are dropped without consuming an index.
    pub fn chunk(&self, text: &str) -> Vec<Chunk> {
        let mut chunks = Vec::new();

        if text.trim().is_empty() {
            return chunks;
        }

        if text.len() <= self.config.chunk_size {
            push_trimmed(&mut chunks, text, 0, text.len());
            return chunks;
        }

        let mut start = 0;
        while start < text.len() {
            let window_end = start + self.config.chunk_size;

            if window_end >= text.len() {
                push_trimmed(&mut chunks, text, start, text.len());
                break;
            }

            let window_end = find_char_boundary_before(text, window_end);
            let cut = self.find_cut(text, start, window_end);
            push_trimmed(&mut chunks, text, start, cut);

            start = find_char_boundary_before(text, cut.saturating_sub(self.config.overlap));
        }

        chunks
    }

    /// Pick the cut position for the window `[start, window_end)`.
    ///
    /// A sentence terminator or paragraph break in the boundary zone
    /// wins; failing that a space; failing both, the window edge.
    fn find_cut(&self, text: &str, start: usize, window_end: usize) -> usize {
        let zone_floor = start + (self.config.chunk_size as f64 * self.config.boundary_zone) as usize;
        let window = &text[start..window_end];

        let mut best: Option<usize> = None;
        if let Some(rel) = window.rfind("\n\n") {
            if start + rel > zone_floor {
                best = Some(start + rel + 2);
            }
        }
        if let Some(rel) = window.rfind(['.', '!', '?']) {
            if start + rel > zone_floor {
                let cut = start + rel + 1;
                best = Some(best.map_or(cut, |b| b.max(cut)));
            }
        }
        if let Some(cut) = best {
            return cut;
        }

        if let Some(rel) = window.rfind(' ') {
            if start + rel > zone_floor {
                return start + rel + 1;
            }
        }

        window_end
    }
}

/// Trim the slice `[start, end)` and append it as a chunk. Slices that
/// trim to nothing are skipped.
fn push_trimmed(chunks: &mut Vec<Chunk>, text: &str, start: usize, end: usize) {
    let slice = &text[start..end];
    let trimmed = slice.trim();
    if trimmed.is_empty() {
        return;
    }

    let lead = slice.len() - slice.trim_start().len();
    let trail = slice.len() - slice.trim_end().len();
    chunks.push(Chunk {
        chunk_index: chunks.len(),
        content: trimmed.to_string(),
        start_offset: start + lead,
        end_offset: end - trail,
    });
}

/// Chunk with the default configuration.
pub fn chunk_text(text: &str) -> Vec<Chunk> {
    BoundaryChunker::with_defaults().chunk(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Small sizes keep boundary behavior visible in test fixtures.
    fn small_config() -> ChunkerConfig {
        ChunkerConfig {
            chunk_size: 100,
            overlap: 10,
            boundary_zone: 0.8,
        }
    }

    fn small_chunker() -> BoundaryChunker {
        BoundaryChunker::new(small_config())
    }

    // ============================================================================
    // Short-circuit and empty-input behavior
    // ============================================================================

    #[test]
    fn test_empty_text() {
        assert!(small_chunker().chunk("").is_empty());
    }

    #[test]
    fn test_whitespace_only_text() {
        assert!(small_chunker().chunk("   \n\t  \n").is_empty());
    }

    #[test]
    fn test_short_text_single_chunk() {
        let chunks = small_chunker().chunk("A short message.");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].content, "A short message.");
        assert_eq!(chunks[0].start_offset, 0);
        assert_eq!(chunks[0].end_offset, 16);
    }

    #[test]
    fn test_short_text_is_trimmed() {
        let chunks = small_chunker().chunk("  padded  ");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "padded");
        assert_eq!(chunks[0].start_offset, 2);
        assert_eq!(chunks[0].end_offset, 8);
    }

    #[test]
    fn test_exactly_chunk_size_single_chunk() {
        let text = "a".repeat(100);
        let chunks = small_chunker().chunk(&text);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content.len(), 100);
    }

    #[test]
    fn test_default_config_short_circuit_below_limit() {
        let text = "a".repeat(2999);
        let chunks = chunk_text(&text);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content.len(), 2999);
    }

    #[test]
    fn test_default_config_splits_above_limit() {
        let text = "a".repeat(3001);
        let chunks = chunk_text(&text);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content.len(), 3000);
    }

    // ============================================================================
    // Boundary selection
    // ============================================================================

    #[test]
    fn test_cuts_at_sentence_terminator_in_zone() {
        // Terminator at byte 89, inside the last-20% zone [81, 100).
        let mut text = "b".repeat(89);
        text.push('.');
        text.push_str(&"c".repeat(60));
        let chunks = small_chunker().chunk(&text);

        assert!(chunks.len() >= 2);
        assert!(chunks[0].content.ends_with('.'));
        assert_eq!(chunks[0].end_offset, 90);
    }

    #[test]
    fn test_cuts_at_paragraph_break_in_zone() {
        let mut text = "b".repeat(90);
        text.push_str("\n\n");
        text.push_str(&"c".repeat(60));
        let chunks = small_chunker().chunk(&text);

        assert!(chunks.len() >= 2);
        // Paragraph whitespace is trimmed off the emitted chunk.
        assert_eq!(chunks[0].content, "b".repeat(90));
        assert_eq!(chunks[0].end_offset, 90);
        // Next window opens overlap bytes before the cut at 92.
        assert_eq!(chunks[1].start_offset, 82);
    }

    #[test]
    fn test_terminator_outside_zone_is_ignored() {
        // Terminator at byte 10 is far before the zone; no space either,
        // so the cut is the hard window edge.
        let mut text = "b".repeat(10);
        text.push('.');
        text.push_str(&"c".repeat(140));
        let chunks = small_chunker().chunk(&text);

        assert_eq!(chunks[0].content.len(), 100);
        assert!(!chunks[0].content.ends_with('.'));
    }

    #[test]
    fn test_falls_back_to_space_in_zone() {
        let mut text = "b".repeat(85);
        text.push(' ');
        text.push_str(&"c".repeat(70));
        let chunks = small_chunker().chunk(&text);

        assert!(chunks.len() >= 2);
        // Cut lands after the space; trim drops it from the content.
        assert_eq!(chunks[0].content, "b".repeat(85));
        assert_eq!(chunks[0].end_offset, 85);
    }

    #[test]
    fn test_hard_cut_when_no_boundary_exists() {
        let text = "x".repeat(250);
        let chunks = small_chunker().chunk(&text);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].content.len(), 100);
        assert_eq!(chunks[0].end_offset, 100);
        assert_eq!(chunks[1].start_offset, 90);
    }

    #[test]
    fn test_sentence_preferred_over_space() {
        // Both a space (at 84) and a terminator (at 94) in the zone;
        // the terminator wins.
        let mut text = "b".repeat(84);
        text.push(' ');
        text.push_str(&"d".repeat(9));
        text.push('.');
        text.push_str(&"c".repeat(60));
        let chunks = small_chunker().chunk(&text);

        assert!(chunks[0].content.ends_with('.'));
        assert_eq!(chunks[0].end_offset, 95);
    }

    // ============================================================================
    // Overlap and coverage
    // ============================================================================

    #[test]
    fn test_overlap_between_consecutive_chunks() {
        let text = "x".repeat(250);
        let chunks = small_chunker().chunk(&text);

        for pair in chunks.windows(2) {
            assert_eq!(pair[1].start_offset, pair[0].end_offset - 10);
        }
    }

    #[test]
    fn test_offsets_slice_back_to_content() {
        let text = "The first sentence here. ".repeat(12);
        let chunks = small_chunker().chunk(&text);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert_eq!(&text[chunk.start_offset..chunk.end_offset], chunk.content);
        }
    }

    #[test]
    fn test_coverage_has_no_gaps() {
        // Unbroken input means nothing is trimmed, so consecutive
        // chunks must tile the text with overlap and no gaps.
        let text = "y".repeat(500);
        let chunks = small_chunker().chunk(&text);

        assert_eq!(chunks[0].start_offset, 0);
        for pair in chunks.windows(2) {
            assert!(pair[1].start_offset <= pair[0].end_offset);
        }
        assert_eq!(chunks.last().unwrap().end_offset, 500);
    }

    #[test]
    fn test_indices_are_monotonic() {
        let text = "z".repeat(1000);
        let chunks = small_chunker().chunk(&text);

        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i);
        }
    }

    #[test]
    fn test_size_bound_holds_for_every_chunk() {
        let text = "Sentences of some length here. ".repeat(40);
        let chunks = small_chunker().chunk(&text);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.len() <= 100, "chunk exceeds max size: {}", chunk.len());
        }
    }

    // ============================================================================
    // UTF-8 safety and determinism
    // ============================================================================

    #[test]
    fn test_utf8_multibyte_no_panic() {
        // 3-byte chars force every window edge off a char boundary.
        let text = "日".repeat(120);
        let chunks = small_chunker().chunk(&text);

        assert!(!chunks.is_empty());
        for chunk in &chunks {
            assert!(text.is_char_boundary(chunk.start_offset));
            assert!(text.is_char_boundary(chunk.end_offset));
            assert_eq!(&text[chunk.start_offset..chunk.end_offset], chunk.content);
        }
    }

    #[test]
    fn test_utf8_mixed_content() {
        let text = "Hello 世界, this is mixed. ".repeat(20);
        let chunks = small_chunker().chunk(&text);

        for chunk in &chunks {
            assert!(std::str::from_utf8(chunk.content.as_bytes()).is_ok());
        }
    }

    #[test]
    fn test_deterministic() {
        let text = "First sentence. Second one! A third? ".repeat(15);
        let a = small_chunker().chunk(&text);
        let b = small_chunker().chunk(&text);
        assert_eq!(a, b);
    }

    #[test]
    fn test_progress_on_pathological_config() {
        // Boundary zone must leave more room than the overlap takes
        // back, or the window could stall. The default config holds
        // this; verify a long run terminates with advancing offsets.
        let text = "p".repeat(5000);
        let chunks = small_chunker().chunk(&text);

        let mut prev_start = None;
        for chunk in &chunks {
            if let Some(prev) = prev_start {
                assert!(chunk.start_offset > prev);
            }
            prev_start = Some(chunk.start_offset);
        }
    }
}
