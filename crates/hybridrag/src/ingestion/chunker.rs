//! Overlapping window chunker with structure-aware boundaries
//!
//! The chunker walks the text with a target window, cuts at the strongest
//! natural boundary found in the second half of the window (paragraph break,
//! then sentence end, then any newline, then a hard cut), and prepends the
//! nearest preceding section heading so that structural context survives
//! chunk boundaries.

use regex::Regex;

use crate::config::ChunkingConfig;
use crate::types::Chunk;

/// Text chunker with configurable size and overlap
pub struct Chunker {
    chunk_size: usize,
    overlap: usize,
    max_heading_len: usize,
    heading_scan_chars: usize,
    numbered_heading: Regex,
}

impl Chunker {
    pub fn new(config: &ChunkingConfig) -> Self {
        let overlap = config.overlap.min(config.chunk_size.saturating_sub(1));
        Self {
            chunk_size: config.chunk_size.max(1),
            overlap,
            max_heading_len: config.max_heading_len,
            heading_scan_chars: config.heading_scan_chars,
            numbered_heading: Regex::new(r"^\d+(\.\d+)*\s").expect("static regex"),
        }
    }

    /// Chunk a text block. `base_offset` is the byte offset of `text` within
    /// the full document; `base_seq` continues the sequence numbering across
    /// blocks. Chunks never cross block (or file) boundaries.
    pub fn chunk_text(
        &self,
        source: &str,
        text: &str,
        base_offset: usize,
        base_seq: u32,
    ) -> Vec<Chunk> {
        if text.is_empty() {
            return Vec::new();
        }

        // Char-boundary byte offsets; position i in this table is the i-th
        // character, so windows count characters, not bytes.
        let mut bounds: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
        bounds.push(text.len());
        let n_chars = bounds.len() - 1;

        let mut chunks = Vec::new();
        let mut pos = 0usize;
        let mut seq = base_seq;

        while pos < n_chars {
            let end_limit = (pos + self.chunk_size).min(n_chars);
            let cut = if end_limit == n_chars {
                n_chars
            } else {
                self.find_cut(text, &bounds, pos, end_limit)
            };

            let byte_start = bounds[pos];
            let byte_end = bounds[cut];
            let payload = text[byte_start..byte_end].to_string();

            let mut chunk = Chunk::new(
                source,
                seq,
                base_offset + byte_start,
                base_offset + byte_end,
                payload,
            );
            if let Some(heading) = self.find_heading(text, byte_start) {
                chunk = chunk.with_heading(heading);
            }
            chunks.push(chunk);
            seq += 1;

            if cut == n_chars {
                break;
            }
            // Step back by the overlap from the actual cut; always advance.
            let next = cut.saturating_sub(self.overlap);
            pos = if next > pos { next } else { cut };
        }

        chunks
    }

    /// Pick the cut position (char index) inside [pos, end_limit]
    fn find_cut(&self, text: &str, bounds: &[usize], pos: usize, end_limit: usize) -> usize {
        let half = pos + (end_limit - pos) / 2;
        let search_start = bounds[half];
        let search_end = bounds[end_limit];
        let window = &text[search_start..search_end];

        // Paragraph break: cut after the blank line.
        if let Some(found) = window.rfind("\n\n") {
            return byte_to_char(bounds, search_start + found + 2);
        }

        // Sentence terminator followed by whitespace: cut after the space.
        let sentence = window
            .char_indices()
            .filter(|&(_, c)| matches!(c, '.' | '!' | '?'))
            .filter_map(|(i, c)| {
                let after = i + c.len_utf8();
                window[after..]
                    .chars()
                    .next()
                    .filter(|next| next.is_whitespace())
                    .map(|next| after + next.len_utf8())
            })
            .last();
        if let Some(found) = sentence {
            return byte_to_char(bounds, search_start + found);
        }

        // Any newline.
        if let Some(found) = window.rfind('\n') {
            return byte_to_char(bounds, search_start + found + 1);
        }

        // Hard cut.
        end_limit
    }

    /// Scan backward from `byte_start` for the nearest heading line
    fn find_heading(&self, text: &str, byte_start: usize) -> Option<String> {
        if byte_start == 0 {
            return None;
        }
        let mut scan_from = byte_start.saturating_sub(self.heading_scan_chars);
        while scan_from > 0 && !text.is_char_boundary(scan_from) {
            scan_from -= 1;
        }
        let region = &text[scan_from..byte_start];

        for line in region.lines().rev() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.chars().count() > self.max_heading_len {
                continue;
            }
            if self.is_heading(trimmed) {
                return Some(trimmed.to_string());
            }
        }
        None
    }

    fn is_heading(&self, line: &str) -> bool {
        if self.numbered_heading.is_match(line) {
            return true;
        }
        if line.ends_with(':') {
            return true;
        }
        // All-uppercase line with at least one letter.
        let mut has_alpha = false;
        for c in line.chars() {
            if c.is_alphabetic() {
                has_alpha = true;
                if c.is_lowercase() {
                    return false;
                }
            }
        }
        has_alpha
    }
}

fn byte_to_char(bounds: &[usize], byte: usize) -> usize {
    match bounds.binary_search(&byte) {
        Ok(i) => i,
        Err(i) => i - 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker() -> Chunker {
        Chunker::new(&ChunkingConfig::default())
    }

    fn small_chunker(size: usize, overlap: usize) -> Chunker {
        Chunker::new(&ChunkingConfig {
            chunk_size: size,
            overlap,
            ..Default::default()
        })
    }

    #[test]
    fn empty_input_emits_no_chunks() {
        assert!(chunker().chunk_text("a.txt", "", 0, 0).is_empty());
    }

    #[test]
    fn single_character_emits_one_chunk() {
        let chunks = chunker().chunk_text("a.txt", "x", 0, 0);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "x");
        assert_eq!((chunks[0].start, chunks[0].end), (0, 1));
    }

    #[test]
    fn text_just_under_window_is_one_chunk() {
        let text = "a".repeat(1199);
        let chunks = chunker().chunk_text("a.txt", &text, 0, 0);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn text_just_over_window_is_two_overlapping_chunks() {
        let text = "a".repeat(1201);
        let chunks = chunker().chunk_text("a.txt", &text, 0, 0);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].end, 1200);
        assert_eq!(chunks[1].start, 1000);
        assert_eq!(chunks[1].end, 1201);
        // Overlap region is shared verbatim.
        assert_eq!(&chunks[0].text[1000..], &chunks[1].text[..200]);
    }

    #[test]
    fn paragraph_break_beats_hard_cut() {
        let mut text = String::new();
        text.push_str(&"alpha ".repeat(120)); // ~720 chars
        text.push_str("\n\n");
        text.push_str(&"bravo ".repeat(200));
        let chunks = chunker().chunk_text("a.txt", &text, 0, 0);

        assert!(chunks.len() >= 2);
        // First chunk ends right after the paragraph break.
        assert!(chunks[0].text.ends_with("\n\n"));
        assert!(!chunks[0].text.contains("bravo"));
    }

    #[test]
    fn sentence_boundary_preferred_over_mid_word() {
        let mut text = String::new();
        text.push_str(&"w".repeat(700));
        text.push_str(". ");
        text.push_str(&"v".repeat(900));
        let chunks = small_chunker(1000, 100).chunk_text("a.txt", &text, 0, 0);

        assert!(chunks[0].text.ends_with(". "));
    }

    #[test]
    fn heading_is_prepended_from_backward_scan() {
        let mut text = String::new();
        text.push_str("2.1 Antenna Tuning\n");
        text.push_str(&"body ".repeat(400));
        let chunks = chunker().chunk_text("doc.txt", &text, 0, 0);

        assert!(chunks.len() >= 2);
        // The first chunk has no preceding heading; later ones do.
        assert!(chunks[0].heading.is_none());
        assert_eq!(chunks[1].heading.as_deref(), Some("2.1 Antenna Tuning"));
        assert!(chunks[1].text.starts_with("[SECTION] 2.1 Antenna Tuning\n"));
    }

    #[test]
    fn uppercase_and_colon_lines_count_as_headings() {
        let c = chunker();
        assert!(c.is_heading("PROPAGATION TABLES"));
        assert!(c.is_heading("Measured results:"));
        assert!(c.is_heading("3.4.1 Filters"));
        assert!(!c.is_heading("plain prose line"));
    }

    #[test]
    fn chunking_is_deterministic() {
        let text = format!(
            "INTRO\n{}\n\n{}",
            "first part. ".repeat(100),
            "second part. ".repeat(100)
        );
        let a = chunker().chunk_text("a.txt", &text, 0, 0);
        let b = chunker().chunk_text("a.txt", &text, 0, 0);

        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.id, y.id);
            assert_eq!(x.text, y.text);
        }
    }

    #[test]
    fn block_offsets_carry_into_ranges_and_sequence() {
        let text = "short block";
        let chunks = chunker().chunk_text("a.txt", text, 5000, 7);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start, 5000);
        assert_eq!(chunks[0].end, 5000 + text.len());
        assert_eq!(chunks[0].seq_index, 7);
    }

    #[test]
    fn multibyte_text_never_splits_a_character() {
        let text = "é".repeat(2500);
        let chunks = chunker().chunk_text("a.txt", &text, 0, 0);
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            // Every payload is valid UTF-8 by construction; check the ranges
            // land on character boundaries of the original text.
            assert!(text.is_char_boundary(chunk.start));
            assert!(text.is_char_boundary(chunk.end));
        }
    }
}
