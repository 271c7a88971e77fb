//! Text normalization and recursive character chunking.
//!
//! [`clean_text`] flattens extracted text: inline `|` delimiters become line
//! breaks and every whitespace run collapses to a single space.
//!
//! [`TextChunker`] splits normalized text into segments of at most `size`
//! characters with up to `overlap` characters of shared context between
//! neighbours.
//!
//! # Algorithm
//!
//! 1. Pick the first separator (coarsest first) that occurs in the text.
//! 2. Split on it, keeping each separator attached to the piece after it.
//! 3. Greedily merge pieces shorter than `size` into chunks; when a chunk is
//!    flushed, keep trailing pieces (≤ `overlap` chars) as the start of the
//!    next one.
//! 4. Pieces that are still `size` or longer recurse with the finer
//!    separators that follow; with none left they are cut into
//!    `size`-character windows.
//!
//! All lengths are measured in `char`s, so multi-byte text never splits
//! inside a code point.
//!
//! # Example
//!
//! ```rust
//! use ragline::chunk::{clean_text, TextChunker};
//!
//! let cleaned = clean_text("Hello   world");
//! assert_eq!(cleaned, "Hello world");
//! let chunks = TextChunker::default().chunk(&cleaned);
//! assert_eq!(chunks, vec!["Hello world".to_string()]);
//! ```

use std::collections::VecDeque;

use crate::config::ChunkingConfig;

/// Separators tried in order: paragraph, line, bullet markers, sentence stop, word.
pub const DEFAULT_SEPARATORS: &[&str] = &["\n\n", "\n", "•", "-", "|", ".", " "];

/// Normalize raw extracted text.
pub fn clean_text(text: &str) -> String {
    text.replace('|', "\n")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Recursive, overlap-aware character splitter.
#[derive(Debug, Clone)]
pub struct TextChunker {
    size: usize,
    overlap: usize,
    separators: Vec<String>,
}

impl Default for TextChunker {
    fn default() -> Self {
        Self::new(500, 100)
    }
}

impl TextChunker {
    /// Chunker with the default separator list. `overlap` is clamped below `size`.
    pub fn new(size: usize, overlap: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            overlap: overlap.min(size - 1),
            separators: DEFAULT_SEPARATORS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_separators(mut self, separators: Vec<String>) -> Self {
        self.separators = separators;
        self
    }

    pub fn from_config(config: &ChunkingConfig) -> Self {
        Self::new(config.size, config.overlap).with_separators(config.separators.clone())
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Split `text` into chunks. Empty input yields no chunks.
    pub fn chunk(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        self.split_recursive(text, &self.separators)
    }

    fn split_recursive(&self, text: &str, separators: &[String]) -> Vec<String> {
        let mut chosen: Option<(&str, &[String])> = None;
        for (i, sep) in separators.iter().enumerate() {
            if sep.is_empty() || text.contains(sep.as_str()) {
                chosen = Some((sep.as_str(), &separators[i + 1..]));
                break;
            }
        }

        let (separator, finer) = match chosen {
            Some(found) => found,
            None => return self.hard_split(text),
        };

        let pieces = split_keep_separator(text, separator);
        let mut chunks = Vec::new();
        let mut small: Vec<&str> = Vec::new();

        for piece in pieces {
            if char_len(piece) < self.size {
                small.push(piece);
                continue;
            }

            if !small.is_empty() {
                chunks.extend(self.merge_pieces(&small));
                small.clear();
            }
            if finer.is_empty() {
                chunks.extend(self.hard_split(piece));
            } else {
                chunks.extend(self.split_recursive(piece, finer));
            }
        }

        if !small.is_empty() {
            chunks.extend(self.merge_pieces(&small));
        }

        chunks
    }

    /// Greedy merge of pieces that each fit, carrying `overlap` chars forward.
    fn merge_pieces(&self, pieces: &[&str]) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut window: VecDeque<&str> = VecDeque::new();
        let mut total = 0usize;

        for &piece in pieces {
            let len = char_len(piece);

            if total + len > self.size && !window.is_empty() {
                push_joined(&mut chunks, &window);

                while total > self.overlap || (total + len > self.size && total > 0) {
                    match window.pop_front() {
                        Some(dropped) => total -= char_len(dropped),
                        None => break,
                    }
                }
            }

            window.push_back(piece);
            total += len;
        }

        push_joined(&mut chunks, &window);
        chunks
    }

    /// Fixed windows of `size` chars stepping by `size - overlap`.
    fn hard_split(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        let step = (self.size - self.overlap).max(1);
        let mut chunks = Vec::new();
        let mut start = 0;

        while start < chars.len() {
            let end = (start + self.size).min(chars.len());
            let window: String = chars[start..end].iter().collect();
            let trimmed = window.trim();
            if !trimmed.is_empty() {
                chunks.push(trimmed.to_string());
            }
            if end >= chars.len() {
                break;
            }
            start += step;
        }

        chunks
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Split on `separator`, attaching each occurrence to the following piece.
/// An empty separator splits into individual characters.
fn split_keep_separator<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    if separator.is_empty() {
        return text
            .char_indices()
            .map(|(i, c)| &text[i..i + c.len_utf8()])
            .collect();
    }

    let mut pieces = Vec::new();
    let mut last = 0;
    for (idx, _) in text.match_indices(separator) {
        if idx > last {
            pieces.push(&text[last..idx]);
        }
        last = idx;
    }
    if last < text.len() {
        pieces.push(&text[last..]);
    }
    pieces
}

fn push_joined(chunks: &mut Vec<String>, window: &VecDeque<&str>) {
    let joined: String = window.iter().copied().collect();
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}
