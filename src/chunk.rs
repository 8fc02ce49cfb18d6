//! Recursive character text splitter.
//!
//! Splits extracted text into [`Chunk`]s no longer than `chunk_size`
//! characters, with up to `chunk_overlap` characters repeated between
//! neighbours. Splitting prefers paragraph breaks, then line breaks, then
//! spaces, and finally falls back to single characters.
//!
//! Separators are kept: each separator stays attached to the start of the
//! piece that follows it. Every chunk is a contiguous slice of the input and
//! consecutive chunks either overlap or abut, so the input text can be
//! rebuilt from the chunks.

use anyhow::{bail, Result};
use std::collections::VecDeque;
use std::ops::Range;

use crate::models::{Chunk, Metadata};

/// Separators tried in order, from coarsest to finest.
const DEFAULT_SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

#[derive(Debug, Clone)]
pub struct TextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: Vec<String>,
}

impl TextSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            bail!("chunk_size must be > 0");
        }
        if chunk_overlap >= chunk_size {
            bail!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                chunk_overlap,
                chunk_size
            );
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
            separators: DEFAULT_SEPARATORS.iter().map(|s| s.to_string()).collect(),
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }

    /// Split `text` and attach a copy of `metadata` to every chunk.
    pub fn split(&self, text: &str, metadata: &Metadata) -> Vec<Chunk> {
        self.split_text(text)
            .into_iter()
            .map(|text| Chunk {
                text,
                metadata: metadata.clone(),
            })
            .collect()
    }

    pub fn split_text(&self, text: &str) -> Vec<String> {
        self.split_spans(text)
            .into_iter()
            .map(|span| text[span].to_string())
            .collect()
    }

    /// Byte ranges of each chunk within `text`.
    pub fn split_spans(&self, text: &str) -> Vec<Range<usize>> {
        if text.is_empty() {
            return Vec::new();
        }
        self.split_range(text, 0..text.len(), &self.separators)
    }

    fn split_range(
        &self,
        text: &str,
        range: Range<usize>,
        separators: &[String],
    ) -> Vec<Range<usize>> {
        let slice = &text[range.clone()];

        let mut separator = separators.last().map(String::as_str).unwrap_or("");
        let mut finer: &[String] = &[];
        for (i, s) in separators.iter().enumerate() {
            if s.is_empty() {
                separator = "";
                break;
            }
            if slice.contains(s.as_str()) {
                separator = s;
                finer = &separators[i + 1..];
                break;
            }
        }

        let pieces = split_keep_separator(slice, separator)
            .into_iter()
            .map(|r| (r.start + range.start)..(r.end + range.start));

        let mut out = Vec::new();
        let mut fitting: Vec<Range<usize>> = Vec::new();

        for piece in pieces {
            if char_len(text, &piece) < self.chunk_size {
                fitting.push(piece);
                continue;
            }

            if !fitting.is_empty() {
                out.extend(self.merge(text, &fitting));
                fitting.clear();
            }
            if finer.is_empty() {
                out.push(piece);
            } else {
                out.extend(self.split_range(text, piece, finer));
            }
        }

        if !fitting.is_empty() {
            out.extend(self.merge(text, &fitting));
        }
        out
    }

    /// Greedily combine adjacent pieces into windows of at most `chunk_size`
    /// characters, carrying up to `chunk_overlap` characters into the next
    /// window.
    fn merge(&self, text: &str, pieces: &[Range<usize>]) -> Vec<Range<usize>> {
        let mut windows = Vec::new();
        let mut current: VecDeque<Range<usize>> = VecDeque::new();
        let mut total = 0usize;

        for piece in pieces {
            let len = char_len(text, piece);

            if total + len > self.chunk_size && !current.is_empty() {
                if let Some(window) = join(&current) {
                    windows.push(window);
                }
                while total > self.chunk_overlap
                    || (total + len > self.chunk_size && total > 0)
                {
                    match current.pop_front() {
                        Some(front) => total -= char_len(text, &front),
                        None => break,
                    }
                }
            }

            current.push_back(piece.clone());
            total += len;
        }

        if let Some(window) = join(&current) {
            windows.push(window);
        }
        windows
    }
}

/// The span covering `pieces`, which are contiguous and in order.
fn join(pieces: &VecDeque<Range<usize>>) -> Option<Range<usize>> {
    let start = pieces.front()?.start;
    let end = pieces.back()?.end;
    (start < end).then_some(start..end)
}

fn char_len(text: &str, range: &Range<usize>) -> usize {
    text[range.clone()].chars().count()
}

/// Split `text` before every occurrence of `separator`, keeping the
/// separator at the start of the following piece. An empty separator splits
/// into single characters.
fn split_keep_separator(text: &str, separator: &str) -> Vec<Range<usize>> {
    if separator.is_empty() {
        return text
            .char_indices()
            .map(|(i, c)| i..(i + c.len_utf8()))
            .collect();
    }

    let mut pieces = Vec::new();
    let mut start = 0;
    for (i, _) in text.char_indices().skip(1) {
        if text[i..].starts_with(separator) {
            pieces.push(start..i);
            start = i;
        }
    }
    if start < text.len() {
        pieces.push(start..text.len());
    }
    pieces
}
