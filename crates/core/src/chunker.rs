//! Chunker
//!
//! Splits a generated module body into bounded [`ModuleChunk`]s for
//! incremental delivery. Cuts land on a paragraph break when one exists near
//! the size limit, otherwise on a sentence end, and only as a last resort in
//! the middle of the text.

use crate::course::ModuleChunk;

/// Default upper bound on a chunk, in characters.
pub const DEFAULT_MAX_CHARS: usize = 2000;
/// Default distance before the limit within which a natural boundary is preferred.
pub const DEFAULT_BOUNDARY_WINDOW: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunker {
    max_chars: usize,
    boundary_window: usize,
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHARS, DEFAULT_BOUNDARY_WINDOW)
    }
}

impl Chunker {
    /// A zero limit is bumped to one character; the window never exceeds the limit.
    pub fn new(max_chars: usize, boundary_window: usize) -> Self {
        let max_chars = max_chars.max(1);
        Self {
            max_chars,
            boundary_window: boundary_window.min(max_chars - 1),
        }
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    /// Line endings unified to `\n` and trailing whitespace dropped.
    ///
    /// Applied once to the whole body before splitting, so chunks always
    /// concatenate back to `normalize(text)`.
    pub fn normalize(text: &str) -> String {
        text.replace("\r\n", "\n").trim_end().to_string()
    }

    pub fn split(&self, text: &str) -> Vec<ModuleChunk> {
        let text = Self::normalize(text);
        let pieces = self.pieces(&text);
        let total = pieces.len();
        pieces
            .into_iter()
            .enumerate()
            .map(|(order, piece)| ModuleChunk::new(piece.to_string(), order, total))
            .collect()
    }

    fn pieces<'a>(&self, text: &'a str) -> Vec<&'a str> {
        let mut pieces = Vec::new();
        let mut rest = text;
        while !rest.is_empty() {
            let Some((limit, _)) = rest.char_indices().nth(self.max_chars) else {
                pieces.push(rest);
                break;
            };
            let window_start = rest
                .char_indices()
                .nth(self.max_chars - self.boundary_window)
                .map(|(at, _)| at)
                .unwrap_or(0);
            let cut = boundary_in(&rest[..limit], window_start).unwrap_or(limit);
            let (piece, tail) = rest.split_at(cut);
            pieces.push(piece);
            rest = tail;
        }
        pieces
    }
}

/// Byte offset just past the last natural boundary in `region` at or after
/// `window_start`.
fn boundary_in(region: &str, window_start: usize) -> Option<usize> {
    let window = &region[window_start..];
    if let Some(at) = window.rfind("\n\n") {
        return Some(window_start + at + 2);
    }

    let bytes = window.as_bytes();
    (0..bytes.len().saturating_sub(1))
        .rev()
        .find(|&i| matches!(bytes[i], b'.' | b'!' | b'?') && bytes[i + 1].is_ascii_whitespace())
        .map(|i| window_start + i + 2)
}
