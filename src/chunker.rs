//! Fixed-size overlapping window chunker.
//!
//! Splits extracted document text into windows of `size` characters where
//! each window after the first starts `size - overlap` characters into the
//! previous one. The last window may be shorter. Deterministic: the same
//! input always yields the same sequence.

use crate::error::{Error, Result};

/// Split `text` into overlapping windows.
///
/// Windows are measured in characters, sliced on UTF-8 boundaries.
/// Requires `overlap < size`.
///
/// # Errors
///
/// [`Error::EmptyInput`] if the text holds no non-whitespace characters.
pub fn split(text: &str, size: usize, overlap: usize) -> Result<Vec<String>> {
    debug_assert!(size > 0 && overlap < size);

    if text.trim().is_empty() {
        return Err(Error::EmptyInput);
    }

    // Byte offset of every char boundary, plus the end of the string.
    let bounds: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let char_count = bounds.len() - 1;

    let stride = size - overlap;
    let mut chunks = Vec::new();
    let mut start = 0usize;

    loop {
        let end = (start + size).min(char_count);
        chunks.push(text[bounds[start]..bounds[end]].to_string());
        if end == char_count {
            break;
        }
        start += stride;
    }

    Ok(chunks)
}
