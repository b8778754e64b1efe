//! Paragraph-boundary text chunker.
//!
//! Splits extracted document text into [`Chunk`]s no longer than roughly
//! `max_tokens`. Splits happen on blank lines first; an oversized paragraph
//! is cut at the last newline or space before the limit.
//!
//! Drawings are often pure vector or raster content, so empty text yields
//! no chunks. The document row is still stored and stays resolvable.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Chunk;

/// Rough chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Split text into chunks on paragraph boundaries, respecting max_tokens.
/// Indices are contiguous from 0.
pub fn chunk_text(document_id: &str, text: &str, max_tokens: usize) -> Vec<Chunk> {
    let max_chars = (max_tokens * CHARS_PER_TOKEN).max(1);
    let mut pieces: Vec<String> = Vec::new();
    let mut current = String::new();

    for para in text.split("\n\n") {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }

        let joined_len = if current.is_empty() {
            para.len()
        } else {
            current.len() + 2 + para.len()
        };
        if joined_len > max_chars && !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
        }

        if para.len() > max_chars {
            let mut rest = para;
            while !rest.is_empty() {
                let cut = split_point(rest, max_chars);
                let piece = rest[..cut].trim();
                if !piece.is_empty() {
                    pieces.push(piece.to_string());
                }
                rest = &rest[cut..];
            }
        } else {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(para);
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }

    pieces
        .iter()
        .enumerate()
        .map(|(i, piece)| make_chunk(document_id, i as i64, piece))
        .collect()
}

/// Byte offset to cut `s` at: the last newline or space before `max_chars`,
/// else the nearest char boundary at or below it. Always > 0.
fn split_point(s: &str, max_chars: usize) -> usize {
    if s.len() <= max_chars {
        return s.len();
    }
    let mut limit = max_chars;
    while limit > 0 && !s.is_char_boundary(limit) {
        limit -= 1;
    }
    if limit == 0 {
        // a single char wider than the limit
        return s.chars().next().map(|c| c.len_utf8()).unwrap_or(s.len());
    }
    s[..limit]
        .rfind('\n')
        .or_else(|| s[..limit].rfind(' '))
        .map(|pos| pos + 1)
        .unwrap_or(limit)
}

fn make_chunk(document_id: &str, index: i64, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        hash,
    }
}
