//! Sentence-boundary text chunker.
//!
//! Joins extracted units into one logical stream and splits it into chunks
//! that respect a `max_tokens` budget without breaking sentences where
//! avoidable. Adjacent chunks can share trailing sentences (`overlap_tokens`)
//! so context survives the cut.
//!
//! Chunking is deterministic: identical input and settings always produce
//! identical chunks with contiguous indices starting at 0.

use crate::models::ExtractedUnit;

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// A chunk of text with its position in the document.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub index: i64,
    pub text: String,
}

/// Chunk the joined text of all extracted units.
pub fn chunk_units(
    units: &[ExtractedUnit],
    max_tokens: usize,
    overlap_tokens: usize,
) -> Vec<TextChunk> {
    let joined = units
        .iter()
        .map(|u| u.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    chunk_text(&joined, max_tokens, overlap_tokens)
}

/// Split text into chunks on sentence boundaries, respecting max_tokens.
/// Returns chunks with contiguous indices starting at 0; never empty.
pub fn chunk_text(text: &str, max_tokens: usize, overlap_tokens: usize) -> Vec<TextChunk> {
    let max_chars = max_tokens * CHARS_PER_TOKEN;
    let overlap_chars = overlap_tokens * CHARS_PER_TOKEN;

    let trimmed = text.trim();
    if trimmed.is_empty() {
        return vec![TextChunk {
            index: 0,
            text: String::new(),
        }];
    }

    let sentences = split_sentences(trimmed);
    let mut chunks: Vec<TextChunk> = Vec::new();
    // Sentences accumulated for the current chunk
    let mut current: Vec<String> = Vec::new();
    let mut current_len = 0usize;

    let mut flush = |current: &mut Vec<String>, current_len: &mut usize, chunks: &mut Vec<TextChunk>| {
        if current.is_empty() {
            return;
        }
        let text = current.join(" ");
        chunks.push(TextChunk {
            index: chunks.len() as i64,
            text,
        });

        // Carry trailing sentences into the next chunk as overlap. Never
        // carry the whole chunk, or we would stop making progress.
        let mut carry: Vec<String> = Vec::new();
        let mut carry_len = 0usize;
        for s in current.iter().rev() {
            if carry_len + s.len() > overlap_chars || carry.len() + 1 == current.len() {
                break;
            }
            carry_len += s.len() + 1;
            carry.push(s.clone());
        }
        carry.reverse();
        *current_len = carry.iter().map(|s| s.len() + 1).sum();
        *current = carry;
    };

    for sentence in sentences {
        // A single oversized sentence gets hard-split at word boundaries
        if sentence.len() > max_chars {
            flush(&mut current, &mut current_len, &mut chunks);
            current.clear();
            current_len = 0;
            for piece in hard_split(sentence, max_chars) {
                chunks.push(TextChunk {
                    index: chunks.len() as i64,
                    text: piece.to_string(),
                });
            }
            continue;
        }

        let would_be = if current.is_empty() {
            sentence.len()
        } else {
            current_len + 1 + sentence.len()
        };

        if would_be > max_chars && !current.is_empty() {
            flush(&mut current, &mut current_len, &mut chunks);
        }

        current_len += if current.is_empty() {
            sentence.len()
        } else {
            1 + sentence.len()
        };
        current.push(sentence.to_string());
    }

    if !current.is_empty() {
        let text = current.join(" ");
        // Skip a final chunk that is pure overlap carry-over
        if chunks.last().map(|c| !c.text.ends_with(&text)).unwrap_or(true) {
            chunks.push(TextChunk {
                index: chunks.len() as i64,
                text,
            });
        }
    }

    if chunks.is_empty() {
        chunks.push(TextChunk {
            index: 0,
            text: trimmed.to_string(),
        });
    }

    chunks
}

/// Split text into sentences. A sentence ends after `.`, `!`, or `?`
/// followed by whitespace, or at a newline. Whitespace-only pieces are
/// dropped.
fn split_sentences(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut sentences = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;

    while i < bytes.len() {
        let b = bytes[i];
        let ends_here = match b {
            b'.' | b'!' | b'?' => {
                i + 1 >= bytes.len() || bytes[i + 1].is_ascii_whitespace()
            }
            b'\n' => true,
            _ => false,
        };
        if ends_here {
            let piece = text[start..=i].trim();
            if !piece.is_empty() {
                sentences.push(piece);
            }
            start = i + 1;
        }
        i += 1;
    }

    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

/// Hard-split an oversized sentence at word boundaries within max_chars.
fn hard_split(sentence: &str, max_chars: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut remaining = sentence;
    while !remaining.is_empty() {
        if remaining.len() <= max_chars {
            pieces.push(remaining.trim());
            break;
        }
        // Stay on a char boundary, prefer a space
        let mut split_at = max_chars;
        while !remaining.is_char_boundary(split_at) {
            split_at -= 1;
        }
        let actual = remaining[..split_at]
            .rfind(' ')
            .map(|pos| pos + 1)
            .unwrap_or(split_at);
        let piece = remaining[..actual].trim();
        if !piece.is_empty() {
            pieces.push(piece);
        }
        remaining = &remaining[actual..];
    }
    pieces
}
