//! Recursive, overlapping text chunker.
//!
//! Text is split at the coarsest separator that occurs in it (paragraph,
//! line, sentence, word, then single characters). Pieces that still exceed
//! `chunk_size` are split again with the next finer separator. Adjacent
//! small pieces are merged back into chunks of at most `chunk_size`
//! characters, carrying up to `chunk_overlap` characters of the previous
//! chunk's tail into the next one.
//!
//! Lengths are counted in `char`s. Chunking is pure and deterministic, and
//! never merges text from two different documents.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::config::{validate_chunking, ChunkingConfig};
use crate::error::ConfigError;
use crate::models::{Chunk, RawDocument};

/// A split point and the text used to glue pieces back together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Separator {
    pub split_on: &'static str,
    pub join_with: &'static str,
    /// Text kept at the end of every piece but the last (sentence punctuation).
    pub keep_suffix: &'static str,
}

impl Separator {
    const fn plain(s: &'static str) -> Self {
        Self {
            split_on: s,
            join_with: s,
            keep_suffix: "",
        }
    }
}

/// Paragraph, line, sentence, word, character.
pub const DEFAULT_SEPARATORS: &[Separator] = &[
    Separator::plain("\n\n"),
    Separator::plain("\n"),
    Separator {
        split_on: ". ",
        join_with: " ",
        keep_suffix: ".",
    },
    Separator::plain(" "),
    Separator::plain(""),
];

#[derive(Debug, Clone)]
pub struct ChunkSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: &'static [Separator],
}

impl ChunkSplitter {
    /// Fails fast when `chunk_overlap >= chunk_size` or `chunk_size == 0`.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self, ConfigError> {
        validate_chunking(&ChunkingConfig {
            chunk_size,
            chunk_overlap,
        })?;
        Ok(Self {
            chunk_size,
            chunk_overlap,
            separators: DEFAULT_SEPARATORS,
        })
    }

    pub fn from_config(config: &ChunkingConfig) -> Result<Self, ConfigError> {
        Self::new(config.chunk_size, config.chunk_overlap)
    }

    /// Use a custom separator list. Without a trailing `""` separator a
    /// single unsplittable unit may exceed `chunk_size`.
    pub fn with_separators(mut self, separators: &'static [Separator]) -> Self {
        self.separators = separators;
        self
    }

    /// Split every document into chunks.
    ///
    /// `sequence_index` counts from 0 per source path, in input order.
    /// Documents from one file arrive together and in parser order, so the
    /// numbering follows document order regardless of which file finished
    /// parsing first.
    pub fn split(&self, documents: &[RawDocument]) -> Vec<Chunk> {
        let mut next_index: HashMap<&str, usize> = HashMap::new();
        let mut chunks = Vec::new();

        for doc in documents {
            let counter = next_index.entry(doc.source_path.as_str()).or_insert(0);
            for text in self.split_text(&doc.text) {
                chunks.push(make_chunk(doc, *counter, text));
                *counter += 1;
            }
        }
        chunks
    }

    /// Split a single text into bounded, overlapping pieces.
    pub fn split_text(&self, text: &str) -> Vec<String> {
        self.split_recursive(text, self.separators)
    }

    fn split_recursive(&self, text: &str, separators: &[Separator]) -> Vec<String> {
        let Some(position) = separators
            .iter()
            .position(|s| s.split_on.is_empty() || text.contains(s.split_on))
        else {
            // No separator applies: the text is one atomic unit.
            let piece = text.trim();
            return if piece.is_empty() {
                Vec::new()
            } else {
                vec![piece.to_string()]
            };
        };
        let separator = separators[position];
        let finer = &separators[position + 1..];

        let mut out = Vec::new();
        let mut pending: Vec<String> = Vec::new();
        for piece in split_on(text, &separator) {
            if char_len(&piece) < self.chunk_size {
                pending.push(piece);
                continue;
            }
            if !pending.is_empty() {
                out.extend(self.merge(&pending, separator.join_with));
                pending.clear();
            }
            if finer.is_empty() {
                out.push(piece);
            } else {
                out.extend(self.split_recursive(&piece, finer));
            }
        }
        if !pending.is_empty() {
            out.extend(self.merge(&pending, separator.join_with));
        }
        out
    }

    /// Greedily pack `pieces` into chunks, keeping an overlapping tail.
    fn merge(&self, pieces: &[String], join_with: &str) -> Vec<String> {
        let sep_len = char_len(join_with);
        let mut chunks = Vec::new();
        let mut window: Vec<(&str, usize)> = Vec::new();
        // Length of window joined with separators.
        let mut total = 0usize;

        for piece in pieces {
            let len = char_len(piece);
            let joiner = if window.is_empty() { 0 } else { sep_len };
            if total + joiner + len > self.chunk_size && !window.is_empty() {
                push_joined(&mut chunks, &window, join_with);
                // Drop from the front until the tail fits the overlap budget
                // and leaves room for the incoming piece.
                while !window.is_empty()
                    && (total > self.chunk_overlap
                        || total + sep_len + len > self.chunk_size)
                {
                    let (_, first_len) = window.remove(0);
                    total -= first_len + if window.is_empty() { 0 } else { sep_len };
                }
            }
            let joiner = if window.is_empty() { 0 } else { sep_len };
            window.push((piece.as_str(), len));
            total += len + joiner;
        }
        push_joined(&mut chunks, &window, join_with);
        chunks
    }
}

fn push_joined(chunks: &mut Vec<String>, window: &[(&str, usize)], join_with: &str) {
    let joined = window
        .iter()
        .map(|(s, _)| *s)
        .collect::<Vec<_>>()
        .join(join_with);
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}

/// Split `text` on `separator`, dropping empty pieces. The empty separator
/// yields single characters.
fn split_on(text: &str, separator: &Separator) -> Vec<String> {
    if separator.split_on.is_empty() {
        return text.chars().map(String::from).collect();
    }
    let parts: Vec<&str> = text.split(separator.split_on).collect();
    let last = parts.len().saturating_sub(1);
    parts
        .into_iter()
        .enumerate()
        .map(|(i, part)| {
            if i < last && !separator.keep_suffix.is_empty() {
                format!("{}{}", part, separator.keep_suffix)
            } else {
                part.to_string()
            }
        })
        .filter(|part| !part.is_empty())
        .collect()
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn make_chunk(doc: &RawDocument, index: usize, text: String) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        text,
        source_path: doc.source_path.clone(),
        metadata: doc.metadata.clone(),
        sequence_index: index,
        hash,
    }
}
