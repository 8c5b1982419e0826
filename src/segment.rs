//! Content segmentation: split extracted units into narration-sized segments.
//!
//! A text unit over the budget is cut only at sentence boundaries and the
//! sentences are packed greedily, so the number of runs is minimal and no
//! sentence is ever cut in half. A sentence that alone exceeds the budget is
//! kept whole as its own oversized run.
//!
//! Derived ids are `{parent}_{hash8}` where `hash8` is the first 8 hex chars
//! of the SHA-256 of the trimmed run, so unchanged text always gets the same
//! id and caches keyed by id or content stay interchangeable.

use crate::model::{Chapter, ContentUnit, Segment};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

/// Maximal run of sentence-terminal punctuation, ASCII and CJK.
static RE_SENTENCE_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?。！？｡]+").unwrap());

/// Hex SHA-256 of `text`. Used for segment ids and cache keys.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Split `text` into sentences, each keeping its terminal punctuation.
///
/// Whatever follows the last terminator is returned as a final sentence.
/// Joining the result reproduces `text` exactly.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    for m in RE_SENTENCE_END.find_iter(text) {
        sentences.push(&text[start..m.end()]);
        start = m.end();
    }
    if start < text.len() {
        sentences.push(&text[start..]);
    }
    sentences
}

/// Splits content units against a character budget.
#[derive(Debug, Clone, Copy)]
pub struct ContentSegmenter {
    max_chars: usize,
}

impl ContentSegmenter {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars: max_chars.max(1),
        }
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    /// Segment one unit. Images and short text come back unchanged.
    pub fn split_unit(&self, unit: &ContentUnit) -> Vec<Segment> {
        match unit {
            ContentUnit::Image { id, image_path } => vec![Segment::image(id.clone(), image_path.clone())],
            ContentUnit::Text { id, content } => self.split_text(id, content),
        }
    }

    /// Segment one text unit with the caller-supplied `id`.
    pub fn split_text(&self, id: &str, text: &str) -> Vec<Segment> {
        if char_len(text) <= self.max_chars {
            return vec![Segment::text(id, text)];
        }

        let mut runs: Vec<String> = Vec::new();
        let mut current = String::new();
        let mut current_len = 0;

        for sentence in split_sentences(text) {
            let len = char_len(sentence);
            if current_len + len <= self.max_chars {
                current.push_str(sentence);
                current_len += len;
            } else {
                if !current.is_empty() {
                    runs.push(std::mem::take(&mut current));
                }
                current.push_str(sentence);
                current_len = len;
            }
        }
        if !current.is_empty() {
            runs.push(current);
        }

        runs.iter()
            .map(|run| run.trim())
            .filter(|run| !run.is_empty())
            .map(|run| Segment::text(derived_id(id, run), run))
            .collect()
    }

    /// Replace every chapter's extracted units with their segments, in order.
    pub fn segment_chapters(&self, chapters: &mut [Chapter]) {
        for chapter in chapters {
            let units = std::mem::take(&mut chapter.units);
            let mut segments = Vec::with_capacity(units.len());
            for unit in &units {
                segments.extend(self.split_unit(unit));
            }
            chapter.segments = segments;
        }
    }
}

fn derived_id(parent: &str, trimmed: &str) -> String {
    format!("{}_{}", parent, &content_hash(trimmed)[..8])
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}
