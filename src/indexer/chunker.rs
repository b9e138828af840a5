use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tiktoken_rs::CoreBPE;

use crate::error::{BalerError, Result};
use crate::models::{Fragment, RawDocument};

// Terminal punctuation, optional closing quotes/brackets, then whitespace.
static SENTENCE_END: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"[.!?…。！？]+["'”’)\]」]*\s+"#).unwrap()
});

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LengthUnit {
    Chars,
    Tokens,
}

impl fmt::Display for LengthUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chars => f.write_str("chars"),
            Self::Tokens => f.write_str("tokens"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    pub max_len: usize,
    pub overlap_sentences: usize,
    pub unit: LengthUnit,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_len: 600,
            overlap_sentences: 1,
            unit: LengthUnit::Chars,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub text: String,
    pub position_index: usize,
}

#[derive(Clone)]
pub struct Chunker {
    config: ChunkerConfig,
    bpe: Option<Arc<CoreBPE>>,
}

impl fmt::Debug for Chunker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunker").field("config", &self.config).finish()
    }
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Result<Self> {
        if config.max_len == 0 {
            return Err(BalerError::config("chunking.max_len must be greater than zero"));
        }
        let bpe = match config.unit {
            LengthUnit::Chars => None,
            LengthUnit::Tokens => {
                let bpe = tiktoken_rs::cl100k_base()
                    .map_err(|e| BalerError::config(format!("failed to load tokenizer: {}", e)))?;
                Some(Arc::new(bpe))
            }
        };
        Ok(Self { config, bpe })
    }

    /// Identifies the chunking parameters; folded into every fragment id so a
    /// parameter change never collides with fragments from older settings.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}:{}:{}",
            self.config.unit, self.config.max_len, self.config.overlap_sentences
        )
    }

    pub fn chunk(&self, document: &RawDocument) -> Vec<TextChunk> {
        self.chunk_text(&document.body_text)
    }

    /// Chunks a document and assigns deterministic fragment ids.
    pub fn fragments(&self, document: &RawDocument) -> Vec<Fragment> {
        let fingerprint = self.fingerprint();
        self.chunk(document)
            .into_iter()
            .map(|chunk| Fragment {
                fragment_id: Fragment::derive_id(
                    &document.source_id,
                    &fingerprint,
                    chunk.position_index,
                    &chunk.text,
                ),
                source_id: document.source_id.clone(),
                album_identifier: document.album_identifier.clone(),
                text: chunk.text,
                position_index: chunk.position_index,
            })
            .collect()
    }

    pub fn chunk_text(&self, text: &str) -> Vec<TextChunk> {
        let normalized = WHITESPACE.replace_all(text.trim(), " ");
        if normalized.is_empty() {
            return Vec::new();
        }

        let sentences: Vec<String> = split_sentences(&normalized)
            .into_iter()
            .flat_map(|sentence| {
                if self.measure(sentence) > self.config.max_len {
                    self.split_long(sentence)
                } else {
                    vec![sentence.to_string()]
                }
            })
            .collect();

        let mut chunks = Vec::new();
        let mut prev_start = 0;
        let mut prev_end = 0;

        while prev_end < sentences.len() {
            let mut start = if chunks.is_empty() {
                0
            } else {
                prev_end
                    .saturating_sub(self.config.overlap_sentences)
                    .max(prev_start + 1)
            };
            let (mut text, mut end) = self.pack(&sentences, start);
            // Overlap left no room for new material; restart at the boundary.
            if end <= prev_end {
                start = prev_end;
                (text, end) = self.pack(&sentences, start);
            }

            chunks.push(TextChunk {
                text,
                position_index: chunks.len(),
            });
            prev_start = start;
            prev_end = end;
        }

        chunks
    }

    /// Greedily joins sentences from `start`; always takes at least one.
    fn pack(&self, sentences: &[String], start: usize) -> (String, usize) {
        let mut current = sentences[start].clone();
        let mut end = start + 1;
        while end < sentences.len() {
            let candidate = format!("{} {}", current, sentences[end]);
            if self.measure(&candidate) > self.config.max_len {
                break;
            }
            current = candidate;
            end += 1;
        }
        (current, end)
    }

    fn measure(&self, text: &str) -> usize {
        match &self.bpe {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            None => text.chars().count(),
        }
    }

    fn split_long(&self, sentence: &str) -> Vec<String> {
        let mut pieces = Vec::new();
        let mut current = String::new();

        for word in sentence.split(' ').filter(|w| !w.is_empty()) {
            let candidate = if current.is_empty() {
                word.to_string()
            } else {
                format!("{} {}", current, word)
            };
            if self.measure(&candidate) <= self.config.max_len {
                current = candidate;
                continue;
            }
            if !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
            }
            if self.measure(word) <= self.config.max_len {
                current = word.to_string();
            } else {
                pieces.extend(self.split_word(word));
            }
        }
        if !current.is_empty() {
            pieces.push(current);
        }
        pieces
    }

    fn split_word(&self, word: &str) -> Vec<String> {
        let mut pieces = Vec::new();
        let mut piece = String::new();
        for ch in word.chars() {
            piece.push(ch);
            if self.measure(&piece) > self.config.max_len {
                piece.pop();
                if !piece.is_empty() {
                    pieces.push(std::mem::take(&mut piece));
                }
                piece.push(ch);
            }
        }
        if !piece.is_empty() {
            pieces.push(piece);
        }
        pieces
    }
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut last = 0;
    for m in SENTENCE_END.find_iter(text) {
        let sentence = text[last..m.end()].trim();
        if !sentence.is_empty() {
            sentences.push(sentence);
        }
        last = m.end();
    }
    let tail = text[last..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}
