//! Text-to-speech through the Google Translate TTS endpoint.
//!
//! The endpoint only accepts short inputs, so text is split into chunks at
//! sentence boundaries, then at word boundaries, and the returned MP3
//! frames are concatenated.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::config::SpeechConfig;
use crate::error::SpeechError;

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Encoded MP3 bytes for `text`.
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, SpeechError>;
}

pub struct TranslateTts {
    config: SpeechConfig,
    client: Client,
}

impl TranslateTts {
    pub fn new(config: SpeechConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("Mozilla/5.0")
            .build()
            .expect("Failed to create HTTP client");

        Self { config, client }
    }
}

#[async_trait]
impl SpeechSynthesizer for TranslateTts {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, SpeechError> {
        let chunks = split_chunks(text, self.config.max_chunk_chars);
        if chunks.is_empty() {
            return Err(SpeechError::EmptyText);
        }

        let url = format!("{}/translate_tts", self.config.host.trim_end_matches('/'));
        let total = chunks.len().to_string();
        let mut audio = Vec::new();

        for (idx, chunk) in chunks.iter().enumerate() {
            debug!("TTS chunk {}/{total}: {chunk}", idx + 1);
            let resp = self
                .client
                .get(&url)
                .query(&[
                    ("ie", "UTF-8"),
                    ("client", "tw-ob"),
                    ("tl", self.config.lang.as_str()),
                    ("q", chunk.as_str()),
                    ("total", total.as_str()),
                    ("idx", idx.to_string().as_str()),
                    ("textlen", chunk.chars().count().to_string().as_str()),
                ])
                .send()
                .await?;
            if !resp.status().is_success() {
                return Err(SpeechError::Status(resp.status().as_u16()));
            }
            audio.extend_from_slice(&resp.bytes().await?);
        }

        Ok(audio)
    }
}

/// Split `text` into chunks of at most `max_chars` characters.
pub fn split_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();

    for sentence in sentences(text) {
        for piece in fit_words(&sentence, max_chars) {
            let joined = current.chars().count() + 1 + piece.chars().count();
            if current.is_empty() {
                current = piece;
            } else if joined <= max_chars {
                current.push(' ');
                current.push_str(&piece);
            } else {
                chunks.push(std::mem::replace(&mut current, piece));
            }
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        current.push(c);
        if matches!(c, '.' | '!' | '?' | ';' | ':' | '\n') {
            push_trimmed(&mut out, &current);
            current.clear();
        }
    }
    push_trimmed(&mut out, &current);
    out
}

fn push_trimmed(out: &mut Vec<String>, s: &str) {
    let s = s.split_whitespace().collect::<Vec<_>>().join(" ");
    if !s.is_empty() {
        out.push(s);
    }
}

/// Break one sentence into pieces that fit, splitting oversized words.
fn fit_words(sentence: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();

    for word in sentence.split_whitespace() {
        let chars: Vec<char> = word.chars().collect();
        for part in chars.chunks(max_chars) {
            let part: String = part.iter().collect();
            if current.is_empty() {
                current = part;
            } else if current.chars().count() + 1 + part.chars().count() <= max_chars {
                current.push(' ');
                current.push_str(&part);
            } else {
                pieces.push(std::mem::replace(&mut current, part));
            }
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}
