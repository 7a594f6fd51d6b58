//! Speech synthesis backends. Each one renders text into an audio file
//! that the playback controller plays once and then deletes.

pub mod espeak;
pub mod google;

use std::path::Path;

use async_trait::async_trait;

use crate::Error;

pub use espeak::EspeakTts;
pub use google::GoogleTranslateTts;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Backend name for logs, e.g. "espeak-ng".
    fn id(&self) -> &'static str;

    /// File extension of what `synthesize` writes.
    fn extension(&self) -> &'static str;

    /// Render `text` into a new file at `dest`.
    async fn synthesize(&self, text: &str, dest: &Path) -> Result<(), Error>;
}

/// Splits text into pieces of at most `max_chars` characters, breaking on
/// whitespace where possible.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        let mut word = word;
        // Words that cannot fit anywhere are cut hard.
        while word.chars().count() > max_chars {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            let cut = word
                .char_indices()
                .nth(max_chars)
                .map(|(i, _)| i)
                .unwrap_or(word.len());
            chunks.push(word[..cut].to_string());
            word = &word[cut..];
        }
        if word.is_empty() {
            continue;
        }

        let needed = if current.is_empty() {
            word.chars().count()
        } else {
            current.chars().count() + 1 + word.chars().count()
        };
        if needed > max_chars {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
