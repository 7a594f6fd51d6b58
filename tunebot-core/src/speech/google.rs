use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::{SpeechSynthesizer, chunk_text};
use crate::Error;

const TTS_ENDPOINT: &str = "https://translate.google.com/translate_tts";

/// The endpoint refuses longer queries.
const MAX_CHUNK_CHARS: usize = 200;

/// Google Translate's public TTS endpoint. Each chunk comes back as an MP3
/// and the pieces are concatenated into one file.
pub struct GoogleTranslateTts {
    client: Client,
    language: String,
}

impl GoogleTranslateTts {
    pub fn new(language: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            language: language.into(),
        }
    }

    fn chunk_url(&self, chunk: &str, index: usize, total: usize) -> String {
        format!(
            "{TTS_ENDPOINT}?ie=UTF-8&client=tw-ob&tl={}&total={total}&idx={index}&textlen={}&q={}",
            urlencoding::encode(&self.language),
            chunk.chars().count(),
            urlencoding::encode(chunk),
        )
    }
}

#[async_trait]
impl SpeechSynthesizer for GoogleTranslateTts {
    fn id(&self) -> &'static str {
        "google-translate"
    }

    fn extension(&self) -> &'static str {
        "mp3"
    }

    async fn synthesize(&self, text: &str, dest: &Path) -> Result<(), Error> {
        let chunks = chunk_text(text, MAX_CHUNK_CHARS);
        if chunks.is_empty() {
            return Err(Error::InvalidInput("nothing to say".into()));
        }

        let mut audio = Vec::new();
        for (index, chunk) in chunks.iter().enumerate() {
            let response = self
                .client
                .get(self.chunk_url(chunk, index, chunks.len()))
                .header("User-Agent", "Mozilla/5.0")
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                return Err(Error::UpstreamUnavailable(format!(
                    "speech endpoint returned {status} for chunk {index}"
                )));
            }
            audio.extend_from_slice(&response.bytes().await?);
        }

        debug!("Synthesized {} chunk(s), {} bytes -> {}", chunks.len(), audio.len(), dest.display());
        tokio::fs::write(dest, &audio).await?;
        Ok(())
    }
}
