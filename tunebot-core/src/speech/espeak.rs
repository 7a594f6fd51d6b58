use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::SpeechSynthesizer;
use crate::Error;

/// Local `espeak-ng`, writing a WAV file directly.
pub struct EspeakTts {
    binary: String,
    voice: String,
}

impl EspeakTts {
    pub fn new(voice: impl Into<String>) -> Self {
        Self {
            binary: "espeak-ng".to_string(),
            voice: voice.into(),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }
}

#[async_trait]
impl SpeechSynthesizer for EspeakTts {
    fn id(&self) -> &'static str {
        "espeak-ng"
    }

    fn extension(&self) -> &'static str {
        "wav"
    }

    async fn synthesize(&self, text: &str, dest: &Path) -> Result<(), Error> {
        let output = Command::new(&self.binary)
            .arg("-v")
            .arg(&self.voice)
            .arg("-w")
            .arg(dest)
            .arg("--")
            .arg(text)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("could not run {}: {e}", self.binary)))?;

        if !output.status.success() {
            let err_msg = String::from_utf8_lossy(&output.stderr);
            return Err(Error::UpstreamUnavailable(format!("espeak error: {}", err_msg.trim())));
        }
        debug!("espeak-ng wrote {}", dest.display());
        Ok(())
    }
}
