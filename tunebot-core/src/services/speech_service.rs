use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};
use twilight_model::id::Id;
use twilight_model::id::marker::{ChannelMarker, GuildMarker};
use uuid::Uuid;

use crate::Error;
use crate::playback::{PlaybackHandle, RequestTicket, remove_ephemeral_file};
use crate::speech::SpeechSynthesizer;
use tunebot_common::models::{PlayOutcome, Song, Source};

const TITLE_CHARS: usize = 48;

/// `speak <text>`: synthesize into a unique temp file and play it once.
pub struct SpeechService {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    directory: PathBuf,
    playback: PlaybackHandle,
    timeout: Duration,
}

/// `speech-<utc millis>-<uuid>.<ext>`: unique even for concurrent requests.
pub fn speech_file_name(extension: &str) -> String {
    format!(
        "speech-{}-{}.{extension}",
        Utc::now().timestamp_millis(),
        Uuid::new_v4().simple()
    )
}

fn speech_title(text: &str) -> String {
    let mut title: String = text.chars().take(TITLE_CHARS).collect();
    if text.chars().count() > TITLE_CHARS {
        title.push('…');
    }
    format!("Speech: \"{title}\"")
}

impl SpeechService {
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        directory: PathBuf,
        playback: PlaybackHandle,
        timeout: Duration,
    ) -> Self {
        info!("SpeechService: using {} in {}", synthesizer.id(), directory.display());
        Self {
            synthesizer,
            directory,
            playback,
            timeout,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub async fn speak(
        &self,
        guild_id: Id<GuildMarker>,
        voice_channel: Id<ChannelMarker>,
        text_channel: Option<Id<ChannelMarker>>,
        text: &str,
    ) -> Result<PlayOutcome, Error> {
        self.speak_with(self.playback.ticket(guild_id), voice_channel, text_channel, text)
            .await
    }

    /// `speak` holding a place in line taken when the command arrived. A
    /// `stop` while the engine runs cancels the ticket and the file is
    /// thrown away instead of played.
    pub async fn speak_with(
        &self,
        ticket: RequestTicket,
        voice_channel: Id<ChannelMarker>,
        text_channel: Option<Id<ChannelMarker>>,
        text: &str,
    ) -> Result<PlayOutcome, Error> {
        let guild_id = ticket.guild_id();
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::InvalidInput("nothing to say".into()));
        }

        tokio::fs::create_dir_all(&self.directory).await?;
        let path = self.directory.join(speech_file_name(self.synthesizer.extension()));

        let result = match tokio::time::timeout(self.timeout, self.synthesizer.synthesize(text, &path)).await {
            Ok(result) => result,
            Err(_) => Err(Error::UpstreamTimeout(format!(
                "{} did not finish within {}s",
                self.synthesizer.id(),
                self.timeout.as_secs()
            ))),
        };
        if let Err(e) = result {
            warn!("Guild {guild_id}: speech synthesis failed: {e}");
            remove_ephemeral_file(&path).await;
            return Err(e);
        }

        debug!("Guild {guild_id}: synthesized {}", path.display());
        let song = Song::new(speech_title(text), Source::SynthesizedSpeech { path });
        // From here on the controller owns the file.
        self.playback
            .play_ephemeral_with(ticket, voice_channel, text_channel, song)
            .await
    }
}
