use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use twilight_model::id::Id;
use twilight_model::id::marker::{ChannelMarker, GuildMarker};

/// Something the voice transport knows how to turn into an audio resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Source {
    /// A file under the configured audio directory.
    LocalFile { path: PathBuf },
    /// A direct media URL streamed over HTTP.
    RemoteStream { url: String },
    /// A video page resolved through the search provider (played via yt-dlp).
    ProviderTrack { url: String },
    /// A generated speech file. Always ephemeral: deleted once playback ends.
    SynthesizedSpeech { path: PathBuf },
}

impl Source {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Source::SynthesizedSpeech { .. })
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Source::LocalFile { .. } => "local_file",
            Source::RemoteStream { .. } => "remote_stream",
            Source::ProviderTrack { .. } => "provider_track",
            Source::SynthesizedSpeech { .. } => "synthesized_speech",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::LocalFile { path } | Source::SynthesizedSpeech { path } => {
                write!(f, "{}", path.display())
            }
            Source::RemoteStream { url } | Source::ProviderTrack { url } => write!(f, "{url}"),
        }
    }
}

/// A playable item with the title we announce for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Song {
    pub title: String,
    pub source: Source,
}

impl Song {
    pub fn new(title: impl Into<String>, source: Source) -> Self {
        Self {
            title: title.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Idle,
    Connecting,
    Playing,
    /// Transient: the controller reports the failure and resets to `Idle`.
    Error,
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlaybackState::Idle => "idle",
            PlaybackState::Connecting => "connecting",
            PlaybackState::Playing => "playing",
            PlaybackState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Result of a successful `play`/`music`/`speak` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayOutcome {
    Started { title: String },
    Queued { title: String, position: usize },
}

/// Result of a successful `join`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    Moved,
    AlreadyJoined,
}

/// Read-only view of one guild's session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub guild_id: Id<GuildMarker>,
    pub state: PlaybackState,
    pub voice_channel: Option<Id<ChannelMarker>>,
    pub connected: bool,
    pub now_playing: Option<Song>,
    pub queue: Vec<String>,
    pub loop_enabled: bool,
    pub generation: u64,
}

impl SessionSnapshot {
    /// What an absent registry entry looks like.
    pub fn idle(guild_id: Id<GuildMarker>, loop_enabled: bool) -> Self {
        Self {
            guild_id,
            state: PlaybackState::Idle,
            voice_channel: None,
            connected: false,
            now_playing: None,
            queue: Vec::new(),
            loop_enabled,
            generation: 0,
        }
    }
}
