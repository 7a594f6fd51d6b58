//! Runtime configuration, read from the environment (after `.env` is loaded).

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use twilight_model::id::Id;
use twilight_model::id::marker::{ChannelMarker, GuildMarker};

use crate::Error;
use crate::playback::ControllerSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtsBackend {
    Google,
    Espeak,
}

impl FromStr for TtsBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "google" | "gtts" => Ok(TtsBackend::Google),
            "espeak" | "espeak-ng" => Ok(TtsBackend::Espeak),
            other => Err(Error::Config(format!("unknown TTS_BACKEND '{other}' (expected google or espeak)"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub discord_token: Option<String>,
    pub audio_directory: Option<PathBuf>,
    pub command_prefix: String,

    /// Queue requests while busy; off means a new request replaces playback.
    pub queue_enabled: bool,
    pub streaming_enabled: bool,
    pub speech_enabled: bool,

    pub tts_backend: TtsBackend,
    pub tts_language: String,
    pub tts_directory: PathBuf,

    pub openai_api_key: Option<String>,
    pub openai_api_base: Option<String>,
    pub openai_model: Option<String>,

    pub connect_timeout: Duration,
    pub fetch_timeout: Duration,
    pub loop_default: bool,

    /// Read commands from stdin as well.
    pub terminal_enabled: bool,
    pub terminal_guild_id: Option<Id<GuildMarker>>,
    pub terminal_channel_id: Option<Id<ChannelMarker>>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            discord_token: None,
            audio_directory: None,
            command_prefix: "!".to_string(),
            queue_enabled: true,
            streaming_enabled: true,
            speech_enabled: true,
            tts_backend: TtsBackend::Google,
            tts_language: "en".to_string(),
            tts_directory: std::env::temp_dir().join("tunebot-speech"),
            openai_api_key: None,
            openai_api_base: None,
            openai_model: None,
            connect_timeout: Duration::from_secs(15),
            fetch_timeout: Duration::from_secs(20),
            loop_default: true,
            terminal_enabled: false,
            terminal_guild_id: None,
            terminal_channel_id: None,
        }
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, Error> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Config(format!("{key}: expected a boolean, got '{other}'"))),
    }
}

fn parse_secs(key: &str, raw: &str) -> Result<Duration, Error> {
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(Error::Config(format!("{key}: must be at least 1 second"))),
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(_) => Err(Error::Config(format!("{key}: expected whole seconds, got '{raw}'"))),
    }
}

fn parse_id<T>(key: &str, raw: &str) -> Result<Id<T>, Error> {
    raw.trim()
        .parse::<u64>()
        .ok()
        .and_then(Id::new_checked)
        .ok_or_else(|| Error::Config(format!("{key}: expected a Discord snowflake, got '{raw}'")))
}

impl BotConfig {
    /// Load configuration from environment variables with sensible defaults.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reads values through `lookup`.
    /// Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let flag = |key: &str, default: bool| match get(key) {
            Some(raw) => parse_bool(key, &raw),
            None => Ok(default),
        };
        let secs = |key: &str, default: Duration| match get(key) {
            Some(raw) => parse_secs(key, &raw),
            None => Ok(default),
        };

        Ok(Self {
            discord_token: get("DISCORD_TOKEN").map(|t| t.trim().to_string()),
            audio_directory: get("AUDIO_DIRECTORY").map(PathBuf::from),
            command_prefix: get("COMMAND_PREFIX").unwrap_or(defaults.command_prefix),
            queue_enabled: flag("TUNEBOT_QUEUE", defaults.queue_enabled)?,
            streaming_enabled: flag("TUNEBOT_STREAMING", defaults.streaming_enabled)?,
            speech_enabled: flag("TUNEBOT_SPEECH", defaults.speech_enabled)?,
            tts_backend: match get("TTS_BACKEND") {
                Some(raw) => raw.parse()?,
                None => defaults.tts_backend,
            },
            tts_language: get("TTS_LANGUAGE").unwrap_or(defaults.tts_language),
            tts_directory: get("TTS_DIRECTORY").map(PathBuf::from).unwrap_or(defaults.tts_directory),
            openai_api_key: get("OPENAI_API_KEY"),
            openai_api_base: get("OPENAI_API_BASE"),
            openai_model: get("OPENAI_MODEL"),
            connect_timeout: secs("TUNEBOT_CONNECT_TIMEOUT_SECS", defaults.connect_timeout)?,
            fetch_timeout: secs("TUNEBOT_FETCH_TIMEOUT_SECS", defaults.fetch_timeout)?,
            loop_default: flag("TUNEBOT_LOOP_DEFAULT", defaults.loop_default)?,
            terminal_enabled: flag("TUNEBOT_TERMINAL", defaults.terminal_enabled)?,
            terminal_guild_id: get("TERMINAL_GUILD_ID")
                .map(|raw| parse_id("TERMINAL_GUILD_ID", &raw))
                .transpose()?,
            terminal_channel_id: get("TERMINAL_CHANNEL_ID")
                .map(|raw| parse_id("TERMINAL_CHANNEL_ID", &raw))
                .transpose()?,
        })
    }

    /// Startup checks. A missing token is fatal.
    pub fn validate(&self) -> Result<(), Error> {
        if self.discord_token.is_none() {
            return Err(Error::Config("DISCORD_TOKEN is not set".into()));
        }
        if self.command_prefix.trim().is_empty() {
            return Err(Error::Config("COMMAND_PREFIX must not be blank".into()));
        }
        if self.terminal_enabled && (self.terminal_guild_id.is_none() || self.terminal_channel_id.is_none()) {
            return Err(Error::Config(
                "TUNEBOT_TERMINAL needs TERMINAL_GUILD_ID and TERMINAL_CHANNEL_ID".into(),
            ));
        }
        Ok(())
    }

    pub fn token(&self) -> Result<&str, Error> {
        self.discord_token
            .as_deref()
            .ok_or_else(|| Error::Config("DISCORD_TOKEN is not set".into()))
    }

    /// The audio root, checked right before a command needs it.
    pub fn require_audio_directory(&self) -> Result<&PathBuf, Error> {
        let dir = self
            .audio_directory
            .as_ref()
            .ok_or_else(|| Error::Config("audio directory is not configured".into()))?;
        if !dir.is_dir() {
            return Err(Error::Config(format!("audio directory {} does not exist", dir.display())));
        }
        Ok(dir)
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            queue_enabled: self.queue_enabled,
            loop_default: self.loop_default,
            connect_timeout: self.connect_timeout,
        }
    }
}
