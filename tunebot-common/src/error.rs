// ================================================================
// File: tunebot-common/src/error.rs
// ================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Empty or unparseable user input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The search provider returned nothing for the query.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Upstream timed out: {0}")]
    UpstreamTimeout(String),

    #[error("Voice connection error: {0}")]
    Connection(String),

    #[error("Playback error: {0}")]
    TransportPlayback(String),

    /// Not in a voice channel, not in a guild, or a capability is switched off.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// A newer command (a replacing play, `stop`) cancelled this request before it completed.
    #[error("Superseded: {0}")]
    Superseded(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout error: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),
}

impl Error {
    /// The single line shown to the user when a command fails.
    pub fn user_message(&self) -> String {
        match self {
            Error::InvalidInput(msg) => format!("Invalid input: {msg}"),
            Error::NotFound(what) => format!("No results found for \"{what}\"."),
            Error::FileNotFound(name) => format!("File not found: {name}"),
            Error::UpstreamUnavailable(_) => {
                "Could not fetch that track right now, try again later.".to_string()
            }
            Error::UpstreamTimeout(_) | Error::Timeout(_) => {
                "The request timed out, try again later.".to_string()
            }
            Error::Connection(_) => "Could not connect to the voice channel.".to_string(),
            Error::TransportPlayback(_) => "Error playing track!".to_string(),
            Error::PermissionDenied(msg) => msg.clone(),
            Error::Superseded(_) => "Request cancelled by a newer command.".to_string(),
            Error::Config(msg) => format!("Not configured: {msg}"),
            Error::Platform(_) | Error::Http(_) | Error::Json(_) | Error::Io(_) => {
                "Something went wrong handling that command.".to_string()
            }
        }
    }

    /// Whether the failure came from a timed-out wait, regardless of which layer noticed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::UpstreamTimeout(_) | Error::Timeout(_))
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::UpstreamUnavailable(e.to_string())
    }
}
