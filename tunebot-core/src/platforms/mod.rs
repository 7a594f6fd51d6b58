// File: src/platforms/mod.rs

use async_trait::async_trait;
use tokio::sync::mpsc;
use twilight_model::id::Id;
use twilight_model::id::marker::{ChannelMarker, GuildMarker, UserMarker};

use crate::Error;
use tunebot_common::models::{Song, Source};

/// Lifecycle of a chat platform connection. `disconnect` after a failed
/// or skipped `connect` is a no-op.
#[async_trait]
pub trait PlatformIntegration {
    async fn connect(&mut self) -> Result<(), Error>;
    async fn disconnect(&mut self) -> Result<(), Error>;
}

/// Outbound side of the chat platform that commands need.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn send_message(&self, channel_id: Id<ChannelMarker>, text: &str) -> Result<(), Error>;
    async fn send_direct_message(&self, user_id: Id<UserMarker>, text: &str) -> Result<(), Error>;
    async fn fetch_user_name(&self, user_id: Id<UserMarker>) -> Result<String, Error>;
}

/// Video/search provider used to resolve links and free-text queries.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaSearch: Send + Sync {
    /// Fetch metadata for a provider link.
    async fn lookup(&self, url: &str) -> Result<Song, Error>;
    /// First result for a query, if any.
    async fn search(&self, query: &str) -> Result<Option<Song>, Error>;
}

/// Identifies one playback request. A fresh token is issued every time a
/// player is created, so events from replaced players can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackToken(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackStatus {
    Playing,
    Idle,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub guild_id: Id<GuildMarker>,
    pub token: TrackToken,
    pub status: TrackStatus,
}

/// Handed to the transport with every `play` so player notifications
/// flow back into the controller's event channel.
#[derive(Debug, Clone)]
pub struct TransportEventSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportEventSink {
    pub fn new(tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { tx }
    }

    pub fn emit(&self, guild_id: Id<GuildMarker>, token: TrackToken, status: TrackStatus) {
        let _ = self.tx.send(TransportEvent { guild_id, token, status });
    }
}

/// The voice library: connections per guild and one player bound to each.
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    async fn connect(
        &self,
        guild_id: Id<GuildMarker>,
        channel_id: Id<ChannelMarker>,
    ) -> Result<(), Error>;

    /// Destroy the guild's connection. Succeeds when there is none.
    async fn disconnect(&self, guild_id: Id<GuildMarker>) -> Result<(), Error>;

    /// Create a fresh player for `source` on the guild's connection and
    /// report its status changes through `events`, tagged with `token`.
    async fn play(
        &self,
        guild_id: Id<GuildMarker>,
        source: &Source,
        token: TrackToken,
        events: TransportEventSink,
    ) -> Result<(), Error>;

    async fn stop(&self, guild_id: Id<GuildMarker>) -> Result<(), Error>;
}

// Re-export submodules
pub mod discord;
pub mod youtube;
