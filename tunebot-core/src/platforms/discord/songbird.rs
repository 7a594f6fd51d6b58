//! songbird.rs
//!
//! Voice transport backed by Songbird. One `Call` per guild; every `play`
//! replaces the call's track and wires its events back to the controller.

use std::sync::Arc;

use async_trait::async_trait;
use ::songbird::error::JoinError;
use ::songbird::input::{File as SongbirdFile, HttpRequest, Input, YoutubeDl};
use ::songbird::{Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent};
use tracing::{debug, info, trace};
use twilight_model::id::Id;
use twilight_model::id::marker::{ChannelMarker, GuildMarker};

use crate::Error;
use crate::platforms::{TrackStatus, TrackToken, TransportEventSink, VoiceTransport};
use tunebot_common::models::Source;

pub struct SongbirdTransport {
    songbird: Arc<Songbird>,
    http: reqwest::Client,
}

impl SongbirdTransport {
    pub fn new(songbird: Arc<Songbird>, http: reqwest::Client) -> Self {
        Self { songbird, http }
    }

    fn input_for(&self, source: &Source) -> Input {
        match source {
            Source::LocalFile { path } | Source::SynthesizedSpeech { path } => {
                SongbirdFile::new(path.clone()).into()
            }
            Source::RemoteStream { url } => HttpRequest::new(self.http.clone(), url.clone()).into(),
            Source::ProviderTrack { url } => YoutubeDl::new(self.http.clone(), url.clone()).into(),
        }
    }
}

#[derive(Clone, Copy)]
enum Watch {
    Play,
    End,
    Error,
}

/// Forwards one track's lifecycle events, tagged with its token.
struct TrackNotifier {
    guild_id: Id<GuildMarker>,
    token: TrackToken,
    watch: Watch,
    sink: TransportEventSink,
}

#[async_trait]
impl VoiceEventHandler for TrackNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let EventContext::Track(tracks) = ctx else {
            return None;
        };
        let status = match self.watch {
            Watch::Play => TrackStatus::Playing,
            Watch::End => TrackStatus::Idle,
            Watch::Error => {
                let reason = tracks
                    .first()
                    .map(|(state, _)| format!("{:?}", state.playing))
                    .unwrap_or_else(|| "unknown track error".to_string());
                TrackStatus::Error(reason)
            }
        };
        trace!("Guild {}: track {:?} -> {:?}", self.guild_id, self.token, status);
        self.sink.emit(self.guild_id, self.token, status);
        None
    }
}

#[async_trait]
impl VoiceTransport for SongbirdTransport {
    async fn connect(
        &self,
        guild_id: Id<GuildMarker>,
        channel_id: Id<ChannelMarker>,
    ) -> Result<(), Error> {
        debug!("Songbird: joining {channel_id} in guild {guild_id}");
        match self.songbird.join(guild_id, channel_id).await {
            Ok(_call) => {
                info!("Songbird: joined {channel_id} in guild {guild_id}");
                Ok(())
            }
            Err(JoinError::TimedOut) => Err(Error::UpstreamTimeout(format!(
                "voice gateway did not answer for channel {channel_id}"
            ))),
            Err(e) => Err(Error::Connection(e.to_string())),
        }
    }

    async fn disconnect(&self, guild_id: Id<GuildMarker>) -> Result<(), Error> {
        match self.songbird.remove(guild_id).await {
            Ok(()) | Err(JoinError::NoCall) => Ok(()),
            Err(e) => Err(Error::Connection(format!("leaving voice failed: {e}"))),
        }
    }

    async fn play(
        &self,
        guild_id: Id<GuildMarker>,
        source: &Source,
        token: TrackToken,
        events: TransportEventSink,
    ) -> Result<(), Error> {
        let call = self
            .songbird
            .get(guild_id)
            .ok_or_else(|| Error::Connection(format!("no voice connection for guild {guild_id}")))?;
        let input = self.input_for(source);

        let handle = {
            let mut call = call.lock().await;
            call.play_only_input(input)
        };

        for (event, watch) in [
            (TrackEvent::Play, Watch::Play),
            (TrackEvent::End, Watch::End),
            (TrackEvent::Error, Watch::Error),
        ] {
            let notifier = TrackNotifier {
                guild_id,
                token,
                watch,
                sink: events.clone(),
            };
            handle
                .add_event(Event::Track(event), notifier)
                .map_err(|e| Error::TransportPlayback(format!("could not watch track: {e}")))?;
        }

        debug!("Songbird: guild {guild_id} playing {} ({:?})", source, token);
        Ok(())
    }

    async fn stop(&self, guild_id: Id<GuildMarker>) -> Result<(), Error> {
        if let Some(call) = self.songbird.get(guild_id) {
            call.lock().await.stop();
        }
        Ok(())
    }
}
