// File: tunebot-core/src/test_utils/helpers.rs

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use twilight_model::id::Id;
use twilight_model::id::marker::{ChannelMarker, GuildMarker};

use crate::Error;
use crate::eventbus::EventBus;
use crate::platforms::{TrackStatus, TrackToken, TransportEventSink, VoiceTransport};
use crate::playback::{ControllerSettings, PlaybackController, PlaybackHandle};
use tunebot_common::models::{PlaybackState, SessionSnapshot, Source};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Connect(Id<GuildMarker>, Id<ChannelMarker>),
    Disconnect(Id<GuildMarker>),
    Play(Id<GuildMarker>, Source, TrackToken),
    Stop(Id<GuildMarker>),
}

#[derive(Default)]
struct FakeState {
    calls: Vec<TransportCall>,
    connected: HashSet<Id<GuildMarker>>,
    gated: bool,
    connect_error: Option<String>,
    play_error: Option<String>,
    current: HashMap<Id<GuildMarker>, (TrackToken, TransportEventSink)>,
}

/// In-memory voice transport. Records every call, can hold or fail
/// connects, and lets tests report track progress on demand.
pub struct FakeTransport {
    state: Mutex<FakeState>,
    gate: Semaphore,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState::default()),
            gate: Semaphore::new(0),
        })
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connects block until `release_connect` is called.
    pub fn gate_connects(&self) {
        self.state().gated = true;
    }

    pub fn release_connect(&self) {
        self.gate.add_permits(1);
    }

    pub fn fail_connects(&self, reason: &str) {
        self.state().connect_error = Some(reason.to_string());
    }

    pub fn fail_plays(&self, reason: Option<&str>) {
        self.state().play_error = reason.map(str::to_string);
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.state().calls.clone()
    }

    pub fn played_sources(&self, guild_id: Id<GuildMarker>) -> Vec<Source> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                TransportCall::Play(g, source, _) if *g == guild_id => Some(source.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn connect_count(&self, guild_id: Id<GuildMarker>) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| matches!(call, TransportCall::Connect(g, _) if *g == guild_id))
            .count()
    }

    pub fn disconnect_count(&self, guild_id: Id<GuildMarker>) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| matches!(call, TransportCall::Disconnect(g) if *g == guild_id))
            .count()
    }

    pub fn is_connected(&self, guild_id: Id<GuildMarker>) -> bool {
        self.state().connected.contains(&guild_id)
    }

    pub fn current_token(&self, guild_id: Id<GuildMarker>) -> Option<TrackToken> {
        self.state().current.get(&guild_id).map(|(token, _)| *token)
    }

    /// Report the current track's status, as the voice library would.
    pub fn report(&self, guild_id: Id<GuildMarker>, status: TrackStatus) -> Option<TrackToken> {
        let (token, sink) = self.state().current.get(&guild_id).cloned()?;
        sink.emit(guild_id, token, status);
        Some(token)
    }

    /// Report on a specific (possibly replaced) track.
    pub fn report_for(&self, guild_id: Id<GuildMarker>, token: TrackToken, status: TrackStatus) {
        let sink = self.state().current.get(&guild_id).map(|(_, sink)| sink.clone());
        if let Some(sink) = sink {
            sink.emit(guild_id, token, status);
        }
    }

    pub fn finish_track(&self, guild_id: Id<GuildMarker>) -> Option<TrackToken> {
        self.report(guild_id, TrackStatus::Idle)
    }
}

#[async_trait]
impl VoiceTransport for FakeTransport {
    async fn connect(&self, guild_id: Id<GuildMarker>, channel_id: Id<ChannelMarker>) -> Result<(), Error> {
        let gated = {
            let mut state = self.state();
            state.calls.push(TransportCall::Connect(guild_id, channel_id));
            state.gated
        };
        if gated {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| Error::Connection("gate closed".into()))?;
            permit.forget();
        }

        let mut state = self.state();
        if let Some(reason) = state.connect_error.clone() {
            return Err(Error::Connection(reason));
        }
        state.connected.insert(guild_id);
        Ok(())
    }

    async fn disconnect(&self, guild_id: Id<GuildMarker>) -> Result<(), Error> {
        let mut state = self.state();
        state.calls.push(TransportCall::Disconnect(guild_id));
        state.connected.remove(&guild_id);
        state.current.remove(&guild_id);
        Ok(())
    }

    async fn play(
        &self,
        guild_id: Id<GuildMarker>,
        source: &Source,
        token: TrackToken,
        events: TransportEventSink,
    ) -> Result<(), Error> {
        let mut state = self.state();
        state.calls.push(TransportCall::Play(guild_id, source.clone(), token));
        if let Some(reason) = state.play_error.clone() {
            return Err(Error::TransportPlayback(reason));
        }
        if !state.connected.contains(&guild_id) {
            return Err(Error::Connection(format!("guild {guild_id} is not connected")));
        }
        state.current.insert(guild_id, (token, events.clone()));
        drop(state);
        events.emit(guild_id, token, TrackStatus::Playing);
        Ok(())
    }

    async fn stop(&self, guild_id: Id<GuildMarker>) -> Result<(), Error> {
        let mut state = self.state();
        state.calls.push(TransportCall::Stop(guild_id));
        state.current.remove(&guild_id);
        Ok(())
    }
}

/// A controller wired to a fresh `FakeTransport`.
pub struct TestController {
    pub transport: Arc<FakeTransport>,
    pub event_bus: Arc<EventBus>,
    pub handle: PlaybackHandle,
    pub task: JoinHandle<()>,
}

pub fn spawn_test_controller(settings: ControllerSettings) -> TestController {
    let transport = FakeTransport::new();
    let event_bus = Arc::new(EventBus::new());
    let (handle, task) = PlaybackController::spawn(transport.clone(), event_bus.clone(), settings);
    TestController {
        transport,
        event_bus,
        handle,
        task,
    }
}

/// Polls `check` until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Waits for the guild's session to reach `state`.
pub async fn wait_for_state(
    handle: &PlaybackHandle,
    guild_id: Id<GuildMarker>,
    state: PlaybackState,
) -> Result<SessionSnapshot, Error> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let snapshot = handle.snapshot(guild_id).await?;
        if snapshot.state == state {
            return Ok(snapshot);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::UpstreamTimeout(format!(
                "guild {guild_id} stayed {} instead of reaching {state}",
                snapshot.state
            )));
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
