//! The playback controller: one task that owns every guild session and
//! drives the idle / connecting / playing state machine.
//!
//! Callers talk to it through [`PlaybackHandle`]. Commands, player
//! notifications from the transport and connect completions all arrive as
//! messages, so transitions never interleave. Connects run in their own
//! task and report back with the session generation they were started for;
//! a completion whose generation is gone is stale and gets discarded.
//!
//! Play requests come with a [`RequestTicket`] taken when the command
//! arrived. They are admitted in ticket order, and a ticket cancelled by
//! `stop` (or by losing the connection) while its song was still being
//! resolved or synthesized is turned away.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use twilight_model::id::Id;
use twilight_model::id::marker::{ChannelMarker, GuildMarker};

use crate::Error;
use crate::eventbus::{BotEvent, EventBus};
use crate::platforms::{TrackStatus, TrackToken, TransportEvent, TransportEventSink, VoiceTransport};
use crate::playback::remove_ephemeral_file;
use crate::playback::session::{ActivePlayer, JoinReply, PendingPlay, PlayReply, Session, SessionRegistry};
use crate::playback::ticket::{RequestTicket, TicketBook, TicketStamp};
use tunebot_common::models::{JoinOutcome, PlayOutcome, PlaybackState, SessionSnapshot, Song, Source};

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Queue requests that arrive while busy instead of replacing playback.
    pub queue_enabled: bool,
    pub loop_default: bool,
    pub connect_timeout: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            queue_enabled: true,
            loop_default: true,
            connect_timeout: Duration::from_secs(15),
        }
    }
}

/// Where a play request lands when it reaches the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PlayKind {
    Normal,
    Ephemeral,
}

pub(crate) struct PlayRequest {
    channel_id: Id<ChannelMarker>,
    text_channel: Option<Id<ChannelMarker>>,
    song: Song,
    kind: PlayKind,
    reply: PlayReply,
}

/// Play requests of one epoch that arrived ahead of an earlier ticket.
struct Admissions {
    epoch: u64,
    next: u64,
    /// `None` marks a ticket that was released without a request.
    parked: BTreeMap<u64, Option<PlayRequest>>,
}

impl Admissions {
    fn new(epoch: u64) -> Self {
        Self {
            epoch,
            next: 0,
            parked: BTreeMap::new(),
        }
    }
}

pub(crate) enum ControlMsg {
    Join {
        guild_id: Id<GuildMarker>,
        channel_id: Id<ChannelMarker>,
        text_channel: Option<Id<ChannelMarker>>,
        reply: JoinReply,
    },
    Play {
        guild_id: Id<GuildMarker>,
        stamp: TicketStamp,
        request: PlayRequest,
    },
    TicketReleased {
        guild_id: Id<GuildMarker>,
        stamp: TicketStamp,
    },
    Stop {
        guild_id: Id<GuildMarker>,
        reply: oneshot::Sender<bool>,
    },
    SetLoop {
        guild_id: Id<GuildMarker>,
        /// `None` toggles.
        enabled: Option<bool>,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        guild_id: Id<GuildMarker>,
        reply: oneshot::Sender<SessionSnapshot>,
    },
    VoiceStateChanged {
        guild_id: Id<GuildMarker>,
        channel_id: Option<Id<ChannelMarker>>,
    },
    ConnectFinished {
        guild_id: Id<GuildMarker>,
        channel_id: Id<ChannelMarker>,
        generation: u64,
        result: Result<(), Error>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap, cloneable front door to the controller task.
#[derive(Clone)]
pub struct PlaybackHandle {
    tx: mpsc::UnboundedSender<ControlMsg>,
    tickets: Arc<TicketBook>,
}

impl PlaybackHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ControlMsg,
    ) -> Result<T, Error> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .map_err(|_| Error::Platform("playback controller is not running".into()))?;
        rx.await
            .map_err(|_| Error::Platform("playback controller dropped the request".into()))
    }

    /// Reserve the guild's next place in line. Take it when the command
    /// arrives, before any resolve or synthesis step.
    pub fn ticket(&self, guild_id: Id<GuildMarker>) -> RequestTicket {
        RequestTicket::issue(guild_id, Arc::clone(&self.tickets), self.tx.clone())
    }

    fn send_play(
        &self,
        ticket: RequestTicket,
        channel_id: Id<ChannelMarker>,
        text_channel: Option<Id<ChannelMarker>>,
        song: Song,
        kind: PlayKind,
    ) -> Result<oneshot::Receiver<Result<PlayOutcome, Error>>, Error> {
        let guild_id = ticket.guild_id();
        let (reply, rx) = oneshot::channel();
        let request = PlayRequest { channel_id, text_channel, song, kind, reply };
        let stamp = ticket.redeem();
        self.tx
            .send(ControlMsg::Play { guild_id, stamp, request })
            .map_err(|_| Error::Platform("playback controller is not running".into()))?;
        Ok(rx)
    }

    /// Connect (or move) the guild's session to `channel_id`.
    pub async fn join(
        &self,
        guild_id: Id<GuildMarker>,
        channel_id: Id<ChannelMarker>,
        text_channel: Option<Id<ChannelMarker>>,
    ) -> Result<JoinOutcome, Error> {
        self.request(|reply| ControlMsg::Join { guild_id, channel_id, text_channel, reply })
            .await?
    }

    /// Play now, or enqueue when the session is busy and queueing is on.
    /// Resolves once playback has started (after any connect) or the song is queued.
    pub async fn play(
        &self,
        guild_id: Id<GuildMarker>,
        channel_id: Id<ChannelMarker>,
        text_channel: Option<Id<ChannelMarker>>,
        song: Song,
    ) -> Result<PlayOutcome, Error> {
        self.play_with(self.ticket(guild_id), channel_id, text_channel, song)
            .await
    }

    /// `play` for a request whose ticket was taken earlier.
    pub async fn play_with(
        &self,
        ticket: RequestTicket,
        channel_id: Id<ChannelMarker>,
        text_channel: Option<Id<ChannelMarker>>,
        song: Song,
    ) -> Result<PlayOutcome, Error> {
        let rx = self.send_play(ticket, channel_id, text_channel, song, PlayKind::Normal)?;
        rx.await
            .map_err(|_| Error::Platform("playback controller dropped the request".into()))?
    }

    /// Play a generated file once, with looping off, deleting it afterwards.
    pub async fn play_ephemeral(
        &self,
        guild_id: Id<GuildMarker>,
        channel_id: Id<ChannelMarker>,
        text_channel: Option<Id<ChannelMarker>>,
        song: Song,
    ) -> Result<PlayOutcome, Error> {
        self.play_ephemeral_with(self.ticket(guild_id), channel_id, text_channel, song)
            .await
    }

    pub async fn play_ephemeral_with(
        &self,
        ticket: RequestTicket,
        channel_id: Id<ChannelMarker>,
        text_channel: Option<Id<ChannelMarker>>,
        song: Song,
    ) -> Result<PlayOutcome, Error> {
        let path = match &song.source {
            Source::SynthesizedSpeech { path } => path.clone(),
            other => {
                return Err(Error::InvalidInput(format!(
                    "{} sources cannot be played as ephemeral",
                    other.kind()
                )));
            }
        };
        let rx = match self.send_play(ticket, channel_id, text_channel, song, PlayKind::Ephemeral) {
            Ok(rx) => rx,
            Err(e) => {
                // Never reached the controller, so nobody else will clean up.
                remove_ephemeral_file(&path).await;
                return Err(e);
            }
        };
        rx.await
            .map_err(|_| Error::Platform("playback controller dropped the request".into()))?
    }

    /// Stop playback and leave, cancelling requests still being prepared.
    /// Returns whether anything was active.
    pub async fn stop(&self, guild_id: Id<GuildMarker>) -> Result<bool, Error> {
        // Cancelled here rather than in the controller: a ticket taken after
        // this call returns must survive the stop.
        let cancelled = self.tickets.cancel(guild_id);
        let was_active = self.request(|reply| ControlMsg::Stop { guild_id, reply }).await?;
        Ok(was_active || cancelled > 0)
    }

    /// Returns the loop flag now in effect.
    pub async fn set_loop(&self, guild_id: Id<GuildMarker>, enabled: bool) -> Result<bool, Error> {
        self.request(|reply| ControlMsg::SetLoop { guild_id, enabled: Some(enabled), reply })
            .await
    }

    /// Flips the loop flag the session will have once any speech is over.
    pub async fn toggle_loop(&self, guild_id: Id<GuildMarker>) -> Result<bool, Error> {
        self.request(|reply| ControlMsg::SetLoop { guild_id, enabled: None, reply })
            .await
    }

    pub async fn snapshot(&self, guild_id: Id<GuildMarker>) -> Result<SessionSnapshot, Error> {
        self.request(|reply| ControlMsg::Snapshot { guild_id, reply }).await
    }

    /// The bot's own voice state changed (moved or disconnected by someone else).
    pub fn voice_state_changed(
        &self,
        guild_id: Id<GuildMarker>,
        channel_id: Option<Id<ChannelMarker>>,
    ) {
        let _ = self.tx.send(ControlMsg::VoiceStateChanged { guild_id, channel_id });
    }

    /// Stop every session and end the controller task.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.request(|reply| ControlMsg::Shutdown { reply }).await
    }
}

pub struct PlaybackController {
    registry: SessionRegistry,
    transport: Arc<dyn VoiceTransport>,
    event_bus: Arc<EventBus>,
    settings: ControllerSettings,
    sink: TransportEventSink,
    self_tx: mpsc::WeakUnboundedSender<ControlMsg>,
    next_token: u64,
    tickets: Arc<TicketBook>,
    admissions: HashMap<Id<GuildMarker>, Admissions>,
}

impl PlaybackController {
    /// Spawn the controller task.
    pub fn spawn(
        transport: Arc<dyn VoiceTransport>,
        event_bus: Arc<EventBus>,
        settings: ControllerSettings,
    ) -> (PlaybackHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let tickets = Arc::new(TicketBook::default());

        let controller = Self {
            registry: SessionRegistry::new(settings.loop_default),
            transport,
            event_bus,
            settings,
            sink: TransportEventSink::new(event_tx),
            self_tx: tx.downgrade(),
            next_token: 0,
            tickets: Arc::clone(&tickets),
            admissions: HashMap::new(),
        };

        let task = tokio::spawn(controller.run(rx, event_rx));
        (PlaybackHandle { tx, tickets }, task)
    }

    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<ControlMsg>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        info!("PlaybackController: started");
        loop {
            // Player notifications go first: anything the transport reported
            // before a command was sent must be applied before that command.
            tokio::select! {
                biased;
                Some(event) = events.recv() => {
                    self.on_transport_event(event).await;
                }
                msg = rx.recv() => {
                    match msg {
                        Some(ControlMsg::Shutdown { reply }) => {
                            self.shutdown_all().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(msg) => self.on_message(msg).await,
                        None => {
                            self.shutdown_all().await;
                            break;
                        }
                    }
                }
            }
        }
        info!("PlaybackController: stopped");
    }

    async fn on_message(&mut self, msg: ControlMsg) {
        match msg {
            ControlMsg::Join { guild_id, channel_id, text_channel, reply } => {
                let mut session = self.registry.checkout(guild_id);
                self.join(&mut session, channel_id, text_channel, reply).await;
                self.registry.checkin(session);
            }
            ControlMsg::Play { guild_id, stamp, request } => {
                self.admit(guild_id, stamp, Some(request)).await;
            }
            ControlMsg::TicketReleased { guild_id, stamp } => {
                self.admit(guild_id, stamp, None).await;
            }
            ControlMsg::Stop { guild_id, reply } => {
                let dropped = self.drop_cancelled_admissions(guild_id, "cancelled: stop requested").await;
                let was_active = match self.registry.take(guild_id) {
                    Some(mut session) => {
                        self.teardown(&mut session, "stop requested").await;
                        true
                    }
                    None => false,
                };
                let _ = reply.send(was_active || dropped > 0);
            }
            ControlMsg::SetLoop { guild_id, enabled, reply } => {
                let mut session = self.registry.checkout(guild_id);
                let enabled = enabled.unwrap_or(!session.effective_loop());
                session.set_loop(enabled);
                debug!("Guild {guild_id}: loop set to {enabled}");
                let _ = reply.send(session.effective_loop());
                self.registry.checkin(session);
            }
            ControlMsg::Snapshot { guild_id, reply } => {
                let snapshot = match self.registry.get(guild_id) {
                    Some(session) => session.snapshot(),
                    None => SessionSnapshot::idle(guild_id, self.registry.loop_default()),
                };
                let _ = reply.send(snapshot);
            }
            ControlMsg::VoiceStateChanged { guild_id, channel_id } => {
                if let Some(mut session) = self.registry.take(guild_id) {
                    self.voice_state_changed(&mut session, channel_id).await;
                    self.registry.checkin(session);
                }
            }
            ControlMsg::ConnectFinished { guild_id, channel_id, generation, result } => {
                self.connect_finished(guild_id, channel_id, generation, result).await;
            }
            ControlMsg::Shutdown { reply } => {
                // Handled in `run`.
                let _ = reply.send(());
            }
        }
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    /// Takes in a handed-in (`Some`) or released (`None`) ticket and runs
    /// every request that is now next in line.
    async fn admit(&mut self, guild_id: Id<GuildMarker>, stamp: TicketStamp, request: Option<PlayRequest>) {
        if !self.tickets.is_current(guild_id, stamp.epoch) {
            if let Some(request) = request {
                debug!("Guild {guild_id}: '{}' was cancelled while being prepared", request.song.title);
                reject(request, "cancelled before it could play").await;
            }
            return;
        }

        let admissions = self
            .admissions
            .entry(guild_id)
            .or_insert_with(|| Admissions::new(stamp.epoch));
        let mut stale = Vec::new();
        if admissions.epoch != stamp.epoch {
            let old = std::mem::replace(admissions, Admissions::new(stamp.epoch));
            stale.extend(old.parked.into_values().flatten());
        }
        admissions.parked.insert(stamp.seq, request);
        let mut ready = Vec::new();
        while let Some(entry) = admissions.parked.remove(&admissions.next) {
            admissions.next += 1;
            ready.extend(entry);
        }
        if !admissions.parked.is_empty() {
            trace!(
                "Guild {guild_id}: {} request(s) waiting for ticket {}",
                admissions.parked.len(),
                admissions.next
            );
        }

        for request in stale {
            reject(request, "cancelled before it could play").await;
        }
        for request in ready {
            let PlayRequest { channel_id, text_channel, song, kind, reply } = request;
            let mut session = self.registry.checkout(guild_id);
            self.play(&mut session, channel_id, text_channel, song, kind, reply).await;
            self.registry.checkin(session);
        }
    }

    /// Rejects requests parked under an epoch that has since been
    /// cancelled. Returns how many there were.
    async fn drop_cancelled_admissions(&mut self, guild_id: Id<GuildMarker>, reason: &str) -> usize {
        let cancelled = self
            .admissions
            .get(&guild_id)
            .is_some_and(|a| !self.tickets.is_current(guild_id, a.epoch));
        if !cancelled {
            return 0;
        }
        let Some(admissions) = self.admissions.remove(&guild_id) else {
            return 0;
        };
        let mut count = 0;
        for request in admissions.parked.into_values().flatten() {
            reject(request, reason).await;
            count += 1;
        }
        count
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    async fn join(
        &mut self,
        session: &mut Session,
        channel_id: Id<ChannelMarker>,
        text_channel: Option<Id<ChannelMarker>>,
        reply: JoinReply,
    ) {
        if session.voice_channel == Some(channel_id) {
            if text_channel.is_some() {
                session.text_channel = text_channel;
            }
            if session.connected {
                let _ = reply.send(Ok(JoinOutcome::AlreadyJoined));
            } else {
                session.join_waiters.push((reply, JoinOutcome::Joined));
            }
            return;
        }

        let outcome = if session.voice_channel.is_some() {
            self.rebind(session).await;
            JoinOutcome::Moved
        } else {
            JoinOutcome::Joined
        };
        if text_channel.is_some() {
            session.text_channel = text_channel;
        }
        session.join_waiters.push((reply, outcome));
        self.begin_connect(session, channel_id).await;
    }

    async fn play(
        &mut self,
        session: &mut Session,
        channel_id: Id<ChannelMarker>,
        text_channel: Option<Id<ChannelMarker>>,
        song: Song,
        kind: PlayKind,
        reply: PlayReply,
    ) {
        if session.voice_channel.is_some_and(|bound| bound != channel_id) {
            self.rebind(session).await;
        }
        if text_channel.is_some() {
            session.text_channel = text_channel;
        }

        if kind == PlayKind::Ephemeral {
            if let Source::SynthesizedSpeech { path } = &song.source {
                if let Some(stale) = session.begin_ephemeral(path.clone()) {
                    remove_ephemeral_file(&stale).await;
                }
            }
        }

        if !session.connected && session.state != PlaybackState::Connecting {
            session.pending = Some(PendingPlay { song, reply: Some(reply) });
            self.begin_connect(session, channel_id).await;
            return;
        }

        if session.state == PlaybackState::Connecting {
            match session.pending.take() {
                None => {
                    session.pending = Some(PendingPlay { song, reply: Some(reply) });
                }
                Some(previous) if kind == PlayKind::Normal && self.settings.queue_enabled => {
                    session.pending = Some(previous);
                    Self::enqueue(session, song, reply);
                }
                Some(previous) => {
                    self.displace_pending(session, previous);
                    session.pending = Some(PendingPlay { song, reply: Some(reply) });
                }
            }
            return;
        }

        // Connected: idle or playing.
        let busy = session.state == PlaybackState::Playing;
        if busy && kind == PlayKind::Normal && self.settings.queue_enabled {
            Self::enqueue(session, song, reply);
            return;
        }

        let title = song.title.clone();
        match self.start_track(session, song).await {
            Ok(()) => {
                let _ = reply.send(Ok(PlayOutcome::Started { title }));
            }
            Err(e) => {
                warn!("Guild {}: could not start '{}': {e}", session.guild_id, title);
                self.fail_to_idle(session).await;
                let _ = reply.send(Err(e));
            }
        }
    }

    fn enqueue(session: &mut Session, song: Song, reply: PlayReply) {
        let title = song.title.clone();
        session.queue.push_back(song);
        let position = session.queue.len();
        debug!("Guild {}: queued '{}' at position {position}", session.guild_id, title);
        let _ = reply.send(Ok(PlayOutcome::Queued { title, position }));
    }

    /// A parked request is pushed aside by a newer one. In queue mode it
    /// keeps its turn at the head of the queue; otherwise it is superseded.
    fn displace_pending(&self, session: &mut Session, previous: PendingPlay) {
        let PendingPlay { song, reply } = previous;
        if song.source.is_ephemeral() {
            // Only reachable when a second speech replaces the first; the
            // first one's file was already handed over by `begin_ephemeral`.
            if let Some(reply) = reply {
                let _ = reply.send(Err(Error::Superseded("replaced by newer speech".into())));
            }
            return;
        }
        if self.settings.queue_enabled {
            let title = song.title.clone();
            session.queue.push_front(song);
            if let Some(reply) = reply {
                let _ = reply.send(Ok(PlayOutcome::Queued { title, position: 1 }));
            }
        } else if let Some(reply) = reply {
            let _ = reply.send(Err(Error::Superseded("replaced by a newer request".into())));
        }
    }

    async fn voice_state_changed(
        &mut self,
        session: &mut Session,
        channel_id: Option<Id<ChannelMarker>>,
    ) {
        // Our own connects and moves report voice states too; only react
        // once the session is settled on a channel.
        if !session.connected || session.state == PlaybackState::Connecting {
            return;
        }
        if channel_id == session.voice_channel {
            return;
        }
        let reason = match channel_id {
            Some(_) => "moved to another voice channel",
            None => "disconnected from voice",
        };
        info!("Guild {}: {reason}, resetting session", session.guild_id);
        // Requests still resolving were meant for the connection we lost.
        self.tickets.cancel(session.guild_id);
        self.drop_cancelled_admissions(session.guild_id, "cancelled: voice connection lost")
            .await;
        self.announce(session, &format!("Stopped playback: {reason}.")).await;
        self.teardown(session, reason).await;
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    async fn begin_connect(&mut self, session: &mut Session, channel_id: Id<ChannelMarker>) {
        session.voice_channel = Some(channel_id);
        session.connected = false;
        self.set_state(session, PlaybackState::Connecting).await;

        let guild_id = session.guild_id;
        let generation = session.generation;
        let transport = Arc::clone(&self.transport);
        let connect_timeout = self.settings.connect_timeout;
        let self_tx = self.self_tx.clone();

        tokio::spawn(async move {
            let result = match tokio::time::timeout(connect_timeout, transport.connect(guild_id, channel_id)).await {
                Ok(result) => result,
                Err(_) => Err(Error::UpstreamTimeout(format!(
                    "voice connection not ready after {}s",
                    connect_timeout.as_secs()
                ))),
            };
            match self_tx.upgrade() {
                Some(tx) => {
                    let _ = tx.send(ControlMsg::ConnectFinished { guild_id, channel_id, generation, result });
                }
                None => {
                    // Controller is gone; leave nothing behind.
                    if result.is_ok() {
                        let _ = transport.disconnect(guild_id).await;
                    }
                }
            }
        });
    }

    async fn connect_finished(
        &mut self,
        guild_id: Id<GuildMarker>,
        channel_id: Id<ChannelMarker>,
        generation: u64,
        result: Result<(), Error>,
    ) {
        let Some(mut session) = self.registry.take(guild_id) else {
            debug!("Guild {guild_id}: connect (gen {generation}) finished after the session ended");
            if result.is_ok() {
                self.disconnect_quietly(guild_id).await;
            }
            return;
        };

        let current = session.generation == generation
            && session.state == PlaybackState::Connecting
            && session.voice_channel == Some(channel_id);
        if !current {
            debug!(
                "Guild {guild_id}: discarding stale connect (gen {generation}, session gen {})",
                session.generation
            );
            // A newer connect owns the guild's connection, or we are already
            // connected; only a session with no connection at all is orphaned.
            if result.is_ok() && !session.connected && session.state != PlaybackState::Connecting {
                self.disconnect_quietly(guild_id).await;
            }
            self.registry.checkin(session);
            return;
        }

        match result {
            Ok(()) => {
                info!("Guild {guild_id}: connected to voice channel {channel_id}");
                session.connected = true;
                for (reply, outcome) in session.join_waiters.drain(..) {
                    let _ = reply.send(Ok(outcome));
                }
                match session.pending.take() {
                    Some(PendingPlay { song, reply }) => {
                        let title = song.title.clone();
                        match self.start_track(&mut session, song).await {
                            Ok(()) => {
                                if let Some(reply) = reply {
                                    let _ = reply.send(Ok(PlayOutcome::Started { title }));
                                }
                            }
                            Err(e) => {
                                warn!("Guild {guild_id}: could not start '{title}': {e}");
                                self.fail_to_idle(&mut session).await;
                                if let Some(reply) = reply {
                                    let _ = reply.send(Err(e));
                                }
                            }
                        }
                    }
                    None if !session.queue.is_empty() => {
                        self.advance(&mut session, false).await;
                    }
                    None => {
                        self.set_state(&mut session, PlaybackState::Idle).await;
                    }
                }
            }
            Err(e) => {
                error!("Guild {guild_id}: voice connection failed: {e}");
                self.set_state(&mut session, PlaybackState::Error).await;
                for (reply, _) in session.join_waiters.drain(..) {
                    let _ = reply.send(Err(copy_connect_error(&e)));
                }
                if let Some(PendingPlay { reply: Some(reply), .. }) = session.pending.take() {
                    let _ = reply.send(Err(copy_connect_error(&e)));
                }
                // The connection is unusable: destroy it and reset so the
                // next command starts clean.
                self.teardown(&mut session, "voice connection failed").await;
            }
        }
        self.registry.checkin(session);
    }

    /// Tear the session down for a channel move and continue with a fresh
    /// one (new generation) that keeps the announce channel.
    async fn rebind(&mut self, session: &mut Session) {
        let text_channel = session.text_channel;
        let loop_enabled = session.effective_loop();
        self.teardown(session, "moving to another voice channel").await;
        *session = self.registry.fresh(session.guild_id);
        session.text_channel = text_channel;
        session.loop_enabled = loop_enabled;
    }

    /// Stop player, destroy connection, clear queue/source/pending, delete
    /// any ephemeral file and mark the session closed.
    async fn teardown(&mut self, session: &mut Session, reason: &str) {
        let guild_id = session.guild_id;
        info!("Guild {guild_id}: tearing down session ({reason})");

        if session.player.take().is_some() {
            if let Err(e) = self.transport.stop(guild_id).await {
                warn!("Guild {guild_id}: stopping player failed: {e}");
            }
        }
        if session.connected || session.state == PlaybackState::Connecting {
            self.disconnect_quietly(guild_id).await;
        }
        session.connected = false;
        session.voice_channel = None;
        session.queue.clear();

        if let Some(PendingPlay { reply: Some(reply), .. }) = session.pending.take() {
            let _ = reply.send(Err(Error::Superseded(format!("cancelled: {reason}"))));
        }
        for (reply, _) in session.join_waiters.drain(..) {
            let _ = reply.send(Err(Error::Superseded(format!("cancelled: {reason}"))));
        }
        if let Some(path) = session.finish_ephemeral() {
            remove_ephemeral_file(&path).await;
        }
        session.loop_enabled = self.registry.loop_default();

        if session.state != PlaybackState::Idle {
            self.set_state(session, PlaybackState::Idle).await;
        }
        session.close();
    }

    async fn disconnect_quietly(&self, guild_id: Id<GuildMarker>) {
        if let Err(e) = self.transport.disconnect(guild_id).await {
            warn!("Guild {guild_id}: disconnect failed: {e}");
        }
    }

    async fn shutdown_all(&mut self) {
        let guilds = self.registry.guild_ids();
        info!("PlaybackController: stopping {} session(s)", guilds.len());
        let waiting: Vec<_> = self.admissions.keys().copied().collect();
        for guild_id in waiting.into_iter().chain(guilds.iter().copied()) {
            self.tickets.cancel(guild_id);
            self.drop_cancelled_admissions(guild_id, "shutting down").await;
        }
        for guild_id in guilds {
            if let Some(mut session) = self.registry.take(guild_id) {
                self.teardown(&mut session, "shutting down").await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Players
    // ------------------------------------------------------------------

    /// Replace whatever is playing with a fresh player for `song`.
    async fn start_track(&mut self, session: &mut Session, song: Song) -> Result<(), Error> {
        let guild_id = session.guild_id;
        if let Some(previous) = session.player.take() {
            if let Err(e) = self.transport.stop(guild_id).await {
                warn!("Guild {guild_id}: stopping previous player failed: {e}");
            }
            // Speech replaced by something else. Speech replacing speech was
            // already settled by `begin_ephemeral`.
            let replaced_speech = match (&previous.song.source, &session.ephemeral) {
                (Source::SynthesizedSpeech { path }, Some(eph)) => *path == eph.path,
                _ => false,
            };
            if replaced_speech {
                if let Some(path) = session.finish_ephemeral() {
                    remove_ephemeral_file(&path).await;
                }
            }
        }

        self.next_token += 1;
        let token = TrackToken(self.next_token);
        self.transport
            .play(guild_id, &song.source, token, self.sink.clone())
            .await?;

        debug!("Guild {guild_id}: playing '{}' ({}) as {:?}", song.title, song.source.kind(), token);
        session.player = Some(ActivePlayer { token, song });
        self.set_state(session, PlaybackState::Playing).await;
        Ok(())
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        let TransportEvent { guild_id, token, status } = event;
        let Some(mut session) = self.registry.take(guild_id) else {
            trace!("Guild {guild_id}: event {status:?} for {token:?} without a session");
            return;
        };
        if session.current_token() != Some(token) {
            trace!("Guild {guild_id}: ignoring {status:?} from replaced player {token:?}");
            self.registry.checkin(session);
            return;
        }

        match status {
            TrackStatus::Playing => {
                trace!("Guild {guild_id}: transport reports {token:?} playing");
            }
            TrackStatus::Idle => {
                self.advance(&mut session, false).await;
            }
            TrackStatus::Error(reason) => {
                let title = session
                    .active_song()
                    .map(|s| s.title.clone())
                    .unwrap_or_default();
                error!("Guild {guild_id}: error playing '{title}': {reason}");
                self.set_state(&mut session, PlaybackState::Error).await;
                self.announce(&session, &format!("Error playing track: {title}")).await;
                self.advance(&mut session, true).await;
            }
        }
        self.registry.checkin(session);
    }

    /// The current player finished (or failed). Clean up speech, then pick
    /// the queue head, else the same source again when looping, else idle.
    async fn advance(&mut self, session: &mut Session, mut failed: bool) {
        let finished = session.player.take();
        if let Some(path) = session.finish_ephemeral() {
            remove_ephemeral_file(&path).await;
        }

        let mut replay = finished.map(|p| p.song);
        loop {
            let (next, from_queue) = match session.queue.pop_front() {
                Some(song) => (song, true),
                None => match replay.take() {
                    Some(song) if !failed && session.loop_enabled && !song.source.is_ephemeral() => {
                        (song, false)
                    }
                    _ => {
                        self.set_state(session, PlaybackState::Idle).await;
                        return;
                    }
                },
            };

            let title = next.title.clone();
            match self.start_track(session, next).await {
                Ok(()) => {
                    if from_queue {
                        self.announce(session, &format!("Now playing: {title}")).await;
                    } else {
                        debug!("Guild {}: looping '{title}'", session.guild_id);
                    }
                    return;
                }
                Err(e) => {
                    error!("Guild {}: could not start '{title}': {e}", session.guild_id);
                    self.announce(session, &format!("Error playing track: {title}")).await;
                    failed = true;
                }
            }
        }
    }

    /// A request failed before its player existed: report through `Error`
    /// and settle in `Idle`, keeping the connection.
    async fn fail_to_idle(&mut self, session: &mut Session) {
        self.set_state(session, PlaybackState::Error).await;
        if let Some(path) = session.finish_ephemeral() {
            remove_ephemeral_file(&path).await;
        }
        if session.queue.is_empty() {
            self.set_state(session, PlaybackState::Idle).await;
        } else {
            self.advance(session, true).await;
        }
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    async fn set_state(&self, session: &mut Session, to: PlaybackState) {
        let from = session.state;
        if from == to && to != PlaybackState::Playing {
            return;
        }
        session.state = to;
        debug!("Guild {}: {from} -> {to}", session.guild_id);
        self.event_bus
            .publish(BotEvent::StateChanged { guild_id: session.guild_id, from, to })
            .await;
    }

    async fn announce(&self, session: &Session, text: &str) {
        if let Some(channel_id) = session.text_channel {
            self.event_bus.publish_notice(session.guild_id, channel_id, text).await;
        }
    }
}

/// Connect failures go to every waiter; each needs its own value.
fn copy_connect_error(e: &Error) -> Error {
    match e {
        Error::UpstreamTimeout(msg) => Error::UpstreamTimeout(msg.clone()),
        Error::Connection(msg) => Error::Connection(msg.clone()),
        other if other.is_timeout() => Error::UpstreamTimeout(other.to_string()),
        other => Error::Connection(other.to_string()),
    }
}

/// Turns away a request that will never run. A speech file dies with it.
async fn reject(request: PlayRequest, reason: &str) {
    if request.kind == PlayKind::Ephemeral {
        if let Source::SynthesizedSpeech { path } = &request.song.source {
            remove_ephemeral_file(path).await;
        }
    }
    let _ = request.reply.send(Err(Error::Superseded(reason.to_string())));
}
