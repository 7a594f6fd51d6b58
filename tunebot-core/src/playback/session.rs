//! Per-guild playback session and the registry that owns them.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use tokio::sync::oneshot;
use twilight_model::id::Id;
use twilight_model::id::marker::{ChannelMarker, GuildMarker};

use crate::Error;
use crate::platforms::TrackToken;
use tunebot_common::models::{JoinOutcome, PlayOutcome, PlaybackState, SessionSnapshot, Song};

pub(crate) type PlayReply = oneshot::Sender<Result<PlayOutcome, Error>>;
pub(crate) type JoinReply = oneshot::Sender<Result<JoinOutcome, Error>>;

/// The player currently bound to the session's connection together with
/// what it plays. One value, so a player never exists without a source.
#[derive(Debug, Clone)]
pub struct ActivePlayer {
    pub token: TrackToken,
    pub song: Song,
}

/// Generated speech in flight and the loop flag to restore afterwards.
#[derive(Debug, Clone)]
pub struct EphemeralPlayback {
    pub path: PathBuf,
    pub prior_loop: bool,
}

/// A play request parked while the connection is being established.
pub(crate) struct PendingPlay {
    pub song: Song,
    pub reply: Option<PlayReply>,
}

pub struct Session {
    pub guild_id: Id<GuildMarker>,
    pub state: PlaybackState,
    /// Channel the session is bound (or binding) to.
    pub voice_channel: Option<Id<ChannelMarker>>,
    pub connected: bool,
    pub player: Option<ActivePlayer>,
    pub loop_enabled: bool,
    pub queue: VecDeque<Song>,
    /// Unique per session instance. Connect completions carry it back and
    /// are discarded when it no longer matches.
    pub generation: u64,
    /// Where queue advances and playback errors are announced.
    pub text_channel: Option<Id<ChannelMarker>>,
    pub ephemeral: Option<EphemeralPlayback>,
    pub(crate) pending: Option<PendingPlay>,
    pub(crate) join_waiters: Vec<(JoinReply, JoinOutcome)>,
    closed: bool,
}

impl Session {
    fn new(guild_id: Id<GuildMarker>, generation: u64, loop_enabled: bool) -> Self {
        Self {
            guild_id,
            state: PlaybackState::Idle,
            voice_channel: None,
            connected: false,
            player: None,
            loop_enabled,
            queue: VecDeque::new(),
            generation,
            text_channel: None,
            ephemeral: None,
            pending: None,
            join_waiters: Vec::new(),
            closed: false,
        }
    }

    pub fn active_song(&self) -> Option<&Song> {
        self.player.as_ref().map(|p| &p.song)
    }

    pub fn current_token(&self) -> Option<TrackToken> {
        self.player.as_ref().map(|p| p.token)
    }

    /// Marks the session for removal when it is checked back in.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Ends an ephemeral playback: restores the saved loop flag and hands
    /// back the file to delete. Returns `None` once it has already run.
    pub fn finish_ephemeral(&mut self) -> Option<PathBuf> {
        let eph = self.ephemeral.take()?;
        self.loop_enabled = eph.prior_loop;
        Some(eph.path)
    }

    /// Saves the loop flag and forces it off for the duration of a speech
    /// playback. An unfinished previous ephemeral is finished first and its
    /// file returned for deletion.
    pub fn begin_ephemeral(&mut self, path: PathBuf) -> Option<PathBuf> {
        let stale = self.finish_ephemeral();
        self.ephemeral = Some(EphemeralPlayback {
            path,
            prior_loop: self.loop_enabled,
        });
        self.loop_enabled = false;
        stale
    }

    /// Loop changes during speech apply once the speech is over.
    pub fn set_loop(&mut self, enabled: bool) {
        match self.ephemeral.as_mut() {
            Some(eph) => eph.prior_loop = enabled,
            None => self.loop_enabled = enabled,
        }
    }

    /// The value `loop_enabled` will have when no speech is playing.
    pub fn effective_loop(&self) -> bool {
        self.ephemeral
            .as_ref()
            .map(|e| e.prior_loop)
            .unwrap_or(self.loop_enabled)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            guild_id: self.guild_id,
            state: self.state,
            voice_channel: self.voice_channel,
            connected: self.connected,
            now_playing: self.active_song().cloned(),
            queue: self.queue.iter().map(|s| s.title.clone()).collect(),
            loop_enabled: self.loop_enabled,
            generation: self.generation,
        }
    }
}

/// Guild id → session. Owned by the controller task; sessions are checked
/// out while a message is handled and checked back in afterwards.
pub struct SessionRegistry {
    sessions: HashMap<Id<GuildMarker>, Session>,
    next_generation: u64,
    loop_default: bool,
}

impl SessionRegistry {
    pub fn new(loop_default: bool) -> Self {
        Self {
            sessions: HashMap::new(),
            next_generation: 1,
            loop_default,
        }
    }

    pub fn loop_default(&self) -> bool {
        self.loop_default
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, guild_id: Id<GuildMarker>) -> Option<&Session> {
        self.sessions.get(&guild_id)
    }

    pub fn guild_ids(&self) -> Vec<Id<GuildMarker>> {
        self.sessions.keys().copied().collect()
    }

    /// A brand-new session with its own generation.
    pub fn fresh(&mut self, guild_id: Id<GuildMarker>) -> Session {
        let generation = self.next_generation;
        self.next_generation += 1;
        Session::new(guild_id, generation, self.loop_default)
    }

    /// Takes the guild's session out of the registry, creating one if needed.
    pub fn checkout(&mut self, guild_id: Id<GuildMarker>) -> Session {
        match self.sessions.remove(&guild_id) {
            Some(session) => session,
            None => self.fresh(guild_id),
        }
    }

    /// Takes the guild's session out only if it exists.
    pub fn take(&mut self, guild_id: Id<GuildMarker>) -> Option<Session> {
        self.sessions.remove(&guild_id)
    }

    /// Puts a session back. Closed sessions and untouched idle ones are dropped.
    pub fn checkin(&mut self, session: Session) {
        if session.is_closed() || self.is_disposable(&session) {
            return;
        }
        self.sessions.insert(session.guild_id, session);
    }

    fn is_disposable(&self, session: &Session) -> bool {
        session.state == PlaybackState::Idle
            && !session.connected
            && session.voice_channel.is_none()
            && session.player.is_none()
            && session.queue.is_empty()
            && session.pending.is_none()
            && session.ephemeral.is_none()
            && session.join_waiters.is_empty()
            && session.loop_enabled == self.loop_default
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tunebot_common::models::Source;

    fn song(title: &str) -> Song {
        Song::new(title, Source::RemoteStream { url: format!("https://example.com/{title}.mp3") })
    }

    #[test]
    fn generations_are_unique_across_sessions() {
        let mut registry = SessionRegistry::new(true);
        let a = registry.fresh(Id::new(1));
        let b = registry.fresh(Id::new(1));
        assert_ne!(a.generation, b.generation);
    }

    #[test]
    fn ephemeral_restores_loop_exactly_once() {
        let mut registry = SessionRegistry::new(true);
        let mut session = registry.checkout(Id::new(1));
        assert!(session.loop_enabled);

        assert!(session.begin_ephemeral("/tmp/a.mp3".into()).is_none());
        assert!(!session.loop_enabled);

        assert_eq!(session.finish_ephemeral().as_deref(), Some(Path::new("/tmp/a.mp3")));
        assert!(session.loop_enabled);
        assert!(session.finish_ephemeral().is_none());
    }

    #[test]
    fn second_speech_finishes_the_first() {
        let mut registry = SessionRegistry::new(false);
        let mut session = registry.checkout(Id::new(1));
        session.begin_ephemeral("/tmp/a.mp3".into());
        let stale = session.begin_ephemeral("/tmp/b.mp3".into());
        assert_eq!(stale.as_deref(), Some(Path::new("/tmp/a.mp3")));
        assert!(!session.effective_loop());
        assert_eq!(session.finish_ephemeral().as_deref(), Some(Path::new("/tmp/b.mp3")));
        assert!(!session.loop_enabled);
    }

    #[test]
    fn loop_change_during_speech_applies_afterwards() {
        let mut registry = SessionRegistry::new(true);
        let mut session = registry.checkout(Id::new(1));
        session.begin_ephemeral("/tmp/a.mp3".into());
        session.set_loop(false);
        assert!(!session.loop_enabled);
        session.finish_ephemeral();
        assert!(!session.loop_enabled);
    }

    #[test]
    fn checkin_keeps_active_sessions_and_drops_closed_ones() {
        let mut registry = SessionRegistry::new(true);

        let mut session = registry.checkout(Id::new(1));
        session.queue.push_back(song("a"));
        registry.checkin(session);
        assert!(registry.get(Id::new(1)).is_some());

        let mut session = registry.checkout(Id::new(1));
        session.close();
        registry.checkin(session);
        assert!(registry.get(Id::new(1)).is_none());
    }
}
