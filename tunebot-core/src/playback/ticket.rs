//! Request tickets: a guild's place in line for play requests that still
//! have a resolve or synthesis step ahead of them.
//!
//! A ticket is taken when the command arrives. It carries the guild's
//! cancel epoch (bumped by `stop` and by losing the voice connection) and
//! a sequence number within that epoch. The controller admits requests in
//! sequence order and rejects any whose epoch is no longer current.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use twilight_model::id::Id;
use twilight_model::id::marker::GuildMarker;

use crate::playback::controller::ControlMsg;

/// Epoch and position of a ticket once it has been handed in or dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TicketStamp {
    pub epoch: u64,
    pub seq: u64,
}

#[derive(Debug, Default)]
struct GuildTickets {
    epoch: u64,
    next_seq: u64,
    /// Issued this epoch and neither handed in nor dropped yet.
    open: usize,
}

/// Per-guild epochs and sequence counters, shared by every handle and the
/// controller task.
#[derive(Debug, Default)]
pub(crate) struct TicketBook {
    guilds: Mutex<HashMap<Id<GuildMarker>, GuildTickets>>,
}

impl TicketBook {
    fn guilds(&self) -> MutexGuard<'_, HashMap<Id<GuildMarker>, GuildTickets>> {
        self.guilds.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn issue(&self, guild_id: Id<GuildMarker>) -> TicketStamp {
        let mut guilds = self.guilds();
        let entry = guilds.entry(guild_id).or_default();
        let stamp = TicketStamp { epoch: entry.epoch, seq: entry.next_seq };
        entry.next_seq += 1;
        entry.open += 1;
        stamp
    }

    fn settle(&self, guild_id: Id<GuildMarker>, epoch: u64) {
        if let Some(entry) = self.guilds().get_mut(&guild_id) {
            if entry.epoch == epoch {
                entry.open = entry.open.saturating_sub(1);
            }
        }
    }

    /// Invalidates every ticket issued so far for the guild. Returns how
    /// many of them were still out.
    pub fn cancel(&self, guild_id: Id<GuildMarker>) -> usize {
        let mut guilds = self.guilds();
        let entry = guilds.entry(guild_id).or_default();
        let open = entry.open;
        entry.epoch += 1;
        entry.next_seq = 0;
        entry.open = 0;
        open
    }

    pub fn is_current(&self, guild_id: Id<GuildMarker>, epoch: u64) -> bool {
        self.guilds()
            .get(&guild_id)
            .map(|entry| entry.epoch)
            .unwrap_or(0)
            == epoch
    }
}

/// A reserved place in the guild's request order. Hand it to
/// `PlaybackHandle::play_with` once the song is known. Dropping it unused
/// (the resolve failed, the command bailed out) releases the place.
#[derive(Debug)]
pub struct RequestTicket {
    guild_id: Id<GuildMarker>,
    stamp: TicketStamp,
    book: Arc<TicketBook>,
    release: Option<mpsc::UnboundedSender<ControlMsg>>,
}

impl RequestTicket {
    pub(crate) fn issue(
        guild_id: Id<GuildMarker>,
        book: Arc<TicketBook>,
        release: mpsc::UnboundedSender<ControlMsg>,
    ) -> Self {
        let stamp = book.issue(guild_id);
        Self {
            guild_id,
            stamp,
            book,
            release: Some(release),
        }
    }

    pub fn guild_id(&self) -> Id<GuildMarker> {
        self.guild_id
    }

    /// False once `stop` (or a lost connection) has cancelled the guild's
    /// outstanding requests.
    pub fn is_current(&self) -> bool {
        self.book.is_current(self.guild_id, self.stamp.epoch)
    }

    /// Hands the ticket in. The caller sends the request carrying the stamp.
    pub(crate) fn redeem(mut self) -> TicketStamp {
        self.release = None;
        self.book.settle(self.guild_id, self.stamp.epoch);
        self.stamp
    }
}

impl Drop for RequestTicket {
    fn drop(&mut self) {
        if let Some(tx) = self.release.take() {
            self.book.settle(self.guild_id, self.stamp.epoch);
            let _ = tx.send(ControlMsg::TicketReleased {
                guild_id: self.guild_id,
                stamp: self.stamp,
            });
        }
    }
}
