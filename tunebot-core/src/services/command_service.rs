use std::sync::Arc;

use tracing::{debug, info, warn};
use twilight_model::id::Id;
use twilight_model::id::marker::{ChannelMarker, GuildMarker, UserMarker};

use crate::Error;
use crate::platforms::ChatClient;
use crate::playback::{PlaybackHandle, RequestTicket, SourceResolver};
use crate::services::command_parser::{BotCommand, HELP_TEXT, parse_command, parse_console_line};
use crate::services::speech_service::SpeechService;
use tunebot_ai::ChatResponder;
use tunebot_common::models::{JoinOutcome, PlayOutcome, Song};

/// Discord rejects longer messages.
const MAX_REPLY_CHARS: usize = 1900;

/// Where a command came from.
#[derive(Debug, Clone, Copy)]
pub struct CommandContext {
    pub guild_id: Option<Id<GuildMarker>>,
    pub channel_id: Id<ChannelMarker>,
    pub author_id: Option<Id<UserMarker>>,
    /// The author's current voice channel, if any.
    pub author_voice_channel: Option<Id<ChannelMarker>>,
}

impl CommandContext {
    fn guild(&self) -> Result<Id<GuildMarker>, Error> {
        self.guild_id
            .ok_or_else(|| Error::PermissionDenied("This command only works in a server.".into()))
    }

    fn voice_channel(&self) -> Result<Id<ChannelMarker>, Error> {
        self.author_voice_channel
            .ok_or_else(|| Error::PermissionDenied("You need to be in a voice channel!".into()))
    }
}

/// A parsed command with its place in the guild's request order already
/// reserved. Admit on arrival, run whenever.
pub struct AdmittedCommand {
    ctx: CommandContext,
    command: BotCommand,
    ticket: Option<RequestTicket>,
}

/// Capabilities switched on for this process.
#[derive(Debug, Clone)]
pub struct CommandSettings {
    pub prefix: String,
    pub streaming_enabled: bool,
}

pub struct CommandService {
    settings: CommandSettings,
    playback: PlaybackHandle,
    resolver: Arc<SourceResolver>,
    speech: Option<Arc<SpeechService>>,
    chat: Arc<dyn ChatClient>,
    responder: Option<Arc<dyn ChatResponder>>,
}

fn truncate_reply(text: String) -> String {
    if text.chars().count() <= MAX_REPLY_CHARS {
        return text;
    }
    let mut cut: String = text.chars().take(MAX_REPLY_CHARS).collect();
    cut.push('…');
    cut
}

fn play_reply(outcome: PlayOutcome) -> String {
    match outcome {
        PlayOutcome::Started { title } => format!("Now playing: {title}"),
        PlayOutcome::Queued { title, position } => format!("Queued: {title} (position {position})"),
    }
}

impl CommandService {
    pub fn new(
        settings: CommandSettings,
        playback: PlaybackHandle,
        resolver: Arc<SourceResolver>,
        speech: Option<Arc<SpeechService>>,
        chat: Arc<dyn ChatClient>,
        responder: Option<Arc<dyn ChatResponder>>,
    ) -> Self {
        debug!("Initializing CommandService");
        Self {
            settings,
            playback,
            resolver,
            speech,
            chat,
            responder,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.settings.prefix
    }

    /// A chat message. `None` when it is not one of our commands.
    pub async fn handle_line(&self, ctx: CommandContext, line: &str) -> Option<String> {
        Some(match self.admit_line(ctx, line)? {
            Ok(admitted) => self.run(admitted).await,
            Err(reply) => reply,
        })
    }

    /// Parses a chat message and reserves its place in line. Call this in
    /// arrival order; `Err` holds the reply for a malformed command.
    pub fn admit_line(&self, ctx: CommandContext, line: &str) -> Option<Result<AdmittedCommand, String>> {
        Some(match parse_command(&self.settings.prefix, line)? {
            Ok(command) => Ok(self.admit(ctx, command)),
            Err(e) => Err(e.user_message()),
        })
    }

    pub fn admit(&self, ctx: CommandContext, command: BotCommand) -> AdmittedCommand {
        let ticket = match (&command, ctx.guild_id) {
            (BotCommand::Play { .. } | BotCommand::Music { .. } | BotCommand::Speak { .. }, Some(guild_id)) => {
                Some(self.playback.ticket(guild_id))
            }
            _ => None,
        };
        AdmittedCommand { ctx, command, ticket }
    }

    /// A console line; the prefix is optional there.
    pub async fn handle_console_line(&self, ctx: CommandContext, line: &str) -> Option<String> {
        match parse_console_line(&self.settings.prefix, line)? {
            Ok(command) => Some(self.reply(ctx, command).await),
            Err(e) => Some(e.user_message()),
        }
    }

    /// Runs a command and renders the one reply it produces, success or not.
    pub async fn reply(&self, ctx: CommandContext, command: BotCommand) -> String {
        self.run(self.admit(ctx, command)).await
    }

    pub async fn run(&self, admitted: AdmittedCommand) -> String {
        let AdmittedCommand { ctx, command, ticket } = admitted;
        let name = command.name();
        match self.execute(ctx, command, ticket).await {
            Ok(text) => truncate_reply(text),
            Err(e) => {
                warn!("Command '{name}' failed in channel {}: {e}", ctx.channel_id);
                e.user_message()
            }
        }
    }

    pub async fn execute(
        &self,
        ctx: CommandContext,
        command: BotCommand,
        ticket: Option<RequestTicket>,
    ) -> Result<String, Error> {
        debug!("Executing '{}' from {:?} in {}", command.name(), ctx.author_id, ctx.channel_id);
        match command {
            BotCommand::Join { channel_id } => {
                let guild_id = ctx.guild()?;
                let channel_id = match channel_id {
                    Some(id) => id,
                    None => ctx.voice_channel()?,
                };
                let outcome = self.playback.join(guild_id, channel_id, Some(ctx.channel_id)).await?;
                Ok(match outcome {
                    JoinOutcome::Joined => "Joined your voice channel!".to_string(),
                    JoinOutcome::Moved => "Moved to your voice channel!".to_string(),
                    JoinOutcome::AlreadyJoined => "Already in that voice channel.".to_string(),
                })
            }
            BotCommand::Play { query } => {
                let guild_id = ctx.guild()?;
                let ticket = ticket.unwrap_or_else(|| self.playback.ticket(guild_id));
                let voice = ctx.voice_channel()?;
                let song = self.resolver.resolve_play(&query, self.settings.streaming_enabled).await?;
                self.start(ctx, ticket, voice, song).await
            }
            BotCommand::Music { url } => {
                let guild_id = ctx.guild()?;
                let ticket = ticket.unwrap_or_else(|| self.playback.ticket(guild_id));
                if !self.settings.streaming_enabled {
                    return Err(Error::PermissionDenied("Streaming is disabled.".into()));
                }
                let voice = ctx.voice_channel()?;
                let song = self.resolver.resolve_stream(&url)?;
                self.start(ctx, ticket, voice, song).await
            }
            BotCommand::Speak { text } => {
                let guild_id = ctx.guild()?;
                let speech = self
                    .speech
                    .as_ref()
                    .ok_or_else(|| Error::PermissionDenied("Speech is disabled.".into()))?;
                let ticket = ticket.unwrap_or_else(|| self.playback.ticket(guild_id));
                let voice = ctx.voice_channel()?;
                let outcome = speech.speak_with(ticket, voice, Some(ctx.channel_id), &text).await?;
                Ok(match outcome {
                    PlayOutcome::Started { .. } => "Speaking!".to_string(),
                    queued => play_reply(queued),
                })
            }
            BotCommand::Stop => {
                let guild_id = ctx.guild()?;
                if self.playback.stop(guild_id).await? {
                    info!("Guild {guild_id}: stopped by {:?}", ctx.author_id);
                    Ok("Stopped playback and left the voice channel.".to_string())
                } else {
                    Ok("Nothing to stop.".to_string())
                }
            }
            BotCommand::List => {
                let names = self.resolver.list_local().await?;
                if names.is_empty() {
                    return Ok("No audio files found.".to_string());
                }
                let mut text = String::from("Available files:");
                for name in names {
                    text.push_str("\n- ");
                    text.push_str(&name);
                }
                Ok(text)
            }
            BotCommand::Dm { user_id, text } => {
                let name = self.chat.fetch_user_name(user_id).await?;
                self.chat.send_direct_message(user_id, &text).await?;
                Ok(format!("Sent a DM to {name}."))
            }
            BotCommand::Chat { text } => {
                let responder = self
                    .responder
                    .as_ref()
                    .ok_or_else(|| Error::Config("chat".into()))?;
                let answer = responder.reply(&text).await?;
                debug!("{} answered {} chars", responder.name(), answer.len());
                Ok(answer)
            }
            BotCommand::Loop { enabled } => {
                let guild_id = ctx.guild()?;
                let now = match enabled {
                    Some(value) => self.playback.set_loop(guild_id, value).await?,
                    None => self.playback.toggle_loop(guild_id).await?,
                };
                Ok(format!("Looping is now {}.", if now { "on" } else { "off" }))
            }
            BotCommand::Queue => {
                let guild_id = ctx.guild()?;
                let snapshot = self.playback.snapshot(guild_id).await?;
                let mut text = match &snapshot.now_playing {
                    Some(song) => format!("Now playing: {} ({})", song.title, snapshot.state),
                    None => format!("Nothing playing ({})", snapshot.state),
                };
                text.push_str(&format!(" | loop {}", if snapshot.loop_enabled { "on" } else { "off" }));
                if snapshot.queue.is_empty() {
                    text.push_str("\nThe queue is empty.");
                } else {
                    text.push_str("\nUp next:");
                    for (i, title) in snapshot.queue.iter().enumerate() {
                        text.push_str(&format!("\n{}. {title}", i + 1));
                    }
                }
                Ok(text)
            }
            BotCommand::Help => Ok(HELP_TEXT.to_string()),
        }
    }

    async fn start(
        &self,
        ctx: CommandContext,
        ticket: RequestTicket,
        voice: Id<ChannelMarker>,
        song: Song,
    ) -> Result<String, Error> {
        let outcome = self.playback.play_with(ticket, voice, Some(ctx.channel_id), song).await?;
        Ok(play_reply(outcome))
    }
}
