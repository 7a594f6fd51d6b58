use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use songbird::Songbird;
use songbird::shards::TwilightMap;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use twilight_cache_inmemory::{InMemoryCache, ResourceType};
use twilight_gateway::{
    self as gateway,
    CloseFrame,
    Config,
    Event,
    EventTypeFlags,
    Intents,
    MessageSender,
    Shard,
    StreamExt,
};
use twilight_http::Client as HttpClient;
use twilight_http::client::ClientBuilder;
use twilight_model::gateway::payload::incoming::{MessageCreate, Ready as ReadyPayload};
use twilight_model::id::Id;
use twilight_model::id::marker::{ChannelMarker, GuildMarker, UserMarker};

use crate::Error;
use crate::eventbus::{BotEvent, EventBus};
use crate::platforms::discord::chat::DiscordChat;
use crate::platforms::{ChatClient, PlatformIntegration};
use crate::playback::PlaybackHandle;
use crate::services::command_service::{AdmittedCommand, CommandContext, CommandService};
use crate::services::discord::slashcommands::{handle_interaction_create, register_global_slash_commands};

/// What the shard runners hand inbound traffic to.
#[derive(Clone)]
pub struct ShardHandler {
    pub commands: Arc<CommandService>,
    pub playback: PlaybackHandle,
}

/// Everything a shard runner needs, shared by all shards.
struct ShardContext {
    http: Arc<HttpClient>,
    cache: Arc<InMemoryCache>,
    songbird: Arc<Songbird>,
    chat: DiscordChat,
    handler: ShardHandler,
    bot_user_id: Id<UserMarker>,
}

impl ShardContext {
    fn voice_channel_of(&self, guild_id: Id<GuildMarker>, user_id: Id<UserMarker>) -> Option<Id<ChannelMarker>> {
        self.cache
            .voice_state(user_id, guild_id)
            .map(|state| state.channel_id())
    }

    fn command_context(&self, msg: &MessageCreate) -> CommandContext {
        CommandContext {
            guild_id: msg.guild_id,
            channel_id: msg.channel_id,
            author_id: Some(msg.author.id),
            author_voice_channel: msg
                .guild_id
                .and_then(|guild_id| self.voice_channel_of(guild_id, msg.author.id)),
        }
    }
}

/// The shard runner:
///   - calls `shard.next_event(...)`
///   - updates the in-memory cache and feeds Songbird
///   - dispatches messages, interactions and our own voice state changes.
async fn shard_runner(mut shard: Shard, ctx: Arc<ShardContext>) {
    let shard_id = shard.id().number();
    info!("(ShardRunner) Shard {shard_id} started. Listening for events.");

    while let Some(item) = shard.next_event(EventTypeFlags::all()).await {
        let event = match item {
            Ok(event) => event,
            Err(err) => {
                error!("Shard {shard_id} => error receiving event: {err:?}");
                continue;
            }
        };

        ctx.cache.update(&event);
        ctx.songbird.process(&event).await;

        match &event {
            Event::Ready(ready) => {
                let data: &ReadyPayload = ready.as_ref();
                info!(
                    "Shard {shard_id} => READY as {} (ID={})",
                    data.user.name, data.user.id
                );
                let http = ctx.http.clone();
                let application_id = data.application.id;
                tokio::spawn(async move {
                    match register_global_slash_commands(&http, application_id).await {
                        Ok(()) => info!("Registered global slash commands"),
                        Err(e) => error!("{e}"),
                    }
                });
            }
            Event::MessageCreate(msg_create) => {
                let msg: &MessageCreate = msg_create;
                if msg.author.bot {
                    debug!("Ignoring bot message from {}", msg.author.name);
                    continue;
                }
                // Admitted here so a guild's requests keep the order they
                // were sent in; run in a task because commands may wait on a
                // voice connect, which needs this loop to keep feeding Songbird.
                let command_ctx = ctx.command_context(msg);
                let Some(admitted) = ctx.handler.commands.admit_line(command_ctx, &msg.content) else {
                    continue;
                };
                let ctx = Arc::clone(&ctx);
                let channel_id = msg.channel_id;
                tokio::spawn(async move { answer_message(ctx, channel_id, admitted).await });
            }
            Event::VoiceStateUpdate(update) => {
                if update.user_id != ctx.bot_user_id {
                    continue;
                }
                if let Some(guild_id) = update.guild_id {
                    trace!("Own voice state in guild {guild_id}: {:?}", update.channel_id);
                    ctx.handler.playback.voice_state_changed(guild_id, update.channel_id);
                }
            }
            Event::InteractionCreate(interaction) => {
                let ctx = Arc::clone(&ctx);
                let interaction = interaction.0.clone();
                tokio::spawn(async move {
                    let lookup_ctx = Arc::clone(&ctx);
                    let result = handle_interaction_create(
                        ctx.http.clone(),
                        ctx.handler.commands.clone(),
                        interaction,
                        move |guild_id, user_id| lookup_ctx.voice_channel_of(guild_id, user_id),
                    )
                    .await;
                    if let Err(e) = result {
                        error!("Slash command failed: {e}");
                    }
                });
            }
            _ => {
                trace!("Shard {shard_id} => unhandled event: {:?}", event.kind());
            }
        }
    }

    warn!("(ShardRunner) Shard {shard_id} event loop ended.");
}

async fn answer_message(
    ctx: Arc<ShardContext>,
    channel_id: Id<ChannelMarker>,
    admitted: Result<AdmittedCommand, String>,
) {
    let reply = match admitted {
        Ok(admitted) => ctx.handler.commands.run(admitted).await,
        Err(reply) => reply,
    };
    if let Err(e) = ctx.chat.send_message(channel_id, &reply).await {
        error!("Error sending reply to {channel_id}: {e}");
    }
}

/// Posts controller announcements ("Now playing: …") to their text channel.
async fn notice_listener(bus: Arc<EventBus>, chat: DiscordChat) {
    let mut rx = bus.subscribe(None).await;
    let mut shutdown_rx = bus.shutdown_rx.clone();
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            event = rx.recv() => {
                match event {
                    Some(BotEvent::PlaybackNotice { channel_id, text, .. }) => {
                        if let Err(e) = chat.send_message(channel_id, &text).await {
                            warn!("Could not post notice to {channel_id}: {e}");
                        }
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        }
    }
    debug!("(DiscordPlatform) notice listener stopped");
}

pub struct DiscordPlatform {
    token: String,
    connected: bool,

    pub http: Arc<HttpClient>,
    pub cache: Arc<InMemoryCache>,
    event_bus: Arc<EventBus>,

    /// Created by `init_voice`, handed to runners by `connect`.
    shards: Vec<Shard>,
    shard_tasks: Vec<JoinHandle<()>>,
    shard_senders: Vec<MessageSender>,
    notice_task: Option<JoinHandle<()>>,

    songbird: Option<Arc<Songbird>>,
    bot_user_id: Option<Id<UserMarker>>,
    handler: Option<ShardHandler>,
}

impl DiscordPlatform {
    pub fn new(token: String, event_bus: Arc<EventBus>) -> Self {
        let http = Arc::new(
            ClientBuilder::new()
                .token(token.clone())
                .timeout(Duration::from_secs(30))
                .build(),
        );
        let cache = InMemoryCache::builder()
            .resource_types(ResourceType::GUILD | ResourceType::CHANNEL | ResourceType::VOICE_STATE)
            .build();

        Self {
            token,
            connected: false,
            http,
            cache: Arc::new(cache),
            event_bus,
            shards: Vec::new(),
            shard_tasks: Vec::new(),
            shard_senders: Vec::new(),
            notice_task: None,
            songbird: None,
            bot_user_id: None,
            handler: None,
        }
    }

    pub fn chat_client(&self) -> DiscordChat {
        DiscordChat::new(self.http.clone())
    }

    /// Creates the shards and the Songbird instance bound to them. Must run
    /// before the voice transport is built and before `connect`.
    pub async fn init_voice(&mut self) -> Result<Arc<Songbird>, Error> {
        if let Some(songbird) = &self.songbird {
            return Ok(songbird.clone());
        }

        let user = self
            .http
            .current_user()
            .await
            .map_err(|e| Error::Platform(format!("Could not fetch the bot user (bad token?): {e}")))?
            .model()
            .await
            .map_err(|e| Error::Platform(format!("Error parsing bot user => {e}")))?;
        info!("(DiscordPlatform) Authenticated as {} (ID={})", user.name, user.id);

        let config = Config::new(
            self.token.clone(),
            Intents::GUILDS
                | Intents::GUILD_MESSAGES
                | Intents::MESSAGE_CONTENT
                | Intents::GUILD_VOICE_STATES
                | Intents::DIRECT_MESSAGES,
        );
        let shards: Vec<Shard> = gateway::create_recommended(&self.http, config, |_, b| b.build())
            .await
            .map_err(|e| Error::Platform(format!("create_recommended error: {e}")))?
            .collect();

        let senders: HashMap<u32, MessageSender> = shards
            .iter()
            .map(|shard| (shard.id().number(), shard.sender()))
            .collect();
        self.shard_senders = senders.values().cloned().collect();

        let songbird = Arc::new(Songbird::twilight(Arc::new(TwilightMap::new(senders)), user.id));
        self.shards = shards;
        self.bot_user_id = Some(user.id);
        self.songbird = Some(songbird.clone());
        Ok(songbird)
    }

    pub fn set_handler(&mut self, handler: ShardHandler) {
        self.handler = Some(handler);
    }
}

#[async_trait]
impl PlatformIntegration for DiscordPlatform {
    async fn connect(&mut self) -> Result<(), Error> {
        if self.connected {
            info!("(DiscordPlatform) Already connected => skipping");
            return Ok(());
        }

        let (Some(songbird), Some(bot_user_id)) = (self.songbird.clone(), self.bot_user_id) else {
            return Err(Error::Platform("init_voice must run before connect".into()));
        };
        let handler = self
            .handler
            .clone()
            .ok_or_else(|| Error::Platform("no command handler installed".into()))?;

        let ctx = Arc::new(ShardContext {
            http: self.http.clone(),
            cache: self.cache.clone(),
            songbird,
            chat: self.chat_client(),
            handler,
            bot_user_id,
        });

        self.notice_task = Some(tokio::spawn(notice_listener(
            self.event_bus.clone(),
            self.chat_client(),
        )));

        for shard in self.shards.drain(..) {
            let ctx = Arc::clone(&ctx);
            self.shard_tasks.push(tokio::spawn(shard_runner(shard, ctx)));
        }

        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), Error> {
        if !self.connected {
            debug!("(DiscordPlatform) Not connected => nothing to close");
            return Ok(());
        }
        self.connected = false;

        // Gracefully close shards
        for sender in &self.shard_senders {
            let _ = sender.close(CloseFrame::NORMAL);
        }
        for task in self.shard_tasks.drain(..) {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("(DiscordPlatform) shard did not close within 5s");
            }
        }
        self.shard_senders.clear();

        if let Some(task) = self.notice_task.take() {
            task.abort();
        }
        Ok(())
    }
}
