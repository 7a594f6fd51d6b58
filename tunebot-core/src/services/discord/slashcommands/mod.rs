// File: tunebot-core/src/services/discord/slashcommands/mod.rs

use std::sync::Arc;

use tracing::{debug, warn};
use twilight_http::Client as HttpClient;
use twilight_model::{
    application::{
        command::{Command, CommandType},
        interaction::{
            Interaction, InteractionData,
            application_command::{CommandData, CommandOptionValue},
        },
    },
    http::interaction::{InteractionResponse, InteractionResponseType},
    id::Id,
    id::marker::{ApplicationMarker, ChannelMarker, GuildMarker, UserMarker},
};
use twilight_util::builder::command::{CommandBuilder, StringBuilder};

use crate::Error;
use crate::services::command_parser::BotCommand;
use crate::services::command_service::{CommandContext, CommandService};

pub fn create_play_command() -> Command {
    CommandBuilder::new("play", "Joins channel and plays a song", CommandType::ChatInput)
        .option(
            StringBuilder::new("song", "YouTube URL or search term (e.g., 'runaway')").required(true),
        )
        .build()
}

pub fn create_join_command() -> Command {
    CommandBuilder::new("join", "Joins your voice channel", CommandType::ChatInput).build()
}

pub fn create_stop_command() -> Command {
    CommandBuilder::new("stop", "Stops playback and leaves the voice channel", CommandType::ChatInput).build()
}

pub async fn register_global_slash_commands(
    http: &Arc<HttpClient>,
    application_id: Id<ApplicationMarker>,
) -> Result<(), Error> {
    let commands = [create_play_command(), create_join_command(), create_stop_command()];

    http.interaction(application_id)
        .set_global_commands(&commands)
        .await
        .map_err(|e| Error::Platform(format!("Failed to register global slash commands: {e}")))?;

    Ok(())
}

fn string_option(data: &CommandData, name: &str) -> Option<String> {
    data.options.iter().find(|o| o.name == name).and_then(|o| match &o.value {
        CommandOptionValue::String(s) => Some(s.clone()),
        _ => None,
    })
}

/// Maps slash command data onto the text command it stands for.
pub fn command_from_interaction(data: &CommandData) -> Result<Option<BotCommand>, Error> {
    let command = match data.name.as_str() {
        "play" => {
            let query = string_option(data, "song")
                .filter(|s| !s.trim().is_empty())
                .ok_or_else(|| Error::InvalidInput("Please provide a YouTube URL or search term!".into()))?;
            BotCommand::Play { query }
        }
        "join" => BotCommand::Join { channel_id: None },
        "stop" => BotCommand::Stop,
        _ => return Ok(None),
    };
    Ok(Some(command))
}

/// Dispatch slash commands from an `InteractionCreate`: defer, run the
/// command, then edit the deferred reply with the result.
pub async fn handle_interaction_create(
    http: Arc<HttpClient>,
    commands: Arc<CommandService>,
    interaction: Interaction,
    voice_channel_of: impl Fn(Id<GuildMarker>, Id<UserMarker>) -> Option<Id<ChannelMarker>>,
) -> Result<(), Error> {
    let Some(InteractionData::ApplicationCommand(data)) = &interaction.data else {
        return Ok(());
    };
    let application_id = interaction.application_id;
    let Some(channel_id) = interaction.channel.as_ref().map(|c| c.id) else {
        debug!("Interaction {} without a channel, ignoring", interaction.id);
        return Ok(());
    };

    let command = match command_from_interaction(data) {
        Ok(Some(command)) => Ok(command),
        Ok(None) => Err(Error::InvalidInput(format!("Unrecognized command: {}", data.name))),
        Err(e) => Err(e),
    };

    http.interaction(application_id)
        .create_response(
            interaction.id,
            &interaction.token,
            &InteractionResponse {
                kind: InteractionResponseType::DeferredChannelMessageWithSource,
                data: None,
            },
        )
        .await
        .map_err(|e| Error::Platform(format!("Error deferring `/{}`: {e}", data.name)))?;

    let author_id = interaction.author_id();
    let ctx = CommandContext {
        guild_id: interaction.guild_id,
        channel_id,
        author_id,
        author_voice_channel: match (interaction.guild_id, author_id) {
            (Some(guild_id), Some(user_id)) => voice_channel_of(guild_id, user_id),
            _ => None,
        },
    };

    let reply = match command {
        Ok(command) => commands.reply(ctx, command).await,
        Err(e) => e.user_message(),
    };

    if let Err(e) = http
        .interaction(application_id)
        .update_response(&interaction.token)
        .content(Some(reply.as_str()))
        .await
    {
        warn!("Error editing reply for `/{}`: {e}", data.name);
    }
    Ok(())
}
