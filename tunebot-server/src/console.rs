//! Terminal input: stdin lines run as commands against one fixed guild and
//! voice channel, with replies printed back to the terminal.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use twilight_model::id::Id;
use twilight_model::id::marker::{ChannelMarker, GuildMarker};

use tunebot_core::services::{CommandContext, CommandService};

pub async fn run_console(
    commands: Arc<CommandService>,
    guild_id: Id<GuildMarker>,
    channel_id: Id<ChannelMarker>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!("Console ready: commands go to guild {guild_id}, channel {channel_id}. Type 'help'.");
    // The terminal user stands in the configured voice channel.
    let ctx = CommandContext {
        guild_id: Some(guild_id),
        channel_id,
        author_id: None,
        author_voice_channel: Some(channel_id),
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        debug!("stdin closed");
                        break;
                    }
                    Err(e) => {
                        warn!("Error reading stdin: {e}");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match commands.handle_console_line(ctx, &line).await {
                    Some(reply) => println!("{reply}"),
                    None => println!("Unknown command. Type 'help'."),
                }
            }
        }
    }
    debug!("Console stopped");
}
