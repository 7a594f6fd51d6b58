//! Text command parsing shared by chat messages, slash commands and the console.

use twilight_model::id::Id;
use twilight_model::id::marker::{ChannelMarker, UserMarker};

use crate::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    /// Join the given channel, or the author's current one.
    Join { channel_id: Option<Id<ChannelMarker>> },
    Play { query: String },
    Stop,
    List,
    Speak { text: String },
    Music { url: String },
    Dm { user_id: Id<UserMarker>, text: String },
    Chat { text: String },
    /// `None` toggles.
    Loop { enabled: Option<bool> },
    Queue,
    Help,
}

impl BotCommand {
    pub fn name(&self) -> &'static str {
        match self {
            BotCommand::Join { .. } => "join",
            BotCommand::Play { .. } => "play",
            BotCommand::Stop => "stop",
            BotCommand::List => "list",
            BotCommand::Speak { .. } => "speak",
            BotCommand::Music { .. } => "music",
            BotCommand::Dm { .. } => "dm",
            BotCommand::Chat { .. } => "chat",
            BotCommand::Loop { .. } => "loop",
            BotCommand::Queue => "queue",
            BotCommand::Help => "help",
        }
    }
}

pub const HELP_TEXT: &str = "Commands: join [channelId], play <file|url|query>, music <url>, speak <text>, \
stop, list, loop [on|off], queue, dm <userId> <text>, chat <text>, help";

fn required(args: &str, usage: &str) -> Result<String, Error> {
    if args.is_empty() {
        Err(Error::InvalidInput(format!("usage: {usage}")))
    } else {
        Ok(args.to_string())
    }
}

fn parse_snowflake<T>(raw: &str, what: &str) -> Result<Id<T>, Error> {
    let digits = raw
        .trim_start_matches("<#")
        .trim_start_matches("<@!")
        .trim_start_matches("<@")
        .trim_end_matches('>');
    digits
        .parse::<u64>()
        .ok()
        .and_then(Id::new_checked)
        .ok_or_else(|| Error::InvalidInput(format!("'{raw}' is not a valid {what} id")))
}

/// Parses a verb and its arguments. `None` for verbs we don't know.
pub fn parse_body(body: &str) -> Option<Result<BotCommand, Error>> {
    let body = body.trim();
    let (verb, args) = match body.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (body, ""),
    };

    let command = match verb.to_ascii_lowercase().as_str() {
        "join" => match args.split_whitespace().next() {
            Some(raw) => parse_snowflake(raw, "channel").map(|id| BotCommand::Join { channel_id: Some(id) }),
            None => Ok(BotCommand::Join { channel_id: None }),
        },
        "play" => required(args, "play <filename|url|query>").map(|query| BotCommand::Play { query }),
        "stop" => Ok(BotCommand::Stop),
        "list" => Ok(BotCommand::List),
        "speak" => required(args, "speak <text>").map(|text| BotCommand::Speak { text }),
        "music" => required(args, "music <url>").map(|url| BotCommand::Music { url }),
        "dm" => match args.split_once(char::is_whitespace) {
            Some((user, text)) if !text.trim().is_empty() => {
                parse_snowflake(user, "user").map(|user_id| BotCommand::Dm {
                    user_id,
                    text: text.trim().to_string(),
                })
            }
            _ => Err(Error::InvalidInput("usage: dm <userId> <text>".into())),
        },
        "chat" => required(args, "chat <text>").map(|text| BotCommand::Chat { text }),
        "loop" => match args.to_ascii_lowercase().as_str() {
            "" => Ok(BotCommand::Loop { enabled: None }),
            "on" | "true" | "yes" => Ok(BotCommand::Loop { enabled: Some(true) }),
            "off" | "false" | "no" => Ok(BotCommand::Loop { enabled: Some(false) }),
            _ => Err(Error::InvalidInput("usage: loop [on|off]".into())),
        },
        "queue" => Ok(BotCommand::Queue),
        "help" => Ok(BotCommand::Help),
        _ => return None,
    };
    Some(command)
}

/// A chat line: must start with `prefix`.
pub fn parse_command(prefix: &str, line: &str) -> Option<Result<BotCommand, Error>> {
    let body = line.trim_start().strip_prefix(prefix)?;
    if body.is_empty() || body.starts_with(char::is_whitespace) {
        return None;
    }
    parse_body(body)
}

/// A console line: the prefix is optional.
pub fn parse_console_line(prefix: &str, line: &str) -> Option<Result<BotCommand, Error>> {
    let line = line.trim();
    parse_body(line.strip_prefix(prefix).unwrap_or(line))
}
