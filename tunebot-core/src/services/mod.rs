pub mod command_parser;
pub mod command_service;
pub mod discord;
pub mod speech_service;

pub use command_parser::{BotCommand, parse_command};
pub use command_service::{AdmittedCommand, CommandContext, CommandService, CommandSettings};
pub use speech_service::SpeechService;
