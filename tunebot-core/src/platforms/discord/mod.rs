pub mod chat;
pub mod runtime;
pub mod songbird;

pub use self::chat::DiscordChat;
pub use self::runtime::{DiscordPlatform, ShardHandler};
pub use self::songbird::SongbirdTransport;
