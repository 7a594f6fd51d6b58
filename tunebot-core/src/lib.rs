// src/lib.rs

pub mod config;
pub mod eventbus;
pub mod platforms;
pub mod playback;
pub mod services;
pub mod speech;
pub mod test_utils;

pub use config::BotConfig;
pub use tunebot_common::error::Error;
pub use tunebot_common::models;
