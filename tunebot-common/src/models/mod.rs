// File: tunebot-common/src/models/mod.rs
pub mod playback;

pub use playback::{JoinOutcome, PlayOutcome, PlaybackState, SessionSnapshot, Song, Source};
