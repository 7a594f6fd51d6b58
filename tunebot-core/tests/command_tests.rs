// File: tunebot-core/tests/command_tests.rs

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Notify;
use twilight_model::id::Id;
use twilight_model::id::marker::{ChannelMarker, GuildMarker, UserMarker};

use tunebot_ai::{ChatMessage, ChatResponder};
use tunebot_core::Error;
use tunebot_core::eventbus::BotEvent;
use tunebot_core::models::{PlaybackState, Song, Source};
use tunebot_core::platforms::{ChatClient, MediaSearch};
use tunebot_core::playback::{ControllerSettings, SourceResolver};
use tunebot_core::services::{CommandContext, CommandService, CommandSettings, SpeechService};
use tunebot_core::speech::SpeechSynthesizer;
use tunebot_core::test_utils::helpers::{TestController, eventually, spawn_test_controller};

const GUILD: Id<GuildMarker> = Id::new(1);
const TEXT: Id<ChannelMarker> = Id::new(7);
const VOICE: Id<ChannelMarker> = Id::new(42);
const AUTHOR: Id<UserMarker> = Id::new(500);

/// Search provider that "finds" every query. A search for `slow jam`
/// holds until released.
#[derive(Default)]
struct FakeSearch {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl MediaSearch for FakeSearch {
    async fn lookup(&self, url: &str) -> Result<Song, Error> {
        Ok(Song::new("Linked Video", Source::ProviderTrack { url: url.to_string() }))
    }

    async fn search(&self, query: &str) -> Result<Option<Song>, Error> {
        if query == "nothing matches" {
            return Ok(None);
        }
        if query == "slow jam" {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(Some(Song::new(
            format!("{query} (Official Audio)"),
            Source::ProviderTrack { url: format!("https://www.youtube.com/watch?v={}", query.len()) },
        )))
    }
}

#[derive(Default)]
struct FakeChat {
    dms: Mutex<Vec<(Id<UserMarker>, String)>>,
}

#[async_trait]
impl ChatClient for FakeChat {
    async fn send_message(&self, _channel_id: Id<ChannelMarker>, _text: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn send_direct_message(&self, user_id: Id<UserMarker>, text: &str) -> Result<(), Error> {
        self.dms
            .lock()
            .unwrap()
            .push((user_id, text.to_string()));
        Ok(())
    }

    async fn fetch_user_name(&self, user_id: Id<UserMarker>) -> Result<String, Error> {
        if user_id.get() == 404 {
            return Err(Error::NotFound(format!("user {user_id}")));
        }
        Ok("alice".to_string())
    }
}

struct EchoResponder;

#[async_trait]
impl ChatResponder for EchoResponder {
    fn name(&self) -> &str {
        "echo"
    }

    async fn chat(&self, messages: Vec<ChatMessage>) -> anyhow::Result<String> {
        let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
        Ok(format!("You said: {last}"))
    }
}

struct QuietSynth;

#[async_trait]
impl SpeechSynthesizer for QuietSynth {
    fn id(&self) -> &'static str {
        "quiet"
    }

    fn extension(&self) -> &'static str {
        "wav"
    }

    async fn synthesize(&self, _text: &str, dest: &Path) -> Result<(), Error> {
        tokio::fs::write(dest, b"RIFF").await?;
        Ok(())
    }
}

struct Bot {
    t: TestController,
    commands: CommandService,
    chat: Arc<FakeChat>,
    search: Arc<FakeSearch>,
    _audio: TempDir,
    _speech: TempDir,
}

struct BotOptions {
    streaming: bool,
    speech: bool,
    responder: bool,
}

impl Default for BotOptions {
    fn default() -> Self {
        Self {
            streaming: true,
            speech: true,
            responder: false,
        }
    }
}

fn bot_with(options: BotOptions) -> Bot {
    let t = spawn_test_controller(ControllerSettings {
        queue_enabled: true,
        loop_default: true,
        connect_timeout: Duration::from_secs(2),
    });

    let audio = tempfile::tempdir().expect("audio dir");
    std::fs::write(audio.path().join("song.mp3"), b"ID3").expect("song");
    std::fs::write(audio.path().join("intro.ogg"), b"OggS").expect("intro");
    std::fs::write(audio.path().join("notes.txt"), b"not audio").expect("notes");
    let speech_dir = tempfile::tempdir().expect("speech dir");

    let search = Arc::new(FakeSearch::default());
    let resolver = Arc::new(SourceResolver::new(
        Some(audio.path().to_path_buf()),
        search.clone(),
        Duration::from_secs(2),
    ));
    let speech = options.speech.then(|| {
        Arc::new(SpeechService::new(
            Arc::new(QuietSynth),
            speech_dir.path().to_path_buf(),
            t.handle.clone(),
            Duration::from_secs(2),
        ))
    });
    let chat = Arc::new(FakeChat::default());
    let responder: Option<Arc<dyn ChatResponder>> = if options.responder {
        Some(Arc::new(EchoResponder))
    } else {
        None
    };

    let commands = CommandService::new(
        CommandSettings {
            prefix: "!".to_string(),
            streaming_enabled: options.streaming,
        },
        t.handle.clone(),
        resolver,
        speech,
        chat.clone(),
        responder,
    );

    Bot {
        t,
        commands,
        chat,
        search,
        _audio: audio,
        _speech: speech_dir,
    }
}

fn bot() -> Bot {
    bot_with(BotOptions::default())
}

fn in_voice() -> CommandContext {
    CommandContext {
        guild_id: Some(GUILD),
        channel_id: TEXT,
        author_id: Some(AUTHOR),
        author_voice_channel: Some(VOICE),
    }
}

fn not_in_voice() -> CommandContext {
    CommandContext {
        author_voice_channel: None,
        ..in_voice()
    }
}

async fn say(bot: &Bot, ctx: CommandContext, line: &str) -> String {
    bot.commands
        .handle_line(ctx, line)
        .await
        .unwrap_or_else(|| panic!("no reply to {line:?}"))
}

#[tokio::test]
async fn test_join_then_play_local_file() -> Result<(), Error> {
    let bot = bot();
    let mut rx = bot.t.event_bus.subscribe(Some(64)).await;

    assert_eq!(say(&bot, not_in_voice(), "!join 42").await, "Joined your voice channel!");
    assert_eq!(say(&bot, in_voice(), "!play song.mp3").await, "Now playing: song.mp3");
    assert_eq!(bot.t.transport.connect_count(GUILD), 1);

    let mut states = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
        if let BotEvent::StateChanged { to, .. } = event {
            states.push(to);
        }
    }
    let connecting = states.iter().position(|s| *s == PlaybackState::Connecting);
    let playing = states.iter().position(|s| *s == PlaybackState::Playing);
    assert!(matches!((connecting, playing), (Some(c), Some(p)) if c < p), "{states:?}");

    let played = bot.t.transport.played_sources(GUILD);
    assert!(matches!(&played[..], [Source::LocalFile { path }] if path.ends_with("song.mp3")));
    Ok(())
}

#[tokio::test]
async fn test_missing_file_never_connects() -> Result<(), Error> {
    let bot = bot();
    let reply = say(&bot, in_voice(), "!play missing.mp3").await;
    assert!(reply.contains("File not found"), "{reply}");
    assert!(reply.contains("missing.mp3"));
    assert_eq!(bot.t.transport.connect_count(GUILD), 0);
    Ok(())
}

#[tokio::test]
async fn test_paths_outside_the_audio_directory_are_refused() -> Result<(), Error> {
    let bot = bot();
    let reply = say(&bot, in_voice(), "!play ../secret.mp3").await;
    assert_eq!(reply, "That path is outside the audio directory.");
    assert_eq!(bot.t.transport.connect_count(GUILD), 0);
    Ok(())
}

#[tokio::test]
async fn test_play_requires_a_voice_channel() -> Result<(), Error> {
    let bot = bot();
    assert_eq!(say(&bot, not_in_voice(), "!play song.mp3").await, "You need to be in a voice channel!");
    assert_eq!(say(&bot, not_in_voice(), "!join").await, "You need to be in a voice channel!");
    assert_eq!(bot.t.transport.connect_count(GUILD), 0);
    Ok(())
}

#[tokio::test]
async fn test_guild_commands_refuse_direct_messages() -> Result<(), Error> {
    let bot = bot();
    let dm = CommandContext {
        guild_id: None,
        ..in_voice()
    };
    assert_eq!(say(&bot, dm, "!stop").await, "This command only works in a server.");
    Ok(())
}

#[tokio::test]
async fn test_second_play_is_queued() -> Result<(), Error> {
    let bot = bot();
    say(&bot, in_voice(), "!play song.mp3").await;
    assert_eq!(say(&bot, in_voice(), "!play intro.ogg").await, "Queued: intro.ogg (position 1)");

    let queue = say(&bot, in_voice(), "!queue").await;
    assert!(queue.starts_with("Now playing: song.mp3"), "{queue}");
    assert!(queue.contains("1. intro.ogg"), "{queue}");
    Ok(())
}

#[tokio::test]
async fn test_search_and_links_go_through_the_provider() -> Result<(), Error> {
    let bot = bot();
    assert_eq!(say(&bot, in_voice(), "!play runaway").await, "Now playing: runaway (Official Audio)");
    assert_eq!(
        say(&bot, in_voice(), "!play https://youtu.be/abc123").await,
        "Queued: Linked Video (position 1)"
    );
    assert_eq!(say(&bot, in_voice(), "!play nothing matches").await, "No results found for \"nothing matches\".");
    Ok(())
}

#[tokio::test]
async fn test_streaming_can_be_switched_off() -> Result<(), Error> {
    let bot = bot_with(BotOptions {
        streaming: false,
        ..BotOptions::default()
    });
    assert_eq!(say(&bot, in_voice(), "!music https://example.com/a.mp3").await, "Streaming is disabled.");
    assert_eq!(say(&bot, in_voice(), "!play https://example.com/a.mp3").await, "Streaming is disabled.");
    // Local files still work.
    assert_eq!(say(&bot, in_voice(), "!play song.mp3").await, "Now playing: song.mp3");
    Ok(())
}

#[tokio::test]
async fn test_music_loops_until_stopped() -> Result<(), Error> {
    let bot = bot();
    assert_eq!(
        say(&bot, in_voice(), "!music https://example.com/radio/a%20b.mp3").await,
        "Now playing: a b.mp3"
    );

    bot.t.transport.finish_track(GUILD);
    assert!(
        eventually(Duration::from_secs(2), || async { bot.t.transport.played_sources(GUILD).len() == 2 }).await
    );

    assert_eq!(say(&bot, in_voice(), "!stop").await, "Stopped playback and left the voice channel.");
    assert_eq!(say(&bot, in_voice(), "!stop").await, "Nothing to stop.");
    assert!(!bot.t.transport.is_connected(GUILD));
    Ok(())
}

#[tokio::test]
async fn test_loop_toggles() -> Result<(), Error> {
    let bot = bot();
    assert_eq!(say(&bot, in_voice(), "!loop").await, "Looping is now off.");
    assert_eq!(say(&bot, in_voice(), "!loop").await, "Looping is now on.");
    assert_eq!(say(&bot, in_voice(), "!loop off").await, "Looping is now off.");
    Ok(())
}

#[tokio::test]
async fn test_speak() -> Result<(), Error> {
    let bot = bot();
    assert_eq!(say(&bot, in_voice(), "!speak hello everyone").await, "Speaking!");
    assert!(matches!(
        bot.t.transport.played_sources(GUILD).as_slice(),
        [Source::SynthesizedSpeech { .. }]
    ));

    let disabled = bot_with(BotOptions {
        speech: false,
        ..BotOptions::default()
    });
    assert_eq!(say(&disabled, in_voice(), "!speak hello").await, "Speech is disabled.");
    Ok(())
}

#[tokio::test]
async fn test_list_shows_audio_files_only() -> Result<(), Error> {
    let bot = bot();
    assert_eq!(say(&bot, in_voice(), "!list").await, "Available files:\n- intro.ogg\n- song.mp3");
    Ok(())
}

#[tokio::test]
async fn test_dm_sends_and_confirms() -> Result<(), Error> {
    let bot = bot();
    assert_eq!(say(&bot, in_voice(), "!dm <@123> see you at eight").await, "Sent a DM to alice.");
    let dms = bot.chat.dms.lock().unwrap().clone();
    assert_eq!(dms, vec![(Id::new(123), "see you at eight".to_string())]);

    let reply = say(&bot, in_voice(), "!dm 404 hello").await;
    assert!(reply.starts_with("No results found"), "{reply}");
    Ok(())
}

#[tokio::test]
async fn test_chat_needs_a_responder() -> Result<(), Error> {
    let bot = bot();
    assert_eq!(say(&bot, in_voice(), "!chat hi").await, "Not configured: chat");

    let bot = bot_with(BotOptions {
        responder: true,
        ..BotOptions::default()
    });
    assert_eq!(say(&bot, in_voice(), "!chat hi").await, "You said: hi");
    Ok(())
}

#[tokio::test]
async fn test_unknown_and_unprefixed_lines_are_ignored() -> Result<(), Error> {
    let bot = bot();
    assert!(bot.commands.handle_line(in_voice(), "!dance").await.is_none());
    assert!(bot.commands.handle_line(in_voice(), "play song.mp3").await.is_none());
    assert!(bot.commands.handle_line(in_voice(), "just chatting").await.is_none());
    assert_eq!(bot.t.transport.connect_count(GUILD), 0);
    Ok(())
}

#[tokio::test]
async fn test_console_lines_work_without_prefix() -> Result<(), Error> {
    let bot = bot();
    let reply = bot.commands.handle_console_line(in_voice(), "play song.mp3").await;
    assert_eq!(reply.as_deref(), Some("Now playing: song.mp3"));
    let reply = bot.commands.handle_console_line(in_voice(), "!stop").await;
    assert_eq!(reply.as_deref(), Some("Stopped playback and left the voice channel."));
    Ok(())
}

#[tokio::test]
async fn test_stop_cancels_a_play_still_searching() -> Result<(), Error> {
    let bot = bot();

    let playing = say(&bot, in_voice(), "!play slow jam");
    let stopping = async {
        bot.search.entered.notified().await;
        let reply = say(&bot, in_voice(), "!stop").await;
        bot.search.release.notify_one();
        reply
    };
    let (played, stopped) = tokio::join!(playing, stopping);

    assert_eq!(stopped, "Stopped playback and left the voice channel.");
    assert_eq!(played, "Request cancelled by a newer command.");
    assert_eq!(bot.t.transport.connect_count(GUILD), 0);
    assert!(bot.t.transport.played_sources(GUILD).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_queue_keeps_command_order_behind_a_slow_search() -> Result<(), Error> {
    let bot = bot();

    let slow = say(&bot, in_voice(), "!play slow jam");
    let fast = async {
        bot.search.entered.notified().await;
        say(&bot, in_voice(), "!play song.mp3").await
    };
    let release = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        bot.search.release.notify_one();
    };
    let (slow, fast, ()) = tokio::join!(slow, fast, release);

    assert_eq!(slow, "Now playing: slow jam (Official Audio)");
    assert_eq!(fast, "Queued: song.mp3 (position 1)");
    let snapshot = bot.t.handle.snapshot(GUILD).await?;
    assert_eq!(snapshot.queue, vec!["song.mp3"]);
    Ok(())
}

#[tokio::test]
async fn test_loop_toggle_during_speech() -> Result<(), Error> {
    let bot = bot();
    assert_eq!(say(&bot, in_voice(), "!speak hold on").await, "Speaking!");
    // Looping was on before the speech started; speech only pauses it.
    assert_eq!(say(&bot, in_voice(), "!loop").await, "Looping is now off.");
    assert_eq!(say(&bot, in_voice(), "!loop").await, "Looping is now on.");
    Ok(())
}
