use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use tunebot_ai::{ChatResponder, OpenAIProvider, ProviderConfig};
use tunebot_core::BotConfig;
use tunebot_core::config::TtsBackend;
use tunebot_core::eventbus::EventBus;
use tunebot_core::platforms::discord::{DiscordPlatform, ShardHandler, SongbirdTransport};
use tunebot_core::platforms::youtube::YtDlpSearch;
use tunebot_core::platforms::{ChatClient, PlatformIntegration};
use tunebot_core::playback::{PlaybackController, PlaybackHandle, SourceResolver};
use tunebot_core::services::{CommandService, CommandSettings, SpeechService};
use tunebot_core::speech::{EspeakTts, GoogleTranslateTts, SpeechSynthesizer};

mod console;

#[derive(Parser, Debug, Clone)]
#[command(name = "tunebot")]
#[command(author, version, about = "TuneBot - Discord voice playback bot")]
struct Args {
    /// Log level for tunebot crates (RUST_LOG still wins for other targets)
    #[arg(long)]
    log_level: Option<String>,

    /// Overrides AUDIO_DIRECTORY
    #[arg(long)]
    audio_dir: Option<PathBuf>,

    /// Overrides COMMAND_PREFIX
    #[arg(long)]
    prefix: Option<String>,

    /// Read commands from stdin too (needs TERMINAL_GUILD_ID and TERMINAL_CHANNEL_ID)
    #[arg(long, short = 't', default_value = "false")]
    terminal: bool,

    /// Replace playback instead of queueing
    #[arg(long, default_value = "false")]
    single_slot: bool,
}

fn init_tracing(level: Option<&str>) {
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("Could not route log records into tracing: {e}");
    }
    let directive = format!("tunebot={}", level.unwrap_or("info"));
    let filter = EnvFilter::from_default_env()
        .add_directive(directive.parse().unwrap_or_default());
    let sub = fmt().with_env_filter(filter).finish();
    if let Err(e) = tracing::subscriber::set_global_default(sub) {
        eprintln!("Failed to set global subscriber: {e}");
    }
}

fn load_config(args: &Args) -> anyhow::Result<BotConfig> {
    let mut config = BotConfig::from_env()?;
    if let Some(dir) = &args.audio_dir {
        config.audio_directory = Some(dir.clone());
    }
    if let Some(prefix) = &args.prefix {
        config.command_prefix = prefix.clone();
    }
    if args.terminal {
        config.terminal_enabled = true;
    }
    if args.single_slot {
        config.queue_enabled = false;
    }
    config.validate()?;
    Ok(config)
}

fn build_speech(config: &BotConfig, playback: PlaybackHandle) -> Option<Arc<SpeechService>> {
    if !config.speech_enabled {
        info!("Speech disabled");
        return None;
    }
    let synthesizer: Arc<dyn SpeechSynthesizer> = match config.tts_backend {
        TtsBackend::Google => Arc::new(GoogleTranslateTts::new(config.tts_language.clone())),
        TtsBackend::Espeak => Arc::new(EspeakTts::new(config.tts_language.clone())),
    };
    Some(Arc::new(SpeechService::new(
        synthesizer,
        config.tts_directory.clone(),
        playback,
        config.fetch_timeout,
    )))
}

fn build_responder(config: &BotConfig) -> Option<Arc<dyn ChatResponder>> {
    let key = config.openai_api_key.clone()?;
    let mut provider = ProviderConfig::new(key);
    provider.api_base = config.openai_api_base.clone();
    if let Some(model) = &config.openai_model {
        provider.default_model = model.clone();
    }
    info!("Chat responder: {} via {}", provider.default_model, provider.api_base());
    Some(Arc::new(OpenAIProvider::new(provider)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_level.as_deref());

    if let Err(e) = dotenv::dotenv() {
        info!("No .env file loaded ({e}); using the process environment");
    }

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Startup aborted: {e:#}");
            return Err(e);
        }
    };
    info!(
        "TuneBot starting. prefix='{}', queue={}, streaming={}, speech={}, terminal={}",
        config.command_prefix,
        config.queue_enabled,
        config.streaming_enabled,
        config.speech_enabled,
        config.terminal_enabled
    );

    if let Err(e) = run(config).await {
        error!("TuneBot error: {e:#}");
        return Err(e);
    }
    info!("Main finished. Goodbye!");
    Ok(())
}

async fn run(config: BotConfig) -> anyhow::Result<()> {
    if let Err(e) = config.require_audio_directory() {
        warn!("{e}; local playback and `list` will fail until it exists");
    }

    let event_bus = Arc::new(EventBus::new());
    let mut platform = DiscordPlatform::new(config.token()?.to_string(), event_bus.clone());
    let songbird = platform
        .init_voice()
        .await
        .context("initializing the Discord gateway")?;

    let http = reqwest::Client::new();
    let transport = Arc::new(SongbirdTransport::new(songbird, http.clone()));
    let (playback, controller_task) =
        PlaybackController::spawn(transport, event_bus.clone(), config.controller_settings());

    let resolver = Arc::new(SourceResolver::new(
        config.audio_directory.clone(),
        Arc::new(YtDlpSearch::new(http)),
        config.fetch_timeout,
    ));
    let chat: Arc<dyn ChatClient> = Arc::new(platform.chat_client());
    let commands = Arc::new(CommandService::new(
        CommandSettings {
            prefix: config.command_prefix.clone(),
            streaming_enabled: config.streaming_enabled,
        },
        playback.clone(),
        resolver,
        build_speech(&config, playback.clone()),
        chat,
        build_responder(&config),
    ));

    platform.set_handler(ShardHandler {
        commands: commands.clone(),
        playback: playback.clone(),
    });
    platform.connect().await?;
    info!("Connected to Discord");

    let console_task = match (config.terminal_enabled, config.terminal_guild_id, config.terminal_channel_id) {
        (true, Some(guild_id), Some(channel_id)) => Some(tokio::spawn(console::run_console(
            commands.clone(),
            guild_id,
            channel_id,
            event_bus.shutdown_rx.clone(),
        ))),
        _ => None,
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {e:?}");
    }
    info!("Ctrl-C detected; shutting down...");

    // Order matters: stop listeners, then every voice session, then the shards.
    event_bus.shutdown();
    if let Err(e) = playback.shutdown().await {
        warn!("Playback controller did not shut down cleanly: {e}");
    }
    if tokio::time::timeout(Duration::from_secs(5), controller_task).await.is_err() {
        warn!("Playback controller did not exit within 5s");
    }
    if let Some(task) = console_task {
        task.abort();
    }
    platform.disconnect().await?;
    Ok(())
}
