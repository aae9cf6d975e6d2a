use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use loqa_converse::{
    create_router, AppState, AudioSink, AudioSource, Config, ConversationManager,
    ConversationPhase, DefaultDevices, NatsTransport,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "loqa-converse", version, about = "Real-time voice conversation client")]
struct Cli {
    /// Config file (extension optional)
    #[arg(long, default_value = "config/loqa-converse")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one conversation until Ctrl-C or until the service ends it
    Talk {
        /// Replay a 16kHz WAV file instead of the microphone
        #[arg(long)]
        input_file: Option<PathBuf>,

        /// Keep replies on a software clock instead of the speakers
        #[arg(long)]
        headless: bool,

        /// Start with the microphone muted
        #[arg(long)]
        muted: bool,
    },
    /// Serve the HTTP control API
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)?;

    info!("Loqa Converse v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded config: {}", cfg.service.name);
    info!("Model: {} (voice {})", cfg.live.model, cfg.live.voice);

    match cli.command {
        Command::Talk {
            input_file,
            headless,
            muted,
        } => talk(cfg, input_file, headless, muted).await,
        Command::Serve => serve(cfg).await,
    }
}

fn build_manager(
    cfg: &Config,
    source: AudioSource,
    sink: AudioSink,
    muted: bool,
) -> ConversationManager {
    let transport = Arc::new(NatsTransport::new(&cfg.nats.url, &cfg.nats.subject_prefix));
    let devices = Arc::new(DefaultDevices::new(source, sink));
    ConversationManager::new(cfg.conversation(muted), devices, transport)
}

async fn talk(cfg: Config, input_file: Option<PathBuf>, headless: bool, muted: bool) -> Result<()> {
    let source = match input_file {
        Some(path) => AudioSource::File {
            path,
            realtime: true,
        },
        None => AudioSource::Microphone,
    };
    let sink = if headless {
        AudioSink::Headless
    } else {
        AudioSink::Speakers
    };

    let manager = build_manager(&cfg, source, sink, muted);

    let mut status_rx = manager.subscribe();
    let status_task = tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let status = status_rx.borrow_and_update().clone();
            info!("[{:?}] {}", status.phase, status.message);
        }
    });

    manager
        .start()
        .await
        .context("Failed to start conversation")?;

    info!("Press Ctrl-C to hang up");

    let mut ended_rx = manager.subscribe();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            info!("Hanging up");
        }
        _ = async {
            let _ = ended_rx.wait_for(|s| s.phase == ConversationPhase::Idle).await;
        } => {
            warn!("Conversation ended: {}", manager.status().message);
        }
    }

    if let Some(stats) = manager.stop().await {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    }

    status_task.abort();
    Ok(())
}

async fn serve(cfg: Config) -> Result<()> {
    let manager = build_manager(&cfg, AudioSource::Microphone, AudioSink::Speakers, false);
    let app = create_router(AppState::new(manager.clone()));

    let addr = cfg.http_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("HTTP API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("HTTP server failed")?;

    // Release devices if a conversation was still running
    manager.stop().await;
    info!("Shut down");

    Ok(())
}
