//! ScribeWire server entrypoint: wiring, recovery, retention, serve loop

use anyhow::Context;
use clap::Parser;
use scribewire_server::api::{self, AppState};
use scribewire_server::config::AppConfig;
use scribewire_server::events::EventBus;
use scribewire_server::fragments::FragmentStore;
use scribewire_server::session::SessionRegistry;
use scribewire_server::stitch::FfmpegStitcher;
use scribewire_server::storage::StorageService;
use scribewire_server::transcribe::{HttpSummarizer, HttpTranscriber, TranscriptionGateway};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "scribewire-server", about = "Streaming audio transcription server")]
struct Args {
    /// Address to bind the WebSocket server to
    #[arg(long, env = "SCRIBEWIRE_BIND")]
    bind: Option<String>,

    /// SQLite database file
    #[arg(long, env = "SCRIBEWIRE_DB_PATH")]
    database: Option<PathBuf>,

    /// Root directory for per-session fragment files
    #[arg(long, env = "SCRIBEWIRE_FRAGMENT_ROOT")]
    fragment_root: Option<PathBuf>,

    /// Base URL of the transcription API
    #[arg(long, env = "SCRIBEWIRE_API_ENDPOINT")]
    api_endpoint: Option<String>,

    /// API key for the transcription API
    #[arg(long, env = "SCRIBEWIRE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Transcription model identifier
    #[arg(long, env = "SCRIBEWIRE_MODEL")]
    model: Option<String>,

    /// Keep stitched debug MP3s across session cleanup
    #[arg(long, env = "SCRIBEWIRE_DEBUG_SAVE_STITCHED")]
    debug_save_stitched: bool,
}

impl Args {
    fn apply(self, config: &mut AppConfig) {
        if let Some(bind) = self.bind {
            config.server.bind_addr = bind;
        }
        if let Some(database) = self.database {
            config.storage.database_path = database;
        }
        if let Some(root) = self.fragment_root {
            config.storage.fragment_root = root;
        }
        if let Some(endpoint) = self.api_endpoint {
            config.transcriber.endpoint = endpoint;
        }
        if let Some(key) = self.api_key {
            config.transcriber.api_key = Some(key);
        }
        if let Some(model) = self.model {
            config.transcriber.model = model;
        }
        if self.debug_save_stitched {
            config.stitch.debug_save_stitched = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut config = AppConfig::load().context("invalid configuration")?;
    Args::parse().apply(&mut config);
    config.validate().context("invalid configuration")?;
    let config = Arc::new(config);

    if config.transcriber.api_key.is_none() {
        warn!("No transcriber API key configured; chunks will be skipped until one is provided");
    }

    let storage = StorageService::new(&config.storage.database_path)
        .await
        .context("failed to initialize storage")?;

    let store = Arc::new(FragmentStore::new(config.storage.fragment_root.clone()));
    let stitcher = Arc::new(FfmpegStitcher::new(
        config.stitch.clone(),
        config.storage.fragment_root.clone(),
    ));
    let transcriber = Arc::new(HttpTranscriber::new(config.transcriber.clone())?);
    let summarizer = Arc::new(HttpSummarizer::new(config.transcriber.clone())?);
    let gateway = Arc::new(TranscriptionGateway::new(
        transcriber,
        storage.chunks.clone(),
        config.pipeline.clone(),
    ));
    let bus = EventBus::new();

    let registry = SessionRegistry::new(
        &storage,
        Arc::clone(&store),
        stitcher,
        gateway,
        summarizer,
        bus.clone(),
        config.pipeline.clone(),
        config.stitch.debug_save_stitched,
    );

    // Re-attach sessions the previous process left behind.
    let recovered = registry.recover().await.context("crash recovery failed")?;
    if recovered > 0 {
        info!("Crash recovery re-attached {} sessions", recovered);
    }

    // Hourly retention sweep for stale session directories.
    let scheduler = JobScheduler::new()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create job scheduler: {}", e))?;
    let retention = Duration::from_secs(config.storage.retention_days * 24 * 60 * 60);
    let sweep_store = Arc::clone(&store);
    let job = Job::new_async("0 17 * * * *", move |_uuid, _lock| {
        let store = Arc::clone(&sweep_store);
        Box::pin(async move {
            if let Err(e) = store.sweep_expired(retention).await {
                warn!("Retention sweep failed: {}", e);
            }
        })
    })
    .map_err(|e| anyhow::anyhow!("failed to create retention job: {}", e))?;
    scheduler
        .add(job)
        .await
        .map_err(|e| anyhow::anyhow!("failed to schedule retention job: {}", e))?;
    scheduler
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("failed to start job scheduler: {}", e))?;

    let state = AppState {
        registry,
        bus,
        config: Arc::clone(&config),
        database: Arc::clone(&storage.database),
    };

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_addr))?;
    info!("Listening on {}", config.server.bind_addr);

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("server error")?;

    storage.shutdown().await;
    Ok(())
}
