use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tokio::net::TcpListener;
use tracing::info;

use scribe::artifact::ArtifactStore;
use scribe::cleanup;
use scribe::config::Settings;
use scribe::downloader::Downloader;
use scribe::events::EventHub;
use scribe::orchestrator::Orchestrator;
use scribe::server::{self, AppState};
use scribe::store::Store;
use scribe::summarizer::Summarizer;
use scribe::tagconfig::TagConfigStore;
use scribe::transcriber::TranscriberClient;

#[derive(Parser, Debug)]
#[command(name = "scribe", version, about = "Scribe transcription service", long_about = None)]
struct Args {
    /// Override listen address (host:port)
    #[arg(long, value_name = "ADDR:PORT")]
    listen: Option<String>,

    /// Override the data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Increase logging verbosity
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    scribe::telemetry::init_tracing(args.verbose)?;

    let mut settings = Settings::from_env()?;
    if let Some(data_dir) = args.data_dir {
        settings.storage.data_dir = data_dir;
    }
    settings.storage.ensure_dirs()?;

    let store = Arc::new(Store::open(settings.storage.db_path())?);
    let artifacts = Arc::new(ArtifactStore::new(settings.storage.transcriptions_dir())?);
    let downloader = Arc::new(Downloader::new(
        settings.storage.audio_cache_dir(),
        settings.storage.max_audio_bytes,
        settings.download_timeout(),
        settings.storage.yt_dlp_path.clone(),
    )?);
    downloader.check_yt_dlp();

    let transcriber = TranscriberClient::new(
        &settings.transcriber.base_url,
        Duration::from_secs(settings.transcriber.poll_interval_secs),
        Duration::from_secs(settings.transcriber.wait_timeout_secs),
    );
    transcriber.probe_health().await;

    let events = Arc::new(EventHub::new());
    let tag_configs = TagConfigStore::new(
        settings.storage.tag_configs_path(),
        settings.storage.secrets_path(),
        settings.llm.clone(),
    );
    let orchestrator = Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&artifacts),
        Arc::clone(&downloader),
        transcriber,
        Arc::clone(&events),
        settings.storage.audio_cache_days,
    );
    let summarizer = Arc::new(Summarizer::new(
        Arc::clone(&store),
        tag_configs.clone(),
        settings.llm_timeout(),
    ));

    let cleanup_task = tokio::spawn(cleanup::run_loop(
        Arc::clone(&store),
        Arc::clone(&artifacts),
        settings.cleanup,
    ));

    let state = AppState {
        store,
        artifacts,
        orchestrator,
        summarizer,
        tag_configs,
        events,
    };
    let router = server::router(state);

    let listen_addr = args
        .listen
        .unwrap_or_else(|| settings.server.listen_addr());
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind listener at {listen_addr}"))?;
    info!(addr = %listen_addr, "starting scribe service");

    axum::serve(listener, router)
        .with_graceful_shutdown(server::shutdown_signal())
        .await
        .context("scribe server terminated unexpectedly")?;

    cleanup_task.abort();
    info!("scribe service stopped");
    Ok(())
}
