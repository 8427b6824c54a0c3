use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use playoutrs::clock::{Clock, SystemClock};
use playoutrs::config::{ChannelConfig, ProgressConfig};
use playoutrs::playlist::PlaylistLoader;
use playoutrs::probe::ffprobe::FfprobeProbe;
use playoutrs::progress::object::{new_s3_store, ObjectStoreProgressStore, S3StoreConfig};
use playoutrs::progress::sqlite::SqliteProgressStore;
use playoutrs::progress::ProgressStore;
use playoutrs::schedule::ScheduleWatcher;
use playoutrs::scheduler::{Collaborators, Scheduler};
use playoutrs::server::make_server;
use playoutrs::sink::OutputSink;
use playoutrs::transcode::ffmpeg::FfmpegTranscoder;

#[derive(Parser)]
#[command(version, about = "Plays a daily schedule of shows out as a live HLS stream")]
pub struct Cli {
    /// Channel file holding the schedule and shows.
    #[arg(long, env = "PLAYOUT_CONFIG", default_value = "channel.toml")]
    pub config: PathBuf,

    /// Address for the HTTP server, overriding `server.bind`.
    #[arg(long, env = "PLAYOUT_BIND")]
    pub bind: Option<String>,

    /// Log as JSON lines.
    #[arg(long, env = "PLAYOUT_LOG_JSON")]
    pub log_json: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let config = ChannelConfig::load(&cli.config)
        .with_context(|| format!("loading channel file {}", cli.config.display()))?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(config.timezone()?));
    let schedule = Arc::new(config.schedule()?);
    info!(
        timezone = %config.timezone,
        entries = schedule.entries().len(),
        shows = config.shows.len(),
        "loaded channel"
    );

    let sink = OutputSink::new(&config.output.directory, config.output.manifest.clone());
    sink.prepare()
        .await
        .with_context(|| format!("creating {}", config.output.directory.display()))?;

    let store = open_store(&config.progress)?;
    let probe = Arc::new(FfprobeProbe::new(
        config.probe.binary.clone(),
        config.probe_timeout()?,
    ));

    let watcher = ScheduleWatcher::new(Arc::clone(&schedule), Arc::clone(&clock), config.poll_interval()?);
    let (slot_tx, slot_rx) = watcher.channel();

    let scheduler = Scheduler::new(
        schedule,
        Collaborators {
            clock,
            loader: PlaylistLoader::new(config.shows(), probe),
            store,
            transcoder: Arc::new(FfmpegTranscoder::new(config.ffmpeg.clone())),
            sink: sink.clone(),
        },
        config.scheduler_settings()?,
        slot_rx,
    );

    let cancel = CancellationToken::new();
    let bind: SocketAddr = cli
        .bind
        .unwrap_or_else(|| config.server.bind.clone())
        .parse()
        .context("parsing bind address")?;
    let routes = make_server(scheduler.subscribe(), &sink, config.server.output_path.clone());
    let shutdown = cancel.clone();
    let (addr, server) = warp::serve(routes)
        .try_bind_with_graceful_shutdown(bind, async move { shutdown.cancelled().await })
        .with_context(|| format!("binding {bind}"))?;
    info!(%addr, "serving status and output");

    let watcher = tokio::spawn(watcher.run(slot_tx, cancel.clone()));
    let scheduler = tokio::spawn(scheduler.run(cancel.clone()));
    let server = tokio::spawn(server);

    shutdown_signal()?.await;
    info!("shutting down");
    cancel.cancel();

    for (name, task) in [("watcher", watcher), ("scheduler", scheduler), ("server", server)] {
        if let Err(e) = task.await {
            error!(task = name, error = %e, "task panicked");
        }
    }

    Ok(())
}

/// Resolves on Ctrl-C, or on SIGTERM where there is one. Handlers are installed
/// before this returns.
fn shutdown_signal() -> std::io::Result<impl Future<Output = ()>> {
    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    Ok(async move {
        #[cfg(unix)]
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }

        #[cfg(not(unix))]
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
        }
    })
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn open_store(config: &ProgressConfig) -> anyhow::Result<Arc<dyn ProgressStore>> {
    let store: Arc<dyn ProgressStore> = match config {
        ProgressConfig::Sqlite { path } => Arc::new(
            SqliteProgressStore::file(path)
                .with_context(|| format!("opening {}", path.display()))?,
        ),
        ProgressConfig::Directory { path } => Arc::new(ObjectStoreProgressStore::local(path)?),
        ProgressConfig::S3 {
            bucket,
            region,
            prefix,
        } => {
            let credentials = S3StoreConfig {
                bucket: bucket.clone(),
                region: region.clone(),
                access_key_id: std::env::var("AWS_ACCESS_KEY_ID")
                    .context("AWS_ACCESS_KEY_ID is required for the s3 progress backend")?,
                secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY")
                    .context("AWS_SECRET_ACCESS_KEY is required for the s3 progress backend")?,
            };
            Arc::new(new_s3_store(&credentials, prefix.as_str())?)
        }
    };

    Ok(store)
}
