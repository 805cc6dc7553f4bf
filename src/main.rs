use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use murmur_orchestrator::{
    backend::{LocalTranscriber, RemoteTranscriber},
    config::OrchestratorConfig,
    events::OrchestratorEvent,
    orchestrator::Orchestrator,
    protocol::{Segment, Session},
    reachability::{NetworkPath, ReachabilityMonitor},
    retry::RetryPolicy,
    store::{SegmentStore, SledSegmentStore},
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

#[derive(Parser)]
#[command(name = "murmur-orchestrator")]
#[command(about = "Transcription orchestration service for Murmur recordings")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Args {
    /// Segment store directory
    #[arg(long, default_value = "/var/lib/murmur/segments")]
    pub store_path: PathBuf,

    /// Directory scanned for newly recorded segment audio
    #[arg(long, default_value = "/var/lib/murmur/ingest")]
    pub ingest_dir: PathBuf,

    /// Scratch directory used by the local fallback engine
    #[arg(long, default_value = "/tmp/murmur-orchestrator/scratch")]
    pub scratch_dir: PathBuf,

    /// Remote transcription endpoint
    #[arg(long, default_value = "https://transcribe.murmur.app")]
    pub endpoint: String,

    /// Environment variable holding the remote API key
    #[arg(long, default_value = "MURMUR_API_KEY")]
    pub api_key_env: String,

    /// Local fallback engine command
    #[arg(long, default_value = "whisper-cli")]
    pub local_cmd: String,

    /// Extra arguments passed to the local engine
    #[arg(long, default_value = "")]
    pub local_args: String,

    /// Maximum simultaneous uploads
    #[arg(long, default_value = "3")]
    pub concurrency: usize,

    /// Remote attempts before the fallback engine takes over
    #[arg(long, default_value = "5")]
    pub max_retries: u32,

    /// Base retry delay in milliseconds
    #[arg(long, default_value = "1000")]
    pub base_delay_ms: u64,

    /// Remote request timeout in seconds
    #[arg(long, default_value = "30")]
    pub request_timeout: u64,

    /// Duration of a produced audio chunk in seconds
    #[arg(long, default_value = "30")]
    pub chunk_secs: u64,

    /// Ingest scan interval in milliseconds
    #[arg(long, default_value = "500")]
    pub poll_interval: u64,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level: tracing::Level = args.log_level.into();
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    info!("Starting Murmur Orchestrator v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration:");
    info!("  Store: {}", args.store_path.display());
    info!("  Ingest dir: {}", args.ingest_dir.display());
    info!("  Endpoint: {}", args.endpoint);
    info!("  Concurrency: {}", args.concurrency);
    info!("  Max retries: {}", args.max_retries);
    info!("  Log level: {:?}", args.log_level);

    let api_key = std::env::var(&args.api_key_env).ok();
    if api_key.is_none() {
        warn!(
            "no API key found in ${}; remote attempts will fail fast to the local engine",
            args.api_key_env
        );
    }

    let store = Arc::new(
        SledSegmentStore::new(&args.store_path).context("Failed to open segment store")?,
    );
    let remote = Arc::new(RemoteTranscriber::new(
        args.endpoint.clone(),
        api_key,
        Duration::from_secs(args.request_timeout),
    ));
    let local_args: Vec<String> = args
        .local_args
        .split_whitespace()
        .map(|s| s.to_string())
        .collect();
    let fallback = Arc::new(LocalTranscriber::new(
        args.local_cmd.clone(),
        local_args,
        args.scratch_dir.clone(),
    ));

    // The platform integration feeds this monitor; standalone we assume an
    // initially reachable path.
    let monitor = ReachabilityMonitor::new(NetworkPath::default());

    let config = OrchestratorConfig {
        concurrency_limit: args.concurrency,
        retry: RetryPolicy {
            base_delay: Duration::from_millis(args.base_delay_ms),
            max_retries_before_fallback: args.max_retries,
        },
        request_timeout: Duration::from_secs(args.request_timeout),
        ..OrchestratorConfig::default()
    };

    let orchestrator = Orchestrator::new(
        store.clone(),
        remote,
        fallback,
        monitor.subscribe(),
        config,
    );

    // Event logger: a passive subscriber, like any other observer.
    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(event),
                Err(RecvError::Lagged(n)) => warn!("event logger lagged by {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    orchestrator.start().await?;

    let ingest_handle = tokio::spawn(ingest_loop(
        orchestrator.clone(),
        store.clone(),
        args.ingest_dir.clone(),
        Duration::from_millis(args.poll_interval),
        Duration::from_secs(args.chunk_secs),
    ));

    // Periodic queue statistics
    let stats_orchestrator = orchestrator.clone();
    let stats_handle = tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            match stats_orchestrator.queue_status().await {
                Ok(snapshot) => info!("Queue stats: {}", snapshot),
                Err(_) => break,
            }
        }
    });

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C signal");
        }
        _ = wait_for_term_signal() => {
            info!("Received TERM signal");
        }
    }

    ingest_handle.abort();
    stats_handle.abort();

    orchestrator.stop().await?;
    store.flush().await.context("Failed to flush segment store")?;

    info!("Murmur Orchestrator stopped");
    Ok(())
}

/// Turn audio files dropped into the ingest directory into pending segments.
///
/// This stands in for the recorder: each new file becomes the next segment
/// of a single service-lifetime session.
async fn ingest_loop(
    orchestrator: Orchestrator,
    store: Arc<SledSegmentStore>,
    ingest_dir: PathBuf,
    poll_interval: Duration,
    chunk_duration: Duration,
) {
    if let Err(e) = tokio::fs::create_dir_all(&ingest_dir).await {
        error!("failed to create ingest dir {}: {}", ingest_dir.display(), e);
        return;
    }

    let session = Session::new("ingest");
    if let Err(e) = store.put_session(&session).await {
        error!("failed to persist ingest session: {:#}", e);
    }

    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut next_index: u32 = 0;
    let mut ticker = interval(poll_interval);

    loop {
        ticker.tick().await;

        let mut entries = match tokio::fs::read_dir(&ingest_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                error!("failed to scan {}: {}", ingest_dir.display(), e);
                continue;
            }
        };

        let mut fresh = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let is_audio = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| matches!(e, "wav" | "m4a" | "flac"))
                .unwrap_or(false);
            if is_audio && !seen.contains(&path) {
                fresh.push(path);
            }
        }
        fresh.sort();

        for path in fresh {
            seen.insert(path.clone());
            let index = next_index;
            next_index += 1;

            let segment = Segment::new(
                session.id,
                index,
                chunk_duration * index,
                chunk_duration,
                path.clone(),
            );
            debug!("ingesting {} as segment {}", path.display(), segment.id);

            if let Err(e) = orchestrator.enqueue(segment).await {
                error!("failed to enqueue {}: {}", path.display(), e);
                return;
            }
        }
    }
}

fn log_event(event: OrchestratorEvent) {
    match event {
        OrchestratorEvent::Queued { segment_id } => debug!("queued {}", segment_id),
        OrchestratorEvent::Started { segment_id } => debug!("uploading {}", segment_id),
        OrchestratorEvent::Completed { segment_id, engine } => {
            info!("transcribed {} via {:?}", segment_id, engine)
        }
        OrchestratorEvent::AttemptFailed {
            segment_id,
            failure_count,
            error,
        } => warn!("attempt {} failed for {}: {}", failure_count, segment_id, error),
        OrchestratorEvent::QueuedOffline { segment_id } => {
            info!("queued offline: {}", segment_id)
        }
        OrchestratorEvent::RetryScheduled {
            segment_id,
            attempt,
            delay,
        } => debug!("retry {} for {} in {:?}", attempt, segment_id, delay),
        OrchestratorEvent::FallbackStarted { segment_id } => {
            info!("falling back to local engine for {}", segment_id)
        }
        OrchestratorEvent::FallbackFailed { segment_id, error } => {
            error!("segment {} failed terminally: {}", segment_id, error)
        }
        OrchestratorEvent::SnapshotChanged(snapshot) => debug!("queue: {}", snapshot),
        OrchestratorEvent::Paused => info!("orchestrator paused"),
        OrchestratorEvent::Resumed => info!("orchestrator resumed"),
    }
}

/// Wait for TERM signal (Unix only)
#[cfg(unix)]
async fn wait_for_term_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    if let Ok(mut stream) = signal(SignalKind::terminate()) {
        stream.recv().await;
    }
}

#[cfg(not(unix))]
async fn wait_for_term_signal() {
    // On non-Unix systems, just wait indefinitely
    futures::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parsing() {
        let args = Args::parse_from([
            "murmur-orchestrator",
            "--concurrency",
            "4",
            "--max-retries",
            "3",
            "--log-level",
            "debug",
        ]);

        assert_eq!(args.concurrency, 4);
        assert_eq!(args.max_retries, 3);
        assert!(matches!(args.log_level, LogLevel::Debug));
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["murmur-orchestrator"]);

        assert_eq!(args.concurrency, 3);
        assert_eq!(args.max_retries, 5);
        assert_eq!(args.base_delay_ms, 1000);
        assert_eq!(args.endpoint, "https://transcribe.murmur.app");
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(tracing::Level::from(LogLevel::Trace), tracing::Level::TRACE);
        assert_eq!(tracing::Level::from(LogLevel::Error), tracing::Level::ERROR);
    }
}
