//! sumwatch daemon entry point.
//!
//! Loads the configuration (fatal on any validation problem), opens the
//! database, registers the configured logs, and then runs until
//! interrupted: per-log STH/ingest/audit loops, the toolchain
//! orchestrator, and the HTTP surface (gossip, feeds, authorized
//! modules, blob routes).

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sumwatch_core::Config;
use sumwatch_core::blob::FsBlobStore;
use sumwatch_core::worker::HttpBuildWorker;
use sumwatch_daemon::db::Database;
use sumwatch_daemon::signals::SignalRegistry;
use sumwatch_daemon::state::AppState;
use sumwatch_daemon::{http, tasks};

/// sumwatch - checksum database auditor
#[derive(Parser, Debug)]
#[command(name = "sumwatch-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "sumwatch.toml")]
    config: std::path::PathBuf,

    /// Listen address for the HTTP surface
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Log filter (overrides RUST_LOG)
    #[arg(long)]
    log_filter: Option<String>,
}

fn init_tracing(filter: Option<&str>) {
    let filter = match filter {
        Some(filter) => EnvFilter::new(filter),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_filter.as_deref());

    let config = Config::from_file(&args.config)
        .with_context(|| format!("failed to load configuration from {:?}", args.config))?;

    let db = Database::open(&config.database_path)
        .with_context(|| format!("failed to open database at {:?}", config.database_path))?;

    for log in &config.logs {
        let key = log.decoded_key().context("invalid log key")?;
        db.register_log(&log.host, &key, log.enabled)
            .with_context(|| format!("failed to register log {}", log.host))?;
    }
    let logs = db.enabled_logs().context("failed to list logs")?;
    if logs.is_empty() {
        warn!("no enabled logs configured; only the HTTP surface will run");
    }

    let blob = Arc::new(
        FsBlobStore::new(
            config.blob_store.root.clone(),
            config.blob_store.base_url.clone(),
            config.blob_store.signing_secret.clone().into_bytes(),
        )
        .context("failed to open blob store")?,
    );
    let client = reqwest::Client::builder()
        .user_agent("sumwatch")
        .build()
        .context("failed to build HTTP client")?;
    let worker = Arc::new(HttpBuildWorker::new(
        client.clone(),
        config.build_worker.url.clone(),
        config.build_worker.name.clone(),
    ));

    let state = Arc::new(AppState {
        signals: SignalRegistry::new(logs.iter().map(|log| log.id)),
        config,
        db,
        blob,
        worker,
        client,
    });

    let cancel = CancellationToken::new();
    let mut task_handles = Vec::new();
    for log in &logs {
        info!(host = %log.host, "monitoring log");
        task_handles.push(tokio::spawn(tasks::sth_download_loop(
            state.clone(),
            log.id,
            cancel.clone(),
        )));
        task_handles.push(tokio::spawn(tasks::sth_audit_loop(
            state.clone(),
            log.id,
            cancel.clone(),
        )));
        task_handles.push(tokio::spawn(tasks::ingest_loop(
            state.clone(),
            log.id,
            cancel.clone(),
        )));
    }
    task_handles.push(tokio::spawn(tasks::toolchain_loop(
        state.clone(),
        cancel.clone(),
    )));

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!(listen = %args.listen, "serving HTTP");

    let shutdown = cancel.clone();
    let server = axum::serve(listener, http::router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await });

    tokio::select! {
        result = server => result.context("HTTP server failed")?,
        () = wait_for_shutdown_signal() => {
            info!("shutdown signal received");
        },
    }

    cancel.cancel();
    for handle in task_handles {
        let _ = handle.await;
    }
    info!("shut down cleanly");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = terminate.recv() => {},
    }
}
