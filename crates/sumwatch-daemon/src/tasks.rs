//! Long-lived task loops.
//!
//! Each enabled log gets three tasks: the STH downloader (pull cadence
//! ~1 minute), the STH auditor (~150 minutes or a new-position wake),
//! and the ingester (~50 minutes or a new-STH wake). A fourth process-
//! wide task drives the toolchain orchestrator and artifact GC.
//!
//! Every loop is restart-safe: it reads its position from the database
//! at entry and persists at checkpoints, so failing an iteration only
//! costs the tick. Loops exit promptly on cancellation.

use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::db::DbError;
use crate::ingest::{self, IngestError};
use crate::state::SharedState;
use crate::{sths, toolchain};

/// Cadence of the STH pull loop.
pub const STH_DOWNLOAD_INTERVAL: Duration = Duration::from_secs(60);

/// Cadence of the STH auditor when no wake arrives.
pub const STH_AUDIT_INTERVAL: Duration = Duration::from_secs(150 * 60);

/// Cadence of the ingester when no wake arrives.
pub const INGEST_INTERVAL: Duration = Duration::from_secs(50 * 60);

/// Cadence of the toolchain orchestrator.
pub const TOOLCHAIN_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Sleeps until the interval elapses, a wake signal fires, or the token
/// is cancelled. Returns `false` on cancellation.
async fn sleep_or_wake(
    interval: Duration,
    wake: Option<&Notify>,
    cancel: &CancellationToken,
) -> bool {
    match wake {
        Some(notify) => {
            tokio::select! {
                () = cancel.cancelled() => false,
                () = tokio::time::sleep(interval) => true,
                () = notify.notified() => true,
            }
        },
        None => {
            tokio::select! {
                () = cancel.cancelled() => false,
                () = tokio::time::sleep(interval) => true,
            }
        },
    }
}

/// Periodically pulls the log's latest STH.
pub async fn sth_download_loop(state: SharedState, log_id: i64, cancel: CancellationToken) {
    loop {
        if let Err(err) = sths::download_latest(&state, log_id).await {
            error!(log_id, error = %err, "STH download failed");
        }
        if !sleep_or_wake(STH_DOWNLOAD_INTERVAL, None, &cancel).await {
            return;
        }
    }
}

/// Periodically audits stored STHs, waking early on new positions.
pub async fn sth_audit_loop(state: SharedState, log_id: i64, cancel: CancellationToken) {
    let wake = state
        .signals
        .get(log_id)
        .map(|signals| signals.new_position.clone());
    loop {
        if let Err(err) = sths::audit(&state, log_id) {
            error!(log_id, error = %err, "STH audit failed");
        }
        if !sleep_or_wake(STH_AUDIT_INTERVAL, wake.as_deref(), &cancel).await {
            return;
        }
    }
}

/// Periodically ingests new records, waking early on new STHs.
pub async fn ingest_loop(state: SharedState, log_id: i64, cancel: CancellationToken) {
    let wake = state
        .signals
        .get(log_id)
        .map(|signals| signals.new_sth.clone());
    loop {
        match ingest::ingest(&state, log_id, &cancel).await {
            Ok(true) => info!(log_id, "ingest made progress"),
            Ok(false) => {},
            // A lost optimistic-concurrency race resolves on the next tick.
            Err(IngestError::Db(DbError::ConcurrentModification(_))) => {
                warn!(log_id, "ingest lost a concurrent-writer race, will retry");
            },
            Err(err) if cancel.is_cancelled() => {
                warn!(log_id, error = %err, "ingest cancelled");
                return;
            },
            Err(err) => error!(log_id, error = %err, "ingest failed"),
        }
        if !sleep_or_wake(INGEST_INTERVAL, wake.as_deref(), &cancel).await {
            return;
        }
    }
}

/// Periodically audits unbuilt toolchains and sweeps stale artifacts.
pub async fn toolchain_loop(state: SharedState, cancel: CancellationToken) {
    loop {
        if let Err(err) = toolchain::audit_all(&state).await {
            error!(error = %err, "toolchain audit pass failed");
        }
        // All builds of the pass have settled, so the sweep only sees
        // finished artifacts.
        if let Err(err) = toolchain::garbage_collect(&state, false) {
            error!(error = %err, "artifact garbage collection failed");
        }
        if !sleep_or_wake(TOOLCHAIN_INTERVAL, None, &cancel).await {
            return;
        }
    }
}
