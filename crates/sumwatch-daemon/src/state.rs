//! Shared daemon state.
//!
//! One [`AppState`] is built at startup and handed to every task and
//! HTTP handler behind an `Arc`. Everything in it is either immutable
//! configuration or internally synchronized.

use std::sync::Arc;

use sumwatch_core::Config;
use sumwatch_core::blob::BlobStore;
use sumwatch_core::worker::BuildWorker;

use crate::db::Database;
use crate::signals::SignalRegistry;

/// State shared by tasks and HTTP handlers.
pub struct AppState {
    /// Process-wide configuration, read-only after startup.
    pub config: Config,

    /// The SQLite database.
    pub db: Database,

    /// Object storage for tarballs and build artifacts.
    pub blob: Arc<dyn BlobStore>,

    /// Remote build worker.
    pub worker: Arc<dyn BuildWorker>,

    /// Shared HTTP client for upstream fetches.
    pub client: reqwest::Client,

    /// Per-log wake signals.
    pub signals: SignalRegistry,
}

/// The state as handlers receive it.
pub type SharedState = Arc<AppState>;

/// Builds the base URL for talking to a log.
///
/// Hosts are normally bare hostnames served over HTTPS; a host that
/// already carries a scheme is used as-is (which is how tests point a
/// log at a local listener).
#[must_use]
pub fn log_base_url(host: &str) -> String {
    if host.contains("://") {
        host.to_string()
    } else {
        format!("https://{host}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_defaults_to_https() {
        assert_eq!(log_base_url("sum.golang.org"), "https://sum.golang.org");
        assert_eq!(log_base_url("http://127.0.0.1:8080"), "http://127.0.0.1:8080");
    }
}
