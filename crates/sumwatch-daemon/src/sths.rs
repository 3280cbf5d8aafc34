//! STH collection, auditing, and gossip.
//!
//! Three entry points per log:
//!
//! - [`download_latest`] pulls `/latest`, authenticates it, and stores
//!   the head. Upstream trouble is logged and swallowed so the pull loop
//!   keeps its cadence; only storage failures propagate.
//! - [`audit`] settles the `consistent` flag of stored heads against
//!   reconstructed roots.
//! - [`serve_gossip`] / [`receive_gossip`] are the HTTP gossip
//!   endpoints: anyone can fetch our verified head or hand us one they
//!   saw elsewhere.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use sumwatch_core::sth;
use thiserror::Error;

use crate::db::DbError;
use crate::state::{SharedState, log_base_url};

/// Gossip POST bodies are capped at 100 kB.
pub const MAX_GOSSIP_BODY: usize = 100_000;

/// Errors surfaced by the gossip endpoints.
#[derive(Debug, Error)]
pub enum GossipError {
    /// The named log is not monitored here.
    #[error("checksum database not found")]
    UnknownLog,

    /// No verified STH exists yet for the log.
    #[error("no verified tree head yet")]
    NoVerifiedSth,

    /// The submitted STH failed to parse or authenticate.
    #[error("invalid STH: {0}")]
    InvalidSth(#[from] sth::SthError),

    /// Storage failed.
    #[error("internal database error")]
    Database(#[from] DbError),
}

impl IntoResponse for GossipError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::UnknownLog | Self::NoVerifiedSth => StatusCode::NOT_FOUND,
            Self::InvalidSth(_) => StatusCode::BAD_REQUEST,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        // Database details stay out of responses.
        let body = match &self {
            Self::Database(err) => {
                tracing::error!(error = %err, "gossip endpoint database error");
                "Internal Database Error".to_string()
            },
            other => other.to_string(),
        };
        (status, body).into_response()
    }
}

/// Downloads and stores the log's latest STH.
///
/// Fetch, parse, and authentication failures are logged and ignored (the
/// log may be briefly unreachable); a fresh head wakes the ingester.
///
/// # Errors
///
/// Returns a [`DbError`] only for storage failures.
pub async fn download_latest(state: &SharedState, log_id: i64) -> Result<(), DbError> {
    let (host, key) = state.db.log_key(log_id)?;
    let url = format!("{}/latest", log_base_url(&host));

    let response = match state.client.get(&url).send().await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(%host, error = %err, "error downloading STH");
            return Ok(());
        },
    };
    if !response.status().is_success() {
        tracing::warn!(%host, status = %response.status(), "error downloading STH");
        return Ok(());
    }
    let body = match response.bytes().await {
        Ok(body) => body,
        Err(err) => {
            tracing::warn!(%host, error = %err, "error reading STH response");
            return Ok(());
        },
    };

    let sth = match sth::parse_and_authenticate_sth(&body, &host, &key) {
        Ok(sth) => sth,
        Err(err) => {
            tracing::warn!(%host, error = %err, "rejecting STH from {url}");
            return Ok(());
        },
    };

    state.db.insert_sth(log_id, &sth, &url)?;
    state.signals.raise_new_sth(log_id);
    tracing::debug!(%host, tree_size = sth.tree_size, "stored STH");
    Ok(())
}

/// Audits unaudited STHs for a log and reports how many were settled.
///
/// # Errors
///
/// Returns a [`DbError`] on storage failure.
pub fn audit(state: &SharedState, log_id: i64) -> Result<usize, DbError> {
    let audited = state.db.audit_sths(log_id)?;
    if audited > 0 {
        tracing::info!(log_id, audited, "audited STHs");
    }
    Ok(audited)
}

fn plain_text(body: String) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        ],
        body,
    )
        .into_response()
}

/// `GET /gosum/{host}`: returns the currently verified STH in wire form.
pub async fn serve_gossip(
    State(state): State<SharedState>,
    Path(host): Path<String>,
) -> Result<Response, GossipError> {
    if state.db.log_by_host(&host)?.is_none() {
        return Err(GossipError::UnknownLog);
    }
    let sth = state
        .db
        .verified_sth(&host)?
        .ok_or(GossipError::NoVerifiedSth)?;
    Ok(plain_text(sth.format(&host)))
}

/// `POST /gosum/{host}`: accepts an externally observed STH.
///
/// The head is authenticated and stored, then answered with one of three
/// plain-text verdicts: `consistent`, `inconsistent` (alarm), or
/// `pending` when the audit has not reached its tree size yet.
pub async fn receive_gossip(
    State(state): State<SharedState>,
    Path(host): Path<String>,
    body: Bytes,
) -> Result<Response, GossipError> {
    let log = state.db.log_by_host(&host)?.ok_or(GossipError::UnknownLog)?;

    let sth = sth::parse_and_authenticate_sth(&body, &host, &log.key)?;
    state.db.insert_sth(log.id, &sth, "gossip")?;
    state.signals.raise_new_sth(log.id);

    let verdict = match state.db.sth_consistency(log.id, &sth)? {
        None => format!(
            "pending: we don't know yet whether this STH is consistent with the records \
             we have from {host}; it is saved and will be audited\n"
        ),
        Some(true) => format!(
            "consistent: this STH is consistent with the records we have from {host}\n"
        ),
        Some(false) => format!(
            "inconsistent: this STH does NOT match the tree we reconstructed from {host}; \
             it is saved and will be reported\n"
        ),
    };
    Ok(plain_text(verdict))
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::routing::get;
    use ed25519_dalek::{Signer, SigningKey};
    use sumwatch_core::merkle::CollapsedTree;
    use sumwatch_core::sth::{KEY_TYPE_ED25519, Sth};

    use super::*;
    use crate::db::NewRecord;
    use crate::testutil::test_state;

    fn signing_key() -> SigningKey {
        SigningKey::from_bytes(&[9u8; 32])
    }

    fn tagged_key(key: &SigningKey) -> Vec<u8> {
        let mut tagged = vec![KEY_TYPE_ED25519];
        tagged.extend_from_slice(key.verifying_key().as_bytes());
        tagged
    }

    fn signed_sth(key: &SigningKey, tree_size: u64, root_hash: sumwatch_core::Hash) -> Sth {
        let unsigned = Sth {
            tree_size,
            root_hash,
            signature: Vec::new(),
        };
        let message = format!(
            "go.sum database tree\n{tree_size}\n{}\n",
            root_hash.to_base64()
        );
        let mut signature = vec![0u8; 4];
        signature.extend_from_slice(&key.sign(message.as_bytes()).to_bytes());
        Sth {
            signature,
            ..unsigned
        }
    }

    /// Commits `count` records and returns the resulting tree.
    fn ingest_records(state: &SharedState, log_id: i64, count: u64) -> CollapsedTree {
        let start = CollapsedTree::new();
        let mut tree = start.clone();
        let mut records = Vec::new();
        for position in 0..count {
            let record = sumwatch_core::Record {
                module: "example.com/m".to_string(),
                version: format!("v1.0.{position}"),
                source_sha256: [position as u8; 32],
                gomod_sha256: [0xee; 32],
            };
            tree.add(record.leaf_hash());
            records.push(NewRecord {
                position,
                module: record.module,
                version: record.version,
                source_sha256: record.source_sha256,
                gomod_sha256: record.gomod_sha256,
                root_hash: tree.calculate_root(),
            });
        }
        state
            .db
            .checkpoint(log_id, "sum.golang.org", &start, &tree, &records, true)
            .unwrap();
        tree
    }

    #[tokio::test]
    async fn gossip_get_unknown_log_is_404() {
        let (_dir, state, _log_id) = test_state();
        let response = serve_gossip(State(state), Path("other.example.org".to_string()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn gossip_get_serves_verified_sth() {
        let (_dir, state, log_id) = test_state();
        let key = signing_key();
        state
            .db
            .register_log("sum.golang.org", &tagged_key(&key), true)
            .unwrap();

        let tree = ingest_records(&state, log_id, 3);
        let sth = signed_sth(&key, 3, tree.calculate_root());
        state.db.insert_sth(log_id, &sth, "test").unwrap();

        let response = serve_gossip(State(state), Path("sum.golang.org".to_string()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let returned = sth::parse_sth(&body, "sum.golang.org").unwrap();
        assert_eq!(returned, sth);
    }

    #[tokio::test]
    async fn gossip_post_rejects_bad_signature() {
        let (_dir, state, log_id) = test_state();
        let key = signing_key();
        state
            .db
            .register_log("sum.golang.org", &tagged_key(&key), true)
            .unwrap();

        let other_key = SigningKey::from_bytes(&[13u8; 32]);
        let sth = signed_sth(&other_key, 7, sumwatch_core::merkle::hash_nothing());
        let response = receive_gossip(
            State(state.clone()),
            Path("sum.golang.org".to_string()),
            Bytes::from(sth.format("sum.golang.org")),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        // Nothing was persisted.
        assert!(state.db.pending_sths(log_id, 0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn gossip_post_verdicts() {
        let (_dir, state, log_id) = test_state();
        let key = signing_key();
        state
            .db
            .register_log("sum.golang.org", &tagged_key(&key), true)
            .unwrap();

        let tree = ingest_records(&state, log_id, 4);

        // A head at an unreached size is pending.
        let ahead = signed_sth(&key, 10, sumwatch_core::merkle::hash_leaf(b"future"));
        let response = receive_gossip(
            State(state.clone()),
            Path("sum.golang.org".to_string()),
            Bytes::from(ahead.format("sum.golang.org")),
        )
        .await
        .into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(body.starts_with(b"pending:"));

        // A matching head at the verified size audits as consistent.
        let good = signed_sth(&key, 4, tree.calculate_root());
        state.db.insert_sth(log_id, &good, "test").unwrap();
        state.db.audit_sths(log_id).unwrap();
        let response = receive_gossip(
            State(state.clone()),
            Path("sum.golang.org".to_string()),
            Bytes::from(good.format("sum.golang.org")),
        )
        .await
        .into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(body.starts_with(b"consistent:"));

        // A mismatching head at the verified size is the alarm case.
        let bad = signed_sth(&key, 4, sumwatch_core::merkle::hash_leaf(b"forged"));
        state.db.insert_sth(log_id, &bad, "test").unwrap();
        state.db.audit_sths(log_id).unwrap();
        let response = receive_gossip(
            State(state.clone()),
            Path("sum.golang.org".to_string()),
            Bytes::from(bad.format("sum.golang.org")),
        )
        .await
        .into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(body.starts_with(b"inconsistent:"));
    }

    #[tokio::test]
    async fn download_latest_stores_authenticated_sth() {
        let (_dir, state, log_id) = test_state();
        let key = signing_key();

        let sth = signed_sth(&key, 5, sumwatch_core::merkle::hash_leaf(b"root"));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let host = format!("http://{addr}");
        let body = sth.format(&host);
        let router = Router::new().route("/latest", get(move || {
            let body = body.clone();
            async move { body }
        }));
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        // Point the log at the local listener.
        state.db.register_log(&host, &tagged_key(&key), true).unwrap();
        let local_id = state.db.log_by_host(&host).unwrap().unwrap().id;
        assert_ne!(local_id, log_id);

        download_latest(&state, local_id).await.unwrap();
        let pending = state.db.pending_sths(local_id, 0).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].tree_size, 5);

        // Pulling the same head again is a no-op.
        download_latest(&state, local_id).await.unwrap();
        assert_eq!(state.db.pending_sths(local_id, 0).unwrap().len(), 1);
    }
}
