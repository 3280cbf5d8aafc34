//! HTTP surface assembly.
//!
//! One axum router serves everything the daemon exposes:
//!
//! - `/gosum/{host}`: STH gossip (GET the verified head, POST one);
//! - `/modules/authorized`: signed go.sum manifests;
//! - `/modules/versions.atom`, `/sumdb/failures.atom`,
//!   `/toolchain/failures.atom`: alert feeds;
//! - `/blob/{key}`: presigned object GET/PUT, standing in for the
//!   object store the presigned URLs point at.

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;

use sumwatch_core::blob::{self, BlobStore};

use crate::state::SharedState;
use crate::{feeds, modules, sths};

/// Upload cap for blob PUTs (toolchain zips run to a few hundred MB).
const MAX_BLOB_BODY: usize = 2 * 1024 * 1024 * 1024;

/// Builds the daemon's router.
#[must_use]
pub fn router(state: SharedState) -> Router {
    let gossip = Router::new()
        .route(
            "/gosum/{host}",
            get(sths::serve_gossip).post(sths::receive_gossip),
        )
        .layer(DefaultBodyLimit::max(sths::MAX_GOSSIP_BODY));

    let authorized = Router::new()
        .route(
            "/modules/authorized",
            axum::routing::post(modules::receive_authorized),
        )
        .layer(DefaultBodyLimit::max(modules::MAX_AUTHORIZED_BODY));

    let blobs = Router::new()
        .route("/blob/{*key}", get(get_blob).put(put_blob))
        .layer(DefaultBodyLimit::max(MAX_BLOB_BODY));

    Router::new()
        .route("/modules/versions.atom", get(modules::serve_versions_atom))
        .route("/sumdb/failures.atom", get(feeds::serve_sumdb_failures))
        .route(
            "/toolchain/failures.atom",
            get(feeds::serve_toolchain_failures),
        )
        .merge(gossip)
        .merge(authorized)
        .merge(blobs)
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct BlobQuery {
    #[serde(default)]
    expires: u64,

    #[serde(default)]
    sig: String,

    #[serde(default)]
    ct: String,
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_secs()
}

fn verify_blob_request(
    state: &SharedState,
    method: &str,
    key: &str,
    query: &BlobQuery,
) -> Result<(), Response> {
    let ok = blob::verify_request(
        state.config.blob_store.signing_secret.as_bytes(),
        method,
        key,
        &query.ct.replace("%2F", "/"),
        query.expires,
        &query.sig,
        unix_now(),
    );
    if ok {
        Ok(())
    } else {
        Err((StatusCode::FORBIDDEN, "invalid or expired signature").into_response())
    }
}

async fn get_blob(
    State(state): State<SharedState>,
    Path(key): Path<String>,
    Query(query): Query<BlobQuery>,
) -> Response {
    if let Err(response) = verify_blob_request(&state, "GET", &key, &query) {
        return response;
    }
    match state.blob.get(&key) {
        Ok(contents) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            contents,
        )
            .into_response(),
        Err(blob::BlobError::NotFound(_)) => {
            (StatusCode::NOT_FOUND, "object not found").into_response()
        },
        Err(err) => {
            tracing::error!(%key, error = %err, "blob read failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "storage error").into_response()
        },
    }
}

async fn put_blob(
    State(state): State<SharedState>,
    Path(key): Path<String>,
    Query(query): Query<BlobQuery>,
    body: Bytes,
) -> Response {
    if let Err(response) = verify_blob_request(&state, "PUT", &key, &query) {
        return response;
    }
    match state.blob.put(&key, &body) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => {
            tracing::error!(%key, error = %err, "blob write failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "storage error").into_response()
        },
    }
}
