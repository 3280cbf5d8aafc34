//! Publisher-authorized module records and the versions feed.
//!
//! Publishers can attest the authentic versions of their modules by
//! POSTing a go.sum manifest signed with their Ed25519 key. Verified
//! manifests are persisted per pubkey, and the versions feed can then be
//! filtered to the versions a publisher did NOT sign, which are the ones worth an
//! alert.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::Deserialize;
use thiserror::Error;

use sumwatch_core::atom::{Entry, Feed};

use crate::db::{AuthorizedColumn, AuthorizedEntry, DbError};
use crate::feeds::{atom_response, rfc3339};
use crate::state::SharedState;

/// Authorized-manifest bodies are capped at 1 MiB.
pub const MAX_AUTHORIZED_BODY: usize = 1024 * 1024;

/// Most entries a single feed will carry.
const MAX_FEED_ENTRIES: usize = 10_000;

/// Errors surfaced by the authorized-module endpoint.
#[derive(Debug, Error)]
pub enum AuthorizedError {
    /// The request body is not the expected JSON document.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// The pubkey or signature has the wrong length.
    #[error("invalid {0} length")]
    InvalidLength(&'static str),

    /// A go.sum line is malformed.
    #[error("invalid go.sum line {0}")]
    InvalidLine(usize),

    /// A go.sum line carries a malformed hash.
    #[error("invalid hash on line {0}")]
    InvalidHash(usize),

    /// The signature does not verify under the supplied key.
    #[error("permission denied: signature validation failed")]
    SignatureMismatch,

    /// Storage failed.
    #[error("internal database error")]
    Database(#[from] DbError),
}

impl IntoResponse for AuthorizedError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::SignatureMismatch => StatusCode::FORBIDDEN,
            Self::Database(ref err) => {
                tracing::error!(error = %err, "authorized endpoint database error");
                StatusCode::INTERNAL_SERVER_ERROR
            },
            _ => StatusCode::BAD_REQUEST,
        };
        let body = match &self {
            Self::Database(_) => "Internal Database Error".to_string(),
            other => other.to_string(),
        };
        (status, body).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct AuthorizedBody {
    #[serde(rename = "ed25519", alias = "Ed25519")]
    ed25519: String,

    #[serde(rename = "gosum", alias = "GoSum")]
    gosum: String,

    #[serde(rename = "signature", alias = "Signature")]
    signature: String,
}

fn parse_hash(input: &str, line: usize) -> Result<[u8; 32], AuthorizedError> {
    let encoded = input
        .strip_prefix("h1:")
        .ok_or(AuthorizedError::InvalidHash(line))?;
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|_| AuthorizedError::InvalidHash(line))?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| AuthorizedError::InvalidHash(line))
}

fn parse_manifest(gosum: &str) -> Result<Vec<AuthorizedEntry>, AuthorizedError> {
    let mut entries = Vec::new();
    for (index, line) in gosum.lines().enumerate() {
        let line_number = index + 1;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 3 {
            return Err(AuthorizedError::InvalidLine(line_number));
        }
        let module = fields[0].to_string();
        let (version, column) = match fields[1].strip_suffix("/go.mod") {
            Some(version) => (version.to_string(), AuthorizedColumn::Gomod),
            None => (fields[1].to_string(), AuthorizedColumn::Source),
        };
        entries.push(AuthorizedEntry {
            module,
            version,
            column,
            hash: parse_hash(fields[2], line_number)?,
        });
    }
    Ok(entries)
}

/// `POST /modules/authorized`: receives a signed go.sum manifest.
///
/// The signature must verify over the manifest bytes exactly as sent;
/// all rows of a manifest commit in one transaction.
pub async fn receive_authorized(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<StatusCode, AuthorizedError> {
    let body: AuthorizedBody = serde_json::from_slice(&body)
        .map_err(|err| AuthorizedError::InvalidJson(err.to_string()))?;

    let pubkey_bytes = STANDARD
        .decode(&body.ed25519)
        .map_err(|_| AuthorizedError::InvalidJson("ed25519 is not base64".to_string()))?;
    let pubkey = <[u8; 32]>::try_from(pubkey_bytes.as_slice())
        .map_err(|_| AuthorizedError::InvalidLength("ed25519 key"))?;
    let signature_bytes = STANDARD
        .decode(&body.signature)
        .map_err(|_| AuthorizedError::InvalidJson("signature is not base64".to_string()))?;
    let signature = <[u8; 64]>::try_from(signature_bytes.as_slice())
        .map_err(|_| AuthorizedError::InvalidLength("signature"))?;

    let verifying_key =
        VerifyingKey::from_bytes(&pubkey).map_err(|_| AuthorizedError::SignatureMismatch)?;
    verifying_key
        .verify(body.gosum.as_bytes(), &Signature::from_bytes(&signature))
        .map_err(|_| AuthorizedError::SignatureMismatch)?;

    let entries = parse_manifest(&body.gosum)?;
    state.db.insert_authorized(&pubkey, &entries)?;
    tracing::info!(
        pubkey = %STANDARD.encode(pubkey),
        entries = entries.len(),
        "stored authorized module records"
    );
    Ok(StatusCode::NO_CONTENT)
}

/// Query parameters of the versions feed.
#[derive(Debug, Deserialize)]
pub struct VersionsQuery {
    /// Module path, or module prefix ending in `/`.
    #[serde(default)]
    module: String,

    /// Optional base64 publisher key; restricts the feed to versions the
    /// publisher has not authorized.
    #[serde(default)]
    ed25519: String,
}

/// Reports whether a module version is a semver prerelease (those are
/// left out of the versions feed).
fn is_prerelease(version: &str) -> bool {
    let version = version.split('+').next().unwrap_or(version);
    version.contains('-')
}

/// `GET /modules/versions.atom`: observed versions of a module, with an
/// optional unauthorized-only filter.
pub async fn serve_versions_atom(
    State(state): State<SharedState>,
    Query(query): Query<VersionsQuery>,
) -> Response {
    if query.module.is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing module parameter").into_response();
    }
    let pubkey = if query.ed25519.is_empty() {
        None
    } else {
        match STANDARD.decode(&query.ed25519) {
            Ok(key) if key.len() == 32 => Some(key),
            _ => {
                return (StatusCode::BAD_REQUEST, "Invalid ed25519 parameter").into_response();
            },
        }
    };

    let rows = match state.db.observed_versions(
        &query.module,
        pubkey.as_deref(),
        MAX_FEED_ENTRIES + 1,
    ) {
        Ok(rows) => rows,
        Err(err) => {
            tracing::error!(error = %err, "error loading versions feed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Database Error")
                .into_response();
        },
    };
    if rows.len() > MAX_FEED_ENTRIES {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!(
                "more than {MAX_FEED_ENTRIES} versions match {}; narrow the module parameter",
                query.module
            ),
        )
            .into_response();
    }

    let mut feed_url = format!(
        "https://feeds.api.{}/modules/versions.atom?module={}",
        state.config.domain, query.module
    );
    if !query.ed25519.is_empty() {
        feed_url.push_str(&format!("&ed25519={}", query.ed25519));
    }

    let mut feed = Feed {
        id: feed_url.clone(),
        title: format!("Versions of {}", query.module),
        updated: String::new(),
        author: format!("sumwatch on {}", state.config.domain),
        link: feed_url.clone(),
        entries: Vec::new(),
    };

    let mut latest = 0i64;
    for row in rows {
        if is_prerelease(&row.version) {
            continue;
        }
        latest = latest.max(row.observed_at);
        feed.entries.push(Entry {
            title: format!("{}@{}", row.module, row.version),
            id: format!("{feed_url}#{}@{}", row.module, row.version),
            updated: rfc3339(row.observed_at),
            content: format!("h1:{}", STANDARD.encode(&row.source_sha256)),
        });
    }
    feed.updated = if latest == 0 {
        rfc3339(chrono::Utc::now().timestamp())
    } else {
        rfc3339(latest)
    };

    atom_response(&feed)
}
