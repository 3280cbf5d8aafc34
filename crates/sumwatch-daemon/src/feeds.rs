//! Alert feeds.
//!
//! Everything the auditor is worried about is published as Atom:
//! inconsistent STHs and duplicate records in the sumdb failures feed,
//! and non-reproducible builds in the toolchain failures feed.
//! Rendering beyond Atom (dashboards and the like) is left to external
//! consumers of the same queries.

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use sumwatch_core::atom::{Entry, Feed};
use sumwatch_core::hex;

use crate::state::SharedState;

/// Formats a Unix timestamp as RFC 3339 for Atom `updated` fields.
#[must_use]
pub fn rfc3339(unix: i64) -> String {
    chrono::DateTime::from_timestamp(unix, 0)
        .unwrap_or_default()
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Wraps a rendered feed in the Atom response headers.
#[must_use]
pub fn atom_response(feed: &Feed) -> Response {
    (
        [
            (
                header::CONTENT_TYPE,
                "application/atom+xml; charset=utf-8",
            ),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
            (
                header::CACHE_CONTROL,
                "public, max-age=300, must-revalidate",
            ),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        feed.to_xml(),
    )
        .into_response()
}

fn internal_error(context: &str, err: &dyn std::error::Error) -> Response {
    tracing::error!(error = %err, "{context}");
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal Database Error").into_response()
}

/// `GET /sumdb/failures.atom`: inconsistent STHs and duplicate records.
pub async fn serve_sumdb_failures(State(state): State<SharedState>) -> Response {
    let inconsistent = match state.db.inconsistent_sths() {
        Ok(rows) => rows,
        Err(err) => return internal_error("error loading inconsistent STHs", &err),
    };
    let duplicates = match state.db.duplicate_records() {
        Ok(rows) => rows,
        Err(err) => return internal_error("error loading duplicate records", &err),
    };

    let feed_url = format!("https://feeds.api.{}/sumdb/failures.atom", state.config.domain);
    let mut feed = Feed {
        id: feed_url.clone(),
        title: "Checksum Database Audit Failures".to_string(),
        updated: String::new(),
        author: format!("sumwatch on {}", state.config.domain),
        link: feed_url.clone(),
        entries: Vec::new(),
    };

    let mut latest = 0i64;
    for sth in inconsistent {
        latest = latest.max(sth.observed_at);
        feed.entries.push(Entry {
            title: format!("Inconsistent STH from {}", sth.host),
            id: format!(
                "{feed_url}#sth-{}-{}-{}",
                sth.host,
                sth.tree_size,
                STANDARD.encode(&sth.root_hash)
            ),
            updated: rfc3339(sth.observed_at),
            content: format!(
                "Log: {}\nTree Size: {}\nSTH Root Hash: {}\nExpected Root Hash: {}\n",
                sth.host,
                sth.tree_size,
                STANDARD.encode(&sth.root_hash),
                STANDARD.encode(&sth.calculated_root_hash),
            ),
        });
    }
    for record in duplicates {
        latest = latest.max(record.observed_at);
        feed.entries.push(Entry {
            title: format!("Duplicate record in {}", record.host),
            id: format!("{feed_url}#dup-{}-{}", record.host, record.position),
            updated: rfc3339(record.observed_at),
            content: format!(
                "Log: {}\nModule: {}\nVersion: {}\nPosition: {}\nPrevious Position: {}\n",
                record.host,
                record.module,
                record.version,
                record.position,
                record.previous_position,
            ),
        });
    }

    feed.updated = if latest == 0 {
        rfc3339(chrono::Utc::now().timestamp())
    } else {
        rfc3339(latest)
    };
    atom_response(&feed)
}

/// `GET /toolchain/failures.atom`: builds that ended `unequal` or
/// `failed`.
pub async fn serve_toolchain_failures(State(state): State<SharedState>) -> Response {
    let failures = match state.db.toolchain_failures() {
        Ok(rows) => rows,
        Err(err) => return internal_error("error loading toolchain failures", &err),
    };

    let feed_url = format!(
        "https://feeds.api.{}/toolchain/failures.atom",
        state.config.domain
    );
    let mut feed = Feed {
        id: feed_url.clone(),
        title: "Toolchain Build Failures".to_string(),
        updated: failures
            .first()
            .map_or_else(|| rfc3339(chrono::Utc::now().timestamp()), |f| rfc3339(f.inserted_at)),
        author: format!("sumwatch on {}", state.config.domain),
        link: feed_url.clone(),
        entries: Vec::new(),
    };

    for failure in failures {
        let build_id = failure
            .build_id
            .as_deref()
            .map(hex::encode)
            .unwrap_or_default();
        feed.entries.push(Entry {
            title: format!("Toolchain {} build {}", failure.version, failure.status),
            id: format!("{feed_url}#{}-{build_id}", failure.version),
            updated: rfc3339(failure.inserted_at),
            content: format!(
                "Version: {}\nStatus: {}\nMessage: {}\nBuild ID: {build_id}\n",
                failure.version, failure.status, failure.message,
            ),
        });
    }
    atom_response(&feed)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sumwatch_core::merkle::{self, CollapsedTree};
    use sumwatch_core::sth::Sth;

    use super::*;
    use crate::db::{BuildResult, BuildStatus, NewRecord};
    use crate::testutil::test_state;

    async fn body_of(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn sumdb_failures_feed_lists_both_alarm_kinds() {
        let (_dir, state, log_id) = test_state();

        // Duplicate module records with a forged STH on top.
        let start = CollapsedTree::new();
        let mut tree = start.clone();
        let mut records = Vec::new();
        for position in 0..2u64 {
            let record = sumwatch_core::Record {
                module: "example.com/dup".to_string(),
                version: "v1.0.0".to_string(),
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
        let forged = Sth {
            tree_size: 2,
            root_hash: merkle::hash_leaf(b"forged"),
            signature: vec![0; 68],
        };
        state.db.insert_sth(log_id, &forged, "gossip").unwrap();
        state
            .db
            .checkpoint(log_id, "sum.golang.org", &start, &tree, &records, true)
            .unwrap();
        state.db.audit_sths(log_id).unwrap();

        let response = serve_sumdb_failures(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/atom+xml; charset=utf-8"
        );
        let xml = body_of(response).await;
        assert!(xml.contains("Inconsistent STH from sum.golang.org"));
        assert!(xml.contains("Duplicate record in sum.golang.org"));
        assert!(xml.contains("Previous Position: 0"));
    }

    #[tokio::test]
    async fn toolchain_failures_feed_skips_good_builds() {
        let (_dir, state, _) = test_state();
        state
            .db
            .store_build_result(
                "v0.0.1-go1.24.0.linux-amd64",
                &BuildResult {
                    status: BuildStatus::Equal,
                    message: None,
                    build_id: None,
                    duration: None,
                },
            )
            .unwrap();
        state
            .db
            .store_build_result(
                "v0.0.1-go1.24.1.linux-amd64",
                &BuildResult {
                    status: BuildStatus::Unequal,
                    message: None,
                    build_id: Some([0x42; 16]),
                    duration: Some(Duration::from_secs(600)),
                },
            )
            .unwrap();

        let response = serve_toolchain_failures(State(state)).await;
        let xml = body_of(response).await;
        assert!(xml.contains("v0.0.1-go1.24.1.linux-amd64"));
        assert!(!xml.contains("v0.0.1-go1.24.0.linux-amd64 build"));
        assert!(xml.contains(&hex::encode(&[0x42; 16])));
    }
}
