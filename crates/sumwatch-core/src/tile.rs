//! Tile-based record download.
//!
//! The log serves its leaves in tiles of 256 records at
//! `/tile/8/data/<encoded index>`, with a `.p/<count>` suffix for a
//! partial final tile. Tile indices are encoded in groups of three
//! decimal digits, most significant group first, every group but the
//! last prefixed with `x` and separated by `/`: index 1999001 encodes as
//! `x001/x999/001`.
//!
//! [`download_records`] streams a contiguous record range into a bounded
//! channel in strictly increasing position order. Any network or decoding
//! failure is retried with randomized exponential backoff; only
//! cancellation or the receiver going away ends the download early.

// Tile counts fit comfortably in both u64 and usize.
#![allow(clippy::cast_possible_truncation)]

use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::record::{self, Record, RecordError};

/// Tile height of the log's tiled layout (tiles hold 2^8 records).
pub const TILE_HEIGHT: u32 = 8;

/// Number of records per full tile.
pub const RECORDS_PER_TILE: u64 = 1 << TILE_HEIGHT;

/// Maximum backoff exponent; sleeps are capped at `[2^8 s, 2^9 s)`.
const MAX_RETRY_EXPONENT: u32 = 8;

/// Errors that end a download (retriable failures are handled internally).
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// The download was cancelled.
    #[error("download cancelled")]
    Cancelled,

    /// The receiving side of the record channel was dropped.
    #[error("record channel closed")]
    ChannelClosed,
}

/// A retriable failure while fetching one tile.
#[derive(Debug, thiserror::Error)]
enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url}: HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("{url} returned {got} records instead of {want}")]
    RecordCount { url: String, got: usize, want: u64 },

    #[error("{url} returned invalid record at {index}: {source}")]
    InvalidRecord {
        url: String,
        index: u64,
        source: RecordError,
    },
}

/// Encodes a tile index for the tile URL path.
#[must_use]
pub fn format_tile_index(mut tile: u64) -> String {
    let mut encoded = String::new();
    loop {
        let rem = tile % 1000;
        tile /= 1000;
        if encoded.is_empty() {
            encoded = format!("{rem:03}");
        } else {
            encoded = format!("x{rem:03}/{encoded}");
        }
        if tile == 0 {
            return encoded;
        }
    }
}

/// Splits a tile body at blank lines into individual record byte ranges.
///
/// Records end with `\n` and are separated by an additional `\n`.
#[must_use]
pub fn split_records(mut input: &[u8]) -> Vec<&[u8]> {
    let mut records = Vec::with_capacity(RECORDS_PER_TILE as usize);
    loop {
        match input.windows(2).position(|w| w == b"\n\n") {
            None => {
                records.push(input);
                return records;
            },
            Some(nlnl) => {
                records.push(&input[..nlnl + 1]);
                input = &input[nlnl + 2..];
            },
        }
    }
}

fn tile_url(base_url: &str, begin: u64, end: u64) -> (String, u64, u64) {
    let tile = begin / RECORDS_PER_TILE;
    let skip = begin % RECORDS_PER_TILE;
    let count = (end - tile * RECORDS_PER_TILE).min(RECORDS_PER_TILE);

    let mut url = format!(
        "{base_url}/tile/{TILE_HEIGHT}/data/{}",
        format_tile_index(tile)
    );
    if count < RECORDS_PER_TILE {
        url.push_str(&format!(".p/{count}"));
    }
    (url, skip, count)
}

async fn fetch(client: &reqwest::Client, url: &str) -> Result<Vec<u8>, FetchError> {
    let response = client.get(url).send().await?;
    let status = response.status();
    let body = response.bytes().await?;
    if !status.is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(body.to_vec())
}

async fn fetch_records(
    client: &reqwest::Client,
    base_url: &str,
    begin: u64,
    end: u64,
) -> Result<Vec<Record>, FetchError> {
    let (url, skip, count) = tile_url(base_url, begin, end);
    let body = fetch(client, &url).await?;

    let raw = split_records(&body);
    if raw.len() as u64 != count {
        return Err(FetchError::RecordCount {
            url,
            got: raw.len(),
            want: count,
        });
    }

    let mut records = Vec::with_capacity(raw.len() - skip as usize);
    for (i, bytes) in raw.iter().enumerate().skip(skip as usize) {
        let parsed = record::parse_record(bytes).map_err(|source| FetchError::InvalidRecord {
            url: url.clone(),
            index: i as u64,
            source,
        })?;
        records.push(parsed);
    }
    Ok(records)
}

async fn backoff(cancel: &CancellationToken, exponent: u32) -> Result<(), DownloadError> {
    let (min, max) = (
        std::time::Duration::from_secs(1 << exponent),
        std::time::Duration::from_secs(2 << exponent),
    );
    let duration = {
        let mut rng = rand::thread_rng();
        rng.gen_range(min..max)
    };
    tokio::select! {
        () = cancel.cancelled() => Err(DownloadError::Cancelled),
        () = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Downloads records for positions `[begin, end)` into `records_out`, in
/// position order.
///
/// The caller is expected to bound the channel at twice the tile size so
/// that slow consumption backpressures the download. Fetch and decode
/// failures are retried indefinitely with randomized exponential backoff
/// (capped at `2^8` seconds); cancellation is honored at every suspension
/// point.
///
/// # Errors
///
/// Returns [`DownloadError::Cancelled`] on cancellation and
/// [`DownloadError::ChannelClosed`] if the receiver is dropped.
pub async fn download_records(
    client: &reqwest::Client,
    base_url: &str,
    mut begin: u64,
    end: u64,
    records_out: mpsc::Sender<Record>,
    cancel: &CancellationToken,
) -> Result<(), DownloadError> {
    let mut retries = 0;

    while begin < end {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        let records = tokio::select! {
            () = cancel.cancelled() => return Err(DownloadError::Cancelled),
            result = fetch_records(client, base_url, begin, end) => result,
        };
        let records = match records {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(
                    base_url,
                    begin,
                    end,
                    error = %err,
                    "error downloading records, backing off"
                );
                backoff(cancel, retries).await?;
                if retries < MAX_RETRY_EXPONENT {
                    retries += 1;
                }
                continue;
            },
        };
        retries = 0;

        for record in records {
            tokio::select! {
                () = cancel.cancelled() => return Err(DownloadError::Cancelled),
                sent = records_out.send(record) => {
                    sent.map_err(|_| DownloadError::ChannelClosed)?;
                },
            }
            begin += 1;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Router;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::get;

    use super::*;
    use crate::merkle::HASH_LEN;

    #[test]
    fn tile_index_encoding_vectors() {
        for (index, encoded) in [
            (0, "000"),
            (1, "001"),
            (12, "012"),
            (105, "105"),
            (1_000, "x001/000"),
            (1_050, "x001/050"),
            (52_123, "x052/123"),
            (999_001, "x999/001"),
            (1_999_001, "x001/x999/001"),
            (15_999_001, "x015/x999/001"),
        ] {
            assert_eq!(format_tile_index(index), encoded, "index {index}");
        }
    }

    #[test]
    fn tile_url_math() {
        let (url, skip, count) = tile_url("https://sum.golang.org", 0, 512);
        assert_eq!(url, "https://sum.golang.org/tile/8/data/000");
        assert_eq!((skip, count), (0, 256));

        let (url, skip, count) = tile_url("https://sum.golang.org", 300, 400);
        assert_eq!(url, "https://sum.golang.org/tile/8/data/001.p/144");
        assert_eq!((skip, count), (44, 144));
    }

    #[test]
    fn split_records_on_blank_lines() {
        let body = b"a 1\nb 2\n\nc 3\n\nd 4\n";
        let records = split_records(body);
        assert_eq!(records, vec![&b"a 1\nb 2\n"[..], b"c 3\n", b"d 4\n"]);
    }

    fn test_record(position: u64) -> Record {
        let mut source = [0u8; HASH_LEN];
        source[..8].copy_from_slice(&position.to_be_bytes());
        Record {
            module: "example.com/mod".to_string(),
            version: format!("v1.0.{position}"),
            source_sha256: source,
            gomod_sha256: [0xaa; HASH_LEN],
        }
    }

    fn tile_body(first: u64, count: u64) -> Vec<u8> {
        let mut body = Vec::new();
        for position in first..first + count {
            if !body.is_empty() {
                body.push(b'\n');
            }
            body.extend_from_slice(&test_record(position).format());
        }
        body
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn downloads_range_in_order_with_partial_tail() {
        let router = Router::new().route(
            "/tile/8/data/{*rest}",
            get(|Path(rest): Path<String>| async move {
                match rest.as_str() {
                    "000" => (StatusCode::OK, tile_body(0, 256)),
                    "001.p/199" => (StatusCode::OK, tile_body(256, 199)),
                    other => panic!("unexpected tile request {other}"),
                }
            }),
        );
        let base_url = serve(router).await;

        let (tx, mut rx) = mpsc::channel(2 * RECORDS_PER_TILE as usize);
        let client = reqwest::Client::new();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(async move {
            download_records(&client, &base_url, 3, 455, tx, &cancel).await
        });

        let mut positions = Vec::new();
        while let Some(record) = rx.recv().await {
            positions.push(record.version);
        }
        handle.await.unwrap().unwrap();

        let expected: Vec<String> = (3..455).map(|p| format!("v1.0.{p}")).collect();
        assert_eq!(positions, expected);
    }

    #[tokio::test]
    async fn retries_after_short_tile_response() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let router = Router::new().route(
            "/tile/8/data/{*rest}",
            get(move |Path(_rest): Path<String>| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        // One record short: a validation failure, not a 4xx.
                        (StatusCode::OK, tile_body(0, 3))
                    } else {
                        (StatusCode::OK, tile_body(0, 4))
                    }
                }
            }),
        );
        let base_url = serve(router).await;

        let (tx, mut rx) = mpsc::channel(8);
        let client = reqwest::Client::new();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(async move {
            download_records(&client, &base_url, 0, 4, tx, &cancel).await
        });

        let mut received = 0;
        while rx.recv().await.is_some() {
            received += 1;
        }
        handle.await.unwrap().unwrap();
        assert_eq!(received, 4);
        assert!(attempts.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn cancellation_stops_download() {
        let router = Router::new().route(
            "/tile/8/data/{*rest}",
            get(|| async {
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                StatusCode::OK
            }),
        );
        let base_url = serve(router).await;

        let (tx, _rx) = mpsc::channel(8);
        let client = reqwest::Client::new();
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let handle = tokio::spawn(async move {
            download_records(&client, &base_url, 0, 4, tx, &cancel_clone).await
        });
        cancel.cancel();
        assert!(matches!(
            handle.await.unwrap(),
            Err(DownloadError::Cancelled)
        ));
    }
}
