//! Log record (leaf) codec.
//!
//! Each leaf of the checksum database is exactly two text lines:
//!
//! ```text
//! <module> <version> h1:<base64 source hash>
//! <module> <version>/go.mod h1:<base64 go.mod hash>
//! ```
//!
//! Both lines must agree on module and version, and both hashes decode to
//! 32 bytes. The Merkle leaf hash is computed over the concatenation of
//! both lines including the trailing newline.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

use crate::merkle::{self, HASH_LEN, Hash};

const HASH_PREFIX: &str = "h1:";

/// Errors from record parsing.
#[derive(Debug, Error)]
pub enum RecordError {
    /// Fewer than two newline-terminated lines were present.
    #[error("premature end of go.sum record")]
    PrematureEnd,

    /// Bytes remain after the second line.
    #[error("garbage at end of go.sum record")]
    TrailingGarbage,

    /// A line does not have exactly three space-separated fields.
    #[error("go.sum line does not have exactly three fields")]
    FieldCount,

    /// The hash field does not start with `h1:`.
    #[error("unrecognized hash type")]
    UnrecognizedHashType,

    /// The hash is not valid base64.
    #[error("go.sum line contains invalid hash")]
    InvalidHash,

    /// The hash decodes to the wrong number of bytes.
    #[error("SHA-256 hash has wrong length")]
    HashLength,

    /// The go.mod line does not match the source line's module/version.
    #[error("go.sum source line does not match go.mod line")]
    LineMismatch,
}

/// One log leaf: a module version and its two content hashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Module path, e.g. `golang.org/x/text`.
    pub module: String,

    /// Module version, e.g. `v0.3.8`.
    pub version: String,

    /// SHA-256 over the module source tree (h1 dirhash preimage).
    pub source_sha256: [u8; HASH_LEN],

    /// SHA-256 over the module's go.mod file.
    pub gomod_sha256: [u8; HASH_LEN],
}

fn parse_record_hash(input: &str) -> Result<[u8; HASH_LEN], RecordError> {
    let encoded = input
        .strip_prefix(HASH_PREFIX)
        .ok_or(RecordError::UnrecognizedHashType)?;
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|_| RecordError::InvalidHash)?;
    <[u8; HASH_LEN]>::try_from(bytes.as_slice()).map_err(|_| RecordError::HashLength)
}

fn chomp_fields(input: &[u8]) -> Option<(Vec<&[u8]>, &[u8])> {
    let newline = input.iter().position(|&b| b == b'\n')?;
    let (line, rest) = (&input[..newline], &input[newline + 1..]);
    Some((line.split(|&b| b == b' ').collect(), rest))
}

/// Parses a single two-line record.
///
/// # Errors
///
/// Returns a [`RecordError`] describing the first malformed component.
pub fn parse_record(input: &[u8]) -> Result<Record, RecordError> {
    let (source_line, input) = chomp_fields(input).ok_or(RecordError::PrematureEnd)?;
    let (gomod_line, input) = chomp_fields(input).ok_or(RecordError::PrematureEnd)?;
    if !input.is_empty() {
        return Err(RecordError::TrailingGarbage);
    }
    if source_line.len() != 3 || gomod_line.len() != 3 {
        return Err(RecordError::FieldCount);
    }

    let module = std::str::from_utf8(source_line[0])
        .map_err(|_| RecordError::FieldCount)?
        .to_string();
    let version = std::str::from_utf8(source_line[1])
        .map_err(|_| RecordError::FieldCount)?
        .to_string();
    let source_sha256 = parse_record_hash(
        std::str::from_utf8(source_line[2]).map_err(|_| RecordError::InvalidHash)?,
    )?;

    if gomod_line[0] != module.as_bytes()
        || gomod_line[1] != format!("{version}/go.mod").as_bytes()
    {
        return Err(RecordError::LineMismatch);
    }
    let gomod_sha256 = parse_record_hash(
        std::str::from_utf8(gomod_line[2]).map_err(|_| RecordError::InvalidHash)?,
    )?;

    Ok(Record {
        module,
        version,
        source_sha256,
        gomod_sha256,
    })
}

impl Record {
    /// Renders the record back to its two-line wire form.
    #[must_use]
    pub fn format(&self) -> Vec<u8> {
        format!(
            "{module} {version} h1:{source}\n{module} {version}/go.mod h1:{gomod}\n",
            module = self.module,
            version = self.version,
            source = STANDARD.encode(self.source_sha256),
            gomod = STANDARD.encode(self.gomod_sha256),
        )
        .into_bytes()
    }

    /// Merkle leaf hash of the record.
    #[must_use]
    pub fn leaf_hash(&self) -> Hash {
        merkle::hash_leaf(&self.format())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Record {
        Record {
            module: "golang.org/x/text".to_string(),
            version: "v0.3.8".to_string(),
            source_sha256: [0x11; HASH_LEN],
            gomod_sha256: [0x22; HASH_LEN],
        }
    }

    #[test]
    fn format_parse_round_trip() {
        let record = sample();
        let parsed = parse_record(&record.format()).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn rejects_mismatched_versions() {
        let text = format!(
            "m v1.0.0 h1:{h}\nm v1.0.1/go.mod h1:{h}\n",
            h = STANDARD.encode([0u8; HASH_LEN])
        );
        assert!(matches!(
            parse_record(text.as_bytes()),
            Err(RecordError::LineMismatch)
        ));
    }

    #[test]
    fn rejects_mismatched_modules() {
        let text = format!(
            "m v1.0.0 h1:{h}\nn v1.0.0/go.mod h1:{h}\n",
            h = STANDARD.encode([0u8; HASH_LEN])
        );
        assert!(matches!(
            parse_record(text.as_bytes()),
            Err(RecordError::LineMismatch)
        ));
    }

    #[test]
    fn rejects_wrong_hash_length() {
        let text = "m v1.0.0 h1:c2hvcnQ=\nm v1.0.0/go.mod h1:c2hvcnQ=\n";
        assert!(matches!(
            parse_record(text.as_bytes()),
            Err(RecordError::HashLength)
        ));
    }

    #[test]
    fn rejects_unknown_hash_type() {
        let h = STANDARD.encode([0u8; HASH_LEN]);
        let text = format!("m v1.0.0 h2:{h}\nm v1.0.0/go.mod h2:{h}\n");
        assert!(matches!(
            parse_record(text.as_bytes()),
            Err(RecordError::UnrecognizedHashType)
        ));
    }

    #[test]
    fn rejects_trailing_garbage() {
        let mut bytes = sample().format();
        bytes.extend_from_slice(b"extra\n");
        assert!(matches!(
            parse_record(&bytes),
            Err(RecordError::TrailingGarbage)
        ));
    }

    #[test]
    fn rejects_truncated_record() {
        let bytes = sample().format();
        let first_line_len = bytes.iter().position(|&b| b == b'\n').unwrap() + 1;
        assert!(matches!(
            parse_record(&bytes[..first_line_len]),
            Err(RecordError::PrematureEnd)
        ));
    }

    #[test]
    fn leaf_hash_covers_both_lines() {
        let record = sample();
        assert_eq!(record.leaf_hash(), merkle::hash_leaf(&record.format()));
        let mut other = record.clone();
        other.gomod_sha256 = [0x23; HASH_LEN];
        assert_ne!(record.leaf_hash(), other.leaf_hash());
    }
}
