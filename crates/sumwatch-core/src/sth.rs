//! Signed tree head (STH) wire codec and authentication.
//!
//! The checksum database publishes its tree head as a signed note:
//!
//! ```text
//! go.sum database tree
//! <tree_size>
//! <base64 root hash>
//!
//! — <origin> <base64 signature>
//! ```
//!
//! The blank line is mandatory and the signature line starts with U+2014
//! (em-dash). A note may carry signature lines from several signers;
//! parsing selects the line whose origin matches. The base64 signature is
//! prefixed with four key-hash bytes which are discarded before Ed25519
//! verification of `"go.sum database tree\n<size>\n<base64 hash>\n"`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use thiserror::Error;

use crate::merkle::{HASH_LEN, Hash};

const STH_PREAMBLE: &str = "go.sum database tree";

/// Key type tag for Ed25519 verification keys.
pub const KEY_TYPE_ED25519: u8 = 0x01;

/// Errors from STH parsing and authentication.
#[derive(Debug, Error)]
pub enum SthError {
    /// The first line is not the expected preamble.
    #[error("doesn't look like an STH")]
    BadPreamble,

    /// The tree size line is not a non-negative integer.
    #[error("malformed tree size")]
    MalformedTreeSize,

    /// The root hash line is not valid base64.
    #[error("malformed root hash")]
    MalformedRootHash,

    /// The root hash decodes to the wrong number of bytes.
    #[error("root hash has wrong length (should be {HASH_LEN} bytes long, not {0})")]
    RootHashLength(usize),

    /// The blank line separating body and signatures is missing.
    #[error("missing blank line at end of STH")]
    MissingBlankLine,

    /// No signature line matches the requested origin.
    #[error("doesn't have a signature from {0}")]
    NoSignature(String),

    /// The signature is not valid base64.
    #[error("malformed signature")]
    MalformedSignature,

    /// The signature is shorter than the four-byte key hash prefix.
    #[error("signature is too short")]
    SignatureTooShort,

    /// The verification key is empty.
    #[error("key is too short")]
    KeyTooShort,

    /// The verification key has an invalid Ed25519 encoding.
    #[error("malformed Ed25519 key")]
    MalformedKey,

    /// The key type tag is not recognized.
    #[error("unsupported key type {0:#04x}")]
    UnsupportedKeyType(u8),

    /// Ed25519 verification failed.
    #[error("signature is invalid")]
    SignatureInvalid,
}

/// A parsed signed tree head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sth {
    /// Number of leaves the head commits to.
    pub tree_size: u64,

    /// Root hash over the first `tree_size` leaves.
    pub root_hash: Hash,

    /// Raw signature bytes, including the four-byte key-hash prefix.
    pub signature: Vec<u8>,
}

fn chomp_line(input: &[u8]) -> Option<(&[u8], &[u8])> {
    let newline = input.iter().position(|&b| b == b'\n')?;
    Some((&input[..newline], &input[newline + 1..]))
}

/// Parses an STH, selecting the signature line signed by `origin`.
///
/// Trailing lines from other signers are tolerated.
///
/// # Errors
///
/// Returns an [`SthError`] describing the first malformed component.
pub fn parse_sth(input: &[u8], origin: &str) -> Result<Sth, SthError> {
    let (preamble, input) = chomp_line(input).ok_or(SthError::BadPreamble)?;
    let (size_line, input) = chomp_line(input).ok_or(SthError::MalformedTreeSize)?;
    let (hash_line, input) = chomp_line(input).ok_or(SthError::MalformedRootHash)?;
    let (blank_line, mut input) = chomp_line(input).ok_or(SthError::MissingBlankLine)?;

    if preamble != STH_PREAMBLE.as_bytes() {
        return Err(SthError::BadPreamble);
    }
    let tree_size = std::str::from_utf8(size_line)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or(SthError::MalformedTreeSize)?;
    let root_bytes = STANDARD
        .decode(hash_line)
        .map_err(|_| SthError::MalformedRootHash)?;
    let root_hash =
        Hash::from_slice(&root_bytes).ok_or(SthError::RootHashLength(root_bytes.len()))?;
    if !blank_line.is_empty() {
        return Err(SthError::MissingBlankLine);
    }

    let signature_prefix = format!("\u{2014} {origin} ");
    let mut signature = None;
    while let Some((line, rest)) = chomp_line(input) {
        input = rest;
        if let Some(sig) = line.strip_prefix(signature_prefix.as_bytes()) {
            signature = Some(sig);
            break;
        }
    }
    let signature = signature.ok_or_else(|| SthError::NoSignature(origin.to_string()))?;
    let signature = STANDARD
        .decode(signature)
        .map_err(|_| SthError::MalformedSignature)?;

    Ok(Sth {
        tree_size,
        root_hash,
        signature,
    })
}

/// Parses an STH and verifies its signature under `key`.
///
/// # Errors
///
/// Returns the parse error or authentication failure.
pub fn parse_and_authenticate_sth(input: &[u8], origin: &str, key: &[u8]) -> Result<Sth, SthError> {
    let sth = parse_sth(input, origin)?;
    sth.authenticate(key)?;
    Ok(sth)
}

impl Sth {
    /// The exact text covered by the signature.
    fn signed_message(&self) -> String {
        format!(
            "{STH_PREAMBLE}\n{}\n{}\n",
            self.tree_size,
            self.root_hash.to_base64()
        )
    }

    /// Verifies the signature under a tagged verification key.
    ///
    /// The key's first byte is an algorithm tag ([`KEY_TYPE_ED25519`]) and
    /// the remainder is the raw key. The first four signature bytes are a
    /// key hash and are discarded.
    ///
    /// # Errors
    ///
    /// Returns an [`SthError`] if the key or signature is malformed or
    /// verification fails.
    pub fn authenticate(&self, key: &[u8]) -> Result<(), SthError> {
        let (&key_type, key_data) = key.split_first().ok_or(SthError::KeyTooShort)?;
        if self.signature.len() < 4 {
            return Err(SthError::SignatureTooShort);
        }
        let signature = &self.signature[4..];

        match key_type {
            KEY_TYPE_ED25519 => {
                let key_bytes =
                    <[u8; 32]>::try_from(key_data).map_err(|_| SthError::MalformedKey)?;
                let verifying_key =
                    VerifyingKey::from_bytes(&key_bytes).map_err(|_| SthError::MalformedKey)?;
                let signature =
                    Signature::from_slice(signature).map_err(|_| SthError::SignatureInvalid)?;
                verifying_key
                    .verify(self.signed_message().as_bytes(), &signature)
                    .map_err(|_| SthError::SignatureInvalid)
            },
            other => Err(SthError::UnsupportedKeyType(other)),
        }
    }

    /// Formats the STH back to wire form with a signature line for `origin`.
    #[must_use]
    pub fn format(&self, origin: &str) -> String {
        format!(
            "{}\u{2014} {origin} {}\n",
            self.signed_message() + "\n",
            STANDARD.encode(&self.signature)
        )
    }
}
