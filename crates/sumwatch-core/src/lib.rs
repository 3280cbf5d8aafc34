//! # sumwatch-core
//!
//! Core library for sumwatch, an independent monitor of Go checksum
//! databases. It provides the pieces the daemon composes into a running
//! auditor:
//!
//! - **Merkle primitives**: leaf/interior hashing and the collapsed
//!   incremental tree used to reconstruct the log.
//! - **Wire codecs**: signed tree heads and two-line log records.
//! - **Tile download**: concurrent, retrying record streaming from the
//!   log's tiled layout.
//! - **Toolchain identity**: module-version parsing, Go version
//!   ordering, and bootstrap-chain selection.
//! - **Reproducibility checks**: the h1 dirhash and the darwin
//!   code-signature stripper.
//! - **Infrastructure seams**: blob storage with presigned URLs, the
//!   remote build worker contract, Atom feed rendering, and process
//!   configuration.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod atom;
pub mod blob;
pub mod config;
pub mod darwin;
pub mod dirhash;
pub mod gover;
pub mod hex;
pub mod merkle;
pub mod record;
pub mod sth;
pub mod tile;
pub mod version;
pub mod worker;

pub use config::Config;
pub use merkle::{CollapsedTree, Hash};
pub use record::Record;
pub use sth::Sth;
