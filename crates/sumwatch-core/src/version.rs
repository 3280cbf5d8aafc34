//! Toolchain version identity and bootstrap-chain selection.
//!
//! Every published toolchain appears in the log as module
//! `golang.org/toolchain` with a version of the form
//! `v0.0.1-<goVersion>.<goos>-<goarch>`. The Go version itself contains
//! dots, so parsing splits at the last dot before the platform pair.

use crate::gover;

/// The log module under which toolchains are published.
pub const TOOLCHAIN_MODULE: &str = "golang.org/toolchain";

/// The first version of Go whose distribution is reproducible.
pub const FIRST_REPRODUCIBLE_VERSION: &str = "go1.21.0";

/// The first version of Go that is bootstrapped by a reproducible
/// (log-verified) toolchain rather than the pre-approved legacy blob.
pub const FIRST_MODERN_BOOTSTRAP_VERSION: &str = "go1.24.0";

/// Uniquely identifies a built toolchain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// Go version, e.g. `go1.21.0`.
    pub go_version: String,

    /// Target operating system.
    pub goos: String,

    /// Target architecture.
    pub goarch: String,
}

impl Version {
    /// Returns the corresponding `golang.org/toolchain` module version.
    #[must_use]
    pub fn mod_version(&self) -> String {
        format!("v0.0.1-{}.{}-{}", self.go_version, self.goos, self.goarch)
    }

    /// Returns the filename of the module zip for this version.
    #[must_use]
    pub fn zip_filename(&self) -> String {
        self.mod_version() + ".zip"
    }
}

/// Parses a `golang.org/toolchain` module version.
#[must_use]
pub fn parse_mod_version(modversion: &str) -> Option<Version> {
    let rest = modversion.strip_prefix("v0.0.1-")?;
    let lastdot = rest.rfind('.')?;
    let go_version = &rest[..lastdot];
    if !gover::is_valid(go_version) {
        return None;
    }
    let (goos, goarch) = rest[lastdot + 1..].split_once('-')?;
    if goos.is_empty() || goarch.is_empty() {
        return None;
    }
    Some(Version {
        go_version: go_version.to_string(),
        goos: goos.to_string(),
        goarch: goarch.to_string(),
    })
}

/// Reports whether a Go version is supposed to be reproducible.
#[must_use]
pub fn is_reproducible(go_version: &str) -> bool {
    gover::compare(go_version, FIRST_REPRODUCIBLE_VERSION) >= std::cmp::Ordering::Equal
}

/// Returns the language version of the toolchain that bootstraps
/// `go_version`, or the empty string for versions that predate
/// reproducible bootstrapping.
///
/// From Go 1.24 on, each release is bootstrapped by the language version
/// two minors back, rounded down to an even minor: 1.24 and 1.25 build
/// with go1.22, 1.26 and 1.27 with go1.24, and so on.
#[must_use]
pub fn modern_bootstrap_lang(go_version: &str) -> String {
    let Some(v) = gover::parse(go_version) else {
        return String::new();
    };
    if v.major != 1 || v.minor < 24 {
        return String::new();
    }
    let minor = (v.minor - 2) & !1;
    format!("go1.{minor}")
}
