//! Content-addressed artifact cache.
//!
//! Artifacts are stored in a flat directory keyed by cache key, with a
//! build log and JSON metadata next to each artifact tarball:
//!
//! ```text
//! <cachedir>/artifacts/<64hex>.<kind>.<name>   # tar bytes
//! <cachedir>/artifacts/<64hex>.build-log       # utf-8 text
//! <cachedir>/artifacts/<64hex>.meta            # json
//! <cachedir>/artifacts/<64hex>.lock            # advisory lock
//! ```
//!
//! The same layout is served over HTTP by `morph-cache-server`; the
//! `remote` module is the client side of that protocol.

pub mod error;
pub mod local;
pub mod remote;

pub use error::{CacheError, CacheResult};
pub use local::{ArtifactMeta, Claim, ClaimOutcome, GcStats, LocalArtifactCache};
pub use remote::RemoteArtifactCache;

use morph_core::{ArtifactKind, CacheKey};
use std::sync::OnceLock;

/// Grammar of artifact names inside cache filenames.
pub const NAME_PATTERN: &str = r"^[A-Za-z0-9._+-]+$";

fn name_regex() -> &'static regex::Regex {
    static NAME_REGEX: OnceLock<regex::Regex> = OnceLock::new();
    NAME_REGEX.get_or_init(|| regex::Regex::new(NAME_PATTERN).expect("static regex"))
}

/// Whether `name` is a valid artifact name.
pub fn is_valid_name(name: &str) -> bool {
    name_regex().is_match(name)
}

/// The cache filename of an artifact tarball.
pub fn artifact_filename(key: &CacheKey, kind: ArtifactKind, name: &str) -> String {
    format!("{}.{}.{}", key.to_hex(), kind.name(), name)
}

/// The cache filename of a build log.
pub fn build_log_filename(key: &CacheKey) -> String {
    format!("{}.build-log", key.to_hex())
}

/// The cache filename of the metadata sidecar.
pub fn meta_filename(key: &CacheKey) -> String {
    format!("{}.meta", key.to_hex())
}

/// A parsed cache filename.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheFilename {
    Artifact {
        key: CacheKey,
        kind: ArtifactKind,
        name: String,
    },
    BuildLog {
        key: CacheKey,
    },
    Meta {
        key: CacheKey,
    },
}

impl CacheFilename {
    /// Parse and validate a cache filename. Rejects anything that is not
    /// exactly `KEY.KIND.NAME`, `KEY.build-log` or `KEY.meta`.
    pub fn parse(filename: &str) -> CacheResult<Self> {
        let (key_hex, rest) = filename
            .split_once('.')
            .ok_or_else(|| CacheError::InvalidName(filename.to_string()))?;
        let key = CacheKey::from_hex(key_hex)
            .map_err(|_| CacheError::InvalidName(filename.to_string()))?;

        match rest {
            "build-log" => return Ok(CacheFilename::BuildLog { key }),
            "meta" => return Ok(CacheFilename::Meta { key }),
            _ => {}
        }

        let (kind_name, name) = rest
            .split_once('.')
            .ok_or_else(|| CacheError::InvalidName(filename.to_string()))?;
        let kind = ArtifactKind::from_name(kind_name)
            .ok_or_else(|| CacheError::InvalidName(filename.to_string()))?;
        if !is_valid_name(name) {
            return Err(CacheError::InvalidName(filename.to_string()));
        }
        Ok(CacheFilename::Artifact {
            key,
            kind,
            name: name.to_string(),
        })
    }

    pub fn key(&self) -> &CacheKey {
        match self {
            CacheFilename::Artifact { key, .. } => key,
            CacheFilename::BuildLog { key } => key,
            CacheFilename::Meta { key } => key,
        }
    }

    pub fn to_filename(&self) -> String {
        match self {
            CacheFilename::Artifact { key, kind, name } => artifact_filename(key, *kind, name),
            CacheFilename::BuildLog { key } => build_log_filename(key),
            CacheFilename::Meta { key } => meta_filename(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> CacheKey {
        CacheKey::compute(b"test")
    }

    #[test]
    fn filename_roundtrip() {
        let filename = artifact_filename(&key(), ArtifactKind::Chunk, "hello-runtime");
        let parsed = CacheFilename::parse(&filename).unwrap();
        assert_eq!(
            parsed,
            CacheFilename::Artifact {
                key: key(),
                kind: ArtifactKind::Chunk,
                name: "hello-runtime".to_string(),
            }
        );
        assert_eq!(parsed.to_filename(), filename);
    }

    #[test]
    fn sidecar_filenames_parse() {
        let log = CacheFilename::parse(&build_log_filename(&key())).unwrap();
        assert!(matches!(log, CacheFilename::BuildLog { .. }));
        let meta = CacheFilename::parse(&meta_filename(&key())).unwrap();
        assert!(matches!(meta, CacheFilename::Meta { .. }));
    }

    #[test]
    fn names_with_dots_parse() {
        let filename = format!("{}.chunk.glibc-2.39-runtime", key().to_hex());
        match CacheFilename::parse(&filename).unwrap() {
            CacheFilename::Artifact { name, .. } => assert_eq!(name, "glibc-2.39-runtime"),
            other => panic!("expected artifact, got {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_filenames() {
        assert!(CacheFilename::parse("nothex.chunk.name").is_err());
        assert!(CacheFilename::parse(&format!("{}.rootkit.name", key().to_hex())).is_err());
        assert!(CacheFilename::parse(&format!("{}.chunk.bad/name", key().to_hex())).is_err());
        assert!(CacheFilename::parse(&format!("{}.chunk.", key().to_hex())).is_err());
        assert!(CacheFilename::parse(&key().to_hex()).is_err());
        assert!(CacheFilename::parse(&format!("{}.lock", key().to_hex())).is_err());
    }
}
