//! Image version triple (ref, stream, semantic version).
//!
//! Short paths identify a version compactly:
//! - `v2.16.0` is a release on the `stable` stream (ref `-`)
//! - `stream/debug/v2.16.0` is a debug build of a release (ref `-`)
//! - `ref/main/stream/nightly/v2.17.0-pre.0.20240312...` is a branch build

use serde::{Deserialize, Serialize};

use crate::error::{PublishError, Result};

/// Ref used for builds that are not tied to a branch.
pub const RELEASE_REF: &str = "-";

/// Stream of release builds.
pub const STABLE_STREAM: &str = "stable";

/// Stream of debug builds.
pub const DEBUG_STREAM: &str = "debug";

/// Version of an OS image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    #[serde(rename = "ref")]
    reference: String,
    stream: String,
    version: String,
}

impl Version {
    /// Create a version, validating each part.
    pub fn new(
        reference: impl Into<String>,
        stream: impl Into<String>,
        version: impl Into<String>,
    ) -> Result<Self> {
        let version = Self {
            reference: reference.into(),
            stream: stream.into(),
            version: version.into(),
        };
        version.validate()?;
        Ok(version)
    }

    /// Parse a version from its short path representation.
    pub fn from_short_path(path: &str) -> Result<Self> {
        let parts: Vec<&str> = path.trim_matches('/').split('/').collect();
        match parts.as_slice() {
            [version] => Self::new(RELEASE_REF, STABLE_STREAM, *version),
            ["stream", stream, version] => Self::new(RELEASE_REF, *stream, *version),
            ["ref", reference, "stream", stream, version] => {
                Self::new(*reference, *stream, *version)
            }
            _ => Err(PublishError::InvalidRequest(format!(
                "invalid version short path {path:?}"
            ))),
        }
    }

    /// Branch ref the image was built from (`-` for releases).
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Release stream (e.g. `stable`, `nightly`, `debug`).
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Semantic version string, including the leading `v`.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Whether this is a release on the stable stream.
    pub fn is_stable(&self) -> bool {
        self.stream == STABLE_STREAM
    }

    /// Whether this is a debug build of a release (no branch ref).
    pub fn is_release_debug(&self) -> bool {
        self.stream == DEBUG_STREAM && self.reference == RELEASE_REF
    }

    /// Render the short path for this version.
    pub fn short_path(&self) -> String {
        match (self.reference.as_str(), self.stream.as_str()) {
            (RELEASE_REF, STABLE_STREAM) => self.version.clone(),
            (RELEASE_REF, stream) => format!("stream/{}/{}", stream, self.version),
            (reference, stream) => {
                format!("ref/{}/stream/{}/{}", reference, stream, self.version)
            }
        }
    }

    /// The `major.minor.patch` core of the version, without the leading `v`.
    pub fn clean_semver(&self) -> Option<String> {
        let rest = self.version.strip_prefix('v')?;
        let core: Vec<&str> = rest
            .splitn(4, |c: char| c == '.' || c == '-' || c == '+')
            .take(3)
            .collect();
        if core.len() != 3 || core.iter().any(|p| p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit())) {
            return None;
        }
        Some(core.join("."))
    }

    fn validate(&self) -> Result<()> {
        if self.reference.is_empty() {
            return Err(PublishError::InvalidRequest("version ref is empty".to_string()));
        }
        if self.stream.is_empty() {
            return Err(PublishError::InvalidRequest("version stream is empty".to_string()));
        }
        if self.reference != RELEASE_REF && self.stream == STABLE_STREAM {
            return Err(PublishError::InvalidRequest(format!(
                "stable stream is only valid for ref {RELEASE_REF:?}, got {:?}",
                self.reference
            )));
        }
        if !self.version.starts_with('v') || self.version.len() < 2 {
            return Err(PublishError::InvalidRequest(format!(
                "version {:?} must start with 'v'",
                self.version
            )));
        }
        if self.reference.contains('/') || self.stream.contains('/') || self.version.contains('/') {
            return Err(PublishError::InvalidRequest(
                "version parts must not contain '/'".to_string(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.short_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_short_path() {
        let v = Version::from_short_path("v2.16.0").unwrap();
        assert_eq!(v.reference(), "-");
        assert_eq!(v.stream(), "stable");
        assert_eq!(v.version(), "v2.16.0");
        assert!(v.is_stable());
        assert_eq!(v.short_path(), "v2.16.0");
    }

    #[test]
    fn test_stream_short_path() {
        let v = Version::from_short_path("stream/debug/v2.16.0").unwrap();
        assert_eq!(v.reference(), "-");
        assert_eq!(v.stream(), "debug");
        assert!(v.is_release_debug());
        assert_eq!(v.short_path(), "stream/debug/v2.16.0");
    }

    #[test]
    fn test_ref_short_path() {
        let path = "ref/feat-x/stream/nightly/v2.17.0-pre.0.20240312101010-abcdef";
        let v = Version::from_short_path(path).unwrap();
        assert_eq!(v.reference(), "feat-x");
        assert_eq!(v.stream(), "nightly");
        assert!(!v.is_stable());
        assert!(!v.is_release_debug());
        assert_eq!(v.short_path(), path);
    }

    #[test]
    fn test_invalid_short_paths() {
        assert!(Version::from_short_path("").is_err());
        assert!(Version::from_short_path("2.16.0").is_err());
        assert!(Version::from_short_path("stream/nightly").is_err());
        assert!(Version::from_short_path("ref/main/stream/stable/v1.0.0").is_err());
    }

    #[test]
    fn test_clean_semver() {
        let v = Version::new("main", "nightly", "v2.17.0-pre.0.20240312").unwrap();
        assert_eq!(v.clean_semver().as_deref(), Some("2.17.0"));
        let v = Version::new("-", "stable", "v2.16.3").unwrap();
        assert_eq!(v.clean_semver().as_deref(), Some("2.16.3"));
        let v = Version::new("-", "stable", "vnext").unwrap();
        assert_eq!(v.clean_semver(), None);
    }

    #[test]
    fn test_serde_uses_ref_field() {
        let v = Version::new("main", "nightly", "v1.0.0").unwrap();
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["ref"], "main");
        assert_eq!(json["stream"], "nightly");
    }
}
