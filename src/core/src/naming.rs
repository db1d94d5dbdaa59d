//! Deterministic resource names.
//!
//! Every name is a pure function of (prefix, version, attestation variant,
//! timestamp). A retried run of the same request therefore finds the leftovers
//! of a failed run under the same names and removes them in pre-clean.
//! Stable releases drop the stream and timestamp from native image names so
//! that re-publishing a release reuses its name.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::provider::Provider;
use crate::version::{Version, DEBUG_STREAM, RELEASE_REF, STABLE_STREAM};

/// Default prefix of every resource name.
pub const DEFAULT_PREFIX: &str = "cvm";

/// Compact timestamp layout used in names.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Maximum GCE resource name length.
const GCP_NAME_MAX: usize = 63;

/// Hex digits of the hash suffix appended to shortened names.
const HASH_SUFFIX_LEN: usize = 8;

/// Maximum length of the ref part of a GCE image family.
const GCP_FAMILY_REF_MAX: usize = 45;

/// Maximum Azure managed disk / image name length.
const AZURE_NAME_MAX: usize = 80;

/// Shared image gallery coordinates of an Azure image version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GalleryNames {
    pub gallery: String,
    /// Image definition name (the offer).
    pub definition: String,
    /// Image version name (`major.minor.patch`).
    pub version: String,
}

/// Names used by one publishing run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    /// Temporary staging object (blob, upload disk).
    pub staging: String,
    /// Native image name.
    pub image: String,
    /// Backing snapshot or intermediate image.
    pub snapshot: String,
    /// GCE image family.
    pub family: Option<String>,
    /// Azure gallery coordinates.
    pub gallery: Option<GalleryNames>,
}

/// Derives provider specific resource names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingScheme {
    prefix: String,
    gallery_override: Option<String>,
}

impl Default for NamingScheme {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl NamingScheme {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            gallery_override: None,
        }
    }

    /// Publish Azure images into a fixed gallery instead of the derived one.
    pub fn with_gallery_override(mut self, gallery: Option<String>) -> Self {
        self.gallery_override = gallery;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// All names a provider adapter needs for one run.
    pub fn names(
        &self,
        provider: Provider,
        version: &Version,
        variant: &str,
        timestamp: DateTime<Utc>,
    ) -> ResourceNames {
        match provider {
            Provider::Aws => {
                let image = self.aws_image_name(version, variant, timestamp);
                ResourceNames {
                    staging: aws_blob_name(version, variant, timestamp),
                    snapshot: image.clone(),
                    image,
                    family: None,
                    gallery: None,
                }
            }
            Provider::Gcp => {
                let image = self.gcp_image_name(version, variant, timestamp);
                ResourceNames {
                    staging: format!("{image}.tar.gz"),
                    snapshot: image.clone(),
                    family: Some(self.gcp_image_family(version)),
                    image,
                    gallery: None,
                }
            }
            Provider::Azure => {
                let disk = self.azure_disk_name(version, variant, timestamp);
                ResourceNames {
                    staging: disk.clone(),
                    image: disk.clone(),
                    snapshot: disk,
                    family: None,
                    gallery: Some(GalleryNames {
                        gallery: self.azure_gallery_name(version, variant),
                        definition: self.azure_image_offer(version),
                        version: azure_image_version(version, timestamp),
                    }),
                }
            }
            Provider::OpenStack | Provider::Stackit | Provider::Qemu => {
                let image = self.generic_image_name(version, variant, timestamp);
                ResourceNames {
                    staging: image.clone(),
                    snapshot: image.clone(),
                    image,
                    family: None,
                    gallery: None,
                }
            }
        }
    }

    /// AMI name.
    pub fn aws_image_name(&self, version: &Version, variant: &str, timestamp: DateTime<Utc>) -> String {
        if version.is_stable() {
            return format!("{}-{}-{}", self.prefix, version.version(), variant);
        }
        format!(
            "{}-{}-{}-{}-{}",
            self.prefix,
            version.stream(),
            version.version(),
            variant,
            compact_timestamp(timestamp)
        )
    }

    /// GCE image name: lowercase, `[a-z0-9-]`, at most 63 characters.
    pub fn gcp_image_name(&self, version: &Version, variant: &str, timestamp: DateTime<Utc>) -> String {
        let raw = if version.is_stable() {
            format!("{}-{}-{}", self.prefix, version.version(), variant)
        } else {
            format!(
                "{}-{}-{}-{}-{}",
                self.prefix,
                version.stream(),
                version.version(),
                variant,
                compact_timestamp(timestamp)
            )
        };
        shorten(&gcp_sanitize(&raw), &raw, GCP_NAME_MAX)
    }

    /// GCE image family: the prefix for stable releases, otherwise prefix and ref.
    pub fn gcp_image_family(&self, version: &Version) -> String {
        if version.is_stable() {
            return gcp_sanitize(&self.prefix);
        }
        let reference: String = version.reference().chars().take(GCP_FAMILY_REF_MAX).collect();
        gcp_sanitize(&format!("{}-{}", self.prefix, reference))
    }

    /// Temporary upload disk name, also used for the intermediate managed image.
    pub fn azure_disk_name(&self, version: &Version, variant: &str, timestamp: DateTime<Utc>) -> String {
        let raw = format!(
            "{}-{}-{}-{}-{}",
            self.prefix,
            version.stream(),
            version.version(),
            variant,
            compact_timestamp(timestamp)
        );
        shorten(&azure_sanitize(&raw), &raw, AZURE_NAME_MAX)
    }

    /// Shared image gallery, one per stream class and attestation variant.
    ///
    /// `azure-sev-snp` and `azure-tdx` get their own galleries; every other
    /// variant (trusted launch) lives in the unsuffixed one.
    pub fn azure_gallery_name(&self, version: &Version, variant: &str) -> String {
        if let Some(gallery) = &self.gallery_override {
            return gallery.clone();
        }
        let stream = match version.stream() {
            STABLE_STREAM => "",
            DEBUG_STREAM => "_Debug",
            _ => "_Testing",
        };
        let technology = match variant.to_lowercase().as_str() {
            "azure-tdx" => "_TDX",
            "azure-sev-snp" => "_CVM",
            _ => "",
        };
        format!("{}{}{}", capitalize(&self.prefix), stream, technology)
    }

    /// Image definition (offer) inside the gallery.
    pub fn azure_image_offer(&self, version: &Version) -> String {
        if version.is_stable() {
            return self.prefix.clone();
        }
        if version.stream() == DEBUG_STREAM && version.reference() == RELEASE_REF {
            return version.version().to_string();
        }
        format!("{}-{}", version.reference(), version.stream())
    }

    fn generic_image_name(&self, version: &Version, variant: &str, timestamp: DateTime<Utc>) -> String {
        format!(
            "{}-{}-{}-{}-{}",
            self.prefix,
            version.stream(),
            version.version(),
            variant,
            compact_timestamp(timestamp)
        )
    }
}

/// S3 staging object name.
pub fn aws_blob_name(version: &Version, variant: &str, timestamp: DateTime<Utc>) -> String {
    format!(
        "image-{}-{}-{}-{}.raw",
        version.stream(),
        version.version(),
        variant,
        timestamp.timestamp()
    )
}

/// Gallery image version: the release semver for stable and release debug
/// builds, otherwise `YYYY.MMDD.HHMMSS` from the timestamp.
pub fn azure_image_version(version: &Version, timestamp: DateTime<Utc>) -> String {
    if version.is_stable() || version.is_release_debug() {
        return version.version().trim_start_matches('v').to_string();
    }
    let ts = compact_timestamp(timestamp);
    format!("{}.{}.{}", &ts[..4], &ts[4..8], &ts[8..])
}

/// `YYYYMMDDHHMMSS` in UTC.
pub fn compact_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

fn gcp_sanitize(raw: &str) -> String {
    let mapped: String = raw
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '-' })
        .collect();
    mapped.trim_matches('-').to_string()
}

fn azure_sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Cut `name` to `max` characters, keeping it unique by appending a hash of the
/// unsanitized `raw` name.
fn shorten(name: &str, raw: &str, max: usize) -> String {
    if name.len() <= max {
        return name.to_string();
    }
    let digest = hex::encode(Sha256::digest(raw.as_bytes()));
    let keep = max - HASH_SUFFIX_LEN - 1;
    let head = name[..keep].trim_end_matches(['-', '.', '_']);
    format!("{}-{}", head, &digest[..HASH_SUFFIX_LEN])
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
