//! Upload request model.

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};

use crate::error::{PublishError, Result};
use crate::provider::Provider;
use crate::secureboot::{Database, UefiVarStore};
use crate::version::Version;

/// Environment variable carrying the reproducible-build timestamp (seconds since epoch).
pub const SOURCE_DATE_EPOCH: &str = "SOURCE_DATE_EPOCH";

/// Raw disk image on the local filesystem.
///
/// Adapters open it themselves: SDK-backed adapters stream byte ranges out of
/// it, the delegate adapter hands the path to an external tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSource {
    path: PathBuf,
    size: u64,
}

impl ImageSource {
    /// Describe an image at `path`, reading its size from the filesystem.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let metadata = std::fs::metadata(&path).map_err(|source| PublishError::ReadFile {
            what: "raw image".to_string(),
            path: path.clone(),
            source,
        })?;
        if !metadata.is_file() {
            return Err(PublishError::InvalidRequest(format!(
                "raw image {} is not a regular file",
                path.display()
            )));
        }
        Ok(Self {
            path,
            size: metadata.len(),
        })
    }

    /// Describe an image with an already known size.
    pub fn with_size(path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Declared size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Open the image for reading.
    pub fn open(&self) -> Result<std::fs::File> {
        std::fs::File::open(&self.path).map_err(|source| PublishError::ReadFile {
            what: "raw image".to_string(),
            path: self.path.clone(),
            source,
        })
    }
}

/// Everything a provider adapter needs to publish one image.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub provider: Provider,
    pub version: Version,
    pub attestation_variant: String,
    pub secure_boot: bool,
    pub image: ImageSource,
    pub timestamp: DateTime<Utc>,
    pub sb_database: Option<Database>,
    pub uefi_var_store: Option<UefiVarStore>,
}

impl UploadRequest {
    /// Create a request without secure boot, stamped with the current time.
    ///
    /// Callers honouring `SOURCE_DATE_EPOCH` pass [`default_timestamp`] to
    /// [`UploadRequest::with_timestamp`].
    pub fn new(
        provider: Provider,
        version: Version,
        attestation_variant: impl Into<String>,
        image: ImageSource,
    ) -> Self {
        Self {
            provider,
            version,
            attestation_variant: attestation_variant.into(),
            secure_boot: false,
            image,
            timestamp: Utc::now(),
            sb_database: None,
            uefi_var_store: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Enable secure boot with the given certificate database and variable store.
    pub fn with_secure_boot(mut self, database: Database, var_store: UefiVarStore) -> Self {
        self.secure_boot = true;
        self.sb_database = Some(database);
        self.uefi_var_store = Some(var_store);
        self
    }

    /// Check the request before any cloud call is made.
    pub fn validate(&self) -> Result<()> {
        if self.attestation_variant.trim().is_empty() {
            return Err(PublishError::InvalidRequest(
                "attestation variant is empty".to_string(),
            ));
        }
        if self.secure_boot {
            if self.sb_database.is_none() {
                return Err(PublishError::InvalidRequest(
                    "secure boot is enabled but no secure boot database is set".to_string(),
                ));
            }
            if self.uefi_var_store.is_none() {
                return Err(PublishError::InvalidRequest(
                    "secure boot is enabled but no UEFI variable store is set".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Timestamp from `SOURCE_DATE_EPOCH` when set, otherwise now.
///
/// A set but unparsable value is rejected, never replaced by the clock.
pub fn default_timestamp() -> Result<DateTime<Utc>> {
    match std::env::var(SOURCE_DATE_EPOCH) {
        Ok(raw) => timestamp_or_now(Some(&raw)),
        Err(std::env::VarError::NotPresent) => timestamp_or_now(None),
        Err(e) => Err(PublishError::InvalidRequest(format!(
            "invalid {SOURCE_DATE_EPOCH}: {e}"
        ))),
    }
}

fn timestamp_or_now(source_date_epoch: Option<&str>) -> Result<DateTime<Utc>> {
    match source_date_epoch {
        None => Ok(Utc::now()),
        Some(raw) => timestamp_from_epoch(raw).ok_or_else(|| {
            PublishError::InvalidRequest(format!(
                "invalid {SOURCE_DATE_EPOCH} {raw:?}: expected seconds since the epoch"
            ))
        }),
    }
}

/// Parse a decimal seconds-since-epoch string.
pub fn timestamp_from_epoch(raw: &str) -> Option<DateTime<Utc>> {
    let secs: i64 = raw.trim().parse().ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request() -> UploadRequest {
        UploadRequest::new(
            Provider::Aws,
            Version::from_short_path("v2.16.0").unwrap(),
            "aws-sev-snp",
            ImageSource::with_size("/tmp/image.raw", 1024),
        )
    }

    #[test]
    fn test_image_source_from_path_reads_size() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("image.raw");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();
        let image = ImageSource::from_path(&path).unwrap();
        assert_eq!(image.size(), 4096);
        assert_eq!(image.path(), path.as_path());
    }

    #[test]
    fn test_image_source_missing_file() {
        let err = ImageSource::from_path("/nonexistent/image.raw").unwrap_err();
        assert!(matches!(err, PublishError::ReadFile { .. }));
    }

    #[test]
    fn test_image_source_rejects_directory() {
        let tmp = TempDir::new().unwrap();
        let err = ImageSource::from_path(tmp.path()).unwrap_err();
        assert!(matches!(err, PublishError::InvalidRequest(_)));
    }

    #[test]
    fn test_validate_plain_request() {
        assert!(request().validate().is_ok());
    }

    #[test]
    fn test_validate_secure_boot_without_material() {
        let mut req = request();
        req.secure_boot = true;
        let err = req.validate().unwrap_err();
        assert!(err.to_string().contains("secure boot database"));

        req.sb_database = Some(Database::default());
        let err = req.validate().unwrap_err();
        assert!(err.to_string().contains("UEFI variable store"));
    }

    #[test]
    fn test_validate_secure_boot_with_material() {
        let req = request().with_secure_boot(Database::default(), UefiVarStore::default());
        assert!(req.secure_boot);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_validate_empty_variant() {
        let mut req = request();
        req.attestation_variant = " ".to_string();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_timestamp_from_epoch() {
        let ts = timestamp_from_epoch("1700000000").unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert!(timestamp_from_epoch("yesterday").is_none());
    }

    #[test]
    fn test_invalid_source_date_epoch_is_rejected() {
        let err = timestamp_or_now(Some("yesterday")).unwrap_err();
        assert!(matches!(err, PublishError::InvalidRequest(_)));
        assert!(err.to_string().contains("SOURCE_DATE_EPOCH"));
    }

    #[test]
    fn test_source_date_epoch_is_used_when_set() {
        let ts = timestamp_or_now(Some(" 1700000000\n")).unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert!(timestamp_or_now(None).is_ok());
    }
}
