use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PublishError, Result};
use crate::naming::{NamingScheme, DEFAULT_PREFIX};

/// Publishing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Prefix of every resource name
    pub prefix: String,

    /// AWS settings
    pub aws: AwsConfig,

    /// Azure settings
    pub azure: AzureConfig,

    /// GCP settings
    pub gcp: GcpConfig,

    /// External upload tool settings
    pub delegate: DelegateConfig,

    /// Bounded waits
    pub wait: WaitConfig,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            aws: AwsConfig::default(),
            azure: AzureConfig::default(),
            gcp: GcpConfig::default(),
            delegate: DelegateConfig::default(),
            wait: WaitConfig::default(),
        }
    }
}

impl PublishConfig {
    /// Load configuration from a YAML file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PublishError::Config(format!("reading {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML.
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| PublishError::Config(format!("parsing configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make every run fail.
    pub fn validate(&self) -> Result<()> {
        if self.prefix.is_empty() {
            return Err(PublishError::Config("prefix must not be empty".to_string()));
        }
        if !self.prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(PublishError::Config(format!(
                "prefix {:?} may only contain ASCII letters, digits and '-'",
                self.prefix
            )));
        }
        if self.wait.image_available_timeout_secs == 0 {
            return Err(PublishError::Config(
                "wait.image_available_timeout_secs must be positive".to_string(),
            ));
        }
        if self.wait.snapshot_poll_interval_secs == 0 || self.wait.image_poll_interval_secs == 0 {
            return Err(PublishError::Config("poll intervals must be positive".to_string()));
        }
        if self.azure.polling_interval_secs == 0 {
            return Err(PublishError::Config(
                "azure.polling_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Naming scheme for this configuration.
    pub fn naming(&self) -> NamingScheme {
        NamingScheme::new(self.prefix.clone()).with_gallery_override(self.azure.gallery_override.clone())
    }
}

/// AWS configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    /// Home region: staging, snapshot import and the primary AMI
    pub region: String,

    /// S3 bucket used for staging
    pub bucket: String,

    /// Regions the primary AMI is copied to
    pub replication_regions: Vec<String>,

    /// EC2 preset dictionary for `UefiData`, required for secure boot
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uefi_dictionary: Option<PathBuf>,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: "eu-central-1".to_string(),
            bucket: "constellation-images".to_string(),
            replication_regions: vec![
                "eu-west-1".to_string(),
                "eu-west-3".to_string(),
                "us-east-2".to_string(),
                "ap-south-1".to_string(),
            ],
            uefi_dictionary: None,
        }
    }
}

/// Azure configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AzureConfig {
    /// Subscription ID
    pub subscription: String,

    /// Home location
    pub location: String,

    /// Resource group holding disks, images and galleries
    pub resource_group: String,

    /// Replication regions, overriding the per attestation variant defaults
    pub replication_regions: Option<Vec<String>>,

    /// Long running operation polling interval (seconds)
    pub polling_interval_secs: u64,

    /// Fixed gallery name instead of the derived one
    pub gallery_override: Option<String>,
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            subscription: String::new(),
            location: "northeurope".to_string(),
            resource_group: String::new(),
            replication_regions: None,
            polling_interval_secs: 10,
            gallery_override: None,
        }
    }
}

impl AzureConfig {
    /// Replication regions for an attestation variant.
    pub fn replication_regions_for(&self, attestation_variant: &str) -> Vec<String> {
        if let Some(regions) = &self.replication_regions {
            return regions.clone();
        }
        let regions: &[&str] = match attestation_variant.to_lowercase().as_str() {
            "azure-tdx" => &["northeurope", "westeurope", "centralus", "eastus2"],
            _ => &[
                "northeurope",
                "westeurope",
                "germanywestcentral",
                "eastus",
                "westus",
                "southeastasia",
            ],
        };
        regions.iter().map(|r| r.to_string()).collect()
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }
}

/// GCP configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcpConfig {
    /// Project ID
    pub project: String,

    /// Bucket location
    pub location: String,

    /// GCS bucket used for staging
    pub bucket: String,
}

impl Default for GcpConfig {
    fn default() -> Self {
        Self {
            project: String::new(),
            location: "europe-west3".to_string(),
            bucket: "constellation-images".to_string(),
        }
    }
}

/// External upload tool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegateConfig {
    /// Binary invoked with the rendered configuration
    pub binary: String,
}

impl Default for DelegateConfig {
    fn default() -> Self {
        Self {
            binary: "uplosi".to_string(),
        }
    }
}

/// Bounded wait configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    /// Upper bound for an image to become available (seconds)
    pub image_available_timeout_secs: u64,

    /// Snapshot import polling interval (seconds)
    pub snapshot_poll_interval_secs: u64,

    /// Image state polling interval (seconds)
    pub image_poll_interval_secs: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            image_available_timeout_secs: 1800,
            snapshot_poll_interval_secs: 15,
            image_poll_interval_secs: 15,
        }
    }
}

impl WaitConfig {
    pub fn image_available_timeout(&self) -> Duration {
        Duration::from_secs(self.image_available_timeout_secs)
    }

    pub fn snapshot_poll_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_poll_interval_secs)
    }

    pub fn image_poll_interval(&self) -> Duration {
        Duration::from_secs(self.image_poll_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = PublishConfig::default();
        assert_eq!(config.prefix, "cvm");
        assert_eq!(config.aws.region, "eu-central-1");
        assert_eq!(config.aws.replication_regions.len(), 4);
        assert_eq!(config.azure.polling_interval(), Duration::from_secs(10));
        assert_eq!(config.gcp.location, "europe-west3");
        assert_eq!(config.wait.image_available_timeout(), Duration::from_secs(1800));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = PublishConfig::from_yaml(
            r#"
prefix: constellation
aws:
  region: us-east-1
  uefi_dictionary: /etc/cvm-image/aws-uefivars-v0.dict
azure:
  subscription: sub-1
  resource_group: images
"#,
        )
        .unwrap();
        assert_eq!(config.prefix, "constellation");
        assert_eq!(config.aws.region, "us-east-1");
        assert_eq!(config.aws.bucket, "constellation-images");
        assert_eq!(
            config.aws.uefi_dictionary.as_deref(),
            Some(Path::new("/etc/cvm-image/aws-uefivars-v0.dict"))
        );
        assert_eq!(config.azure.subscription, "sub-1");
        assert_eq!(config.azure.location, "northeurope");
        assert_eq!(config.wait.snapshot_poll_interval_secs, 15);
    }

    #[test]
    fn test_empty_yaml_is_default() {
        assert_eq!(PublishConfig::from_yaml("  \n").unwrap(), PublishConfig::default());
    }

    #[test]
    fn test_invalid_yaml() {
        let err = PublishConfig::from_yaml("aws: [unclosed").unwrap_err();
        assert!(matches!(err, PublishError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_bad_prefix() {
        let err = PublishConfig::from_yaml("prefix: \"my prefix\"").unwrap_err();
        assert!(err.to_string().contains("prefix"));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let err = PublishConfig::from_yaml("wait:\n  image_poll_interval_secs: 0\n").unwrap_err();
        assert!(err.to_string().contains("poll intervals"));
    }

    #[test]
    fn test_from_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("publish.yaml");
        std::fs::write(&path, "gcp:\n  project: my-project\n").unwrap();
        let config = PublishConfig::from_file(&path).unwrap();
        assert_eq!(config.gcp.project, "my-project");
    }

    #[test]
    fn test_from_missing_file() {
        let err = PublishConfig::from_file(Path::new("/nonexistent/publish.yaml")).unwrap_err();
        assert!(matches!(err, PublishError::Config(_)));
    }

    #[test]
    fn test_azure_regions_per_variant() {
        let azure = AzureConfig::default();
        assert_eq!(
            azure.replication_regions_for("azure-tdx"),
            vec!["northeurope", "westeurope", "centralus", "eastus2"]
        );
        assert_eq!(azure.replication_regions_for("azure-sev-snp").len(), 6);

        let pinned = AzureConfig {
            replication_regions: Some(vec!["westus".to_string()]),
            ..AzureConfig::default()
        };
        assert_eq!(pinned.replication_regions_for("azure-tdx"), vec!["westus"]);
    }

    #[test]
    fn test_naming_uses_prefix_and_gallery_override() {
        let mut config = PublishConfig::default();
        config.prefix = "img".to_string();
        config.azure.gallery_override = Some("Pinned".to_string());
        let naming = config.naming();
        assert_eq!(naming.prefix(), "img");
        let version = crate::version::Version::from_short_path("v1.0.0").unwrap();
        assert_eq!(naming.azure_gallery_name(&version, "azure-sev-snp"), "Pinned");
    }
}
