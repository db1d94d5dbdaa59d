//! Publication results.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::provider::Provider;
use crate::version::Version;

/// One published image reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageInfoEntry {
    pub csp: Provider,
    pub attestation_variant: String,
    /// AMI id, gallery image version id, GCE image link or archive URL.
    pub reference: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
}

impl ImageInfoEntry {
    pub fn new(
        csp: Provider,
        attestation_variant: impl Into<String>,
        reference: impl Into<String>,
    ) -> Self {
        Self {
            csp,
            attestation_variant: attestation_variant.into(),
            reference: reference.into(),
            region: String::new(),
        }
    }

    pub fn in_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }
}

/// All references published for one image version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    #[serde(rename = "ref")]
    pub reference: String,
    pub stream: String,
    pub version: String,
    pub list: Vec<ImageInfoEntry>,
}

impl ImageInfo {
    pub fn new(version: &Version, list: Vec<ImageInfoEntry>) -> Self {
        Self {
            reference: version.reference().to_string(),
            stream: version.stream().to_string(),
            version: version.version().to_string(),
            list,
        }
    }

    /// Pretty JSON document.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
