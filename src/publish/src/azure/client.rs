//! Azure compute operations used by the Azure adapter.

use async_trait::async_trait;
use cvm_image_core::error::Result;

/// Shared image gallery image definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDefinition {
    pub gallery: String,
    pub name: String,
    pub location: String,
    pub publisher: String,
    pub offer: String,
    pub sku: String,
    /// `SecurityType` feature value, if the image needs one.
    pub security_type: Option<String>,
}

/// Gallery image version created from a managed image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageVersion {
    pub gallery: String,
    pub definition: String,
    pub version: String,
    pub location: String,
    pub source_image_id: String,
    pub target_regions: Vec<String>,
}

/// Replication state of an image version in one region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationState {
    Replicating,
    Completed,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionReplication {
    /// Region name, normalized to the `northeurope` form.
    pub region: String,
    pub state: ReplicationState,
}

/// Azure Resource Manager calls scoped to one subscription and resource group.
///
/// Deletes and revokes of missing resources succeed.
#[async_trait]
pub trait AzureApi: Send + Sync {
    async fn ensure_gallery(&self, gallery: &str, location: &str) -> Result<()>;

    async fn ensure_image_definition(&self, definition: &ImageDefinition) -> Result<()>;

    async fn delete_image_version(&self, gallery: &str, definition: &str, version: &str) -> Result<()>;

    async fn delete_managed_image(&self, name: &str) -> Result<()>;

    async fn delete_disk(&self, name: &str) -> Result<()>;

    /// Create an empty disk in the upload state; returns its resource id.
    async fn create_upload_disk(&self, name: &str, location: &str, size_bytes: u64) -> Result<String>;

    /// Grant temporary write access; returns the SAS URL.
    async fn grant_write_access(&self, disk: &str) -> Result<String>;

    async fn revoke_access(&self, disk: &str) -> Result<()>;

    /// Write `data` at `offset` into the page blob behind `sas_url`.
    async fn upload_page(&self, sas_url: &str, offset: u64, data: Vec<u8>) -> Result<()>;

    /// Create a generalized managed image from the named disk; returns the image id.
    async fn create_managed_image(&self, name: &str, location: &str, disk: &str) -> Result<String>;

    /// Returns the image version id.
    async fn create_image_version(&self, version: &ImageVersion) -> Result<String>;

    async fn target_regions(&self, gallery: &str, definition: &str, version: &str) -> Result<Vec<String>>;

    async fn set_target_regions(
        &self,
        gallery: &str,
        definition: &str,
        version: &str,
        regions: &[String],
    ) -> Result<()>;

    async fn replication_status(
        &self,
        gallery: &str,
        definition: &str,
        version: &str,
    ) -> Result<Vec<RegionReplication>>;

    /// Public name of the gallery when community sharing is enabled.
    async fn community_gallery_name(&self, gallery: &str) -> Result<Option<String>>;

    /// Unique id of an image version in a community gallery.
    async fn community_image_version_id(
        &self,
        location: &str,
        public_gallery: &str,
        definition: &str,
        version: &str,
    ) -> Result<String>;
}

/// `North Europe` and `northeurope` name the same region.
pub fn normalize_region(region: &str) -> String {
    region
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
}
