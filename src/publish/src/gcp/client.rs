//! Google Cloud Storage and Compute Engine operations used by the GCP adapter.

use std::path::Path;

use async_trait::async_trait;
use cvm_image_core::error::Result;

/// Shielded VM initial UEFI state, DER certificates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShieldedState {
    pub pk: Vec<u8>,
    pub keks: Vec<Vec<u8>>,
    pub dbs: Vec<Vec<u8>>,
}

/// Compute Engine image to create from a staged tarball.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    pub name: String,
    pub description: String,
    pub family: Option<String>,
    /// `https://storage.googleapis.com/<bucket>/<object>`
    pub source_uri: String,
    pub guest_os_features: Vec<String>,
    pub shielded_state: Option<ShieldedState>,
}

/// Lifecycle state of a Compute Engine image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageStatus {
    Pending,
    Ready,
    Failed(String),
}

/// Cloud Storage calls.
#[async_trait]
pub trait GcsApi: Send + Sync {
    /// Create the bucket with public access prevention unless it exists.
    async fn ensure_bucket(&self, bucket: &str, location: &str) -> Result<()>;

    /// Upload a local file; returns the object's public URI.
    async fn upload_file(&self, bucket: &str, object: &str, path: &Path) -> Result<String>;

    /// Missing objects are not an error.
    async fn delete_object(&self, bucket: &str, object: &str) -> Result<()>;
}

/// Compute Engine image calls. Operations are waited for before returning.
#[async_trait]
pub trait GceApi: Send + Sync {
    /// Missing images are not an error.
    async fn delete_image(&self, name: &str) -> Result<()>;

    /// Returns the image self link.
    async fn create_image(&self, spec: &ImageSpec) -> Result<String>;

    /// `None` when the image does not exist.
    async fn image_status(&self, name: &str) -> Result<Option<ImageStatus>>;

    /// Grant `roles/compute.imageUser` to all authenticated users.
    async fn make_public(&self, name: &str) -> Result<()>;
}
