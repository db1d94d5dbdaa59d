//! EC2 and S3 operations used by the AWS adapter.
//!
//! The traits speak in domain types so the adapter can be exercised against
//! in-memory fakes; [`super::sdk`] implements them on top of the AWS SDK.

use async_trait::async_trait;
use cvm_image_core::error::Result;
use cvm_image_core::ImageSource;

/// State of an AMI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmiState {
    Pending,
    Available,
    /// Terminal failure, with the state reason reported by EC2.
    Failed(String),
}

/// An AMI as seen by the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ami {
    pub id: String,
    pub state: AmiState,
    /// EBS snapshots backing the image.
    pub snapshot_ids: Vec<String>,
}

/// Progress of a snapshot import task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportStatus {
    Active,
    Completed { snapshot_id: String },
    Failed(String),
}

/// Parameters of an AMI registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterImage {
    pub name: String,
    pub description: String,
    pub snapshot_id: String,
    /// Base64 AWS UEFI variable store, set when secure boot is enabled.
    pub uefi_data: Option<String>,
}

/// EC2 calls, each addressed to an explicit region.
#[async_trait]
pub trait Ec2Api: Send + Sync {
    /// Images owned by this account with the given name.
    async fn find_images(&self, region: &str, name: &str) -> Result<Vec<Ami>>;

    /// Look up an image by id; `None` when EC2 does not know it (yet).
    async fn describe_image(&self, region: &str, image_id: &str) -> Result<Option<Ami>>;

    async fn deregister_image(&self, region: &str, image_id: &str) -> Result<()>;

    /// Snapshots owned by this account whose `Name` tag equals `name`.
    async fn find_snapshots(&self, region: &str, name: &str) -> Result<Vec<String>>;

    async fn delete_snapshot(&self, region: &str, snapshot_id: &str) -> Result<()>;

    /// Start importing an S3 object as an EBS snapshot; returns the task id.
    async fn import_snapshot(
        &self,
        region: &str,
        bucket: &str,
        key: &str,
        description: &str,
    ) -> Result<String>;

    async fn import_snapshot_status(&self, region: &str, task_id: &str) -> Result<ImportStatus>;

    /// Register a UEFI boot AMI from a snapshot; returns the AMI id.
    async fn register_image(&self, region: &str, image: &RegisterImage) -> Result<String>;

    /// Copy an AMI into `region`; returns the new AMI id.
    async fn copy_image(
        &self,
        region: &str,
        source_region: &str,
        source_image_id: &str,
        name: &str,
    ) -> Result<String>;

    async fn tag_resources(
        &self,
        region: &str,
        resource_ids: &[String],
        key: &str,
        value: &str,
    ) -> Result<()>;

    /// Grant launch permission to all accounts.
    async fn make_public(&self, region: &str, image_id: &str) -> Result<()>;
}

/// S3 calls against the home region.
#[async_trait]
pub trait S3Api: Send + Sync {
    /// Create the bucket unless it exists.
    async fn ensure_bucket(&self, bucket: &str) -> Result<()>;

    /// Upload a raw image as one object.
    async fn upload_object(&self, bucket: &str, key: &str, image: &ImageSource) -> Result<()>;

    /// Delete an object. Deleting a missing object succeeds.
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;
}
