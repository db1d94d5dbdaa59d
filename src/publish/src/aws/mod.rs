//! AWS adapter: S3 staging, snapshot import, AMI registration and copies.

mod client;
mod sdk;

pub use client::{Ami, AmiState, Ec2Api, ImportStatus, RegisterImage, S3Api};
pub use sdk::{SdkEc2, SdkS3};

use std::sync::Arc;

use async_trait::async_trait;
use cvm_image_core::error::{PublishError, Result};
use cvm_image_core::{
    AwsConfig, ImageInfoEntry, Provider, UefiDictionary, UploadRequest, WaitConfig,
};

use crate::adapter::{ImageHandle, ProviderAdapter, RunContext};
use crate::poll::{poll_until, PollConfig};

const PROVIDER: &str = "AWS";

/// Tag carrying the deterministic image name on AMIs and snapshots.
const NAME_TAG: &str = "Name";

/// Publishes AMIs in a home region and copies them to replica regions.
pub struct AwsAdapter {
    ec2: Arc<dyn Ec2Api>,
    s3: Arc<dyn S3Api>,
    config: AwsConfig,
    wait: WaitConfig,
    dictionary: Option<UefiDictionary>,
}

impl AwsAdapter {
    pub fn new(ec2: Arc<dyn Ec2Api>, s3: Arc<dyn S3Api>, config: AwsConfig, wait: WaitConfig) -> Self {
        Self {
            ec2,
            s3,
            config,
            wait,
            dictionary: None,
        }
    }

    /// Adapter backed by the AWS SDK, with credentials from the default chain.
    ///
    /// Loads the `UefiData` dictionary when `uefi_dictionary` is configured.
    pub async fn from_env(config: AwsConfig, wait: WaitConfig) -> Result<Self> {
        let dictionary = config
            .uefi_dictionary
            .as_deref()
            .map(UefiDictionary::from_file)
            .transpose()?;
        let s3 = SdkS3::new(&config.region).await;
        let adapter = Self::new(Arc::new(SdkEc2::new()), Arc::new(s3), config, wait);
        Ok(match dictionary {
            Some(dictionary) => adapter.with_uefi_dictionary(dictionary),
            None => adapter,
        })
    }

    /// Preset dictionary used to encode `UefiData` for secure boot images.
    pub fn with_uefi_dictionary(mut self, dictionary: UefiDictionary) -> Self {
        self.dictionary = Some(dictionary);
        self
    }

    fn uefi_dictionary(&self, request: &UploadRequest) -> Result<Option<&UefiDictionary>> {
        if !request.secure_boot {
            return Ok(None);
        }
        self.dictionary.as_ref().map(Some).ok_or_else(|| {
            PublishError::InvalidRequest(
                "secure boot on AWS requires the UefiData dictionary (aws.uefi_dictionary)".to_string(),
            )
        })
    }

    fn home(&self) -> &str {
        &self.config.region
    }

    fn all_regions(&self) -> Vec<&str> {
        std::iter::once(self.config.region.as_str())
            .chain(
                self.config
                    .replication_regions
                    .iter()
                    .map(String::as_str)
                    .filter(|r| *r != self.config.region),
            )
            .collect()
    }

    async fn delete_images(&self, region: &str, name: &str) -> Result<()> {
        for ami in self.ec2.find_images(region, name).await? {
            tracing::debug!(region = %region, ami = %ami.id, "Deregistering leftover image");
            self.ec2.deregister_image(region, &ami.id).await?;
            for snapshot in &ami.snapshot_ids {
                tracing::debug!(region = %region, snapshot = %snapshot, "Deleting backing snapshot");
                self.ec2.delete_snapshot(region, snapshot).await?;
            }
        }
        Ok(())
    }

    async fn import_snapshot(&self, ctx: &RunContext) -> Result<String> {
        let name = &ctx.names.snapshot;
        let task_id = self
            .ec2
            .import_snapshot(self.home(), &self.config.bucket, &ctx.names.staging, name)
            .await?;
        tracing::info!(task = %task_id, snapshot = %name, "Waiting for snapshot import");

        let config = PollConfig::new(
            self.wait.snapshot_poll_interval(),
            self.wait.image_available_timeout(),
        );
        let what = format!("snapshot import {task_id}");
        let (ec2, home, task) = (&self.ec2, self.home(), task_id.as_str());
        let snapshot_id = poll_until(&what, config, ctx.cancel_token(), move || async move {
            match ec2.import_snapshot_status(home, task).await? {
                ImportStatus::Active => Ok(None),
                ImportStatus::Completed { snapshot_id } => Ok(Some(snapshot_id)),
                ImportStatus::Failed(reason) => Err(PublishError::provider(
                    PROVIDER,
                    format!("importing snapshot {name}: {reason}"),
                )),
            }
        })
        .await?;

        // pre-clean finds snapshots by this tag
        self.ec2
            .tag_resources(self.home(), &[snapshot_id.clone()], NAME_TAG, name)
            .await?;
        Ok(snapshot_id)
    }

    async fn wait_for_image(&self, ctx: &RunContext, region: &str, image_id: &str) -> Result<Ami> {
        let config = PollConfig::new(
            self.wait.image_poll_interval(),
            self.wait.image_available_timeout(),
        );
        let what = format!("image {image_id} in {region}");
        let ec2 = &self.ec2;
        poll_until(&what, config, ctx.cancel_token(), move || async move {
            match ec2.describe_image(region, image_id).await? {
                Some(ami) if ami.state == AmiState::Available => Ok(Some(ami)),
                Some(Ami {
                    state: AmiState::Failed(reason),
                    ..
                }) => Err(PublishError::provider(
                    PROVIDER,
                    format!("image {image_id} in {region} failed: {reason}"),
                )),
                _ => Ok(None),
            }
        })
        .await
    }
}

fn handle_region(handle: &ImageHandle) -> Result<&str> {
    handle
        .region
        .as_deref()
        .ok_or_else(|| PublishError::Other(format!("AMI {} has no region", handle.id)))
}

#[async_trait]
impl ProviderAdapter for AwsAdapter {
    fn provider(&self) -> Provider {
        Provider::Aws
    }

    fn replication_regions(&self, _request: &UploadRequest) -> Vec<String> {
        self.config.replication_regions.clone()
    }

    async fn ensure_container(&self, ctx: &RunContext) -> Result<()> {
        // secure boot material is checked before anything is uploaded
        self.uefi_dictionary(&ctx.request)?;
        self.s3.ensure_bucket(&self.config.bucket).await
    }

    async fn pre_clean(&self, ctx: &RunContext) -> Result<()> {
        for region in self.all_regions() {
            self.delete_images(region, &ctx.names.image).await?;
        }
        for snapshot in self.ec2.find_snapshots(self.home(), &ctx.names.snapshot).await? {
            tracing::debug!(snapshot = %snapshot, "Deleting leftover snapshot");
            self.ec2.delete_snapshot(self.home(), &snapshot).await?;
        }
        self.s3
            .delete_object(&self.config.bucket, &ctx.names.staging)
            .await
    }

    async fn stage(&self, ctx: &RunContext) -> Result<()> {
        tracing::info!(
            bucket = %self.config.bucket,
            key = %ctx.names.staging,
            size = ctx.request.image.size(),
            "Uploading raw image"
        );
        self.s3
            .upload_object(&self.config.bucket, &ctx.names.staging, &ctx.request.image)
            .await
    }

    async fn convert(&self, ctx: &RunContext) -> Result<Vec<ImageHandle>> {
        let snapshot_id = self.import_snapshot(ctx).await?;

        let uefi_data = match self.uefi_dictionary(&ctx.request)? {
            Some(dictionary) => {
                let store = ctx.request.uefi_var_store.as_ref().ok_or_else(|| {
                    PublishError::InvalidRequest("secure boot requires a UEFI variable store".to_string())
                })?;
                Some(store.to_aws(dictionary)?)
            }
            None => None,
        };

        let registration = RegisterImage {
            name: ctx.names.image.clone(),
            description: format!("CVM image {}", ctx.request.version.short_path()),
            snapshot_id,
            uefi_data,
        };
        let ami = self.ec2.register_image(self.home(), &registration).await?;
        tracing::info!(ami = %ami, region = %self.home(), "Registered image");
        Ok(vec![ImageHandle::regional(ami, self.home())])
    }

    async fn replicate(
        &self,
        ctx: &RunContext,
        source: &ImageHandle,
        region: &str,
    ) -> Result<ImageHandle> {
        let source_region = handle_region(source)?;
        // CopyImage rejects sources that are still pending.
        self.wait_for_image(ctx, source_region, &source.id).await?;
        let ami = self
            .ec2
            .copy_image(region, source_region, &source.id, &ctx.names.image)
            .await?;
        tracing::info!(ami = %ami, region = %region, "Copied image");
        Ok(ImageHandle::regional(ami, region))
    }

    async fn wait_available(&self, ctx: &RunContext, handle: &ImageHandle) -> Result<()> {
        self.wait_for_image(ctx, handle_region(handle)?, &handle.id)
            .await
            .map(|_| ())
    }

    async fn tag_and_publish(&self, ctx: &RunContext, handle: &ImageHandle) -> Result<ImageInfoEntry> {
        let region = handle_region(handle)?;
        let ami = self
            .ec2
            .describe_image(region, &handle.id)
            .await?
            .ok_or_else(|| PublishError::NotFound(format!("image {} in {region}", handle.id)))?;

        let mut resources = vec![ami.id.clone()];
        resources.extend(ami.snapshot_ids.iter().cloned());
        self.ec2
            .tag_resources(region, &resources, NAME_TAG, &ctx.names.image)
            .await?;
        self.ec2.make_public(region, &ami.id).await?;
        tracing::info!(ami = %ami.id, region = %region, "Published image");

        Ok(
            ImageInfoEntry::new(Provider::Aws, ctx.request.attestation_variant.clone(), ami.id)
                .in_region(region),
        )
    }

    async fn cleanup_staging(&self, ctx: &RunContext) -> Result<()> {
        self.s3
            .delete_object(&self.config.bucket, &ctx.names.staging)
            .await
    }
}
