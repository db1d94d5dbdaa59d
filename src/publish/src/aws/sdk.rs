//! [`Ec2Api`] and [`S3Api`] on top of the AWS SDK.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_ec2::types::{
    ArchitectureValues, BlockDeviceMapping, BootModeValues, ClientData, EbsBlockDevice, Filter,
    Image, ImageState, LaunchPermission, LaunchPermissionModifications, PermissionGroup,
    SnapshotDiskContainer, Tag, TpmSupportValues, UserBucket,
};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration,
};
use cvm_image_core::error::{PublishError, Result};
use cvm_image_core::ImageSource;
use dashmap::DashMap;

use crate::chunk::read_chunk;

use super::client::{Ami, AmiState, Ec2Api, ImportStatus, RegisterImage, S3Api};

const ROOT_DEVICE: &str = "/dev/xvda";

/// Smallest multipart chunk; raised for images that would exceed the part limit.
const MIN_PART_SIZE: u64 = 64 * 1024 * 1024;
const MAX_PARTS: u64 = 10_000;

async fn load_config(region: &str) -> SdkConfig {
    aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .load()
        .await
}

fn sdk_error<E>(what: impl std::fmt::Display, err: E) -> PublishError
where
    E: std::error::Error + 'static,
{
    PublishError::provider("AWS", format!("{what}: {}", DisplayErrorContext(err)))
}

/// EC2 client per region, created on first use.
#[derive(Default)]
pub struct SdkEc2 {
    clients: DashMap<String, aws_sdk_ec2::Client>,
}

impl SdkEc2 {
    pub fn new() -> Self {
        Self::default()
    }

    async fn client(&self, region: &str) -> aws_sdk_ec2::Client {
        if let Some(client) = self.clients.get(region) {
            return client.clone();
        }
        let client = aws_sdk_ec2::Client::new(&load_config(region).await);
        self.clients
            .entry(region.to_string())
            .or_insert(client)
            .clone()
    }
}

fn to_ami(image: &Image) -> Option<Ami> {
    let id = image.image_id()?.to_string();
    let state = match image.state() {
        Some(ImageState::Available) => AmiState::Available,
        Some(ImageState::Pending) | Some(ImageState::Transient) | None => AmiState::Pending,
        Some(other) => AmiState::Failed(format!(
            "{} ({})",
            other.as_str(),
            image
                .state_reason()
                .and_then(|r| r.message())
                .unwrap_or("no reason given")
        )),
    };
    let snapshot_ids = image
        .block_device_mappings()
        .iter()
        .filter_map(|m| m.ebs().and_then(|ebs| ebs.snapshot_id()))
        .map(str::to_string)
        .collect();
    Some(Ami {
        id,
        state,
        snapshot_ids,
    })
}

#[async_trait]
impl Ec2Api for SdkEc2 {
    async fn find_images(&self, region: &str, name: &str) -> Result<Vec<Ami>> {
        let output = self
            .client(region)
            .await
            .describe_images()
            .owners("self")
            .filters(Filter::builder().name("name").values(name).build())
            .send()
            .await
            .map_err(|e| sdk_error(format!("describing images named {name} in {region}"), e))?;
        Ok(output.images().iter().filter_map(to_ami).collect())
    }

    async fn describe_image(&self, region: &str, image_id: &str) -> Result<Option<Ami>> {
        let result = self
            .client(region)
            .await
            .describe_images()
            .image_ids(image_id)
            .send()
            .await;
        match result {
            Ok(output) => Ok(output.images().first().and_then(to_ami)),
            Err(e)
                if e.as_service_error().and_then(|se| se.code()) == Some("InvalidAMIID.NotFound") =>
            {
                Ok(None)
            }
            Err(e) => Err(sdk_error(format!("describing image {image_id} in {region}"), e)),
        }
    }

    async fn deregister_image(&self, region: &str, image_id: &str) -> Result<()> {
        self.client(region)
            .await
            .deregister_image()
            .image_id(image_id)
            .send()
            .await
            .map_err(|e| sdk_error(format!("deregistering image {image_id} in {region}"), e))?;
        Ok(())
    }

    async fn find_snapshots(&self, region: &str, name: &str) -> Result<Vec<String>> {
        let output = self
            .client(region)
            .await
            .describe_snapshots()
            .owner_ids("self")
            .filters(Filter::builder().name("tag:Name").values(name).build())
            .send()
            .await
            .map_err(|e| sdk_error(format!("describing snapshots named {name} in {region}"), e))?;
        Ok(output
            .snapshots()
            .iter()
            .filter_map(|s| s.snapshot_id())
            .map(str::to_string)
            .collect())
    }

    async fn delete_snapshot(&self, region: &str, snapshot_id: &str) -> Result<()> {
        self.client(region)
            .await
            .delete_snapshot()
            .snapshot_id(snapshot_id)
            .send()
            .await
            .map_err(|e| sdk_error(format!("deleting snapshot {snapshot_id} in {region}"), e))?;
        Ok(())
    }

    async fn import_snapshot(
        &self,
        region: &str,
        bucket: &str,
        key: &str,
        description: &str,
    ) -> Result<String> {
        let output = self
            .client(region)
            .await
            .import_snapshot()
            .description(description)
            .client_data(ClientData::builder().comment(description).build())
            .disk_container(
                SnapshotDiskContainer::builder()
                    .description(description)
                    .format("raw")
                    .user_bucket(UserBucket::builder().s3_bucket(bucket).s3_key(key).build())
                    .build(),
            )
            .send()
            .await
            .map_err(|e| sdk_error(format!("importing s3://{bucket}/{key} as snapshot"), e))?;
        output
            .import_task_id()
            .map(str::to_string)
            .ok_or_else(|| PublishError::provider("AWS", "importing snapshot: no import task ID returned"))
    }

    async fn import_snapshot_status(&self, region: &str, task_id: &str) -> Result<ImportStatus> {
        let output = self
            .client(region)
            .await
            .describe_import_snapshot_tasks()
            .import_task_ids(task_id)
            .send()
            .await
            .map_err(|e| sdk_error(format!("describing import task {task_id}"), e))?;
        let detail = output
            .import_snapshot_tasks()
            .first()
            .and_then(|t| t.snapshot_task_detail())
            .ok_or_else(|| {
                PublishError::provider("AWS", format!("import task {task_id} has no snapshot details"))
            })?;
        match detail.status() {
            Some("completed") => detail
                .snapshot_id()
                .map(|id| ImportStatus::Completed {
                    snapshot_id: id.to_string(),
                })
                .ok_or_else(|| {
                    PublishError::provider("AWS", format!("import task {task_id} completed without a snapshot"))
                }),
            Some("error") => Ok(ImportStatus::Failed(
                detail.status_message().unwrap_or("task failed").to_string(),
            )),
            Some(_) => Ok(ImportStatus::Active),
            None => Err(PublishError::provider(
                "AWS",
                format!("import task {task_id} has no status"),
            )),
        }
    }

    async fn register_image(&self, region: &str, image: &RegisterImage) -> Result<String> {
        let output = self
            .client(region)
            .await
            .register_image()
            .name(&image.name)
            .description(&image.description)
            .architecture(ArchitectureValues::X8664)
            .block_device_mappings(
                BlockDeviceMapping::builder()
                    .device_name(ROOT_DEVICE)
                    .ebs(
                        EbsBlockDevice::builder()
                            .delete_on_termination(true)
                            .snapshot_id(&image.snapshot_id)
                            .build(),
                    )
                    .build(),
            )
            .boot_mode(BootModeValues::Uefi)
            .ena_support(true)
            .root_device_name(ROOT_DEVICE)
            .tpm_support(TpmSupportValues::V20)
            .set_uefi_data(image.uefi_data.clone())
            .virtualization_type("hvm")
            .send()
            .await
            .map_err(|e| sdk_error(format!("registering image {}", image.name), e))?;
        output
            .image_id()
            .map(str::to_string)
            .ok_or_else(|| PublishError::provider("AWS", "registering image: no image ID returned"))
    }

    async fn copy_image(
        &self,
        region: &str,
        source_region: &str,
        source_image_id: &str,
        name: &str,
    ) -> Result<String> {
        let output = self
            .client(region)
            .await
            .copy_image()
            .name(name)
            .source_image_id(source_image_id)
            .source_region(source_region)
            .send()
            .await
            .map_err(|e| sdk_error(format!("copying image {source_image_id} to {region}"), e))?;
        output
            .image_id()
            .map(str::to_string)
            .ok_or_else(|| PublishError::provider("AWS", "copying image: no image ID returned"))
    }

    async fn tag_resources(
        &self,
        region: &str,
        resource_ids: &[String],
        key: &str,
        value: &str,
    ) -> Result<()> {
        self.client(region)
            .await
            .create_tags()
            .set_resources(Some(resource_ids.to_vec()))
            .tags(Tag::builder().key(key).value(value).build())
            .send()
            .await
            .map_err(|e| sdk_error(format!("tagging {resource_ids:?} in {region}"), e))?;
        Ok(())
    }

    async fn make_public(&self, region: &str, image_id: &str) -> Result<()> {
        self.client(region)
            .await
            .modify_image_attribute()
            .image_id(image_id)
            .launch_permission(
                LaunchPermissionModifications::builder()
                    .add(LaunchPermission::builder().group(PermissionGroup::All).build())
                    .build(),
            )
            .send()
            .await
            .map_err(|e| sdk_error(format!("publishing image {image_id} in {region}"), e))?;
        Ok(())
    }
}

/// S3 client bound to the home region.
pub struct SdkS3 {
    client: aws_sdk_s3::Client,
    region: String,
}

impl SdkS3 {
    pub async fn new(region: &str) -> Self {
        Self {
            client: aws_sdk_s3::Client::new(&load_config(region).await),
            region: region.to_string(),
        }
    }

    async fn upload_parts(
        &self,
        file: &mut tokio::fs::File,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_size: u64,
    ) -> Result<Vec<CompletedPart>> {
        let mut parts = Vec::new();
        let mut part_number = 1;
        loop {
            let chunk = read_chunk(file, part_size as usize).await?;
            let last = (chunk.len() as u64) < part_size;
            if chunk.is_empty() && !parts.is_empty() {
                break;
            }
            let output = self
                .client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(|e| sdk_error(format!("uploading part {part_number} of {key}"), e))?;
            tracing::debug!(key = %key, part = part_number, "Uploaded part");
            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(output.e_tag().map(str::to_string))
                    .build(),
            );
            if last {
                break;
            }
            part_number += 1;
        }
        Ok(parts)
    }
}

/// Multipart chunk size for an object of `size` bytes.
fn part_size(size: u64) -> u64 {
    MIN_PART_SIZE.max(size.div_ceil(MAX_PARTS))
}

#[async_trait]
impl S3Api for SdkS3 {
    async fn ensure_bucket(&self, bucket: &str) -> Result<()> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => return Ok(()),
            Err(e) if e.as_service_error().map(|se| se.is_not_found()).unwrap_or(false) => {}
            Err(e) => return Err(sdk_error(format!("checking bucket {bucket}"), e)),
        }

        tracing::info!(bucket = %bucket, region = %self.region, "Creating bucket");
        let mut request = self.client.create_bucket().bucket(bucket);
        // us-east-1 is the implicit default and rejects an explicit constraint.
        if self.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }
        request
            .send()
            .await
            .map_err(|e| sdk_error(format!("creating bucket {bucket}"), e))?;
        Ok(())
    }

    async fn upload_object(&self, bucket: &str, key: &str, image: &ImageSource) -> Result<()> {
        let mut file = tokio::fs::File::open(image.path())
            .await
            .map_err(|source| PublishError::ReadFile {
                what: "raw image".to_string(),
                path: image.path().to_path_buf(),
                source,
            })?;

        let upload = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_error(format!("starting upload of {key}"), e))?;
        let upload_id = upload
            .upload_id()
            .ok_or_else(|| PublishError::provider("AWS", format!("starting upload of {key}: no upload ID")))?
            .to_string();

        let parts = match self
            .upload_parts(&mut file, bucket, key, &upload_id, part_size(image.size()))
            .await
        {
            Ok(parts) => parts,
            Err(e) => {
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    tracing::warn!(key = %key, error = %DisplayErrorContext(abort), "Failed to abort upload");
                }
                return Err(e);
            }
        };

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| sdk_error(format!("completing upload of {key}"), e))?;
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        tracing::debug!(bucket = %bucket, key = %key, "Deleting object");
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_error(format!("deleting s3://{bucket}/{key}"), e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_size() {
        assert_eq!(part_size(0), MIN_PART_SIZE);
        assert_eq!(part_size(10 * 1024 * 1024 * 1024), MIN_PART_SIZE);
        let huge = 2 * MIN_PART_SIZE * MAX_PARTS;
        assert_eq!(part_size(huge), 2 * MIN_PART_SIZE);
    }

    #[test]
    fn test_to_ami_maps_state_and_snapshots() {
        let image = Image::builder()
            .image_id("ami-1")
            .state(ImageState::Failed)
            .state_reason(
                aws_sdk_ec2::types::StateReason::builder()
                    .message("snapshot unusable")
                    .build(),
            )
            .block_device_mappings(
                BlockDeviceMapping::builder()
                    .ebs(EbsBlockDevice::builder().snapshot_id("snap-1").build())
                    .build(),
            )
            .build();
        let ami = to_ami(&image).unwrap();
        assert_eq!(ami.id, "ami-1");
        assert_eq!(ami.snapshot_ids, vec!["snap-1".to_string()]);
        assert_eq!(ami.state, AmiState::Failed("failed (snapshot unusable)".to_string()));
    }
}
