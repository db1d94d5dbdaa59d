//! Delegate adapter: hands the whole upload to the external `uplosi` tool.
//!
//! The tool reads `uplosi.conf` from its working directory, publishes the
//! image and prints one reference per line. AWS references are AMI ARNs.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cvm_image_core::error::{PublishError, Result};
use cvm_image_core::naming::azure_image_version;
use cvm_image_core::{
    ImageInfoEntry, NamingScheme, Provider, PublishConfig, UploadRequest, Version,
};
use tokio::process::Command;
use toml::value::Table;
use toml::Value;

use crate::adapter::{ImageHandle, ProviderAdapter, RunContext};

const CONFIG_TEMPLATE: &str = include_str!("uplosi.conf.in");
const CONFIG_FILE: &str = "uplosi.conf";

/// Publishes through an external upload tool.
pub struct DelegateAdapter {
    provider: Provider,
    binary: String,
    config: PublishConfig,
    naming: NamingScheme,
}

impl DelegateAdapter {
    pub fn new(provider: Provider, config: PublishConfig) -> Self {
        Self {
            provider,
            binary: config.delegate.binary.clone(),
            naming: config.naming(),
            config,
        }
    }

    /// Tool configuration for `request`.
    pub fn render_config(&self, request: &UploadRequest) -> Result<String> {
        let mut root: Value = CONFIG_TEMPLATE
            .parse()
            .map_err(|e| PublishError::Config(format!("invalid {CONFIG_FILE} template: {e}")))?;
        let root_table = as_table(&mut root, "template root")?;
        let base = table(root_table, "base")?;
        base.insert(
            "imageVersion".to_string(),
            Value::String(image_version(request.provider, &request.version, request.timestamp)),
        );
        base.insert(
            "provider".to_string(),
            Value::String(request.provider.tag().to_string()),
        );

        let version = &request.version;
        let variant = request.attestation_variant.as_str();
        let ts = request.timestamp;

        let aws_names = self.naming.names(Provider::Aws, version, variant, ts);
        let aws = table(base, "aws")?;
        set(aws, "region", &self.config.aws.region);
        set(aws, "bucket", &self.config.aws.bucket);
        set_list(aws, "replicationRegions", &self.config.aws.replication_regions);
        set(aws, "amiName", &aws_names.image);
        set(aws, "snapshotName", &aws_names.snapshot);
        set(aws, "blobName", &aws_names.staging);

        let azure_names = self.naming.names(Provider::Azure, version, variant, ts);
        let azure = table(base, "azure")?;
        set(azure, "subscriptionID", &self.config.azure.subscription);
        set(azure, "location", &self.config.azure.location);
        set(azure, "resourceGroup", &self.config.azure.resource_group);
        set(azure, "attestationVariant", variant);
        set(azure, "sku", self.naming.prefix());
        set(azure, "diskName", &azure_names.staging);
        set_list(
            azure,
            "replicationRegions",
            &self.config.azure.replication_regions_for(variant),
        );
        if let Some(gallery) = &azure_names.gallery {
            set(azure, "sharedImageGallery", &gallery.gallery);
            set(azure, "imageDefinitionName", &gallery.definition);
            set(azure, "offer", &gallery.definition);
        }

        let gcp_names = self.naming.names(Provider::Gcp, version, variant, ts);
        let gcp = table(base, "gcp")?;
        set(gcp, "project", &self.config.gcp.project);
        set(gcp, "location", &self.config.gcp.location);
        set(gcp, "bucket", &self.config.gcp.bucket);
        set(gcp, "imageName", &gcp_names.image);
        set(gcp, "blobName", &gcp_names.staging);
        if let Some(family) = &gcp_names.family {
            set(gcp, "imageFamily", family);
        }

        toml::to_string(&root)
            .map_err(|e| PublishError::Serialization(format!("rendering {CONFIG_FILE}: {e}")))
    }

    async fn run_tool(&self, workspace: &Path, image: &Path) -> Result<String> {
        let image = tokio::fs::canonicalize(image)
            .await
            .map_err(|source| PublishError::ReadFile {
                what: "raw image".to_string(),
                path: image.to_path_buf(),
                source,
            })?;
        tracing::info!(binary = %self.binary, image = %image.display(), "Running upload tool");

        let output = Command::new(&self.binary)
            .arg("upload")
            .arg(&image)
            .current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| PublishError::Tool(format!("failed to run {}: {e}", self.binary)))?;
        if !output.status.success() {
            return Err(PublishError::Tool(format!(
                "{} exited with {}",
                self.binary, output.status
            )));
        }
        String::from_utf8(output.stdout)
            .map_err(|e| PublishError::Tool(format!("{} printed invalid UTF-8: {e}", self.binary)))
    }
}

/// Image version handed to the tool: the clean semver, except for Azure
/// builds that are not releases, which use the timestamp form.
pub fn image_version(provider: Provider, version: &Version, timestamp: DateTime<Utc>) -> String {
    if provider == Provider::Azure {
        return azure_image_version(version, timestamp);
    }
    version.clean_semver().unwrap_or_default()
}

/// Split `arn:aws:ec2:<region>:<account>:image/<ami>` into region and AMI id.
pub fn parse_ami_arn(arn: &str) -> Result<(String, String)> {
    let invalid = |why: &str| PublishError::Tool(format!("invalid ARN ({why}) {arn:?}"));
    let parts: Vec<&str> = arn.split(':').collect();
    if parts.len() != 6 {
        return Err(invalid("expected 6 components"));
    }
    if parts[0] != "arn" {
        return Err(invalid("prefix mismatch"));
    }
    if parts[1] != "aws" {
        return Err(invalid("partition mismatch"));
    }
    if parts[2] != "ec2" {
        return Err(invalid("service mismatch"));
    }
    match parts[5].split_once('/') {
        Some(("image", ami)) if !ami.is_empty() && !ami.contains('/') => {
            Ok((parts[3].to_string(), ami.to_string()))
        }
        Some((_, _)) | None => Err(invalid("expected image/<id>")),
    }
}

/// One handle per non-empty output line.
pub fn parse_output(output: &str, provider: Provider) -> Result<Vec<ImageHandle>> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            if provider == Provider::Aws {
                let (region, ami) = parse_ami_arn(line)?;
                Ok(ImageHandle::regional(ami, region))
            } else {
                Ok(ImageHandle::global(line))
            }
        })
        .collect()
}

fn as_table<'a>(value: &'a mut Value, what: &str) -> Result<&'a mut Table> {
    value
        .as_table_mut()
        .ok_or_else(|| PublishError::Config(format!("{CONFIG_FILE} template: {what} is not a table")))
}

fn table<'a>(parent: &'a mut Table, key: &str) -> Result<&'a mut Table> {
    let value = parent
        .get_mut(key)
        .ok_or_else(|| PublishError::Config(format!("{CONFIG_FILE} template has no [{key}]")))?;
    as_table(value, key)
}

fn set(table: &mut Table, key: &str, value: &str) {
    table.insert(key.to_string(), Value::String(value.to_string()));
}

fn set_list(table: &mut Table, key: &str, values: &[String]) {
    let list = values.iter().cloned().map(Value::String).collect();
    table.insert(key.to_string(), Value::Array(list));
}

#[async_trait]
impl ProviderAdapter for DelegateAdapter {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn replication_regions(&self, _request: &UploadRequest) -> Vec<String> {
        Vec::new()
    }

    async fn ensure_container(&self, _ctx: &RunContext) -> Result<()> {
        Ok(())
    }

    async fn pre_clean(&self, _ctx: &RunContext) -> Result<()> {
        Ok(())
    }

    async fn stage(&self, _ctx: &RunContext) -> Result<()> {
        Ok(())
    }

    async fn convert(&self, ctx: &RunContext) -> Result<Vec<ImageHandle>> {
        let config = self.render_config(&ctx.request)?;
        let workspace = tempfile::Builder::new().prefix("uplosi-").tempdir()?;
        tokio::fs::write(workspace.path().join(CONFIG_FILE), config).await?;

        let output = self.run_tool(workspace.path(), ctx.request.image.path()).await?;
        let handles = parse_output(&output, self.provider)?;
        tracing::info!(images = handles.len(), "Upload tool finished");
        Ok(handles)
    }

    async fn replicate(
        &self,
        _ctx: &RunContext,
        _source: &ImageHandle,
        region: &str,
    ) -> Result<ImageHandle> {
        Err(PublishError::Tool(format!(
            "{} replicates on its own; cannot replicate to {region}",
            self.binary
        )))
    }

    async fn wait_available(&self, _ctx: &RunContext, _handle: &ImageHandle) -> Result<()> {
        Ok(())
    }

    async fn tag_and_publish(&self, ctx: &RunContext, handle: &ImageHandle) -> Result<ImageInfoEntry> {
        Ok(ImageInfoEntry::new(
            self.provider,
            ctx.request.attestation_variant.clone(),
            handle.id.clone(),
        )
        .in_region(handle.region.clone().unwrap_or_default()))
    }

    async fn cleanup_staging(&self, _ctx: &RunContext) -> Result<()> {
        Ok(())
    }
}
