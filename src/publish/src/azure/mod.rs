//! Azure adapter: upload disk, managed image and shared image gallery versions.

mod arm;
mod client;

pub use arm::ArmClient;
pub use client::{
    normalize_region, AzureApi, ImageDefinition, ImageVersion, RegionReplication, ReplicationState,
};

use std::sync::Arc;

use async_trait::async_trait;
use cvm_image_core::error::{PublishError, Result};
use cvm_image_core::{AzureConfig, GalleryNames, ImageInfoEntry, Provider, UploadRequest, WaitConfig};

use crate::adapter::{ImageHandle, ProviderAdapter, RunContext};
use crate::auth::TokenSource;
use crate::chunk::read_chunk;
use crate::poll::{poll_until, PollConfig};

const PROVIDER: &str = "Azure";

/// Publisher of every image definition.
pub const IMAGE_PUBLISHER: &str = "edgelesssys";

/// Page blob writes are at most 4 MiB and 512 byte aligned.
const PAGE_SIZE_MAX: usize = 4 * 1024 * 1024;
const PAGE_ALIGNMENT: u64 = 512;

/// `SecurityType` feature of the image definition for an attestation variant.
pub fn security_type(attestation_variant: &str) -> Option<&'static str> {
    match attestation_variant.to_lowercase().as_str() {
        "azure-sev-snp" | "azure-tdx" => Some("ConfidentialVMSupported"),
        "azure-trustedlaunch" => Some("TrustedLaunch"),
        _ => None,
    }
}

/// Publishes gallery image versions and replicates them by extending their target regions.
pub struct AzureAdapter {
    api: Arc<dyn AzureApi>,
    config: AzureConfig,
    wait: WaitConfig,
    sku: String,
}

impl AzureAdapter {
    pub fn new(api: Arc<dyn AzureApi>, config: AzureConfig, wait: WaitConfig, sku: impl Into<String>) -> Self {
        Self {
            api,
            config,
            wait,
            sku: sku.into(),
        }
    }

    /// Adapter talking to Resource Manager with the given token source.
    pub fn with_tokens(
        tokens: Arc<dyn TokenSource>,
        config: AzureConfig,
        wait: WaitConfig,
        sku: impl Into<String>,
    ) -> Self {
        let arm = ArmClient::new(
            tokens,
            config.subscription.clone(),
            config.resource_group.clone(),
            config.polling_interval(),
        );
        Self::new(Arc::new(arm), config, wait, sku)
    }

    fn location(&self) -> &str {
        &self.config.location
    }

    fn gallery<'a>(&self, ctx: &'a RunContext) -> Result<&'a GalleryNames> {
        ctx.names
            .gallery
            .as_ref()
            .ok_or_else(|| PublishError::Config("no gallery names for an Azure run".to_string()))
    }

    async fn upload_pages(&self, ctx: &RunContext, sas_url: &str) -> Result<()> {
        let image = &ctx.request.image;
        let mut file = tokio::fs::File::open(image.path())
            .await
            .map_err(|source| PublishError::ReadFile {
                what: "raw image".to_string(),
                path: image.path().to_path_buf(),
                source,
            })?;

        let mut offset = 0u64;
        let mut written = 0u64;
        loop {
            let page = read_chunk(&mut file, PAGE_SIZE_MAX).await?;
            if page.is_empty() {
                break;
            }
            let len = page.len() as u64;
            // Fresh upload disks read as zeros.
            if page.iter().any(|b| *b != 0) {
                self.api.upload_page(sas_url, offset, page).await?;
                written += len;
            }
            offset += len;
        }
        tracing::debug!(bytes = offset, written, "Uploaded disk pages");
        Ok(())
    }

    async fn remove_disk(&self, disk: &str) -> Result<()> {
        self.api.revoke_access(disk).await?;
        self.api.delete_disk(disk).await
    }
}

fn handle_region(handle: &ImageHandle) -> Result<&str> {
    handle
        .region
        .as_deref()
        .ok_or_else(|| PublishError::Other(format!("image version {} has no region", handle.id)))
}

#[async_trait]
impl ProviderAdapter for AzureAdapter {
    fn provider(&self) -> Provider {
        Provider::Azure
    }

    fn replication_regions(&self, request: &UploadRequest) -> Vec<String> {
        self.config.replication_regions_for(&request.attestation_variant)
    }

    async fn ensure_container(&self, ctx: &RunContext) -> Result<()> {
        let gallery = self.gallery(ctx)?;
        self.api.ensure_gallery(&gallery.gallery, self.location()).await
    }

    async fn pre_clean(&self, ctx: &RunContext) -> Result<()> {
        let gallery = self.gallery(ctx)?;
        self.api
            .delete_image_version(&gallery.gallery, &gallery.definition, &gallery.version)
            .await?;
        self.api.delete_managed_image(&ctx.names.image).await?;
        self.remove_disk(&ctx.names.staging).await
    }

    async fn stage(&self, ctx: &RunContext) -> Result<()> {
        let size = ctx.request.image.size();
        if size % PAGE_ALIGNMENT != 0 {
            return Err(PublishError::InvalidRequest(format!(
                "image size {size} is not a multiple of {PAGE_ALIGNMENT} bytes"
            )));
        }
        let disk = &ctx.names.staging;
        let disk_id = self.api.create_upload_disk(disk, self.location(), size).await?;
        tracing::info!(disk = %disk_id, size, "Created upload disk");

        let sas_url = self.api.grant_write_access(disk).await?;
        let uploaded = self.upload_pages(ctx, &sas_url).await;
        let revoked = self.api.revoke_access(disk).await;
        uploaded?;
        revoked
    }

    async fn convert(&self, ctx: &RunContext) -> Result<Vec<ImageHandle>> {
        let gallery = self.gallery(ctx)?;
        let image_id = self
            .api
            .create_managed_image(&ctx.names.image, self.location(), &ctx.names.staging)
            .await?;
        tracing::info!(image = %image_id, "Created managed image");

        self.api
            .ensure_image_definition(&ImageDefinition {
                gallery: gallery.gallery.clone(),
                name: gallery.definition.clone(),
                location: self.location().to_string(),
                publisher: IMAGE_PUBLISHER.to_string(),
                offer: gallery.definition.clone(),
                sku: self.sku.clone(),
                security_type: security_type(&ctx.request.attestation_variant).map(str::to_string),
            })
            .await?;

        let version_id = self
            .api
            .create_image_version(&ImageVersion {
                gallery: gallery.gallery.clone(),
                definition: gallery.definition.clone(),
                version: gallery.version.clone(),
                location: self.location().to_string(),
                source_image_id: image_id,
                target_regions: vec![self.location().to_string()],
            })
            .await?;
        tracing::info!(version = %version_id, "Created image version");
        Ok(vec![ImageHandle::regional(version_id, self.location())])
    }

    async fn replicate(
        &self,
        ctx: &RunContext,
        source: &ImageHandle,
        region: &str,
    ) -> Result<ImageHandle> {
        let gallery = self.gallery(ctx)?;
        let mut regions = self
            .api
            .target_regions(&gallery.gallery, &gallery.definition, &gallery.version)
            .await?;
        let wanted = normalize_region(region);
        if !regions.contains(&wanted) {
            regions.push(wanted);
            self.api
                .set_target_regions(&gallery.gallery, &gallery.definition, &gallery.version, &regions)
                .await?;
        }
        tracing::info!(version = %source.id, region = %region, "Replicating image version");
        Ok(ImageHandle::regional(source.id.clone(), region))
    }

    async fn wait_available(&self, ctx: &RunContext, handle: &ImageHandle) -> Result<()> {
        let gallery = self.gallery(ctx)?;
        let region = handle_region(handle)?;
        let wanted = normalize_region(region);
        let config = PollConfig::new(self.config.polling_interval(), self.wait.image_available_timeout());
        let what = format!("image version {} in {region}", gallery.version);
        let api = &self.api;
        poll_until(&what, config, ctx.cancel_token(), move || {
            let wanted = wanted.clone();
            async move {
                let status = api
                    .replication_status(&gallery.gallery, &gallery.definition, &gallery.version)
                    .await?;
                match status.into_iter().find(|r| r.region == wanted).map(|r| r.state) {
                    Some(ReplicationState::Completed) => Ok(Some(())),
                    Some(ReplicationState::Failed(details)) => Err(PublishError::provider(
                        PROVIDER,
                        format!("replication to {region} failed: {details}"),
                    )),
                    _ => Ok(None),
                }
            }
        })
        .await
    }

    async fn tag_and_publish(&self, ctx: &RunContext, handle: &ImageHandle) -> Result<ImageInfoEntry> {
        let gallery = self.gallery(ctx)?;
        let region = handle_region(handle)?;
        let reference = match self.api.community_gallery_name(&gallery.gallery).await? {
            Some(public_name) => {
                self.api
                    .community_image_version_id(
                        self.location(),
                        &public_name,
                        &gallery.definition,
                        &gallery.version,
                    )
                    .await?
            }
            None => handle.id.clone(),
        };
        tracing::info!(reference = %reference, region = %region, "Published image version");
        Ok(
            ImageInfoEntry::new(Provider::Azure, ctx.request.attestation_variant.clone(), reference)
                .in_region(region),
        )
    }

    async fn cleanup_staging(&self, ctx: &RunContext) -> Result<()> {
        self.remove_disk(&ctx.names.staging).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PublishPipeline;
    use cvm_image_core::{ImageSource, NamingScheme, Version};
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};
    use tempfile::TempDir;

    #[derive(Default)]
    struct AzureState {
        galleries: HashSet<String>,
        definitions: Vec<ImageDefinition>,
        disks: HashSet<String>,
        granted: HashSet<String>,
        images: HashSet<String>,
        versions: HashMap<String, Vec<String>>,
        pages: Vec<(u64, usize)>,
        community: Option<String>,
        failing_region: Option<String>,
        pending_polls: usize,
        calls: Vec<String>,
    }

    #[derive(Default)]
    struct FakeAzure {
        state: Mutex<AzureState>,
    }

    impl FakeAzure {
        fn calls(&self) -> Vec<String> {
            self.state.lock().calls.clone()
        }
    }

    #[async_trait]
    impl AzureApi for FakeAzure {
        async fn ensure_gallery(&self, gallery: &str, _location: &str) -> Result<()> {
            self.state.lock().galleries.insert(gallery.to_string());
            Ok(())
        }

        async fn ensure_image_definition(&self, definition: &ImageDefinition) -> Result<()> {
            self.state.lock().definitions.push(definition.clone());
            Ok(())
        }

        async fn delete_image_version(&self, _g: &str, _d: &str, version: &str) -> Result<()> {
            let mut state = self.state.lock();
            state.calls.push(format!("delete-version:{version}"));
            state.versions.remove(version);
            Ok(())
        }

        async fn delete_managed_image(&self, name: &str) -> Result<()> {
            self.state.lock().images.remove(name);
            Ok(())
        }

        async fn delete_disk(&self, name: &str) -> Result<()> {
            let mut state = self.state.lock();
            state.calls.push(format!("delete-disk:{name}"));
            state.disks.remove(name);
            Ok(())
        }

        async fn create_upload_disk(&self, name: &str, _location: &str, _size: u64) -> Result<String> {
            self.state.lock().disks.insert(name.to_string());
            Ok(format!("/disks/{name}"))
        }

        async fn grant_write_access(&self, disk: &str) -> Result<String> {
            self.state.lock().granted.insert(disk.to_string());
            Ok(format!("https://blob/{disk}?sig=x"))
        }

        async fn revoke_access(&self, disk: &str) -> Result<()> {
            self.state.lock().granted.remove(disk);
            Ok(())
        }

        async fn upload_page(&self, _sas: &str, offset: u64, data: Vec<u8>) -> Result<()> {
            self.state.lock().pages.push((offset, data.len()));
            Ok(())
        }

        async fn create_managed_image(&self, name: &str, _location: &str, disk: &str) -> Result<String> {
            let mut state = self.state.lock();
            assert!(state.disks.contains(disk));
            state.images.insert(name.to_string());
            Ok(format!("/images/{name}"))
        }

        async fn create_image_version(&self, version: &ImageVersion) -> Result<String> {
            self.state
                .lock()
                .versions
                .insert(version.version.clone(), version.target_regions.clone());
            Ok(format!("/galleries/{}/versions/{}", version.gallery, version.version))
        }

        async fn target_regions(&self, _g: &str, _d: &str, version: &str) -> Result<Vec<String>> {
            Ok(self.state.lock().versions.get(version).cloned().unwrap_or_default())
        }

        async fn set_target_regions(
            &self,
            _g: &str,
            _d: &str,
            version: &str,
            regions: &[String],
        ) -> Result<()> {
            self.state
                .lock()
                .versions
                .insert(version.to_string(), regions.to_vec());
            Ok(())
        }

        async fn replication_status(&self, _g: &str, _d: &str, version: &str) -> Result<Vec<RegionReplication>> {
            let mut state = self.state.lock();
            if state.pending_polls > 0 {
                state.pending_polls -= 1;
                return Ok(Vec::new());
            }
            let regions = state.versions.get(version).cloned().unwrap_or_default();
            Ok(regions
                .into_iter()
                .map(|region| {
                    let state = if state.failing_region.as_deref() == Some(region.as_str()) {
                        ReplicationState::Failed("quota exceeded".to_string())
                    } else {
                        ReplicationState::Completed
                    };
                    RegionReplication { region, state }
                })
                .collect())
        }

        async fn community_gallery_name(&self, _gallery: &str) -> Result<Option<String>> {
            Ok(self.state.lock().community.clone())
        }

        async fn community_image_version_id(
            &self,
            _location: &str,
            public_gallery: &str,
            definition: &str,
            version: &str,
        ) -> Result<String> {
            Ok(format!(
                "/CommunityGalleries/{public_gallery}/Images/{definition}/Versions/{version}"
            ))
        }
    }

    fn config() -> AzureConfig {
        AzureConfig {
            subscription: "sub".to_string(),
            resource_group: "rg".to_string(),
            replication_regions: Some(vec![
                "northeurope".to_string(),
                "westeurope".to_string(),
                "eastus".to_string(),
            ]),
            ..AzureConfig::default()
        }
    }

    /// 4 MiB of zeros followed by 1 KiB of data.
    fn image(tmp: &TempDir) -> ImageSource {
        let path = tmp.path().join("image.raw");
        let mut data = vec![0u8; PAGE_SIZE_MAX];
        data.extend_from_slice(&[0xab; 1024]);
        std::fs::write(&path, data).unwrap();
        ImageSource::from_path(path).unwrap()
    }

    fn request(image: ImageSource) -> UploadRequest {
        UploadRequest::new(
            Provider::Azure,
            Version::from_short_path("v2.16.0").unwrap(),
            "azure-sev-snp",
            image,
        )
    }

    fn pipeline(api: Arc<FakeAzure>) -> PublishPipeline {
        let adapter = AzureAdapter::new(api, config(), WaitConfig::default(), "cvm");
        PublishPipeline::new(NamingScheme::default()).with_adapter(Arc::new(adapter))
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_and_replicates_gallery_version() {
        let tmp = TempDir::new().unwrap();
        let api = Arc::new(FakeAzure::default());
        api.state.lock().pending_polls = 2;

        let entries = pipeline(api.clone()).run(request(image(&tmp))).await.unwrap();

        let regions: Vec<&str> = entries.iter().map(|e| e.region.as_str()).collect();
        assert_eq!(regions, vec!["northeurope", "westeurope", "eastus"]);
        assert!(entries
            .iter()
            .all(|e| e.reference == "/galleries/Cvm_CVM/versions/2.16.0"));

        let state = api.state.lock();
        assert!(state.galleries.contains("Cvm_CVM"));
        assert_eq!(state.pages, vec![(PAGE_SIZE_MAX as u64, 1024)]);
        assert_eq!(
            state.versions.get("2.16.0").unwrap(),
            &vec!["northeurope".to_string(), "westeurope".to_string(), "eastus".to_string()]
        );
        let definition = &state.definitions[0];
        assert_eq!(definition.publisher, IMAGE_PUBLISHER);
        assert_eq!(definition.offer, "cvm");
        assert_eq!(definition.security_type.as_deref(), Some("ConfidentialVMSupported"));
        assert!(state.disks.is_empty());
        assert!(state.granted.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_community_gallery_reference() {
        let tmp = TempDir::new().unwrap();
        let api = Arc::new(FakeAzure::default());
        api.state.lock().community = Some("cvm-0a1b".to_string());

        let entries = pipeline(api).run(request(image(&tmp))).await.unwrap();
        assert_eq!(
            entries[0].reference,
            "/CommunityGalleries/cvm-0a1b/Images/cvm/Versions/2.16.0"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unaligned_image_is_rejected_and_cleaned() {
        let api = Arc::new(FakeAzure::default());
        let request = request(ImageSource::with_size("/tmp/image.raw", 1000));

        let err = pipeline(api.clone()).run(request).await.unwrap_err();
        assert!(err
            .to_string()
            .starts_with("staging: Invalid request: image size 1000 is not a multiple of 512 bytes"));
        let deletes = api
            .calls()
            .iter()
            .filter(|c| c.starts_with("delete-disk:"))
            .count();
        // pre-clean and post-clean
        assert_eq!(deletes, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_replication_names_region() {
        let tmp = TempDir::new().unwrap();
        let api = Arc::new(FakeAzure::default());
        api.state.lock().failing_region = Some("eastus".to_string());

        let err = pipeline(api).run(request(image(&tmp))).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "waiting for availability in eastus: Azure API error: replication to eastus failed: quota exceeded"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pre_clean_removes_previous_version() {
        let tmp = TempDir::new().unwrap();
        let api = Arc::new(FakeAzure::default());
        api.state
            .lock()
            .versions
            .insert("2.16.0".to_string(), vec!["westus".to_string()]);

        pipeline(api.clone()).run(request(image(&tmp))).await.unwrap();

        assert_eq!(api.calls()[0], "delete-version:2.16.0");
        let regions = api.state.lock().versions.get("2.16.0").cloned().unwrap();
        assert!(!regions.contains(&"westus".to_string()));
    }

    #[test]
    fn test_security_type() {
        assert_eq!(security_type("azure-sev-snp"), Some("ConfidentialVMSupported"));
        assert_eq!(security_type("Azure-TDX"), Some("ConfidentialVMSupported"));
        assert_eq!(security_type("azure-trustedlaunch"), Some("TrustedLaunch"));
        assert_eq!(security_type("qemu-vtpm"), None);
    }
}
