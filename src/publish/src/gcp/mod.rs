//! GCP adapter: gzip tarball in Cloud Storage, one global Compute Engine image.

mod client;
mod google;

pub use client::{GceApi, GcsApi, ImageSpec, ImageStatus, ShieldedState};
pub use google::GoogleCloud;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use cvm_image_core::error::{PublishError, Result};
use cvm_image_core::{Database, GcpConfig, ImageInfoEntry, Provider, UploadRequest, WaitConfig};
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::adapter::{ImageHandle, ProviderAdapter, RunContext};
use crate::auth::TokenSource;
use crate::poll::{poll_until, PollConfig};

const PROVIDER: &str = "GCP";

/// Name of the disk inside a GCE import tarball.
pub const TARBALL_DISK_NAME: &str = "disk.raw";

const SELF_LINK_PREFIX: &str = "https://www.googleapis.com/compute/v1/";

pub const GUEST_OS_FEATURES: [&str; 5] = [
    "GVNIC",
    "SEV_CAPABLE",
    "SEV_SNP_CAPABLE",
    "VIRTIO_SCSI_MULTIQUEUE",
    "UEFI_COMPATIBLE",
];

/// Publishes a single global image; there is nothing to replicate.
pub struct GcpAdapter {
    gcs: Arc<dyn GcsApi>,
    gce: Arc<dyn GceApi>,
    config: GcpConfig,
    wait: WaitConfig,
}

impl GcpAdapter {
    pub fn new(gcs: Arc<dyn GcsApi>, gce: Arc<dyn GceApi>, config: GcpConfig, wait: WaitConfig) -> Self {
        Self {
            gcs,
            gce,
            config,
            wait,
        }
    }

    /// Adapter talking to the Google Cloud JSON APIs with the given token source.
    pub fn with_tokens(tokens: Arc<dyn TokenSource>, config: GcpConfig, wait: WaitConfig) -> Self {
        let google = Arc::new(GoogleCloud::new(tokens, config.project.clone()));
        Self::new(google.clone(), google, config, wait)
    }
}

/// Image reference as used by instance templates: the self link without the API prefix.
pub fn image_reference(self_link: &str) -> &str {
    self_link.strip_prefix(SELF_LINK_PREFIX).unwrap_or(self_link)
}

fn shielded_state(database: &Database) -> ShieldedState {
    ShieldedState {
        pk: database.pk.clone(),
        keks: database.keks.clone(),
        dbs: database.dbs.clone(),
    }
}

/// Package `image` as `disk.raw` inside a gzip compressed GNU tarball at `out`.
pub fn write_tarball(image: &Path, out: &Path) -> Result<()> {
    let mut disk = std::fs::File::open(image).map_err(|source| PublishError::ReadFile {
        what: "raw image".to_string(),
        path: image.to_path_buf(),
        source,
    })?;
    let size = disk.metadata()?.len();

    let encoder = GzEncoder::new(std::fs::File::create(out)?, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let mut header = tar::Header::new_gnu();
    header.set_size(size);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, TARBALL_DISK_NAME, &mut disk)?;
    builder.into_inner()?.finish()?;
    Ok(())
}

#[async_trait]
impl ProviderAdapter for GcpAdapter {
    fn provider(&self) -> Provider {
        Provider::Gcp
    }

    fn replication_regions(&self, _request: &UploadRequest) -> Vec<String> {
        Vec::new()
    }

    async fn ensure_container(&self, _ctx: &RunContext) -> Result<()> {
        self.gcs
            .ensure_bucket(&self.config.bucket, &self.config.location)
            .await
    }

    async fn pre_clean(&self, ctx: &RunContext) -> Result<()> {
        self.gce.delete_image(&ctx.names.image).await?;
        self.gcs
            .delete_object(&self.config.bucket, &ctx.names.staging)
            .await
    }

    async fn stage(&self, ctx: &RunContext) -> Result<()> {
        let workdir = tempfile::TempDir::new()?;
        let tarball = workdir.path().join(&ctx.names.staging);
        let image = ctx.request.image.path().to_path_buf();
        let out = tarball.clone();
        tokio::task::spawn_blocking(move || write_tarball(&image, &out))
            .await
            .map_err(|e| PublishError::Other(format!("packaging task failed: {e}")))??;
        tracing::debug!(tarball = %tarball.display(), "Packaged image");

        let uri = self
            .gcs
            .upload_file(&self.config.bucket, &ctx.names.staging, &tarball)
            .await?;
        tracing::info!(uri = %uri, "Uploaded image tarball");
        Ok(())
    }

    async fn convert(&self, ctx: &RunContext) -> Result<Vec<ImageHandle>> {
        let request = &ctx.request;
        let shielded = if request.secure_boot {
            let database = request.sb_database.as_ref().ok_or_else(|| {
                PublishError::InvalidRequest("secure boot requires a certificate database".to_string())
            })?;
            Some(shielded_state(database))
        } else {
            None
        };
        let spec = ImageSpec {
            name: ctx.names.image.clone(),
            description: format!("{} image {}", request.attestation_variant, request.version),
            family: ctx.names.family.clone(),
            source_uri: format!(
                "https://storage.googleapis.com/{}/{}",
                self.config.bucket, ctx.names.staging
            ),
            guest_os_features: GUEST_OS_FEATURES.iter().map(|f| f.to_string()).collect(),
            shielded_state: shielded,
        };
        let self_link = self.gce.create_image(&spec).await?;
        tracing::info!(image = %self_link, "Created image");
        Ok(vec![ImageHandle::global(self_link)])
    }

    async fn replicate(
        &self,
        _ctx: &RunContext,
        _source: &ImageHandle,
        region: &str,
    ) -> Result<ImageHandle> {
        Err(PublishError::provider(
            PROVIDER,
            format!("images are global and cannot be replicated to {region}"),
        ))
    }

    async fn wait_available(&self, ctx: &RunContext, _handle: &ImageHandle) -> Result<()> {
        let name = ctx.names.image.as_str();
        let config = PollConfig::new(self.wait.image_poll_interval(), self.wait.image_available_timeout());
        let gce = &self.gce;
        poll_until(&format!("image {name}"), config, ctx.cancel_token(), move || async move {
            match gce.image_status(name).await? {
                Some(ImageStatus::Ready) => Ok(Some(())),
                Some(ImageStatus::Failed(status)) => Err(PublishError::provider(
                    PROVIDER,
                    format!("image {name} is {status}"),
                )),
                Some(ImageStatus::Pending) | None => Ok(None),
            }
        })
        .await
    }

    async fn tag_and_publish(&self, ctx: &RunContext, handle: &ImageHandle) -> Result<ImageInfoEntry> {
        self.gce.make_public(&ctx.names.image).await?;
        Ok(ImageInfoEntry::new(
            Provider::Gcp,
            ctx.request.attestation_variant.clone(),
            image_reference(&handle.id),
        ))
    }

    async fn cleanup_staging(&self, ctx: &RunContext) -> Result<()> {
        self.gcs
            .delete_object(&self.config.bucket, &ctx.names.staging)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PublishPipeline;
    use cvm_image_core::{ImageSource, NamingScheme, UefiVarStore, Version};
    use flate2::read::GzDecoder;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::io::Read;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeGcs {
        objects: Mutex<HashMap<String, Vec<u8>>>,
        deletes: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl GcsApi for FakeGcs {
        async fn ensure_bucket(&self, _bucket: &str, _location: &str) -> Result<()> {
            Ok(())
        }

        async fn upload_file(&self, bucket: &str, object: &str, path: &Path) -> Result<String> {
            let data = std::fs::read(path)?;
            self.objects.lock().insert(object.to_string(), data);
            Ok(format!("https://storage.googleapis.com/{bucket}/{object}"))
        }

        async fn delete_object(&self, _bucket: &str, object: &str) -> Result<()> {
            self.deletes.lock().push(object.to_string());
            self.objects.lock().remove(object);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeGce {
        images: Mutex<HashMap<String, ImageSpec>>,
        public: Mutex<Vec<String>>,
        pending_polls: Mutex<usize>,
        fail_with: Option<String>,
        deleted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl GceApi for FakeGce {
        async fn delete_image(&self, name: &str) -> Result<()> {
            if self.images.lock().remove(name).is_some() {
                self.deleted.lock().push(name.to_string());
            }
            Ok(())
        }

        async fn create_image(&self, spec: &ImageSpec) -> Result<String> {
            self.images.lock().insert(spec.name.clone(), spec.clone());
            Ok(format!(
                "https://www.googleapis.com/compute/v1/projects/p/global/images/{}",
                spec.name
            ))
        }

        async fn image_status(&self, name: &str) -> Result<Option<ImageStatus>> {
            if !self.images.lock().contains_key(name) {
                return Ok(None);
            }
            if let Some(status) = &self.fail_with {
                return Ok(Some(ImageStatus::Failed(status.clone())));
            }
            let mut pending = self.pending_polls.lock();
            if *pending > 0 {
                *pending -= 1;
                return Ok(Some(ImageStatus::Pending));
            }
            Ok(Some(ImageStatus::Ready))
        }

        async fn make_public(&self, name: &str) -> Result<()> {
            self.public.lock().push(name.to_string());
            Ok(())
        }
    }

    fn image(tmp: &TempDir) -> ImageSource {
        let path = tmp.path().join("image.raw");
        std::fs::write(&path, vec![7u8; 4096]).unwrap();
        ImageSource::from_path(path).unwrap()
    }

    fn request(image: ImageSource) -> UploadRequest {
        UploadRequest::new(
            Provider::Gcp,
            Version::from_short_path("v2.16.0").unwrap(),
            "gcp-sev-snp",
            image,
        )
    }

    fn pipeline(gcs: Arc<FakeGcs>, gce: Arc<FakeGce>) -> PublishPipeline {
        let config = GcpConfig {
            project: "p".to_string(),
            ..GcpConfig::default()
        };
        let adapter = GcpAdapter::new(gcs, gce, config, WaitConfig::default());
        PublishPipeline::new(NamingScheme::default()).with_adapter(Arc::new(adapter))
    }

    fn unpack(tarball: &[u8]) -> HashMap<String, Vec<u8>> {
        let mut archive = tar::Archive::new(GzDecoder::new(tarball));
        let mut files = HashMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().to_string();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            files.insert(name, data);
        }
        files
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_single_global_image() {
        let tmp = TempDir::new().unwrap();
        let gcs = Arc::new(FakeGcs::default());
        let gce = Arc::new(FakeGce::default());
        *gce.pending_polls.lock() = 2;

        let request = request(image(&tmp));
        let names = NamingScheme::default().names(
            Provider::Gcp,
            &request.version,
            &request.attestation_variant,
            request.timestamp,
        );
        let entries = pipeline(gcs.clone(), gce.clone()).run(request).await.unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].reference,
            format!("projects/p/global/images/{}", names.image)
        );
        assert!(entries[0].region.is_empty());
        assert_eq!(gce.public.lock().clone(), vec![names.image.clone()]);

        let spec = gce.images.lock().get(&names.image).cloned().unwrap();
        assert_eq!(spec.family, names.family);
        assert_eq!(spec.guest_os_features.len(), 5);
        assert!(spec.shielded_state.is_none());
        assert!(spec.source_uri.ends_with(&names.staging));

        // staged tarball is gone after the run
        assert!(gcs.objects.lock().is_empty());
        assert_eq!(gcs.deletes.lock().last(), Some(&names.staging));
    }

    #[tokio::test(start_paused = true)]
    async fn test_secure_boot_sets_shielded_state() {
        let tmp = TempDir::new().unwrap();
        let gce = Arc::new(FakeGce::default());
        let database = Database {
            pk: b"pk".to_vec(),
            keks: vec![b"kek".to_vec()],
            dbs: vec![b"db".to_vec()],
        };
        let store = UefiVarStore::from_signature_lists(vec![1], vec![2], vec![3], None);
        let request = request(image(&tmp)).with_secure_boot(database, store);

        pipeline(Arc::new(FakeGcs::default()), gce.clone())
            .run(request)
            .await
            .unwrap();

        let images = gce.images.lock();
        let spec = images.values().next().unwrap();
        let state = spec.shielded_state.as_ref().unwrap();
        assert_eq!(state.pk, b"pk".to_vec());
        assert_eq!(state.keks, vec![b"kek".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_image_aborts() {
        let tmp = TempDir::new().unwrap();
        let gce = Arc::new(FakeGce {
            fail_with: Some("failed".to_string()),
            ..FakeGce::default()
        });

        let err = pipeline(Arc::new(FakeGcs::default()), gce.clone())
            .run(request(image(&tmp)))
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("waiting for availability: GCP API error: image "));
        assert!(message.ends_with(" is failed"));
        assert!(gce.public.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rerun_replaces_existing_image() {
        let tmp = TempDir::new().unwrap();
        let gcs = Arc::new(FakeGcs::default());
        let gce = Arc::new(FakeGce::default());
        let pipeline = pipeline(gcs, gce.clone());

        let request = request(image(&tmp));
        pipeline.run(request.clone()).await.unwrap();
        pipeline.run(request).await.unwrap();

        assert_eq!(gce.deleted.lock().len(), 1);
        assert_eq!(gce.images.lock().len(), 1);
    }

    #[test]
    fn test_tarball_contains_disk_raw() {
        let tmp = TempDir::new().unwrap();
        let image = tmp.path().join("image.raw");
        std::fs::write(&image, b"raw disk bytes").unwrap();
        let out = tmp.path().join("image.tar.gz");

        write_tarball(&image, &out).unwrap();

        let files = unpack(&std::fs::read(&out).unwrap());
        assert_eq!(files.len(), 1);
        assert_eq!(files[TARBALL_DISK_NAME], b"raw disk bytes".to_vec());
    }

    #[test]
    fn test_tarball_missing_image() {
        let tmp = TempDir::new().unwrap();
        let err = write_tarball(&tmp.path().join("missing.raw"), &tmp.path().join("o.tar.gz"))
            .unwrap_err();
        assert!(err.to_string().starts_with("Failed to read raw image"));
    }

    #[test]
    fn test_image_reference() {
        assert_eq!(
            image_reference("https://www.googleapis.com/compute/v1/projects/p/global/images/i"),
            "projects/p/global/images/i"
        );
        assert_eq!(image_reference("projects/p/global/images/i"), "projects/p/global/images/i");
    }
}
