//! Caller-level flow: archive the raw image, publish it, record the result.

use std::sync::Arc;

use async_trait::async_trait;
use cvm_image_core::error::Result;
use cvm_image_core::{ImageInfo, ImageInfoEntry, ImageSource, Provider, UploadRequest, Version};

use crate::aws::S3Api;
use crate::pipeline::PublishPipeline;

/// Long term storage of raw images.
#[async_trait]
pub trait ArchiveClient: Send + Sync {
    /// Store the raw image and return the URL it can be downloaded from.
    async fn archive(
        &self,
        version: &Version,
        provider: Provider,
        attestation_variant: &str,
        image: &ImageSource,
    ) -> Result<String>;
}

/// Durable store of published image references.
#[async_trait]
pub trait VersionsClient: Send + Sync {
    async fn upload_image_info(&self, info: &ImageInfo) -> Result<()>;
}

/// Archive in an S3 bucket served under a public base URL.
pub struct S3Archive {
    s3: Arc<dyn S3Api>,
    bucket: String,
    public_url: String,
}

impl S3Archive {
    pub fn new(s3: Arc<dyn S3Api>, bucket: impl Into<String>, public_url: impl Into<String>) -> Self {
        Self {
            s3,
            bucket: bucket.into(),
            public_url: public_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Object key of an archived raw image.
    pub fn object_key(version: &Version, provider: Provider, attestation_variant: &str) -> String {
        format!(
            "ref/{}/stream/{}/{}/image/csp/{}/{}/image.raw",
            version.reference(),
            version.stream(),
            version.version(),
            provider.tag(),
            attestation_variant
        )
    }
}

#[async_trait]
impl ArchiveClient for S3Archive {
    async fn archive(
        &self,
        version: &Version,
        provider: Provider,
        attestation_variant: &str,
        image: &ImageSource,
    ) -> Result<String> {
        let key = Self::object_key(version, provider, attestation_variant);
        tracing::info!(bucket = %self.bucket, key = %key, "Archiving raw image");
        self.s3.upload_object(&self.bucket, &key, image).await?;
        Ok(format!("{}/{}", self.public_url, key))
    }
}

/// Archive the raw image, publish it, and record the resulting [`ImageInfo`].
///
/// When the pipeline publishes no native image, a single entry pointing at
/// the archived raw image is recorded instead.
pub async fn publish_and_record(
    pipeline: &PublishPipeline,
    archive: &dyn ArchiveClient,
    versions: &dyn VersionsClient,
    request: UploadRequest,
) -> Result<ImageInfo> {
    let archive_url = archive
        .archive(
            &request.version,
            request.provider,
            &request.attestation_variant,
            &request.image,
        )
        .await?;

    let version = request.version.clone();
    let provider = request.provider;
    let variant = request.attestation_variant.clone();

    let mut entries = pipeline.run(request).await?;
    if entries.is_empty() {
        tracing::info!(url = %archive_url, "No native image published, referencing the archived image");
        entries.push(ImageInfoEntry::new(provider, variant, archive_url));
    }

    let info = ImageInfo::new(&version, entries);
    versions.upload_image_info(&info).await?;
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noop::NoopAdapter;
    use cvm_image_core::error::PublishError;
    use cvm_image_core::NamingScheme;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeS3 {
        uploads: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl S3Api for FakeS3 {
        async fn ensure_bucket(&self, _bucket: &str) -> Result<()> {
            Ok(())
        }

        async fn upload_object(&self, bucket: &str, key: &str, _image: &ImageSource) -> Result<()> {
            self.uploads.lock().push((bucket.to_string(), key.to_string()));
            Ok(())
        }

        async fn delete_object(&self, _bucket: &str, _key: &str) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingVersions {
        recorded: Mutex<Vec<ImageInfo>>,
    }

    #[async_trait]
    impl VersionsClient for RecordingVersions {
        async fn upload_image_info(&self, info: &ImageInfo) -> Result<()> {
            self.recorded.lock().push(info.clone());
            Ok(())
        }
    }

    fn request(provider: Provider) -> UploadRequest {
        UploadRequest::new(
            provider,
            Version::from_short_path("v2.16.0").unwrap(),
            "qemu-vtpm",
            ImageSource::with_size("/tmp/image.raw", 1024),
        )
    }

    #[test]
    fn test_object_key() {
        let version = Version::from_short_path("v2.16.0").unwrap();
        assert_eq!(
            S3Archive::object_key(&version, Provider::Qemu, "qemu-vtpm"),
            "ref/-/stream/stable/v2.16.0/image/csp/qemu/qemu-vtpm/image.raw"
        );
    }

    #[tokio::test]
    async fn test_archive_url_fallback_for_noop() {
        let s3 = Arc::new(FakeS3::default());
        let archive = S3Archive::new(s3.clone(), "cdn-bucket", "https://cdn.example.com/");
        let versions = RecordingVersions::default();
        let pipeline = PublishPipeline::new(NamingScheme::default())
            .with_adapter(Arc::new(NoopAdapter::new(Provider::Qemu)));

        let info = publish_and_record(&pipeline, &archive, &versions, request(Provider::Qemu))
            .await
            .unwrap();

        assert_eq!(info.stream, "stable");
        assert_eq!(info.list.len(), 1);
        assert_eq!(
            info.list[0].reference,
            "https://cdn.example.com/ref/-/stream/stable/v2.16.0/image/csp/qemu/qemu-vtpm/image.raw"
        );
        assert_eq!(info.list[0].csp, Provider::Qemu);
        assert!(info.list[0].region.is_empty());
        assert_eq!(s3.uploads.lock().len(), 1);
        assert_eq!(versions.recorded.lock().as_slice(), &[info]);
    }

    #[tokio::test]
    async fn test_pipeline_failure_records_nothing() {
        let archive = S3Archive::new(Arc::new(FakeS3::default()), "b", "https://cdn");
        let versions = RecordingVersions::default();
        let pipeline = PublishPipeline::new(NamingScheme::default());

        let err = publish_and_record(&pipeline, &archive, &versions, request(Provider::Gcp))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Stage { .. }));
        assert!(versions.recorded.lock().is_empty());
    }
}
