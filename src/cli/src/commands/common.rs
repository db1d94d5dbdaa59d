//! Flags and flow shared by the publishing commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::Args;
use cvm_image_core::error::{PublishError, Result};
use cvm_image_core::request::default_timestamp;
use cvm_image_core::{
    ImageInfo, ImageSource, Provider, PublishConfig, SecureBootPaths, UploadRequest, Version,
};
use cvm_image_publish::aws::SdkS3;
use cvm_image_publish::{publish_and_record, PublishPipeline, S3Archive, SharedAdapter};
use tokio_util::sync::CancellationToken;

use crate::output::InfoWriter;

#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Raw disk image to publish
    #[arg(long)]
    pub raw_image: PathBuf,

    /// Directory with the secure boot keys (PK.cer, KEK.esl, db.esl, ...)
    #[arg(long)]
    pub pki: Option<PathBuf>,

    /// Attestation variant of the image (e.g., "aws-sev-snp", "azure-tdx")
    #[arg(long)]
    pub attestation_variant: String,

    /// Enroll the secure boot keys from --pki
    #[arg(long)]
    pub secure_boot: bool,

    /// Image version as short path (e.g., "v2.16.0", "ref/main/stream/nightly/v2.17.0-pre")
    #[arg(long = "version", id = "image_version")]
    pub image_version: String,

    /// RFC 3339 build timestamp; defaults to SOURCE_DATE_EPOCH or now
    #[arg(long)]
    pub timestamp: Option<String>,

    /// Write the image info JSON here instead of stdout
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Archive the raw image in this S3 bucket before publishing
    #[arg(long)]
    pub archive_bucket: Option<String>,

    /// Region of the archive bucket
    #[arg(long, default_value = "eu-central-1")]
    pub archive_region: String,

    /// Public base URL the archive bucket is served from
    #[arg(long)]
    pub archive_url: Option<String>,
}

impl CommonArgs {
    /// Build the upload request for `provider`, loading secure boot material if asked to.
    pub fn request(&self, provider: Provider) -> Result<UploadRequest> {
        let version = Version::from_short_path(&self.image_version)?;
        let image = ImageSource::from_path(&self.raw_image)?;
        let mut request = UploadRequest::new(provider, version, &self.attestation_variant, image);
        let timestamp = match &self.timestamp {
            Some(raw) => parse_timestamp(raw)?,
            None => default_timestamp()?,
        };
        request = request.with_timestamp(timestamp);
        if self.secure_boot {
            let pki = self.pki.as_deref().ok_or_else(|| {
                PublishError::InvalidRequest("--secure-boot requires --pki".to_string())
            })?;
            let paths = SecureBootPaths::from_pki_dir(pki);
            request = request.with_secure_boot(paths.database()?, paths.var_store()?);
        }
        Ok(request)
    }

    fn archive_public_url(&self, bucket: &str) -> String {
        self.archive_url
            .clone()
            .unwrap_or_else(|| format!("https://{bucket}.s3.{}.amazonaws.com", self.archive_region))
    }
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| PublishError::InvalidRequest(format!("invalid timestamp {raw:?}: {e}")))
}

/// Configuration file contents, or defaults without a file.
pub fn load_config(path: Option<&Path>) -> Result<PublishConfig> {
    match path {
        Some(path) => PublishConfig::from_file(path),
        None => Ok(PublishConfig::default()),
    }
}

/// Token cancelled on Ctrl-C, so the run stops and cleans up.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            on_signal.cancel();
        }
    });
    token
}

/// Publish with `adapter` and write the resulting image info.
pub async fn publish(
    config: &PublishConfig,
    adapter: SharedAdapter,
    args: &CommonArgs,
    provider: Provider,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let request = args.request(provider)?;
    let pipeline = PublishPipeline::new(config.naming())
        .with_adapter(adapter)
        .with_cancellation(cancel_on_ctrl_c());
    let writer = InfoWriter::new(args.out.clone());

    match &args.archive_bucket {
        Some(bucket) => {
            let s3 = SdkS3::new(&args.archive_region).await;
            let archive = S3Archive::new(Arc::new(s3), bucket.clone(), args.archive_public_url(bucket));
            publish_and_record(&pipeline, &archive, &writer, request).await?;
        }
        None => {
            let version = request.version.clone();
            let entries = pipeline.run(request).await?;
            writer.write(&ImageInfo::new(&version, entries))?;
        }
    }
    Ok(())
}
