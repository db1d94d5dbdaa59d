//! No-op adapter for providers that boot the archived raw image directly.

use async_trait::async_trait;
use cvm_image_core::error::{PublishError, Result};
use cvm_image_core::{ImageInfoEntry, Provider, UploadRequest};

use crate::adapter::{ImageHandle, ProviderAdapter, RunContext};

/// Performs no cloud call and publishes no native image.
#[derive(Debug, Clone, Copy)]
pub struct NoopAdapter {
    provider: Provider,
}

impl NoopAdapter {
    pub fn new(provider: Provider) -> Self {
        Self { provider }
    }

    fn unsupported(&self, operation: &str) -> PublishError {
        PublishError::Other(format!("{} has no native images to {operation}", self.provider))
    }
}

#[async_trait]
impl ProviderAdapter for NoopAdapter {
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
        tracing::info!(
            provider = %self.provider,
            image = %ctx.request.image.path().display(),
            "Skipping native image creation"
        );
        Ok(Vec::new())
    }

    async fn replicate(
        &self,
        _ctx: &RunContext,
        _source: &ImageHandle,
        _region: &str,
    ) -> Result<ImageHandle> {
        Err(self.unsupported("replicate"))
    }

    async fn wait_available(&self, _ctx: &RunContext, _handle: &ImageHandle) -> Result<()> {
        Err(self.unsupported("wait for"))
    }

    async fn tag_and_publish(
        &self,
        _ctx: &RunContext,
        _handle: &ImageHandle,
    ) -> Result<ImageInfoEntry> {
        Err(self.unsupported("publish"))
    }

    async fn cleanup_staging(&self, _ctx: &RunContext) -> Result<()> {
        Ok(())
    }
}
