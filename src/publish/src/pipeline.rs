//! PublishPipeline - drives one provider adapter through a publishing run.
//!
//! Stage order:
//!
//! ```text
//! init -> setup -> pre-cleaning -> staging -> converting
//!      -> replicating (per region) -> waiting + tagging/publishing (per region)
//!      -> post-cleaning (always)
//! ```
//!
//! Any stage failure aborts the run. Regions that were already published
//! stay published; they are listed in a warning.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use cvm_image_core::error::{PublishError, Result, Stage};
use cvm_image_core::{ImageInfoEntry, NamingScheme, Provider, UploadRequest};
use tokio_util::sync::CancellationToken;

use crate::adapter::{ImageHandle, ProviderAdapter, RunContext, SharedAdapter};

/// Orchestrates publishing runs over registered provider adapters.
pub struct PublishPipeline {
    adapters: HashMap<Provider, SharedAdapter>,
    naming: NamingScheme,
    cancel: CancellationToken,
}

impl PublishPipeline {
    pub fn new(naming: NamingScheme) -> Self {
        Self {
            adapters: HashMap::new(),
            naming,
            cancel: CancellationToken::new(),
        }
    }

    /// Register the adapter for its provider, replacing any previous one.
    pub fn with_adapter(mut self, adapter: SharedAdapter) -> Self {
        self.adapters.insert(adapter.provider(), adapter);
        self
    }

    /// Cancel every run of this pipeline when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Publish the image described by `request`.
    ///
    /// Returns one entry per published region; no entries for adapters that
    /// publish nothing. The staging resource is cleaned up exactly once on
    /// every exit path, including when the returned future is dropped.
    pub async fn run(&self, request: UploadRequest) -> Result<Vec<ImageInfoEntry>> {
        let adapter = self.select(&request).map_err(|e| e.in_stage(Stage::Init, None))?;
        let names = self.naming.names(
            request.provider,
            &request.version,
            &request.attestation_variant,
            request.timestamp,
        );
        tracing::info!(
            provider = %request.provider,
            version = %request.version,
            variant = %request.attestation_variant,
            image = %names.image,
            "Publishing image"
        );

        let ctx = RunContext::new(request, names, self.cancel.child_token());
        let guard = StagingGuard::new(adapter.clone(), &ctx);
        let result = run_stages(adapter.as_ref(), &ctx).await;
        guard.release().await;

        match &result {
            Ok(entries) => tracing::info!(entries = entries.len(), "Image published"),
            Err(e) => tracing::error!(error = %e, "Publishing failed"),
        }
        result
    }

    fn select(&self, request: &UploadRequest) -> Result<SharedAdapter> {
        request.validate()?;
        self.adapters
            .get(&request.provider)
            .cloned()
            .ok_or_else(|| PublishError::UnknownProvider(request.provider.to_string()))
    }
}

async fn run_stages(adapter: &dyn ProviderAdapter, ctx: &RunContext) -> Result<Vec<ImageInfoEntry>> {
    step(ctx, Stage::EnsureContainer, None, adapter.ensure_container(ctx)).await?;
    step(ctx, Stage::PreClean, None, adapter.pre_clean(ctx)).await?;
    step(ctx, Stage::Stage, None, adapter.stage(ctx)).await?;
    let mut handles = step(ctx, Stage::Convert, None, adapter.convert(ctx)).await?;

    let Some(source) = handles.first().cloned() else {
        tracing::info!(provider = %adapter.provider(), "Adapter produced no native image");
        return Ok(Vec::new());
    };

    for region in adapter.replication_regions(&ctx.request) {
        if handles.iter().any(|h| h.region.as_deref() == Some(region.as_str())) {
            continue;
        }
        let replica = step(
            ctx,
            Stage::Replicate,
            Some(&region),
            adapter.replicate(ctx, &source, &region),
        )
        .await?;
        handles.push(replica);
    }

    let mut published: Vec<ImageInfoEntry> = Vec::with_capacity(handles.len());
    for handle in &handles {
        match publish_region(adapter, ctx, handle).await {
            Ok(entry) => published.push(entry),
            Err(e) => {
                if !published.is_empty() {
                    let regions: Vec<&str> = published.iter().map(|p| p.region.as_str()).collect();
                    tracing::warn!(
                        published = ?regions,
                        "Run failed after publishing some regions; they are not rolled back"
                    );
                }
                return Err(e);
            }
        }
    }
    Ok(published)
}

async fn publish_region(
    adapter: &dyn ProviderAdapter,
    ctx: &RunContext,
    handle: &ImageHandle,
) -> Result<ImageInfoEntry> {
    let region = handle.region.as_deref();
    step(ctx, Stage::WaitAvailable, region, adapter.wait_available(ctx, handle)).await?;
    step(ctx, Stage::TagAndPublish, region, adapter.tag_and_publish(ctx, handle)).await
}

async fn step<T, F>(ctx: &RunContext, stage: Stage, region: Option<&str>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tracing::debug!(stage = %stage, region = region.unwrap_or("-"), "Entering stage");
    ctx.cancellable(&stage.to_string(), fut)
        .await
        .map_err(|e| e.in_stage(stage, region))
}

/// Runs `cleanup_staging` exactly once: explicitly through [`StagingGuard::release`],
/// or from `Drop` when the run future is dropped before reaching it.
struct StagingGuard {
    armed: Option<(SharedAdapter, RunContext)>,
}

impl StagingGuard {
    fn new(adapter: SharedAdapter, ctx: &RunContext) -> Self {
        Self {
            armed: Some((adapter, ctx.detached())),
        }
    }

    async fn release(mut self) {
        if let Some((adapter, ctx)) = self.armed.take() {
            cleanup(adapter, ctx).await;
        }
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        let Some((adapter, ctx)) = self.armed.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(cleanup(adapter, ctx));
            }
            Err(_) => tracing::warn!(
                staging = %ctx.names.staging,
                "No async runtime left; staging resource was not cleaned up"
            ),
        }
    }
}

async fn cleanup(adapter: Arc<dyn ProviderAdapter>, ctx: RunContext) {
    match adapter.cleanup_staging(&ctx).await {
        Ok(()) => tracing::debug!(staging = %ctx.names.staging, "Staging resource removed"),
        Err(e) => tracing::warn!(
            staging = %ctx.names.staging,
            error = %e.in_stage(Stage::CleanupStaging, None),
            "Failed to remove staging resource"
        ),
    }
}
