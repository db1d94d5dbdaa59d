//! ProviderAdapter - the operation set every cloud backend implements.
//!
//! The pipeline drives these operations in a fixed order; adapters never call
//! each other's stages. All names an adapter touches come from the
//! [`ResourceNames`] in the [`RunContext`], so a retried run addresses the
//! same resources as the failed one.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use cvm_image_core::error::{PublishError, Result};
use cvm_image_core::{ImageInfoEntry, Provider, ResourceNames, UploadRequest};
use tokio_util::sync::CancellationToken;

/// Opaque per-region handle to a native image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHandle {
    /// Provider identifier (AMI id, gallery image version id, GCE image link).
    pub id: String,
    /// Region the handle refers to; `None` for global images.
    pub region: Option<String>,
}

impl ImageHandle {
    pub fn new(id: impl Into<String>, region: Option<String>) -> Self {
        Self {
            id: id.into(),
            region,
        }
    }

    pub fn regional(id: impl Into<String>, region: impl Into<String>) -> Self {
        Self::new(id, Some(region.into()))
    }

    pub fn global(id: impl Into<String>) -> Self {
        Self::new(id, None)
    }
}

/// State shared by all stages of one run. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub request: Arc<UploadRequest>,
    pub names: ResourceNames,
    cancel: CancellationToken,
}

impl RunContext {
    pub fn new(request: UploadRequest, names: ResourceNames, cancel: CancellationToken) -> Self {
        Self {
            request: Arc::new(request),
            names,
            cancel,
        }
    }

    /// Same run with its own, never cancelled token. Used for cleanup, which
    /// has to run even after the run was cancelled.
    pub fn detached(&self) -> Self {
        Self {
            request: self.request.clone(),
            names: self.names.clone(),
            cancel: CancellationToken::new(),
        }
    }

    /// Cancellation signal of this run.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run `fut` unless the run is cancelled first.
    pub async fn cancellable<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PublishError::Cancelled(what.to_string())),
            result = fut => result,
        }
    }
}

/// Operation set of one cloud provider.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider this adapter publishes to.
    fn provider(&self) -> Provider;

    /// Regions the home-region image is copied to, in order.
    fn replication_regions(&self, request: &UploadRequest) -> Vec<String>;

    /// Provision the durable container (bucket, gallery). No-op when it exists.
    async fn ensure_container(&self, ctx: &RunContext) -> Result<()>;

    /// Delete leftovers of a previous run with the same names. Missing resources are fine.
    async fn pre_clean(&self, ctx: &RunContext) -> Result<()>;

    /// Upload the raw image to the staging resource.
    async fn stage(&self, ctx: &RunContext) -> Result<()>;

    /// Create native images from the staged bytes.
    ///
    /// SDK-backed adapters return exactly one home-region handle, the delegate
    /// adapter returns whatever the external tool published, no-op returns none.
    async fn convert(&self, ctx: &RunContext) -> Result<Vec<ImageHandle>>;

    /// Copy the home-region image into `region`.
    async fn replicate(&self, ctx: &RunContext, source: &ImageHandle, region: &str)
        -> Result<ImageHandle>;

    /// Wait until the image behind `handle` can be used.
    async fn wait_available(&self, ctx: &RunContext, handle: &ImageHandle) -> Result<()>;

    /// Tag the image and make it consumable; returns the published reference.
    async fn tag_and_publish(&self, ctx: &RunContext, handle: &ImageHandle)
        -> Result<ImageInfoEntry>;

    /// Delete the staging resource. Missing resources are fine.
    async fn cleanup_staging(&self, ctx: &RunContext) -> Result<()>;
}

/// Shared adapter handle.
pub type SharedAdapter = Arc<dyn ProviderAdapter>;
