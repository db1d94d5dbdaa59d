//! `cvm-image nop` command.

use std::sync::Arc;

use clap::Args;
use cvm_image_core::error::{PublishError, Result};
use cvm_image_core::{Provider, PublishConfig};
use cvm_image_publish::NoopAdapter;

use super::common::{self, CommonArgs};

#[derive(Args)]
pub struct NopArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Provider the image is built for
    #[arg(long, default_value = "qemu")]
    pub provider: Provider,
}

impl NopArgs {
    /// The archived raw image is the only reference a no-op publish produces.
    fn validate(&self) -> Result<()> {
        if self.common.archive_bucket.is_none() {
            return Err(PublishError::InvalidRequest(format!(
                "{} images are only published through the archive, pass --archive-bucket",
                self.provider
            )));
        }
        Ok(())
    }
}

pub async fn execute(args: NopArgs, config: PublishConfig) -> std::result::Result<(), Box<dyn std::error::Error>> {
    args.validate()?;
    let adapter = NoopAdapter::new(args.provider);
    common::publish(&config, Arc::new(adapter), &args.common, args.provider).await
}
