//! `cvm-image azure` command.

use std::sync::Arc;

use clap::Args;
use cvm_image_core::{Provider, PublishConfig};
use cvm_image_publish::{AzureAdapter, CliTokenSource};

use super::common::{self, CommonArgs};

#[derive(Args)]
pub struct AzureArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Subscription ID
    #[arg(long)]
    pub az_subscription: Option<String>,

    /// Home location of disks, images and galleries
    #[arg(long)]
    pub az_location: Option<String>,

    /// Resource group
    #[arg(long)]
    pub az_resource_group: Option<String>,

    /// Publish into this gallery instead of the derived one
    #[arg(long)]
    pub az_gallery: Option<String>,

    /// Regions the image version is replicated to (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub az_replication_regions: Option<Vec<String>>,
}

impl AzureArgs {
    fn apply(&self, config: &mut PublishConfig) {
        let azure = &mut config.azure;
        if let Some(subscription) = &self.az_subscription {
            azure.subscription = subscription.clone();
        }
        if let Some(location) = &self.az_location {
            azure.location = location.clone();
        }
        if let Some(group) = &self.az_resource_group {
            azure.resource_group = group.clone();
        }
        if self.az_gallery.is_some() {
            azure.gallery_override = self.az_gallery.clone();
        }
        if self.az_replication_regions.is_some() {
            azure.replication_regions = self.az_replication_regions.clone();
        }
    }
}

pub async fn execute(args: AzureArgs, mut config: PublishConfig) -> Result<(), Box<dyn std::error::Error>> {
    args.apply(&mut config);
    if config.azure.subscription.is_empty() || config.azure.resource_group.is_empty() {
        return Err("Azure subscription and resource group are required".into());
    }
    let adapter = AzureAdapter::with_tokens(
        Arc::new(CliTokenSource::azure()),
        config.azure.clone(),
        config.wait.clone(),
        config.prefix.clone(),
    );
    common::publish(&config, Arc::new(adapter), &args.common, Provider::Azure).await
}
