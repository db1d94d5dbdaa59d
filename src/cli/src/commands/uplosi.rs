//! `cvm-image uplosi` command.

use std::sync::Arc;

use clap::Args;
use cvm_image_core::{Provider, PublishConfig};
use cvm_image_publish::DelegateAdapter;

use super::common::{self, CommonArgs};

#[derive(Args)]
pub struct UplosiArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Target provider (aws, azure, gcp, openstack, stackit)
    #[arg(long)]
    pub provider: Provider,

    /// Path of the uplosi binary
    #[arg(long)]
    pub uplosi_path: Option<String>,
}

pub async fn execute(args: UplosiArgs, mut config: PublishConfig) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(path) = &args.uplosi_path {
        config.delegate.binary = path.clone();
    }
    let adapter = DelegateAdapter::new(args.provider, config.clone());
    common::publish(&config, Arc::new(adapter), &args.common, args.provider).await
}

#[cfg(test)]
mod tests {
    use crate::commands::{Cli, Command};
    use clap::Parser;
    use cvm_image_core::Provider;

    #[test]
    fn test_provider_is_case_insensitive() {
        let cli = Cli::try_parse_from([
            "cvm-image",
            "uplosi",
            "--raw-image",
            "/tmp/image.raw",
            "--attestation-variant",
            "qemu-vtpm",
            "--version",
            "v2.16.0",
            "--provider",
            "STACKIT",
        ])
        .unwrap();
        let Command::Uplosi(args) = cli.command else {
            panic!("expected uplosi command");
        };
        assert_eq!(args.provider, Provider::Stackit);
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let result = Cli::try_parse_from([
            "cvm-image",
            "uplosi",
            "--raw-image",
            "/tmp/image.raw",
            "--attestation-variant",
            "qemu-vtpm",
            "--version",
            "v2.16.0",
            "--provider",
            "digitalocean",
        ]);
        assert!(result.is_err());
    }
}
