//! `cvm-image gcp` command.

use std::sync::Arc;

use clap::Args;
use cvm_image_core::{Provider, PublishConfig};
use cvm_image_publish::{CliTokenSource, GcpAdapter};

use super::common::{self, CommonArgs};

#[derive(Args)]
pub struct GcpArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Project the image is created in
    #[arg(long)]
    pub gcp_project: Option<String>,

    /// Location of the staging bucket
    #[arg(long)]
    pub gcp_location: Option<String>,

    /// Staging bucket
    #[arg(long)]
    pub gcp_bucket: Option<String>,
}

impl GcpArgs {
    fn apply(&self, config: &mut PublishConfig) {
        if let Some(project) = &self.gcp_project {
            config.gcp.project = project.clone();
        }
        if let Some(location) = &self.gcp_location {
            config.gcp.location = location.clone();
        }
        if let Some(bucket) = &self.gcp_bucket {
            config.gcp.bucket = bucket.clone();
        }
    }
}

pub async fn execute(args: GcpArgs, mut config: PublishConfig) -> Result<(), Box<dyn std::error::Error>> {
    args.apply(&mut config);
    if config.gcp.project.is_empty() {
        return Err("GCP project is required".into());
    }
    let adapter = GcpAdapter::with_tokens(
        Arc::new(CliTokenSource::gcp()),
        config.gcp.clone(),
        config.wait.clone(),
    );
    common::publish(&config, Arc::new(adapter), &args.common, Provider::Gcp).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{Cli, Command};
    use clap::Parser;

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::try_parse_from([
            "cvm-image",
            "gcp",
            "--raw-image",
            "/tmp/image.raw",
            "--attestation-variant",
            "gcp-sev-snp",
            "--version",
            "v2.16.0",
            "--gcp-project",
            "images-prod",
        ])
        .unwrap();
        let Command::Gcp(args) = cli.command else {
            panic!("expected gcp command");
        };

        let mut config = PublishConfig::default();
        args.apply(&mut config);
        assert_eq!(config.gcp.project, "images-prod");
        assert_eq!(config.gcp.location, "europe-west3");
    }
}
