//! `cvm-image aws` command.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use cvm_image_core::{Provider, PublishConfig};
use cvm_image_publish::AwsAdapter;

use super::common::{self, CommonArgs};

#[derive(Args)]
pub struct AwsArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Home region the AMI is registered in
    #[arg(long)]
    pub aws_region: Option<String>,

    /// S3 bucket for the staging upload
    #[arg(long)]
    pub aws_bucket: Option<String>,

    /// Regions the AMI is copied to (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub aws_replication_regions: Option<Vec<String>>,

    /// EC2 UefiData preset dictionary, required with --secure-boot
    #[arg(long, env = "CVM_IMAGE_UEFI_DICTIONARY")]
    pub uefi_dictionary: Option<PathBuf>,
}

impl AwsArgs {
    fn apply(&self, config: &mut PublishConfig) {
        if let Some(region) = &self.aws_region {
            config.aws.region = region.clone();
        }
        if let Some(bucket) = &self.aws_bucket {
            config.aws.bucket = bucket.clone();
        }
        if let Some(regions) = &self.aws_replication_regions {
            config.aws.replication_regions = regions.clone();
        }
        if let Some(dictionary) = &self.uefi_dictionary {
            config.aws.uefi_dictionary = Some(dictionary.clone());
        }
    }
}

pub async fn execute(args: AwsArgs, mut config: PublishConfig) -> Result<(), Box<dyn std::error::Error>> {
    args.apply(&mut config);
    let adapter = AwsAdapter::from_env(config.aws.clone(), config.wait.clone()).await?;
    common::publish(&config, Arc::new(adapter), &args.common, Provider::Aws).await
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
            "aws",
            "--raw-image",
            "/tmp/image.raw",
            "--attestation-variant",
            "aws-sev-snp",
            "--version",
            "v2.16.0",
            "--aws-region",
            "us-east-1",
            "--aws-replication-regions",
            "eu-west-1,us-west-2",
            "--uefi-dictionary",
            "/tmp/aws-uefivars-v0.dict",
        ])
        .unwrap();
        let Command::Aws(args) = cli.command else {
            panic!("expected aws command");
        };

        let mut config = PublishConfig::default();
        args.apply(&mut config);
        assert_eq!(config.aws.region, "us-east-1");
        assert_eq!(config.aws.replication_regions, vec!["eu-west-1", "us-west-2"]);
        assert_eq!(config.aws.bucket, PublishConfig::default().aws.bucket);
        assert_eq!(
            config.aws.uefi_dictionary,
            Some(PathBuf::from("/tmp/aws-uefivars-v0.dict"))
        );
    }
}
