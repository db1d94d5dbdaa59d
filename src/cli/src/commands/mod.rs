//! CLI command definitions and dispatch.

mod aws;
mod azure;
mod common;
mod gcp;
mod nop;
mod uefi_vars;
mod uplosi;
mod version;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// CVM image publisher: turns a raw confidential VM disk image into cloud images.
#[derive(Parser)]
#[command(name = "cvm-image", version, about)]
pub struct Cli {
    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// YAML configuration file
    #[arg(long, global = true, env = "CVM_IMAGE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Publish an AMI in the home region and copy it to the replica regions
    Aws(aws::AwsArgs),
    /// Publish a shared image gallery version and replicate it
    Azure(azure::AzureArgs),
    /// Publish a global Compute Engine image
    Gcp(gcp::GcpArgs),
    /// Publish through the external uplosi tool
    Uplosi(uplosi::UplosiArgs),
    /// Record the image for a provider without native images (QEMU, OpenStack)
    Nop(nop::NopArgs),
    /// Print the AWS UEFI variable store of a PKI directory
    UefiVars(uefi_vars::UefiVarsArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Aws(args) => aws::execute(args, common::load_config(cli.config.as_deref())?).await,
        Command::Azure(args) => {
            azure::execute(args, common::load_config(cli.config.as_deref())?).await
        }
        Command::Gcp(args) => gcp::execute(args, common::load_config(cli.config.as_deref())?).await,
        Command::Uplosi(args) => {
            uplosi::execute(args, common::load_config(cli.config.as_deref())?).await
        }
        Command::Nop(args) => nop::execute(args, common::load_config(cli.config.as_deref())?).await,
        Command::UefiVars(args) => uefi_vars::execute(args).await,
        Command::Version(args) => version::execute(args).await,
    }
}
