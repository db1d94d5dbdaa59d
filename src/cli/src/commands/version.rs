//! `cvm-image version` command.

use clap::Args;

#[derive(Args)]
pub struct VersionArgs;

pub async fn execute(_args: VersionArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("cvm-image version {}", cvm_image_core::VERSION);
    Ok(())
}
