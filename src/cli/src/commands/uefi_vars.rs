//! `cvm-image uefi-vars` command.

use std::path::PathBuf;

use clap::Args;
use cvm_image_core::{SecureBootPaths, UefiDictionary};

#[derive(Args)]
pub struct UefiVarsArgs {
    /// Directory with PK.esl, KEK.esl, db.esl and optionally dbx.esl
    #[arg(long)]
    pub pki: PathBuf,

    /// EC2 UefiData preset dictionary
    #[arg(long, env = "CVM_IMAGE_UEFI_DICTIONARY")]
    pub uefi_dictionary: PathBuf,
}

pub async fn execute(args: UefiVarsArgs) -> Result<(), Box<dyn std::error::Error>> {
    let dictionary = UefiDictionary::from_file(&args.uefi_dictionary)?;
    let store = SecureBootPaths::from_pki_dir(&args.pki).var_store()?;
    println!("{}", store.to_aws(&dictionary)?);
    Ok(())
}
