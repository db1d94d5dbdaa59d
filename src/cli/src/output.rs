//! Writing publication results.

use std::path::PathBuf;

use async_trait::async_trait;
use cvm_image_core::error::Result;
use cvm_image_core::ImageInfo;
use cvm_image_publish::VersionsClient;

/// Records [`ImageInfo`] as pretty JSON in a file, or on stdout when no file is set.
#[derive(Debug, Clone, Default)]
pub struct InfoWriter {
    out: Option<PathBuf>,
}

impl InfoWriter {
    pub fn new(out: Option<PathBuf>) -> Self {
        Self { out }
    }

    pub fn write(&self, info: &ImageInfo) -> Result<()> {
        let json = info.to_json()?;
        match &self.out {
            Some(path) => {
                std::fs::write(path, format!("{json}\n"))?;
                tracing::info!(path = %path.display(), entries = info.list.len(), "Wrote image info");
            }
            None => println!("{json}"),
        }
        Ok(())
    }
}

#[async_trait]
impl VersionsClient for InfoWriter {
    async fn upload_image_info(&self, info: &ImageInfo) -> Result<()> {
        self.write(info)
    }
}
