//! AWS `UefiData` encoding of a UEFI variable store.
//!
//! Container layout:
//!
//! ```text
//! magic "AMZNUEFI" | crc32c(version || body) LE u32 | version (4 bytes) | body
//! ```
//!
//! `body` is the zlib stream (best compression, preset dictionary) of:
//!
//! ```text
//! u64 count, then per variable:
//!   u64 len, name | u64 len, data | guid (16) | u32 attributes
//!   [timestamp (16) | u64 len, digest]   only with TIME_BASED_AUTHENTICATED_WRITE
//! ```
//!
//! All integers are little-endian. The result is base64 (standard alphabet).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::{Compress, Compression, FlushCompress, Status};

use super::dictionary::UefiDictionary;
use super::uefi::{UefiVar, UefiVarStore};
use crate::error::{PublishError, Result};

/// Container magic.
pub const AWS_MAGIC: &[u8; 8] = b"AMZNUEFI";

/// Container format version.
pub const AWS_VERSION: [u8; 4] = [0, 0, 0, 0];

const OUTPUT_SPARE: usize = 256;

impl UefiVar {
    /// Serialize this variable as one entry of the AWS payload.
    pub fn aws_entry(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            8 + self.name.len() + 8 + self.data.len() + 16 + 4 + 16 + 8 + self.digest.len(),
        );
        write_length_prefixed(&mut out, self.name.as_bytes());
        write_length_prefixed(&mut out, &self.data);
        out.extend_from_slice(&self.guid);
        out.extend_from_slice(&self.attributes.to_le_bytes());
        if self.is_time_based_authenticated() {
            out.extend_from_slice(&self.timestamp);
            write_length_prefixed(&mut out, &self.digest);
        }
        out
    }
}

impl UefiVarStore {
    /// Uncompressed payload: variable count followed by each entry in store order.
    pub fn aws_payload(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(self.len() as u64).to_le_bytes());
        for var in self.vars() {
            payload.extend_from_slice(&var.aws_entry());
        }
        payload
    }

    /// Encode the store as the base64 `UefiData` blob accepted by EC2.
    ///
    /// The output is a pure function of the store contents and the dictionary.
    pub fn to_aws(&self, dictionary: &UefiDictionary) -> Result<String> {
        let compressed = compress_with_dictionary(&self.aws_payload(), dictionary)?;

        let mut checked = Vec::with_capacity(AWS_VERSION.len() + compressed.len());
        checked.extend_from_slice(&AWS_VERSION);
        checked.extend_from_slice(&compressed);
        let crc = crc32c::crc32c(&checked);

        let mut container = Vec::with_capacity(AWS_MAGIC.len() + 4 + checked.len());
        container.extend_from_slice(AWS_MAGIC);
        container.extend_from_slice(&crc.to_le_bytes());
        container.extend_from_slice(&checked);

        Ok(STANDARD.encode(container))
    }
}

fn write_length_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn compress_with_dictionary(payload: &[u8], dictionary: &UefiDictionary) -> Result<Vec<u8>> {
    let mut compressor = Compress::new(Compression::best(), true);
    compressor
        .set_dictionary(dictionary.as_bytes())
        .map_err(|e| PublishError::Encoding(format!("setting zlib dictionary: {e}")))?;

    let mut out = Vec::with_capacity(payload.len() + OUTPUT_SPARE);
    loop {
        if out.capacity() - out.len() < OUTPUT_SPARE {
            out.reserve(OUTPUT_SPARE.max(out.len()));
        }
        let consumed = compressor.total_in() as usize;
        let status = compressor
            .compress_vec(&payload[consumed..], &mut out, FlushCompress::Finish)
            .map_err(|e| PublishError::Encoding(format!("compressing UEFI variables: {e}")))?;
        if status == Status::StreamEnd {
            return Ok(out);
        }
    }
}
