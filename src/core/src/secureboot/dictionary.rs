//! Preset zlib dictionary for the AWS UEFI variable store container.
//!
//! The EC2 firmware inflates `UefiData` with a fixed preset dictionary and
//! checks its Adler-32 from the zlib header, so the compressor must be primed
//! with exactly the same bytes. The dictionary is the v0 dictionary of the
//! public awslabs `python-uefivars` encoder. It is not compiled in: it is read
//! verbatim from a file, and encoding without it is refused.

use std::path::Path;

use super::read_file;
use crate::error::{PublishError, Result};

/// File name the dictionary is conventionally stored under.
pub const UEFI_DICTIONARY_FILE: &str = "aws-uefivars-v0.dict";

/// Preset dictionary used when compressing the variable store payload.
#[derive(Clone, PartialEq, Eq)]
pub struct UefiDictionary(Vec<u8>);

impl UefiDictionary {
    /// Wrap dictionary bytes. An empty dictionary is rejected.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.is_empty() {
            return Err(PublishError::InvalidRequest(
                "UEFI variable store dictionary is empty".to_string(),
            ));
        }
        Ok(Self(bytes))
    }

    /// Read the dictionary from a file, byte for byte.
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_bytes(read_file("UEFI dictionary", path)?)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for UefiDictionary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UefiDictionary")
            .field("len", &self.0.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_dictionary_is_rejected() {
        let err = UefiDictionary::from_bytes(Vec::new()).unwrap_err();
        assert!(matches!(err, PublishError::InvalidRequest(_)));
    }

    #[test]
    fn test_from_file_reads_verbatim() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(UEFI_DICTIONARY_FILE);
        std::fs::write(&path, [0u8, 1, 2, 0xff]).unwrap();
        let dict = UefiDictionary::from_file(&path).unwrap();
        assert_eq!(dict.as_bytes(), &[0u8, 1, 2, 0xff]);
    }

    #[test]
    fn test_missing_file_names_it() {
        let tmp = TempDir::new().unwrap();
        let err = UefiDictionary::from_file(&tmp.path().join("missing.dict")).unwrap_err();
        match err {
            PublishError::ReadFile { what, .. } => assert_eq!(what, "UEFI dictionary"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
