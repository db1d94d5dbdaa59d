//! UEFI variables built from EFI signature list files.

use std::path::Path;

use crate::error::{PublishError, Result};

pub const EFI_VARIABLE_NON_VOLATILE: u32 = 0x0000_0001;
pub const EFI_VARIABLE_BOOTSERVICE_ACCESS: u32 = 0x0000_0002;
pub const EFI_VARIABLE_RUNTIME_ACCESS: u32 = 0x0000_0004;
pub const EFI_VARIABLE_TIME_BASED_AUTHENTICATED_WRITE_ACCESS: u32 = 0x0000_0020;

/// EFI_GLOBAL_VARIABLE (8be4df61-93ca-11d2-aa0d-00e098032b8c), used by PK and KEK.
pub const GLOBAL_VARIABLE_GUID: [u8; 16] = [
    0x61, 0xdf, 0xe4, 0x8b, 0xca, 0x93, 0xd2, 0x11, 0xaa, 0x0d, 0x00, 0xe0, 0x98, 0x03, 0x2b, 0x8c,
];

/// EFI_IMAGE_SECURITY_DATABASE_GUID (d719b2cb-3d3a-4596-a3bc-dad00e67656f), used by db and dbx.
pub const SECURITY_DATABASE_GUID: [u8; 16] = [
    0xcb, 0xb2, 0x19, 0xd7, 0x3a, 0x3d, 0x96, 0x45, 0xa3, 0xbc, 0xda, 0xd0, 0x0e, 0x67, 0x65, 0x6f,
];

const AUTHENTICATED_ATTRIBUTES: u32 = EFI_VARIABLE_NON_VOLATILE
    | EFI_VARIABLE_BOOTSERVICE_ACCESS
    | EFI_VARIABLE_RUNTIME_ACCESS
    | EFI_VARIABLE_TIME_BASED_AUTHENTICATED_WRITE_ACCESS;

const DIGEST_LEN: usize = 32;

/// A single UEFI variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UefiVar {
    pub name: String,
    pub guid: [u8; 16],
    pub data: Vec<u8>,
    pub attributes: u32,
    /// EFI_TIME of the last authenticated write; only encoded for time-based authenticated variables.
    pub timestamp: [u8; 16],
    /// Only encoded for time-based authenticated variables.
    pub digest: Vec<u8>,
}

impl UefiVar {
    /// Wrap the contents of an EFI signature list as an authenticated variable.
    pub fn authenticated(name: impl Into<String>, guid: [u8; 16], data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            guid,
            data,
            attributes: AUTHENTICATED_ATTRIBUTES,
            timestamp: [0; 16],
            digest: vec![0; DIGEST_LEN],
        }
    }

    /// Read an EFI signature list file into an authenticated variable.
    pub fn from_esl_file(name: &str, guid: [u8; 16], path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|source| PublishError::ReadFile {
            what: format!("{name} ESL"),
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::authenticated(name, guid, data))
    }

    /// Whether the time-based authenticated write attribute is set.
    pub fn is_time_based_authenticated(&self) -> bool {
        self.attributes & EFI_VARIABLE_TIME_BASED_AUTHENTICATED_WRITE_ACCESS != 0
    }
}

/// Ordered UEFI variable store: PK, KEK, db and optionally dbx.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UefiVarStore {
    vars: Vec<UefiVar>,
}

impl UefiVarStore {
    /// Build the store from EFI signature list files.
    ///
    /// Without a dbx path the store holds exactly three variables.
    pub fn from_esl_files(pk: &Path, kek: &Path, db: &Path, dbx: Option<&Path>) -> Result<Self> {
        let mut vars = vec![
            UefiVar::from_esl_file("PK", GLOBAL_VARIABLE_GUID, pk)?,
            UefiVar::from_esl_file("KEK", GLOBAL_VARIABLE_GUID, kek)?,
            UefiVar::from_esl_file("db", SECURITY_DATABASE_GUID, db)?,
        ];
        if let Some(dbx) = dbx {
            vars.push(UefiVar::from_esl_file("dbx", SECURITY_DATABASE_GUID, dbx)?);
        }
        Ok(Self { vars })
    }

    /// Build the store from in-memory signature lists.
    pub fn from_signature_lists(pk: Vec<u8>, kek: Vec<u8>, db: Vec<u8>, dbx: Option<Vec<u8>>) -> Self {
        let mut vars = vec![
            UefiVar::authenticated("PK", GLOBAL_VARIABLE_GUID, pk),
            UefiVar::authenticated("KEK", GLOBAL_VARIABLE_GUID, kek),
            UefiVar::authenticated("db", SECURITY_DATABASE_GUID, db),
        ];
        if let Some(dbx) = dbx {
            vars.push(UefiVar::authenticated("dbx", SECURITY_DATABASE_GUID, dbx));
        }
        Self { vars }
    }

    /// Build a store from arbitrary variables, in the given order.
    pub fn from_vars(vars: Vec<UefiVar>) -> Self {
        Self { vars }
    }

    pub fn vars(&self) -> &[UefiVar] {
        &self.vars
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}
