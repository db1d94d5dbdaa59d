//! Secure boot material for image uploads.
//!
//! - `Database`: raw certificates (PK, KEKs, DBs) handed to providers that
//!   accept X.509 certificates directly (GCP shielded instance state).
//! - `UefiVarStore`: UEFI variables built from EFI signature lists, encoded
//!   into the AWS `UefiData` container by `UefiVarStore::to_aws`, primed
//!   with a `UefiDictionary`.

mod aws;
mod dictionary;
mod uefi;

use std::path::{Path, PathBuf};

use crate::error::{PublishError, Result};

pub use aws::{AWS_MAGIC, AWS_VERSION};
pub use dictionary::{UefiDictionary, UEFI_DICTIONARY_FILE};
pub use uefi::{
    UefiVar, UefiVarStore, EFI_VARIABLE_BOOTSERVICE_ACCESS, EFI_VARIABLE_NON_VOLATILE,
    EFI_VARIABLE_RUNTIME_ACCESS, EFI_VARIABLE_TIME_BASED_AUTHENTICATED_WRITE_ACCESS,
    GLOBAL_VARIABLE_GUID, SECURITY_DATABASE_GUID,
};

/// Vendor KEK shipped next to the platform's own KEK.
pub const VENDOR_KEK_CERT: &str = "MicCorKEKCA2011_2011-06-24.crt";

/// Vendor signature database certificates shipped next to the platform's own db cert.
pub const VENDOR_DB_CERTS: [&str; 2] = [
    "MicWinProPCA2011_2011-10-19.crt",
    "MicCorUEFCA2011_2011-06-27.crt",
];

/// Secure boot database that providers use when enabling secure boot.
///
/// KEK and DB order is the order the certificates are presented to the
/// guest firmware.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Database {
    /// Platform key.
    pub pk: Vec<u8>,
    /// Trusted key exchange keys.
    pub keks: Vec<Vec<u8>>,
    /// Signature database entries.
    pub dbs: Vec<Vec<u8>>,
}

impl Database {
    /// Load the database from individual certificate files.
    ///
    /// Fails on the first unreadable file, naming it; no partial database is returned.
    pub fn from_files(pk: &Path, keks: &[PathBuf], dbs: &[PathBuf]) -> Result<Self> {
        let pk = read_file("PK", pk)?;
        let keks = keks
            .iter()
            .map(|path| read_file("KEK", path))
            .collect::<Result<Vec<_>>>()?;
        let dbs = dbs
            .iter()
            .map(|path| read_file("DB", path))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { pk, keks, dbs })
    }
}

/// File locations of secure boot material inside a PKI directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureBootPaths {
    pub pk_cert: PathBuf,
    pub kek_certs: Vec<PathBuf>,
    pub db_certs: Vec<PathBuf>,
    pub pk_esl: PathBuf,
    pub kek_esl: PathBuf,
    pub db_esl: PathBuf,
    /// Only set when `dbx.esl` exists in the directory.
    pub dbx_esl: Option<PathBuf>,
}

impl SecureBootPaths {
    /// Resolve the fixed file layout of a PKI directory.
    pub fn from_pki_dir(pki: &Path) -> Self {
        let dbx = pki.join("dbx.esl");
        Self {
            pk_cert: pki.join("PK.cer"),
            kek_certs: vec![pki.join("KEK.cer"), pki.join(VENDOR_KEK_CERT)],
            db_certs: std::iter::once(pki.join("db.cer"))
                .chain(VENDOR_DB_CERTS.iter().map(|name| pki.join(name)))
                .collect(),
            pk_esl: pki.join("PK.esl"),
            kek_esl: pki.join("KEK.esl"),
            db_esl: pki.join("db.esl"),
            dbx_esl: dbx.is_file().then_some(dbx),
        }
    }

    /// Load the certificate database.
    pub fn database(&self) -> Result<Database> {
        Database::from_files(&self.pk_cert, &self.kek_certs, &self.db_certs)
    }

    /// Load the UEFI variable store from the signature lists.
    pub fn var_store(&self) -> Result<UefiVarStore> {
        UefiVarStore::from_esl_files(
            &self.pk_esl,
            &self.kek_esl,
            &self.db_esl,
            self.dbx_esl.as_deref(),
        )
    }
}

pub(crate) fn read_file(what: &str, path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|source| PublishError::ReadFile {
        what: what.to_string(),
        path: path.to_path_buf(),
        source,
    })
}
