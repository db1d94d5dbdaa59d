//! CVM Image Core - Foundational Types for Image Publishing
//!
//! This crate provides the request/result model, deterministic resource
//! naming, the secure boot codec and configuration shared by the publishing
//! engine and the CLI.

pub mod cache;
pub mod config;
pub mod error;
pub mod info;
pub mod naming;
pub mod provider;
pub mod request;
pub mod secureboot;
pub mod version;

// Re-export commonly used types
pub use cache::{Clock, SystemClock, TimedCache};
pub use config::{AwsConfig, AzureConfig, DelegateConfig, GcpConfig, PublishConfig, WaitConfig};
pub use error::{PublishError, Result, Stage};
pub use info::{ImageInfo, ImageInfoEntry};
pub use naming::{GalleryNames, NamingScheme, ResourceNames};
pub use provider::Provider;
pub use request::{ImageSource, UploadRequest};
pub use secureboot::{Database, SecureBootPaths, UefiDictionary, UefiVar, UefiVarStore};
pub use version::Version;

/// CVM image tooling version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
