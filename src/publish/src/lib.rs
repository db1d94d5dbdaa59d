//! CVM Image Publish - provider adapters and the publishing pipeline.
//!
//! This crate turns a raw disk image into native cloud images: one adapter
//! per provider (AWS, Azure, GCP, an external upload tool and no-op
//! providers), the cloud clients behind them and the pipeline that drives
//! an adapter through staging, conversion, replication and publication.

#![allow(clippy::result_large_err)]

pub mod adapter;
pub mod auth;
pub mod aws;
pub mod azure;
pub mod chunk;
pub mod delegate;
pub mod gcp;
pub mod noop;
pub mod pipeline;
pub mod poll;
pub mod record;
pub mod rest;

// Re-export common types
pub use adapter::{ImageHandle, ProviderAdapter, RunContext, SharedAdapter};
pub use auth::{CliTokenSource, StaticToken, TokenSource};
pub use aws::AwsAdapter;
pub use azure::AzureAdapter;
pub use delegate::DelegateAdapter;
pub use gcp::GcpAdapter;
pub use noop::NoopAdapter;
pub use pipeline::PublishPipeline;
pub use poll::{poll_until, PollConfig};
pub use record::{publish_and_record, ArchiveClient, S3Archive, VersionsClient};
