use std::path::PathBuf;

use thiserror::Error;

/// Pipeline stage an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    EnsureContainer,
    PreClean,
    Stage,
    Convert,
    Replicate,
    WaitAvailable,
    TagAndPublish,
    CleanupStaging,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Init => "init",
            Stage::EnsureContainer => "setup",
            Stage::PreClean => "pre-cleaning",
            Stage::Stage => "staging",
            Stage::Convert => "converting",
            Stage::Replicate => "replicating",
            Stage::WaitAvailable => "waiting for availability",
            Stage::TagAndPublish => "tagging and publishing",
            Stage::CleanupStaging => "post-cleaning",
        };
        f.write_str(name)
    }
}

/// Image publishing error types
#[derive(Error, Debug)]
pub enum PublishError {
    /// Malformed upload request, rejected before any cloud call
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Provider name that no adapter handles
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    /// Secure boot material or image could not be read
    #[error("Failed to read {what} {}: {source}", path.display())]
    ReadFile {
        what: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Local encoding failed (UEFI variable store, tarball packaging)
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Cloud provider API call failed
    #[error("{provider} API error: {message}")]
    Provider { provider: String, message: String },

    /// Cloud resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// A bounded wait ran out of time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The caller cancelled the run
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// External upload tool failed
    #[error("External tool error: {0}")]
    Tool(String),

    /// A pipeline stage failed
    #[error("{stage}{}: {source}", region.as_ref().map(|r| format!(" in {r}")).unwrap_or_default())]
    Stage {
        stage: Stage,
        region: Option<String>,
        #[source]
        source: Box<PublishError>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl PublishError {
    /// Build a provider API error.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        PublishError::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Wrap an error with the stage (and region) it happened in.
    pub fn in_stage(self, stage: Stage, region: Option<&str>) -> Self {
        PublishError::Stage {
            stage,
            region: region.map(str::to_string),
            source: Box::new(self),
        }
    }

    /// Whether the error means the resource does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            PublishError::NotFound(_) => true,
            PublishError::Stage { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Whether the error was caused by cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            PublishError::Cancelled(_) => true,
            PublishError::Stage { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for PublishError {
    fn from(err: serde_json::Error) -> Self {
        PublishError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for PublishError {
    fn from(err: serde_yaml::Error) -> Self {
        PublishError::Serialization(err.to_string())
    }
}

/// Result type alias for image publishing operations
pub type Result<T> = std::result::Result<T, PublishError>;
