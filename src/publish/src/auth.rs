//! Bearer tokens for the REST based adapters (Azure, GCP).
//!
//! Credentials are passed through, never managed: a token is taken from an
//! environment variable or printed by the provider's own CLI, then cached
//! for a bounded time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cvm_image_core::error::{PublishError, Result};
use cvm_image_core::{Clock, SystemClock, TimedCache};
use tokio::process::Command;

/// Environment variable holding an Azure Resource Manager token.
pub const AZURE_TOKEN_ENV: &str = "AZURE_ACCESS_TOKEN";

/// Environment variable holding a Google OAuth access token.
pub const GOOGLE_TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

/// Tokens from both CLIs are valid for an hour; refresh well before that.
const TOKEN_TTL: Duration = Duration::from_secs(45 * 60);

/// Source of bearer tokens.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<String>;
}

/// Fixed token, mainly for tests and short lived CI credentials.
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Token from an environment variable, falling back to a CLI command.
pub struct CliTokenSource {
    env_var: &'static str,
    program: &'static str,
    args: Vec<&'static str>,
    cache: TimedCache<String>,
}

impl CliTokenSource {
    /// Azure Resource Manager token (`az account get-access-token`).
    pub fn azure() -> Self {
        Self::new(
            AZURE_TOKEN_ENV,
            "az",
            vec![
                "account",
                "get-access-token",
                "--resource",
                "https://management.azure.com/",
                "--query",
                "accessToken",
                "--output",
                "tsv",
            ],
            Arc::new(SystemClock),
        )
    }

    /// Google Cloud token (`gcloud auth print-access-token`).
    pub fn gcp() -> Self {
        Self::new(
            GOOGLE_TOKEN_ENV,
            "gcloud",
            vec!["auth", "print-access-token"],
            Arc::new(SystemClock),
        )
    }

    pub fn new(
        env_var: &'static str,
        program: &'static str,
        args: Vec<&'static str>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            env_var,
            program,
            args,
            cache: TimedCache::with_clock(TOKEN_TTL, clock),
        }
    }

    async fn fetch(&self) -> Result<String> {
        if let Ok(token) = std::env::var(self.env_var) {
            if !token.trim().is_empty() {
                tracing::debug!(source = self.env_var, "Using access token from environment");
                return Ok(token.trim().to_string());
            }
        }

        tracing::debug!(program = self.program, "Requesting access token");
        let output = Command::new(self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                PublishError::Config(format!(
                    "no {} set and running {} failed: {}",
                    self.env_var, self.program, e
                ))
            })?;
        if !output.status.success() {
            return Err(PublishError::Config(format!(
                "{} could not provide an access token: {}",
                self.program,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(PublishError::Config(format!(
                "{} returned an empty access token",
                self.program
            )));
        }
        Ok(token)
    }
}

#[async_trait]
impl TokenSource for CliTokenSource {
    async fn token(&self) -> Result<String> {
        if let Some(token) = self.cache.get() {
            return Ok(token);
        }
        let token = self.fetch().await?;
        self.cache.set(token.clone());
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_token() {
        let source = StaticToken("abc".to_string());
        assert_eq!(source.token().await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_env_token_is_used_and_cached() {
        std::env::set_var("CVM_IMAGE_TEST_TOKEN_A", " from-env \n");
        let source = CliTokenSource::new(
            "CVM_IMAGE_TEST_TOKEN_A",
            "definitely-not-a-real-binary",
            vec![],
            Arc::new(SystemClock),
        );
        assert_eq!(source.token().await.unwrap(), "from-env");

        std::env::remove_var("CVM_IMAGE_TEST_TOKEN_A");
        assert_eq!(source.token().await.unwrap(), "from-env");
    }

    #[tokio::test]
    async fn test_cli_token() {
        let source = CliTokenSource::new(
            "CVM_IMAGE_TEST_TOKEN_UNSET",
            "echo",
            vec!["cli-token"],
            Arc::new(SystemClock),
        );
        assert_eq!(source.token().await.unwrap(), "cli-token");
    }

    #[tokio::test]
    async fn test_missing_cli_is_config_error() {
        let source = CliTokenSource::new(
            "CVM_IMAGE_TEST_TOKEN_UNSET",
            "definitely-not-a-real-binary",
            vec![],
            Arc::new(SystemClock),
        );
        let err = source.token().await.unwrap_err();
        assert!(matches!(err, PublishError::Config(_)));
    }
}
