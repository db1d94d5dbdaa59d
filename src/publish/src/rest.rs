//! Minimal authenticated JSON-over-HTTPS client for management APIs.

use std::sync::Arc;

use cvm_image_core::error::{PublishError, Result};
use reqwest::{Method, StatusCode};
use serde_json::Value;

use crate::auth::TokenSource;

/// Response of a successful call.
#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: StatusCode,
    /// `Azure-AsyncOperation` header, if any.
    pub async_operation: Option<String>,
    /// `Location` header, if any.
    pub location: Option<String>,
    /// JSON body; `Null` for empty bodies.
    pub body: Value,
}

/// Bearer-token JSON client bound to one provider.
#[derive(Clone)]
pub struct RestClient {
    provider: &'static str,
    http: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
}

impl RestClient {
    pub fn new(provider: &'static str, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            provider,
            http: reqwest::Client::new(),
            tokens,
        }
    }

    /// Provider name used in error messages.
    pub fn provider(&self) -> &'static str {
        self.provider
    }

    /// Underlying HTTP client, for unauthenticated calls (SAS URLs).
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn error(&self, message: impl Into<String>) -> PublishError {
        PublishError::provider(self.provider, message)
    }

    /// Send a request; `Ok(None)` when the resource does not exist.
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Option<RestResponse>> {
        let token = self.tokens.token().await?;
        tracing::debug!(method = %method, url = %url, "{} request", self.provider);

        let mut request = self.http.request(method.clone(), url).bearer_auth(token);
        request = match body {
            Some(body) => request.json(body),
            None => request.header(reqwest::header::CONTENT_LENGTH, 0),
        };
        let response = request
            .send()
            .await
            .map_err(|e| self.error(format!("{method} {url}: {e}")))?;
        self.read(method, url, response).await
    }

    /// Send a request with a raw body (uploads).
    pub async fn send_body(
        &self,
        method: Method,
        url: &str,
        content_type: &str,
        body: reqwest::Body,
    ) -> Result<Option<RestResponse>> {
        let token = self.tokens.token().await?;
        tracing::debug!(method = %method, url = %url, "{} upload", self.provider);
        let response = self
            .http
            .request(method.clone(), url)
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| self.error(format!("{method} {url}: {e}")))?;
        self.read(method, url, response).await
    }

    /// GET a JSON document; `Ok(None)` when it does not exist.
    pub async fn get(&self, url: &str) -> Result<Option<Value>> {
        Ok(self.send(Method::GET, url, None).await?.map(|r| r.body))
    }

    /// Like [`RestClient::get`] but a missing resource is an error.
    pub async fn get_existing(&self, url: &str) -> Result<Value> {
        self.get(url)
            .await?
            .ok_or_else(|| PublishError::NotFound(url.to_string()))
    }

    /// Send a request whose target must exist.
    pub async fn send_existing(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<RestResponse> {
        self.send(method, url, body)
            .await?
            .ok_or_else(|| PublishError::NotFound(url.to_string()))
    }

    async fn read(
        &self,
        method: Method,
        url: &str,
        response: reqwest::Response,
    ) -> Result<Option<RestResponse>> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let async_operation = header(&response, "azure-asyncoperation");
        let location = header(&response, reqwest::header::LOCATION.as_str());
        let text = response
            .text()
            .await
            .map_err(|e| self.error(format!("reading response of {method} {url}: {e}")))?;
        if !status.is_success() {
            return Err(self.error(format!(
                "{method} {url} returned {status}: {}",
                error_message(&text)
            )));
        }
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text)?
        };
        Ok(Some(RestResponse {
            status,
            async_operation,
            location,
            body,
        }))
    }
}

fn header(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Extract `error.message` from a management API error body, falling back to the raw text.
pub fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

/// Read a string field by JSON pointer.
pub fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

/// Append path segments to `base`, percent-encoding each one.
pub fn url_with_segments(base: &str, segments: &[&str]) -> Result<reqwest::Url> {
    let mut url = reqwest::Url::parse(base)
        .map_err(|e| PublishError::Config(format!("invalid URL {base}: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| PublishError::Config(format!("URL {base} cannot carry a path")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}
