//! Cloud Storage and Compute Engine over their JSON APIs.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cvm_image_core::error::{PublishError, Result};
use reqwest::Method;
use serde_json::{json, Value};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use super::client::{GceApi, GcsApi, ImageSpec, ImageStatus, ShieldedState};
use crate::auth::TokenSource;
use crate::poll::{poll_until, PollConfig};
use crate::rest::{str_at, url_with_segments, RestClient};

const STORAGE_API: &str = "https://storage.googleapis.com/storage/v1/b";
const UPLOAD_API: &str = "https://storage.googleapis.com/upload/storage/v1/b";
const PUBLIC_OBJECT_BASE: &str = "https://storage.googleapis.com";
const COMPUTE_API: &str = "https://compute.googleapis.com/compute/v1/projects";

/// Each `wait` call blocks server side for up to two minutes.
const OPERATION_POLL: Duration = Duration::from_secs(1);
const OPERATION_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Google Cloud client for one project.
pub struct GoogleCloud {
    rest: RestClient,
    project: String,
}

impl GoogleCloud {
    pub fn new(tokens: Arc<dyn TokenSource>, project: impl Into<String>) -> Self {
        Self {
            rest: RestClient::new("GCP", tokens),
            project: project.into(),
        }
    }

    fn images_url(&self, segments: &[&str]) -> Result<String> {
        let mut all = vec![self.project.as_str(), "global", "images"];
        all.extend_from_slice(segments);
        Ok(url_with_segments(COMPUTE_API, &all)?.to_string())
    }

    fn operation_wait_url(&self, operation: &str) -> Result<String> {
        Ok(url_with_segments(
            COMPUTE_API,
            &[self.project.as_str(), "global", "operations", operation, "wait"],
        )?
        .to_string())
    }

    /// Wait for a global operation returned by a mutating call.
    async fn wait_operation(&self, operation: &Value) -> Result<()> {
        let name = str_at(operation, "/name")
            .ok_or_else(|| self.rest.error("operation response without a name"))?
            .to_string();
        let url = self.operation_wait_url(&name)?;
        let rest = &self.rest;
        let config = PollConfig::new(OPERATION_POLL, OPERATION_TIMEOUT);
        let done = poll_until(&format!("operation {name}"), config, &CancellationToken::new(), move || {
            let url = url.clone();
            async move {
                let response = rest.send_existing(Method::POST, &url, None).await?;
                Ok((str_at(&response.body, "/status") == Some("DONE")).then_some(response.body))
            }
        })
        .await?;
        match operation_error(&done) {
            Some(message) => Err(self.rest.error(format!("operation {name} failed: {message}"))),
            None => Ok(()),
        }
    }
}

fn operation_error(operation: &Value) -> Option<String> {
    let errors = operation.pointer("/error/errors")?.as_array()?;
    let messages: Vec<&str> = errors
        .iter()
        .filter_map(|e| str_at(e, "/message"))
        .collect();
    if messages.is_empty() {
        None
    } else {
        Some(messages.join("; "))
    }
}

fn certificate(content: &[u8]) -> Value {
    json!({ "content": STANDARD.encode(content), "fileType": "X509" })
}

pub(crate) fn shielded_state_body(state: &ShieldedState) -> Value {
    json!({
        "pk": certificate(&state.pk),
        "keks": state.keks.iter().map(|k| certificate(k)).collect::<Vec<_>>(),
        "dbs": state.dbs.iter().map(|d| certificate(d)).collect::<Vec<_>>(),
    })
}

pub(crate) fn image_body(spec: &ImageSpec) -> Value {
    let mut body = json!({
        "name": spec.name,
        "description": spec.description,
        "architecture": "X86_64",
        "rawDisk": { "source": spec.source_uri },
        "guestOsFeatures": spec
            .guest_os_features
            .iter()
            .map(|feature| json!({ "type": feature }))
            .collect::<Vec<_>>(),
    });
    if let Some(family) = &spec.family {
        body["family"] = json!(family);
    }
    if let Some(state) = &spec.shielded_state {
        body["shieldedInstanceInitialState"] = shielded_state_body(state);
    }
    body
}

pub(crate) fn parse_image_status(image: &Value) -> ImageStatus {
    match str_at(image, "/status") {
        Some("READY") => ImageStatus::Ready,
        Some("FAILED") | Some("DELETING") => ImageStatus::Failed(
            str_at(image, "/status").unwrap_or_default().to_lowercase(),
        ),
        _ => ImageStatus::Pending,
    }
}

fn public_iam_policy() -> Value {
    json!({
        "policy": {
            "bindings": [{
                "role": "roles/compute.imageUser",
                "members": ["allAuthenticatedUsers"],
            }]
        }
    })
}

#[async_trait]
impl GcsApi for GoogleCloud {
    async fn ensure_bucket(&self, bucket: &str, location: &str) -> Result<()> {
        let url = url_with_segments(STORAGE_API, &[bucket])?;
        if self.rest.get(url.as_str()).await?.is_some() {
            return Ok(());
        }
        let mut create = reqwest::Url::parse(STORAGE_API)
            .map_err(|e| PublishError::Config(format!("invalid URL {STORAGE_API}: {e}")))?;
        create.query_pairs_mut().append_pair("project", &self.project);
        let body = json!({
            "name": bucket,
            "location": location,
            "iamConfiguration": { "publicAccessPrevention": "enforced" },
        });
        self.rest
            .send_existing(Method::POST, create.as_str(), Some(&body))
            .await?;
        tracing::info!(bucket = %bucket, location = %location, "Created bucket");
        Ok(())
    }

    async fn upload_file(&self, bucket: &str, object: &str, path: &Path) -> Result<String> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|source| PublishError::ReadFile {
                what: "staging archive".to_string(),
                path: path.to_path_buf(),
                source,
            })?;
        let mut url = url_with_segments(UPLOAD_API, &[bucket, "o"])?;
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", object);
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        self.rest
            .send_body(Method::POST, url.as_str(), "application/gzip", body)
            .await?
            .ok_or_else(|| PublishError::NotFound(format!("bucket {bucket}")))?;
        Ok(format!("{PUBLIC_OBJECT_BASE}/{bucket}/{object}"))
    }

    async fn delete_object(&self, bucket: &str, object: &str) -> Result<()> {
        let url = url_with_segments(STORAGE_API, &[bucket, "o", object])?;
        self.rest.send(Method::DELETE, url.as_str(), None).await?;
        Ok(())
    }
}

#[async_trait]
impl GceApi for GoogleCloud {
    async fn delete_image(&self, name: &str) -> Result<()> {
        let url = self.images_url(&[name])?;
        match self.rest.send(Method::DELETE, &url, None).await? {
            Some(response) => self.wait_operation(&response.body).await,
            None => Ok(()),
        }
    }

    async fn create_image(&self, spec: &ImageSpec) -> Result<String> {
        let url = self.images_url(&[])?;
        let body = image_body(spec);
        let response = self.rest.send_existing(Method::POST, &url, Some(&body)).await?;
        self.wait_operation(&response.body).await?;

        let image = self.rest.get_existing(&self.images_url(&[&spec.name])?).await?;
        str_at(&image, "/selfLink")
            .map(str::to_string)
            .ok_or_else(|| self.rest.error(format!("image {} has no self link", spec.name)))
    }

    async fn image_status(&self, name: &str) -> Result<Option<ImageStatus>> {
        let url = self.images_url(&[name])?;
        Ok(self.rest.get(&url).await?.as_ref().map(parse_image_status))
    }

    async fn make_public(&self, name: &str) -> Result<()> {
        let url = self.images_url(&[name, "setIamPolicy"])?;
        self.rest
            .send_existing(Method::POST, &url, Some(&public_iam_policy()))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;

    fn client() -> GoogleCloud {
        GoogleCloud::new(Arc::new(StaticToken("t".to_string())), "my-project")
    }

    #[test]
    fn test_image_urls() {
        let gcp = client();
        assert_eq!(
            gcp.images_url(&["cvm-v2-16-0", "setIamPolicy"]).unwrap(),
            "https://compute.googleapis.com/compute/v1/projects/my-project/global/images/cvm-v2-16-0/setIamPolicy"
        );
        assert_eq!(
            gcp.operation_wait_url("operation-1").unwrap(),
            "https://compute.googleapis.com/compute/v1/projects/my-project/global/operations/operation-1/wait"
        );
    }

    #[test]
    fn test_image_body() {
        let spec = ImageSpec {
            name: "cvm-v2-16-0".to_string(),
            description: "CVM image".to_string(),
            family: Some("cvm".to_string()),
            source_uri: "https://storage.googleapis.com/b/cvm.tar.gz".to_string(),
            guest_os_features: vec!["GVNIC".to_string(), "SEV_CAPABLE".to_string()],
            shielded_state: Some(ShieldedState {
                pk: b"pk".to_vec(),
                keks: vec![b"kek".to_vec()],
                dbs: vec![b"db1".to_vec(), b"db2".to_vec()],
            }),
        };
        let body = image_body(&spec);
        assert_eq!(body["family"], "cvm");
        assert_eq!(body["rawDisk"]["source"], spec.source_uri);
        assert_eq!(body["guestOsFeatures"][1]["type"], "SEV_CAPABLE");
        let state = &body["shieldedInstanceInitialState"];
        assert_eq!(state["pk"]["content"], STANDARD.encode(b"pk"));
        assert_eq!(state["pk"]["fileType"], "X509");
        assert_eq!(state["dbs"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_image_body_without_optionals() {
        let spec = ImageSpec {
            name: "n".to_string(),
            description: String::new(),
            family: None,
            source_uri: "u".to_string(),
            guest_os_features: Vec::new(),
            shielded_state: None,
        };
        let body = image_body(&spec);
        assert!(body.get("family").is_none());
        assert!(body.get("shieldedInstanceInitialState").is_none());
    }

    #[test]
    fn test_parse_image_status() {
        assert_eq!(parse_image_status(&json!({"status": "READY"})), ImageStatus::Ready);
        assert_eq!(parse_image_status(&json!({"status": "PENDING"})), ImageStatus::Pending);
        assert_eq!(
            parse_image_status(&json!({"status": "FAILED"})),
            ImageStatus::Failed("failed".to_string())
        );
    }

    #[test]
    fn test_operation_error() {
        let op = json!({"status": "DONE", "error": {"errors": [{"message": "quota"}, {"message": "denied"}]}});
        assert_eq!(operation_error(&op).as_deref(), Some("quota; denied"));
        assert_eq!(operation_error(&json!({"status": "DONE"})), None);
    }

    #[test]
    fn test_public_iam_policy() {
        let policy = public_iam_policy();
        assert_eq!(policy["policy"]["bindings"][0]["members"][0], "allAuthenticatedUsers");
    }
}
