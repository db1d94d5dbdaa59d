//! [`AzureApi`] over the Azure Resource Manager REST API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cvm_image_core::error::Result;
use reqwest::Method;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::client::{
    normalize_region, AzureApi, ImageDefinition, ImageVersion, RegionReplication, ReplicationState,
};
use crate::auth::TokenSource;
use crate::poll::{poll_until, PollConfig};
use crate::rest::{str_at, RestClient, RestResponse};

const MANAGEMENT_URL: &str = "https://management.azure.com";
const DISK_API_VERSION: &str = "2023-04-02";
const IMAGE_API_VERSION: &str = "2023-07-01";
const GALLERY_API_VERSION: &str = "2022-03-03";
/// Blob service version for page writes through a SAS URL.
const BLOB_API_VERSION: &str = "2021-08-06";

/// Lifetime of upload SAS tokens (24 hours).
const UPLOAD_ACCESS_SECS: u64 = 86_400;

/// Upper bound for a single long running operation.
const OPERATION_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// ARM client for one subscription and resource group.
pub struct ArmClient {
    rest: RestClient,
    subscription: String,
    resource_group: String,
    polling_interval: Duration,
}

impl ArmClient {
    pub fn new(
        tokens: Arc<dyn TokenSource>,
        subscription: impl Into<String>,
        resource_group: impl Into<String>,
        polling_interval: Duration,
    ) -> Self {
        Self {
            rest: RestClient::new("Azure", tokens),
            subscription: subscription.into(),
            resource_group: resource_group.into(),
            polling_interval,
        }
    }

    fn compute_path(&self) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute",
            self.subscription, self.resource_group
        )
    }

    /// Resource id of a managed disk.
    pub fn disk_id(&self, name: &str) -> String {
        format!("{}/disks/{name}", self.compute_path())
    }

    fn url(id: &str, api_version: &str) -> String {
        format!("{MANAGEMENT_URL}{id}?api-version={api_version}")
    }

    fn disk_url(&self, name: &str) -> String {
        Self::url(&self.disk_id(name), DISK_API_VERSION)
    }

    fn disk_action_url(&self, name: &str, action: &str) -> String {
        Self::url(&format!("{}/{action}", self.disk_id(name)), DISK_API_VERSION)
    }

    fn image_url(&self, name: &str) -> String {
        Self::url(&format!("{}/images/{name}", self.compute_path()), IMAGE_API_VERSION)
    }

    fn gallery_url(&self, gallery: &str) -> String {
        Self::url(&format!("{}/galleries/{gallery}", self.compute_path()), GALLERY_API_VERSION)
    }

    fn definition_url(&self, gallery: &str, definition: &str) -> String {
        Self::url(
            &format!("{}/galleries/{gallery}/images/{definition}", self.compute_path()),
            GALLERY_API_VERSION,
        )
    }

    fn version_url(&self, gallery: &str, definition: &str, version: &str) -> String {
        Self::url(
            &format!(
                "{}/galleries/{gallery}/images/{definition}/versions/{version}",
                self.compute_path()
            ),
            GALLERY_API_VERSION,
        )
    }

    /// Wait for a long running operation started by `response`.
    ///
    /// Returns the operation output, the resource at `resource_url` once the
    /// operation finished, or the response body for synchronous calls.
    async fn complete(&self, response: RestResponse, resource_url: Option<&str>) -> Result<Value> {
        let config = PollConfig::new(self.polling_interval, OPERATION_TIMEOUT);
        let cancel = CancellationToken::new();
        let rest = &self.rest;

        if let Some(operation) = response.async_operation.as_deref() {
            let status = poll_until("Azure operation", config, &cancel, move || async move {
                let body = rest.get_existing(operation).await?;
                let status = str_at(&body, "/status").map(str::to_string);
                match status.as_deref() {
                    Some("Succeeded") => Ok(Some(body)),
                    Some(state @ ("Failed" | "Canceled")) => Err(rest.error(format!(
                        "operation {state}: {}",
                        str_at(&body, "/error/message").unwrap_or("no details")
                    ))),
                    _ => Ok(None),
                }
            })
            .await?;
            if let Some(output) = status.pointer("/properties/output") {
                return Ok(output.clone());
            }
            return match resource_url {
                Some(url) => rest.get_existing(url).await,
                None => Ok(Value::Null),
            };
        }

        if response.status == reqwest::StatusCode::ACCEPTED {
            if let Some(location) = response.location.as_deref() {
                return poll_until("Azure operation", config, &cancel, move || async move {
                    match rest.send(Method::GET, location, None).await? {
                        Some(r) if r.status == reqwest::StatusCode::ACCEPTED => Ok(None),
                        Some(r) => Ok(Some(r.body)),
                        None => Ok(Some(Value::Null)),
                    }
                })
                .await;
            }
        }
        Ok(response.body)
    }

    async fn put(&self, url: &str, body: &Value) -> Result<Value> {
        let response = self.rest.send_existing(Method::PUT, url, Some(body)).await?;
        self.complete(response, Some(url)).await
    }

    async fn delete(&self, url: &str) -> Result<()> {
        match self.rest.send(Method::DELETE, url, None).await? {
            Some(response) => self.complete(response, None).await.map(|_| ()),
            None => Ok(()),
        }
    }
}

fn disk_body(location: &str, size_bytes: u64) -> Value {
    json!({
        "location": location,
        "sku": { "name": "Standard_LRS" },
        "properties": {
            "osType": "Linux",
            "hyperVGeneration": "V2",
            "creationData": {
                "createOption": "Upload",
                "uploadSizeBytes": size_bytes,
            },
        },
    })
}

fn managed_image_body(location: &str, disk_id: &str) -> Value {
    json!({
        "location": location,
        "properties": {
            "hyperVGeneration": "V2",
            "storageProfile": {
                "osDisk": {
                    "osType": "Linux",
                    "osState": "Generalized",
                    "managedDisk": { "id": disk_id },
                },
            },
        },
    })
}

fn definition_body(definition: &ImageDefinition) -> Value {
    let features: Vec<Value> = definition
        .security_type
        .iter()
        .map(|value| json!({ "name": "SecurityType", "value": value }))
        .collect();
    json!({
        "location": definition.location,
        "properties": {
            "identifier": {
                "publisher": definition.publisher,
                "offer": definition.offer,
                "sku": definition.sku,
            },
            "osState": "Generalized",
            "osType": "Linux",
            "architecture": "x64",
            "hyperVGeneration": "V2",
            "features": features,
        },
    })
}

fn target_regions_body(regions: &[String]) -> Value {
    Value::Array(
        regions
            .iter()
            .map(|name| json!({ "name": name, "regionalReplicaCount": 1 }))
            .collect(),
    )
}

fn version_body(version: &ImageVersion) -> Value {
    json!({
        "location": version.location,
        "properties": {
            "storageProfile": {
                "osDiskImage": { "hostCaching": "ReadOnly" },
                "source": { "id": version.source_image_id },
            },
            "publishingProfile": {
                "replicaCount": 1,
                "replicationMode": "Full",
                "targetRegions": target_regions_body(&version.target_regions),
            },
        },
    })
}

fn parse_replication_summary(body: &Value) -> Vec<RegionReplication> {
    body.pointer("/properties/replicationStatus/summary")
        .and_then(Value::as_array)
        .map(|summary| {
            summary
                .iter()
                .filter_map(|entry| {
                    let region = normalize_region(entry.get("region")?.as_str()?);
                    let state = match entry.get("state").and_then(Value::as_str) {
                        Some("Completed") => ReplicationState::Completed,
                        Some("Failed") => ReplicationState::Failed(
                            str_at(entry, "/details").unwrap_or("replication failed").to_string(),
                        ),
                        _ => ReplicationState::Replicating,
                    };
                    Some(RegionReplication { region, state })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_community_name(gallery: &Value) -> Option<String> {
    let info = gallery.pointer("/properties/sharingProfile/communityGalleryInfo")?;
    if !info.get("communityGalleryEnabled")?.as_bool()? {
        return None;
    }
    info.get("publicNames")?
        .as_array()?
        .first()?
        .as_str()
        .map(str::to_string)
}

#[async_trait]
impl AzureApi for ArmClient {
    async fn ensure_gallery(&self, gallery: &str, location: &str) -> Result<()> {
        let url = self.gallery_url(gallery);
        if self.rest.get(&url).await?.is_some() {
            tracing::debug!(gallery = %gallery, "Gallery exists");
            return Ok(());
        }
        tracing::info!(gallery = %gallery, location = %location, "Creating gallery");
        self.put(&url, &json!({ "location": location, "properties": {} }))
            .await
            .map(|_| ())
    }

    async fn ensure_image_definition(&self, definition: &ImageDefinition) -> Result<()> {
        let url = self.definition_url(&definition.gallery, &definition.name);
        if self.rest.get(&url).await?.is_some() {
            tracing::debug!(definition = %definition.name, "Image definition exists");
            return Ok(());
        }
        tracing::info!(gallery = %definition.gallery, definition = %definition.name, "Creating image definition");
        self.put(&url, &definition_body(definition)).await.map(|_| ())
    }

    async fn delete_image_version(&self, gallery: &str, definition: &str, version: &str) -> Result<()> {
        self.delete(&self.version_url(gallery, definition, version)).await
    }

    async fn delete_managed_image(&self, name: &str) -> Result<()> {
        self.delete(&self.image_url(name)).await
    }

    async fn delete_disk(&self, name: &str) -> Result<()> {
        self.delete(&self.disk_url(name)).await
    }

    async fn create_upload_disk(&self, name: &str, location: &str, size_bytes: u64) -> Result<String> {
        let disk = self
            .put(&self.disk_url(name), &disk_body(location, size_bytes))
            .await?;
        Ok(str_at(&disk, "/id")
            .map(str::to_string)
            .unwrap_or_else(|| self.disk_id(name)))
    }

    async fn grant_write_access(&self, disk: &str) -> Result<String> {
        let url = self.disk_action_url(disk, "beginGetAccess");
        let body = json!({ "access": "Write", "durationInSeconds": UPLOAD_ACCESS_SECS });
        let response = self.rest.send_existing(Method::POST, &url, Some(&body)).await?;
        let output = self.complete(response, None).await?;
        str_at(&output, "/accessSAS")
            .map(str::to_string)
            .ok_or_else(|| self.rest.error(format!("granting access to disk {disk}: no SAS returned")))
    }

    async fn revoke_access(&self, disk: &str) -> Result<()> {
        let url = self.disk_action_url(disk, "endGetAccess");
        match self.rest.send(Method::POST, &url, None).await? {
            Some(response) => self.complete(response, None).await.map(|_| ()),
            None => Ok(()),
        }
    }

    async fn upload_page(&self, sas_url: &str, offset: u64, data: Vec<u8>) -> Result<()> {
        let end = offset + data.len() as u64 - 1;
        let response = self
            .rest
            .http()
            .put(format!("{sas_url}&comp=page"))
            .header("x-ms-page-write", "update")
            .header("x-ms-range", format!("bytes={offset}-{end}"))
            .header("x-ms-version", BLOB_API_VERSION)
            .body(data)
            .send()
            .await
            .map_err(|e| self.rest.error(format!("writing page at {offset}: {e}")))?;
        if !response.status().is_success() {
            return Err(self.rest.error(format!(
                "writing page at {offset} returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn create_managed_image(&self, name: &str, location: &str, disk: &str) -> Result<String> {
        let url = self.image_url(name);
        let image = self
            .put(&url, &managed_image_body(location, &self.disk_id(disk)))
            .await?;
        str_at(&image, "/id")
            .map(str::to_string)
            .ok_or_else(|| self.rest.error(format!("managed image {name} has no id")))
    }

    async fn create_image_version(&self, version: &ImageVersion) -> Result<String> {
        let url = self.version_url(&version.gallery, &version.definition, &version.version);
        let created = self.put(&url, &version_body(version)).await?;
        str_at(&created, "/id")
            .map(str::to_string)
            .ok_or_else(|| self.rest.error(format!("image version {} has no id", version.version)))
    }

    async fn target_regions(&self, gallery: &str, definition: &str, version: &str) -> Result<Vec<String>> {
        let body = self
            .rest
            .get_existing(&self.version_url(gallery, definition, version))
            .await?;
        Ok(body
            .pointer("/properties/publishingProfile/targetRegions")
            .and_then(Value::as_array)
            .map(|regions| {
                regions
                    .iter()
                    .filter_map(|r| r.get("name").and_then(Value::as_str))
                    .map(normalize_region)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn set_target_regions(
        &self,
        gallery: &str,
        definition: &str,
        version: &str,
        regions: &[String],
    ) -> Result<()> {
        let url = self.version_url(gallery, definition, version);
        let body = json!({
            "properties": {
                "publishingProfile": { "targetRegions": target_regions_body(regions) },
            },
        });
        let response = self.rest.send_existing(Method::PATCH, &url, Some(&body)).await?;
        self.complete(response, Some(&url)).await.map(|_| ())
    }

    async fn replication_status(
        &self,
        gallery: &str,
        definition: &str,
        version: &str,
    ) -> Result<Vec<RegionReplication>> {
        let url = format!(
            "{}&$expand=ReplicationStatus",
            self.version_url(gallery, definition, version)
        );
        Ok(parse_replication_summary(&self.rest.get_existing(&url).await?))
    }

    async fn community_gallery_name(&self, gallery: &str) -> Result<Option<String>> {
        let body = self.rest.get_existing(&self.gallery_url(gallery)).await?;
        Ok(parse_community_name(&body))
    }

    async fn community_image_version_id(
        &self,
        location: &str,
        public_gallery: &str,
        definition: &str,
        version: &str,
    ) -> Result<String> {
        let url = Self::url(
            &format!(
                "/subscriptions/{}/providers/Microsoft.Compute/locations/{location}/communityGalleries/{public_gallery}/images/{definition}/versions/{version}",
                self.subscription
            ),
            GALLERY_API_VERSION,
        );
        let body = self.rest.get_existing(&url).await?;
        str_at(&body, "/identifier/uniqueId")
            .map(str::to_string)
            .ok_or_else(|| {
                self.rest.error(format!(
                    "community image version {public_gallery}/{definition}/{version} has no unique id"
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;

    fn client() -> ArmClient {
        ArmClient::new(
            Arc::new(StaticToken("t".to_string())),
            "sub-1",
            "rg-images",
            Duration::from_secs(10),
        )
    }

    #[test]
    fn test_resource_urls() {
        let arm = client();
        assert_eq!(
            arm.disk_id("disk-a"),
            "/subscriptions/sub-1/resourceGroups/rg-images/providers/Microsoft.Compute/disks/disk-a"
        );
        assert_eq!(
            arm.version_url("G", "offer", "1.2.3"),
            "https://management.azure.com/subscriptions/sub-1/resourceGroups/rg-images/providers/Microsoft.Compute/galleries/G/images/offer/versions/1.2.3?api-version=2022-03-03"
        );
        assert!(arm
            .disk_action_url("disk-a", "beginGetAccess")
            .ends_with("/disks/disk-a/beginGetAccess?api-version=2023-04-02"));
    }

    #[test]
    fn test_definition_body_security_type() {
        let mut definition = ImageDefinition {
            gallery: "G".to_string(),
            name: "cvm".to_string(),
            location: "northeurope".to_string(),
            publisher: "edgelesssys".to_string(),
            offer: "cvm".to_string(),
            sku: "azure-sev-snp".to_string(),
            security_type: Some("ConfidentialVMSupported".to_string()),
        };
        let body = definition_body(&definition);
        assert_eq!(body["properties"]["features"][0]["value"], "ConfidentialVMSupported");
        assert_eq!(body["properties"]["identifier"]["publisher"], "edgelesssys");

        definition.security_type = None;
        let body = definition_body(&definition);
        assert_eq!(body["properties"]["features"], json!([]));
    }

    #[test]
    fn test_version_body() {
        let body = version_body(&ImageVersion {
            gallery: "G".to_string(),
            definition: "cvm".to_string(),
            version: "2.16.0".to_string(),
            location: "northeurope".to_string(),
            source_image_id: "/images/x".to_string(),
            target_regions: vec!["northeurope".to_string()],
        });
        assert_eq!(body["properties"]["storageProfile"]["osDiskImage"]["hostCaching"], "ReadOnly");
        assert_eq!(body["properties"]["publishingProfile"]["replicationMode"], "Full");
        assert_eq!(
            body["properties"]["publishingProfile"]["targetRegions"],
            json!([{ "name": "northeurope", "regionalReplicaCount": 1 }])
        );
    }

    #[test]
    fn test_disk_body() {
        let body = disk_body("northeurope", 1 << 30);
        assert_eq!(body["properties"]["creationData"]["createOption"], "Upload");
        assert_eq!(body["properties"]["creationData"]["uploadSizeBytes"], 1u64 << 30);
        assert_eq!(body["properties"]["hyperVGeneration"], "V2");
    }

    #[test]
    fn test_parse_replication_summary() {
        let body = json!({
            "properties": {
                "replicationStatus": {
                    "summary": [
                        { "region": "North Europe", "state": "Completed", "progress": 100 },
                        { "region": "East US", "state": "Replicating", "progress": 40 },
                        { "region": "West US", "state": "Failed", "details": "quota exceeded" },
                    ],
                },
            },
        });
        let summary = parse_replication_summary(&body);
        assert_eq!(
            summary,
            vec![
                RegionReplication {
                    region: "northeurope".to_string(),
                    state: ReplicationState::Completed,
                },
                RegionReplication {
                    region: "eastus".to_string(),
                    state: ReplicationState::Replicating,
                },
                RegionReplication {
                    region: "westus".to_string(),
                    state: ReplicationState::Failed("quota exceeded".to_string()),
                },
            ]
        );
        assert!(parse_replication_summary(&json!({})).is_empty());
    }

    #[test]
    fn test_parse_community_name() {
        let shared = json!({
            "properties": {
                "sharingProfile": {
                    "communityGalleryInfo": {
                        "communityGalleryEnabled": true,
                        "publicNames": ["cvm-0a1b2c3d"],
                    },
                },
            },
        });
        assert_eq!(parse_community_name(&shared).as_deref(), Some("cvm-0a1b2c3d"));

        let private = json!({ "properties": { "sharingProfile": { "permissions": "Private" } } });
        assert!(parse_community_name(&private).is_none());

        let disabled = json!({
            "properties": {
                "sharingProfile": {
                    "communityGalleryInfo": { "communityGalleryEnabled": false, "publicNames": ["x"] },
                },
            },
        });
        assert!(parse_community_name(&disabled).is_none());
    }
}
