//! Client of the external metadata service.
//!
//! Replicas expose:
//!
//! - `GET  http://{replica}/version/list?hash={hash}` → JSON array of versions
//! - `PATCH http://{replica}/metadata_version/{name}/locates?version={seq}`
//!   with body `{"locations": [...]}`

use std::time::Duration;

use async_trait::async_trait;
use ballast_types::Version;
use serde::Serialize;
use tracing::debug;

use crate::error::MetadataError;

/// Metadata-service operations needed by reconciliation.
#[async_trait]
pub trait MetadataService: Send + Sync {
    /// Every version record whose content hash is `hash`.
    async fn versions_by_hash(
        &self,
        replica: &str,
        hash: &str,
    ) -> Result<Vec<Version>, MetadataError>;

    /// Replace the location array of one version.
    async fn update_locations(
        &self,
        replica: &str,
        name: &str,
        sequence: u64,
        locations: &[String],
    ) -> Result<(), MetadataError>;
}

#[derive(Serialize)]
struct LocationsBody<'a> {
    locations: &'a [String],
}

/// [`MetadataService`] over the replicas' HTTP API.
#[derive(Clone)]
pub struct HttpMetadataService {
    client: reqwest::Client,
}

impl HttpMetadataService {
    /// Create a client with a per-request timeout.
    pub fn new(timeout: Duration) -> Result<Self, MetadataError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

async fn check(replica: &str, resp: reqwest::Response) -> Result<reqwest::Response, MetadataError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(MetadataError::Status {
        replica: replica.to_string(),
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl MetadataService for HttpMetadataService {
    async fn versions_by_hash(
        &self,
        replica: &str,
        hash: &str,
    ) -> Result<Vec<Version>, MetadataError> {
        let resp = self
            .client
            .get(format!("http://{replica}/version/list"))
            .query(&[("hash", hash)])
            .send()
            .await?;
        let versions: Vec<Version> = check(replica, resp).await?.json().await?;
        debug!(%replica, %hash, count = versions.len(), "fetched versions by hash");
        Ok(versions)
    }

    async fn update_locations(
        &self,
        replica: &str,
        name: &str,
        sequence: u64,
        locations: &[String],
    ) -> Result<(), MetadataError> {
        let mut url = reqwest::Url::parse(&format!("http://{replica}/"))
            .map_err(|e| MetadataError::Unavailable {
                replica: replica.to_string(),
                reason: e.to_string(),
            })?;
        url.path_segments_mut()
            .map_err(|_| MetadataError::Unavailable {
                replica: replica.to_string(),
                reason: "replica address cannot be a base url".to_string(),
            })?
            .clear()
            .extend(["metadata_version", name, "locates"]);
        url.query_pairs_mut()
            .append_pair("version", &sequence.to_string());

        let resp = self
            .client
            .patch(url)
            .json(&LocationsBody { locations })
            .send()
            .await?;
        check(replica, resp).await?;
        debug!(%replica, %name, sequence, "updated version locations");
        Ok(())
    }
}
