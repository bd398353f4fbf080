//! REST resource store.

use async_trait::async_trait;
use cohort_core::{EndpointConfig, ResourceKind, ResourceStore, SearchParams, StoreError};
use reqwest::StatusCode;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::{endpoint, http_client, parse_base_url, ClientError};

/// `GET {base}/{Kind}/{id}` for reads, `GET {base}/{Kind}?…` for searches.
///
/// Searches read the first Bundle page only.
#[derive(Clone)]
pub struct RestResourceStore {
    client: reqwest::Client,
    base_url: Url,
}

impl RestResourceStore {
    pub fn new(base_url: &str, timeout: std::time::Duration) -> Result<Self, ClientError> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: parse_base_url(base_url)?,
        })
    }

    pub fn from_config(config: &EndpointConfig) -> Result<Self, ClientError> {
        Self::new(&config.base_url, config.request_timeout())
    }

    fn read_url(&self, kind: ResourceKind, id: &str) -> Url {
        endpoint(&self.base_url, &[kind.as_str(), id])
    }

    fn search_url(&self, kind: ResourceKind, params: &SearchParams) -> Url {
        let mut url = endpoint(&self.base_url, &[kind.as_str()]);
        url.query_pairs_mut().extend_pairs(params.iter());
        url
    }

    async fn get(&self, url: Url) -> Result<reqwest::Response, StoreError> {
        self.client
            .get(url)
            .header("Accept", "application/fhir+json")
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))
    }
}

async fn decode(response: reqwest::Response) -> Result<Value, StoreError> {
    response
        .json()
        .await
        .map_err(|e| StoreError::Decode(e.to_string()))
}

async fn status_error(response: reqwest::Response) -> StoreError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    StoreError::Status { status, body }
}

/// Resources of a searchset Bundle, in entry order.
fn bundle_resources(bundle: Value) -> Result<Vec<Value>, StoreError> {
    if bundle.get("resourceType").and_then(Value::as_str) != Some("Bundle") {
        return Err(StoreError::Decode("search did not return a Bundle".into()));
    }
    let Value::Object(mut bundle) = bundle else {
        return Ok(Vec::new());
    };
    let entries = match bundle.remove("entry") {
        Some(Value::Array(entries)) => entries,
        _ => return Ok(Vec::new()),
    };
    Ok(entries
        .into_iter()
        .filter_map(|mut entry| entry.get_mut("resource").map(Value::take))
        .collect())
}

#[async_trait]
impl ResourceStore for RestResourceStore {
    async fn read(&self, kind: ResourceKind, id: &str) -> Result<Value, StoreError> {
        let response = self.get(self.read_url(kind, id)).await?;
        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::GONE => Err(StoreError::NotFound {
                kind,
                id: id.to_string(),
            }),
            status if status.is_success() => decode(response).await,
            _ => Err(status_error(response).await),
        }
    }

    async fn search(
        &self,
        kind: ResourceKind,
        params: &SearchParams,
    ) -> Result<Vec<Value>, StoreError> {
        let url = self.search_url(kind, params);
        debug!(%url, "Searching resources");
        let response = self.get(url).await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        bundle_resources(decode(response).await?)
    }
}
