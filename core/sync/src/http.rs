//! HTTP transports for the authority and the resource cache.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

use scoresync_common::{ActionId, DeviceId, Error, ResourceKey, Result};

use crate::authority::{RemoteAuthority, RemoteRecord, SubmitOutcome, SubmitRequest};
use crate::cache::{FetchedResource, ResourceFetcher};

const USER_AGENT: &str = "scoresync/0.1";

/// Body of a write request.
#[derive(Debug, Serialize)]
struct WriteBody<'a> {
    action_id: &'a ActionId,
    device_id: &'a DeviceId,
    base_version: Option<DateTime<Utc>>,
    client_modified_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fields: Option<Map<String, Value>>,
}

/// Record representation used by the authority on the wire.
#[derive(Debug, Deserialize)]
struct WireRecord {
    #[serde(default)]
    fields: Map<String, Value>,
    last_modified: DateTime<Utc>,
}

fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))
}

/// Parse a base URL so relative joins keep its path.
fn parse_base(base_url: &str) -> Result<Url> {
    let mut base = Url::parse(base_url)
        .map_err(|e| Error::InvalidInput(format!("Invalid base URL {}: {}", base_url, e)))?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base)
}

fn join(base: &Url, path: &str) -> Result<Url> {
    base.join(path.trim_start_matches('/'))
        .map_err(|e| Error::InvalidInput(format!("Invalid path {}: {}", path, e)))
}

fn transport_error(context: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout(format!("{}: {}", context, err))
    } else {
        Error::Network(format!("{}: {}", context, err))
    }
}

/// Map a non-success status to the error taxonomy.
fn status_error(context: &str, status: StatusCode, body: &str) -> Error {
    let message = format!("{}: {} - {}", context, status, body);
    if status == StatusCode::NOT_FOUND {
        Error::NotFound(message)
    } else if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        Error::Network(message)
    } else {
        Error::Validation(message)
    }
}

/// Authority reached over HTTP.
///
/// Writes go to `PUT {base}/api/{type}/{id}` (or `DELETE`) with the base
/// version in the body; `409`/`412` signal a version mismatch.
pub struct HttpAuthority {
    http: Client,
    base: Url,
}

impl HttpAuthority {
    /// Create a client for the authority at `base_url`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: build_client(timeout)?,
            base: parse_base(base_url)?,
        })
    }

    /// URL of one record.
    pub fn record_url(&self, resource: &ResourceKey) -> Result<Url> {
        join(&self.base, &resource.api_path())
    }

    async fn parse_record(response: reqwest::Response) -> Result<WireRecord> {
        response
            .json()
            .await
            .map_err(|e| Error::Serialization(format!("Failed to parse response: {}", e)))
    }
}

#[async_trait]
impl RemoteAuthority for HttpAuthority {
    fn name(&self) -> &str {
        "http"
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitOutcome> {
        let url = self.record_url(&request.resource)?;
        let (method, fields) = if request.payload.is_delete() {
            (Method::DELETE, None)
        } else {
            (Method::PUT, Some(request.payload.to_fields()?))
        };
        let body = WriteBody {
            action_id: &request.action_id,
            device_id: &request.device_id,
            base_version: request.base_version,
            client_modified_at: request.client_modified_at,
            fields,
        };

        debug!("{} {}", method, url);
        let response = self
            .http
            .request(method, url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("Failed to submit", e))?;

        let status = response.status();
        if status.is_success() {
            if status == StatusCode::NO_CONTENT {
                return Err(Error::Serialization(
                    "authority accepted without a version token".to_string(),
                ));
            }
            let record = Self::parse_record(response).await?;
            Ok(SubmitOutcome::Accepted {
                last_modified: record.last_modified,
                fields: record.fields,
            })
        } else if status == StatusCode::CONFLICT || status == StatusCode::PRECONDITION_FAILED {
            let record = Self::parse_record(response).await?;
            Ok(SubmitOutcome::VersionMismatch {
                server_fields: record.fields,
                server_last_modified: record.last_modified,
            })
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(status_error("Submit rejected", status, &body))
        }
    }

    async fn fetch_record(&self, resource: &ResourceKey) -> Result<Option<RemoteRecord>> {
        let url = self.record_url(resource)?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| transport_error("Failed to fetch record", e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("Fetch rejected", status, &body));
        }
        let record = Self::parse_record(response).await?;
        Ok(Some(RemoteRecord {
            resource: resource.clone(),
            fields: record.fields,
            last_modified: record.last_modified,
        }))
    }
}

/// Read-only fetcher behind the resource cache.
pub struct HttpFetcher {
    http: Client,
    base: Url,
}

impl HttpFetcher {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: build_client(timeout)?,
            base: parse_base(base_url)?,
        })
    }
}

#[async_trait]
impl ResourceFetcher for HttpFetcher {
    async fn fetch(&self, path: &str) -> Result<FetchedResource> {
        let url = join(&self.base, path)?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| transport_error("Failed to fetch", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(path, status, &body));
        }

        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error("Failed to read body", e))?;

        Ok(FetchedResource {
            status: status.as_u16(),
            headers,
            body: body.to_vec(),
        })
    }
}
