use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use audience_core::config::{ConnectorsConfig, EndpointConfig};
use audience_core::types::Destination;
use audience_core::{AudienceError, AudienceResult, DeliveryError};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use tracing::debug;
use url::Url;

use crate::local::LocalConnector;
use crate::types::{payload_digest, DeliveryAck, DeliveryMetadata};

/// A destination that accepts rendered export payloads.
#[async_trait]
pub trait DestinationConnector: Send + Sync {
    /// The destination this connector serves.
    fn destination(&self) -> Destination;

    /// Whether the connector has what it needs to attempt a delivery.
    fn is_configured(&self) -> bool {
        true
    }

    /// Hand over a payload. Never retried by the caller.
    async fn deliver(
        &self,
        payload: &[u8],
        metadata: &DeliveryMetadata,
    ) -> Result<DeliveryAck, DeliveryError>;
}

const MAX_ERROR_BODY: usize = 512;

/// Endpoint and credentials shared by the HTTP-based connectors.
struct HttpEndpoint {
    destination: Destination,
    url: Option<Url>,
    api_key: Option<String>,
    account_id: Option<String>,
    client: reqwest::Client,
}

impl HttpEndpoint {
    fn from_config(destination: Destination, config: &EndpointConfig) -> AudienceResult<Self> {
        let url = match config.endpoint.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(Url::parse(raw).map_err(|e| {
                AudienceError::config(format!(
                    "invalid endpoint for {}: {raw}: {e}",
                    destination.display_name()
                ))
            })?),
        };
        Ok(Self {
            destination,
            url,
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            account_id: config.account_id.clone().filter(|a| !a.is_empty()),
            client: reqwest::Client::new(),
        })
    }

    fn is_configured(&self) -> bool {
        self.url.is_some() && self.api_key.is_some()
    }

    fn not_configured(&self, what: &str) -> DeliveryError {
        DeliveryError::NotConfigured(format!("{} ({what} missing)", self.destination.display_name()))
    }

    fn bearer(&self) -> Result<HeaderMap, DeliveryError> {
        let key = self.api_key.as_deref().ok_or_else(|| self.not_configured("api_key"))?;
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, header_value(&format!("Bearer {key}"))?);
        Ok(headers)
    }

    fn account_header(&self, headers: &mut HeaderMap, name: &'static str) -> Result<(), DeliveryError> {
        let account = self
            .account_id
            .as_deref()
            .ok_or_else(|| self.not_configured("account_id"))?;
        headers.insert(HeaderName::from_static(name), header_value(account)?);
        Ok(())
    }

    async fn post(
        &self,
        payload: &[u8],
        metadata: &DeliveryMetadata,
        mut headers: HeaderMap,
    ) -> Result<DeliveryAck, DeliveryError> {
        let url = self.url.as_ref().ok_or_else(|| self.not_configured("endpoint"))?;
        let digest = payload_digest(payload);

        headers.insert(CONTENT_TYPE, HeaderValue::from_static(metadata.format.content_type()));
        headers.insert(
            HeaderName::from_static("x-segment-name"),
            header_value(&metadata.segment_name)?,
        );
        headers.insert(
            HeaderName::from_static("x-row-count"),
            header_value(&metadata.row_count.to_string())?,
        );
        headers.insert(HeaderName::from_static("x-payload-sha256"), header_value(&digest)?);
        if let Some(id) = metadata.schedule_id {
            headers.insert(
                HeaderName::from_static("x-schedule-id"),
                header_value(&id.to_string())?,
            );
        }

        debug!(
            destination = %self.destination,
            url = %url,
            bytes = payload.len(),
            "Posting export payload"
        );
        let response = self
            .client
            .post(url.clone())
            .headers(headers)
            .body(payload.to_vec())
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            let mut body = body;
            body.truncate(floor_char_boundary(&body, MAX_ERROR_BODY));
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(DeliveryAck {
            destination: self.destination,
            reference: reference_from(&body).unwrap_or_else(|| format!("http-{}", status.as_u16())),
            bytes: payload.len() as u64,
            digest,
            delivered_at: metadata.timestamp,
        })
    }
}

fn header_value(raw: &str) -> Result<HeaderValue, DeliveryError> {
    HeaderValue::from_str(raw)
        .map_err(|e| DeliveryError::Transport(format!("invalid header value {raw:?}: {e}")))
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    (0..=max).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0)
}

/// Pulls an upload/job identifier out of a JSON acknowledgement body.
fn reference_from(body: &str) -> Option<String> {
    let json: serde_json::Value = serde_json::from_str(body).ok()?;
    ["id", "job_id", "upload_id", "audience_id"]
        .iter()
        .find_map(|key| match json.get(*key)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

// ---------------------------------------------------------------------------
// Salesforce CRM
// ---------------------------------------------------------------------------

pub struct SalesforceConnector {
    endpoint: HttpEndpoint,
}

impl SalesforceConnector {
    pub fn new(config: &EndpointConfig) -> AudienceResult<Self> {
        Ok(Self {
            endpoint: HttpEndpoint::from_config(Destination::Salesforce, config)?,
        })
    }
}

#[async_trait]
impl DestinationConnector for SalesforceConnector {
    fn destination(&self) -> Destination {
        Destination::Salesforce
    }

    fn is_configured(&self) -> bool {
        self.endpoint.is_configured()
    }

    async fn deliver(
        &self,
        payload: &[u8],
        metadata: &DeliveryMetadata,
    ) -> Result<DeliveryAck, DeliveryError> {
        let headers = self.endpoint.bearer()?;
        self.endpoint.post(payload, metadata, headers).await
    }
}

// ---------------------------------------------------------------------------
// Google Ads Customer Match
// ---------------------------------------------------------------------------

pub struct GoogleAdsConnector {
    endpoint: HttpEndpoint,
}

impl GoogleAdsConnector {
    pub fn new(config: &EndpointConfig) -> AudienceResult<Self> {
        Ok(Self {
            endpoint: HttpEndpoint::from_config(Destination::GoogleAds, config)?,
        })
    }
}

#[async_trait]
impl DestinationConnector for GoogleAdsConnector {
    fn destination(&self) -> Destination {
        Destination::GoogleAds
    }

    fn is_configured(&self) -> bool {
        self.endpoint.is_configured() && self.endpoint.account_id.is_some()
    }

    async fn deliver(
        &self,
        payload: &[u8],
        metadata: &DeliveryMetadata,
    ) -> Result<DeliveryAck, DeliveryError> {
        let mut headers = self.endpoint.bearer()?;
        self.endpoint.account_header(&mut headers, "login-customer-id")?;
        self.endpoint.post(payload, metadata, headers).await
    }
}

// ---------------------------------------------------------------------------
// Meta Custom Audiences
// ---------------------------------------------------------------------------

pub struct MetaAdsConnector {
    endpoint: HttpEndpoint,
}

impl MetaAdsConnector {
    pub fn new(config: &EndpointConfig) -> AudienceResult<Self> {
        Ok(Self {
            endpoint: HttpEndpoint::from_config(Destination::MetaAds, config)?,
        })
    }
}

#[async_trait]
impl DestinationConnector for MetaAdsConnector {
    fn destination(&self) -> Destination {
        Destination::MetaAds
    }

    fn is_configured(&self) -> bool {
        self.endpoint.is_configured() && self.endpoint.account_id.is_some()
    }

    async fn deliver(
        &self,
        payload: &[u8],
        metadata: &DeliveryMetadata,
    ) -> Result<DeliveryAck, DeliveryError> {
        let mut headers = self.endpoint.bearer()?;
        self.endpoint.account_header(&mut headers, "x-ad-account-id")?;
        self.endpoint.post(payload, metadata, headers).await
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Create the connector for a destination from its configuration.
pub fn create_connector(
    destination: Destination,
    config: &ConnectorsConfig,
    export_dir: impl Into<PathBuf>,
) -> AudienceResult<Arc<dyn DestinationConnector>> {
    Ok(match destination {
        Destination::None => Arc::new(LocalConnector::new(export_dir)),
        Destination::Salesforce => Arc::new(SalesforceConnector::new(&config.salesforce)?),
        Destination::GoogleAds => Arc::new(GoogleAdsConnector::new(&config.google_ads)?),
        Destination::MetaAds => Arc::new(MetaAdsConnector::new(&config.meta_ads)?),
    })
}
