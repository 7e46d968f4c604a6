//! HTTP transport posting bulk event payloads.
//!
//! Each record becomes one event carrying its identity key as `event_id`, so
//! the remote can drop replays after a crash. Uses a pooled `reqwest` client;
//! one call per batch.

use std::{fmt, future::Future, pin::Pin, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use rowcast_core::{time::unix_millis, Batch, Clock, KeyedRecord};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    error::{DeliveryError, Result},
    transport::{ItemResult, Transport, TransportError, TransportResponse},
};

/// Path of the bulk events endpoint.
pub const BULK_EVENTS_PATH: &str = "/v2/bulkevents";

/// Fields sent as user identities rather than custom attributes.
const IDENTITY_FIELDS: &[&str] = &["email", "customer_id"];

/// Response bodies larger than this are truncated before logging.
const MAX_LOGGED_BODY: usize = 1024;

/// Hint used when `Retry-After` is present but unparseable.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Regional API endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataCenter {
    /// United States.
    #[default]
    Us,
    /// European Union.
    Eu,
}

impl DataCenter {
    /// Base URL of the data center.
    pub fn base_url(self) -> &'static str {
        match self {
            Self::Us => "https://s2s.mparticle.com",
            Self::Eu => "https://s2s.eu1.mparticle.com",
        }
    }
}

/// Remote environment events are tagged with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Test traffic.
    #[default]
    Development,
    /// Live traffic.
    Production,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Development => write!(f, "development"),
            Self::Production => write!(f, "production"),
        }
    }
}

/// Configuration for [`HttpTransport`].
#[derive(Clone, Serialize, Deserialize)]
pub struct HttpTransportConfig {
    /// Full base URL override; takes precedence over `data_center`.
    pub endpoint: Option<String>,
    /// Regional endpoint.
    pub data_center: DataCenter,
    /// Basic auth user.
    pub api_key: String,
    /// Basic auth password.
    pub api_secret: String,
    /// Environment tag on every event.
    pub environment: Environment,
    /// Name of the custom event.
    pub event_name: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Idle pooled connections kept per host.
    pub pool_max_idle_per_host: usize,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            data_center: DataCenter::Us,
            api_key: String::new(),
            api_secret: String::new(),
            environment: Environment::Development,
            event_name: "qsr_coupon_signup".to_string(),
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            user_agent: concat!("rowcast/", env!("CARGO_PKG_VERSION")).to_string(),
            pool_max_idle_per_host: 32,
        }
    }
}

impl fmt::Debug for HttpTransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransportConfig")
            .field("endpoint", &self.endpoint)
            .field("data_center", &self.data_center)
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .field("environment", &self.environment)
            .field("event_name", &self.event_name)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl HttpTransportConfig {
    /// URL batches are posted to.
    pub fn url(&self) -> String {
        let base = self.endpoint.as_deref().unwrap_or_else(|| self.data_center.base_url());
        format!("{}{BULK_EVENTS_PATH}", base.trim_end_matches('/'))
    }
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    results: Vec<ItemResult>,
}

/// Posts batches as bulk JSON event arrays with basic auth.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    config: HttpTransportConfig,
    clock: Arc<dyn Clock>,
}

impl HttpTransport {
    /// Builds the pooled HTTP client.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if credentials are missing
    /// or the HTTP client cannot be built.
    pub fn new(config: HttpTransportConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        if config.api_key.is_empty() || config.api_secret.is_empty() {
            return Err(DeliveryError::configuration("API key and secret are required"));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, url: config.url(), config, clock })
    }

    /// URL batches are posted to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Builds the event for one record.
    pub fn build_event(&self, item: &KeyedRecord, timestamp_ms: u64) -> Value {
        let mut custom_attributes = Map::new();
        custom_attributes.insert("event_id".to_string(), Value::String(item.key.to_string()));

        let mut user_identities = Map::new();
        for (name, value) in item.record.iter() {
            if value.is_empty() {
                continue;
            }
            if IDENTITY_FIELDS.contains(&name) {
                user_identities.insert(name.to_string(), Value::String(value.to_string()));
            } else {
                custom_attributes.insert(name.to_string(), Value::String(value.to_string()));
            }
        }

        json!({
            "schema_version": 2,
            "environment": self.config.environment.to_string(),
            "events": [{
                "data": {
                    "event_name": self.config.event_name,
                    "custom_event_type": "other",
                    "timestamp_unixtime_ms": timestamp_ms,
                    "custom_attributes": custom_attributes,
                },
                "event_type": "custom_event",
            }],
            "user_identities": user_identities,
            "device_info": { "platform": "web" },
        })
    }

    async fn post(
        &self,
        batch: &Batch,
        attempt: u32,
    ) -> std::result::Result<TransportResponse, TransportError> {
        let span = info_span!(
            "batch_delivery",
            batch_seq = batch.seq(),
            records = batch.len(),
            attempt
        );

        async move {
            let timestamp_ms = unix_millis(self.clock.as_ref());
            let payload: Vec<Value> =
                batch.items().iter().map(|item| self.build_event(item, timestamp_ms)).collect();

            let start_time = std::time::Instant::now();
            let response = self
                .client
                .post(&self.url)
                .basic_auth(&self.config.api_key, Some(&self.config.api_secret))
                .json(&payload)
                .send()
                .await
                .map_err(|e| {
                    warn!(duration_ms = start_time.elapsed().as_millis(), "request failed: {e}");
                    if e.is_timeout() {
                        TransportError::Timeout(self.config.timeout)
                    } else if e.is_connect() {
                        TransportError::Connect(e.to_string())
                    } else {
                        TransportError::Other(e.to_string())
                    }
                })?;

            let status = response.status().as_u16();
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .map(|value| parse_retry_after(value, DateTime::<Utc>::from(self.clock.now_system())));

            let bytes = match response.bytes().await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("failed to read response body: {e}");
                    Default::default()
                },
            };

            let item_results = if (200..300).contains(&status) && !bytes.is_empty() {
                serde_json::from_slice::<BulkResponse>(&bytes).ok().map(|parsed| parsed.results)
            } else {
                None
            };

            let body = if bytes.len() > MAX_LOGGED_BODY {
                format!("{}... (truncated)", String::from_utf8_lossy(&bytes[..MAX_LOGGED_BODY]))
            } else {
                String::from_utf8_lossy(&bytes).into_owned()
            };

            debug!(
                status,
                duration_ms = start_time.elapsed().as_millis(),
                item_results = item_results.as_ref().map_or(0, Vec::len),
                "received response"
            );

            Ok(TransportResponse { status, retry_after, item_results, body })
        }
        .instrument(span)
        .await
    }
}

impl Transport for HttpTransport {
    fn send<'a>(
        &'a self,
        batch: &'a Batch,
        attempt: u32,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<TransportResponse, TransportError>> + Send + 'a>>
    {
        Box::pin(self.post(batch, attempt))
    }
}

/// Parses a `Retry-After` value given as delay seconds or an HTTP date.
///
/// A date in the past yields zero; anything unparseable yields a 60 second
/// default.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Duration {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Duration::from_secs(seconds);
    }

    if let Ok(date_time) = DateTime::parse_from_rfc2822(value) {
        let retry_time = date_time.with_timezone(&Utc);
        return retry_time.signed_duration_since(now).to_std().unwrap_or(Duration::ZERO);
    }

    DEFAULT_RETRY_AFTER
}
