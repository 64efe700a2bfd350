//! Remote source: the AirGradient public API.
//!
//! A fetch is a single query-parameter GET for a trailing lookback window.
//! Failures are surfaced as `SourceUnavailable` and never retried here; the
//! merge is idempotent, so re-running the whole fetch is always safe.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde_json::Value;

use crate::error::IngestError;
use crate::models::RawBatch;

// ---

/// Query-string timestamp layout expected by the API.
const WINDOW_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Time span requested from the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookbackWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl LookbackWindow {
    /// Window of `days` ending at `now`.
    pub fn trailing(days: u32, now: DateTime<Utc>) -> Self {
        Self {
            from: now - Duration::days(i64::from(days)),
            to: now,
        }
    }
}

#[async_trait]
pub trait MeasurementSource: Send + Sync {
    fn describe(&self) -> String;

    async fn fetch(&self, window: LookbackWindow) -> Result<RawBatch, IngestError>;
}

/// HTTP client for one AirGradient location.
#[derive(Debug, Clone)]
pub struct AirGradientClient {
    http: Client,
    base_url: String,
    token: String,
    location_id: String,
}

impl AirGradientClient {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        location_id: impl Into<String>,
    ) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            location_id: location_id.into(),
        }
    }

    /// Probe the token against the current-measures endpoint.
    ///
    /// `Ok(false)` means the API answered but rejected the request.
    pub async fn check_token(&self) -> Result<bool, IngestError> {
        // ---
        let url = format!("{}/locations/measures/current", self.base_url);
        tracing::info!("Testing AirGradient API token against {}", url);

        let response = self
            .http
            .get(&url)
            .query(&[("token", self.token.as_str())])
            .send()
            .await
            .map_err(|e| unavailable(&url, e))?;

        let status = response.status();
        tracing::debug!("Token check returned {}", status);
        Ok(status.is_success())
    }
}

#[async_trait]
impl MeasurementSource for AirGradientClient {
    // ---
    fn describe(&self) -> String {
        format!("AirGradient location {}", self.location_id)
    }

    async fn fetch(&self, window: LookbackWindow) -> Result<RawBatch, IngestError> {
        // ---
        let url = format!(
            "{}/locations/{}/measures/past",
            self.base_url, self.location_id
        );
        let from = window.from.format(WINDOW_FORMAT).to_string();
        let to = window.to.format(WINDOW_FORMAT).to_string();

        tracing::info!("Requesting {} from {} to {}", url, from, to);

        let response = self
            .http
            .get(&url)
            .query(&[
                ("token", self.token.as_str()),
                ("from", from.as_str()),
                ("to", to.as_str()),
            ])
            .send()
            .await
            .map_err(|e| unavailable(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::SourceUnavailable(format!(
                "{url} returned {status}"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| unavailable(&url, e))?;

        let items = match body {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => {
                return Err(IngestError::SourceUnavailable(format!(
                    "{url}: expected a JSON array, got {}",
                    json_kind(&other)
                )))
            }
        };

        let mut rows = Vec::with_capacity(items.len());
        for (i, item) in items.into_iter().enumerate() {
            match item {
                Value::Object(map) => rows.push(map),
                other => {
                    return Err(IngestError::SourceUnavailable(format!(
                        "{url}: item {i} is {}, not an object",
                        json_kind(&other)
                    )))
                }
            }
        }

        tracing::info!("Fetched {} records from {}", rows.len(), self.describe());
        Ok(RawBatch::from_objects(rows))
    }
}

/// reqwest errors print the request URL, query string and token included.
fn unavailable(url: &str, err: reqwest::Error) -> IngestError {
    IngestError::SourceUnavailable(format!("{url}: {}", err.without_url()))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
