// src/ingest/adapters/mod.rs
//! Per-provider clients. Each adapter turns one source configuration into a
//! batch of `RawRecord`s; retries and circuit breaking live in
//! [`crate::ingest::resilient`], not here.

pub mod firms;
pub mod gdacs_rss;
pub mod json_feed;
pub mod usgs;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::AdapterError;
use crate::ingest::types::{ExternalSourceConfig, RawRecord, SourceType};

#[async_trait]
pub trait DataSourceAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Checks required connection parameters. Must not touch the network.
    fn check_config(&self, _config: &ExternalSourceConfig) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn fetch(&self, config: &ExternalSourceConfig) -> Result<Vec<RawRecord>, AdapterError>;

    /// Connectivity probe.
    async fn validate(&self, config: &ExternalSourceConfig) -> Result<(), AdapterError> {
        self.fetch(config).await.map(|_| ())
    }

    /// Parse a pushed payload into zero or one record.
    fn parse_webhook(
        &self,
        config: &ExternalSourceConfig,
        payload: &str,
    ) -> Result<Option<RawRecord>, AdapterError> {
        json_object_record(config, default_data_type(config.source_type), payload)
    }
}

pub type DynAdapter = Arc<dyn DataSourceAdapter>;

pub fn default_data_type(t: SourceType) -> &'static str {
    match t {
        SourceType::SatelliteFire => "fire_detection",
        SourceType::Seismic => "earthquake",
        SourceType::DisasterAlert => "disaster_alert",
        SourceType::Social => "social_post",
        SourceType::UserReport => "user_report",
    }
}

/// Generic webhook parsing: a JSON object becomes one record, `null` or `{}` none.
pub(crate) fn json_object_record(
    config: &ExternalSourceConfig,
    data_type: &str,
    payload: &str,
) -> Result<Option<RawRecord>, AdapterError> {
    let value: serde_json::Value = serde_json::from_str(payload.trim())
        .map_err(|e| AdapterError::Malformed(format!("webhook json: {e}")))?;
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Object(map) if map.is_empty() => Ok(None),
        serde_json::Value::Object(map) => Ok(Some(RawRecord::new(
            config,
            data_type,
            serde_json::Value::Object(map).to_string(),
        ))),
        other => Err(AdapterError::Malformed(format!(
            "webhook payload must be a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

pub(crate) fn json_kind(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Shared client for all built-in adapters.
pub fn build_http_client() -> Result<reqwest::Client, AdapterError> {
    reqwest::Client::builder()
        .user_agent("fire-ingest-pipeline/0.1")
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(25))
        .build()
        .map_err(|e| AdapterError::Config(format!("http client: {e}")))
}

/// GET a text body, classifying non-2xx statuses for the retry policy.
pub(crate) async fn get_text(client: &reqwest::Client, url: &str) -> Result<String, AdapterError> {
    let resp = client.get(url).send().await?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(200).collect();
        return Err(AdapterError::from_status(status.as_u16(), snippet));
    }
    Ok(resp.text().await?)
}

/// Source-type -> adapter lookup used when spawning ingestion actors.
#[derive(Clone, Default)]
pub struct AdapterCatalog {
    adapters: HashMap<SourceType, DynAdapter>,
}

impl AdapterCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Built-in HTTP adapters for every source type.
    pub fn http(client: reqwest::Client) -> Self {
        Self::empty()
            .with(
                SourceType::SatelliteFire,
                Arc::new(firms::FirmsAdapter::new(client.clone())),
            )
            .with(
                SourceType::Seismic,
                Arc::new(usgs::UsgsAdapter::new(client.clone())),
            )
            .with(
                SourceType::DisasterAlert,
                Arc::new(gdacs_rss::GdacsRssAdapter::new(client.clone())),
            )
            .with(
                SourceType::Social,
                Arc::new(json_feed::JsonFeedAdapter::new(client.clone(), "social")),
            )
            .with(
                SourceType::UserReport,
                Arc::new(json_feed::JsonFeedAdapter::new(client, "user-report")),
            )
    }

    pub fn with(mut self, source_type: SourceType, adapter: DynAdapter) -> Self {
        self.adapters.insert(source_type, adapter);
        self
    }

    pub fn get(&self, source_type: SourceType) -> Option<DynAdapter> {
        self.adapters.get(&source_type).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ExternalSourceConfig {
        ExternalSourceConfig::new("u1", "Reports", SourceType::UserReport)
    }

    #[test]
    fn json_object_webhook_becomes_one_record() {
        let r = json_object_record(&cfg(), "user_report", r#"{"latitude":1,"longitude":2}"#)
            .unwrap()
            .unwrap();
        assert_eq!(r.source_id, "u1");
        assert_eq!(r.data_type, "user_report");
    }

    #[test]
    fn empty_object_yields_no_record() {
        assert!(json_object_record(&cfg(), "x", "{}").unwrap().is_none());
        assert!(json_object_record(&cfg(), "x", "null").unwrap().is_none());
    }

    #[test]
    fn non_object_is_malformed_and_not_transient() {
        let err = json_object_record(&cfg(), "x", "[1,2]").unwrap_err();
        assert!(matches!(err, AdapterError::Malformed(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn status_classification() {
        assert!(AdapterError::from_status(503, "").is_transient());
        assert!(AdapterError::from_status(429, "").is_transient());
        assert!(!AdapterError::from_status(404, "").is_transient());
    }
}
