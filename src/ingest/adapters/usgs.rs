//! USGS earthquake GeoJSON feed.
use async_trait::async_trait;
use metrics::{counter, histogram};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{get_text, json_object_record, DataSourceAdapter};
use crate::error::AdapterError;
use crate::ingest::types::{ExternalSourceConfig, RawRecord};

const DEFAULT_FEED: &str =
    "https://earthquake.usgs.gov/earthquakes/feed/v1.0/summary/all_hour.geojson";

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    properties: Value,
    geometry: Option<Geometry>,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    coordinates: Vec<f64>,
}

pub struct UsgsAdapter {
    client: reqwest::Client,
}

impl UsgsAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn flatten(feature: Feature) -> Option<Value> {
        let coords = feature.geometry?.coordinates;
        if coords.len() < 2 {
            return None;
        }
        let p = &feature.properties;
        Some(json!({
            "id": feature.id,
            "longitude": coords[0],
            "latitude": coords[1],
            "depth_km": coords.get(2).copied(),
            "magnitude": p.get("mag").cloned().unwrap_or(Value::Null),
            "place": p.get("place").cloned().unwrap_or(Value::Null),
            "title": p.get("title").cloned().unwrap_or(Value::Null),
            "time": p.get("time").cloned().unwrap_or(Value::Null),
            "alert": p.get("alert").cloned().unwrap_or(Value::Null),
        }))
    }

    pub fn parse_feed(config: &ExternalSourceConfig, body: &str) -> Result<Vec<RawRecord>, AdapterError> {
        let t0 = std::time::Instant::now();
        let fc: FeatureCollection = serde_json::from_str(body)
            .map_err(|e| AdapterError::Malformed(format!("usgs geojson: {e}")))?;
        let out: Vec<RawRecord> = fc
            .features
            .into_iter()
            .filter_map(Self::flatten)
            .map(|v| RawRecord::new(config, "earthquake", v.to_string()))
            .collect();
        histogram!("ingest_parse_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        counter!("ingest_events_total").increment(out.len() as u64);
        Ok(out)
    }
}

#[async_trait]
impl DataSourceAdapter for UsgsAdapter {
    fn name(&self) -> &'static str {
        "usgs"
    }

    async fn fetch(&self, config: &ExternalSourceConfig) -> Result<Vec<RawRecord>, AdapterError> {
        let url = config.param("url").unwrap_or(DEFAULT_FEED);
        let body = get_text(&self.client, url).await?;
        Self::parse_feed(config, &body)
    }

    /// Accepts a single GeoJSON Feature, or a flat object.
    fn parse_webhook(
        &self,
        config: &ExternalSourceConfig,
        payload: &str,
    ) -> Result<Option<RawRecord>, AdapterError> {
        let value: Value = serde_json::from_str(payload.trim())
            .map_err(|e| AdapterError::Malformed(format!("usgs webhook: {e}")))?;
        if value.get("type").and_then(Value::as_str) == Some("Feature") {
            let feature: Feature = serde_json::from_value(value)
                .map_err(|e| AdapterError::Malformed(format!("usgs feature: {e}")))?;
            return match Self::flatten(feature) {
                Some(v) => Ok(Some(RawRecord::new(config, "earthquake", v.to_string()))),
                None => Err(AdapterError::Malformed("feature without point geometry".into())),
            };
        }
        json_object_record(config, "earthquake", payload)
    }
}
