//! NASA FIRMS area API (CSV).
use async_trait::async_trait;
use metrics::{counter, histogram};
use serde_json::{Map, Value};

use super::{get_text, DataSourceAdapter};
use crate::error::AdapterError;
use crate::ingest::types::{ExternalSourceConfig, RawRecord};

const DEFAULT_BASE: &str = "https://firms.modaps.eosdis.nasa.gov/api/area/csv";

pub struct FirmsAdapter {
    client: reqwest::Client,
}

impl FirmsAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn url(config: &ExternalSourceConfig) -> Result<String, AdapterError> {
        let key = config
            .param("api_key")
            .ok_or_else(|| AdapterError::Config("FIRMS source requires `api_key`".into()))?;
        let base = config.param("url").unwrap_or(DEFAULT_BASE);
        let sensor = config.param("sensor").unwrap_or("VIIRS_SNPP_NRT");
        let area = config.param("area").unwrap_or("world");
        let days = config.param("days").unwrap_or("1");
        Ok(format!(
            "{}/{}/{}/{}/{}",
            base.trim_end_matches('/'),
            key,
            sensor,
            area,
            days
        ))
    }

    /// One JSON object per CSV row, keyed by header names.
    pub fn parse_csv(config: &ExternalSourceConfig, body: &str) -> Result<Vec<RawRecord>, AdapterError> {
        let t0 = std::time::Instant::now();
        let mut lines = body.lines().filter(|l| !l.trim().is_empty());
        let header: Vec<String> = match lines.next() {
            Some(h) => h.split(',').map(|c| c.trim().to_ascii_lowercase()).collect(),
            None => return Ok(Vec::new()),
        };
        if !header.iter().any(|h| h == "latitude") || !header.iter().any(|h| h == "longitude") {
            return Err(AdapterError::Malformed(
                "FIRMS csv lacks latitude/longitude columns".into(),
            ));
        }

        let mut out = Vec::new();
        for (row_no, line) in lines.enumerate() {
            let cells: Vec<&str> = line.split(',').map(str::trim).collect();
            if cells.len() != header.len() {
                tracing::debug!(target: "ingest", row = row_no, "skipping ragged FIRMS row");
                continue;
            }
            let mut obj = Map::new();
            for (k, v) in header.iter().zip(cells) {
                obj.insert(k.clone(), cell_value(v));
            }
            out.push(RawRecord::new(
                config,
                "fire_detection",
                Value::Object(obj).to_string(),
            ));
        }

        histogram!("ingest_parse_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        counter!("ingest_events_total").increment(out.len() as u64);
        Ok(out)
    }
}

fn cell_value(v: &str) -> Value {
    // acq_time is HHMM and must keep its leading zeros
    if v.len() == 4 && v.starts_with('0') {
        return Value::String(v.to_string());
    }
    match v.parse::<f64>() {
        Ok(n) if n.is_finite() => serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(v.to_string())),
        _ => Value::String(v.to_string()),
    }
}

#[async_trait]
impl DataSourceAdapter for FirmsAdapter {
    fn name(&self) -> &'static str {
        "firms"
    }

    fn check_config(&self, config: &ExternalSourceConfig) -> Result<(), AdapterError> {
        Self::url(config).map(|_| ())
    }

    async fn fetch(&self, config: &ExternalSourceConfig) -> Result<Vec<RawRecord>, AdapterError> {
        let url = Self::url(config)?;
        let body = get_text(&self.client, &url).await?;
        if body.trim_start().starts_with("Invalid") {
            // FIRMS answers 200 with a plain-text error for bad keys
            return Err(AdapterError::Rejected {
                status: 200,
                message: body.chars().take(120).collect(),
            });
        }
        Self::parse_csv(config, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::SourceType;

    fn cfg() -> ExternalSourceConfig {
        ExternalSourceConfig::new("f1", "FIRMS", SourceType::SatelliteFire).with_param("api_key", "k")
    }

    #[test]
    fn missing_api_key_is_config_error() {
        let c = ExternalSourceConfig::new("f1", "FIRMS", SourceType::SatelliteFire);
        assert!(matches!(FirmsAdapter::url(&c), Err(AdapterError::Config(_))));
    }

    #[test]
    fn parses_rows_and_keeps_acq_time_text() {
        let csv = "latitude,longitude,bright_ti4,acq_date,acq_time,confidence\n\
                   -33.9,151.1,330.5,2025-01-10,0130,n\n\
                   -34.0,151.2,301.0,2025-01-10,1412,h\n";
        let rows = FirmsAdapter::parse_csv(&cfg(), csv).unwrap();
        assert_eq!(rows.len(), 2);
        let v: Value = serde_json::from_str(&rows[0].payload).unwrap();
        assert_eq!(v["acq_time"], "0130");
        assert_eq!(v["latitude"], -33.9);
        assert_eq!(rows[0].data_type, "fire_detection");
    }

    #[test]
    fn header_without_coordinates_is_malformed() {
        let err = FirmsAdapter::parse_csv(&cfg(), "a,b\n1,2\n").unwrap_err();
        assert!(matches!(err, AdapterError::Malformed(_)));
    }
}
