use async_trait::async_trait;
use metrics::{counter, histogram};
use quick_xml::de::from_str;
use serde::Deserialize;
use serde_json::json;
use time::{format_description::well_known::Rfc2822, OffsetDateTime, UtcOffset};

use super::{get_text, DataSourceAdapter};
use crate::error::AdapterError;
use crate::ingest::types::{ExternalSourceConfig, RawRecord};

const DEFAULT_FEED: &str = "https://www.gdacs.org/xml/rss.xml";

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}
#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}
#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
    #[serde(rename = "geo:Point", alias = "Point")]
    point: Option<GeoPoint>,
    #[serde(rename = "gdacs:alertlevel", alias = "alertlevel")]
    alert_level: Option<String>,
    #[serde(rename = "gdacs:eventtype", alias = "eventtype")]
    event_type: Option<String>,
    #[serde(rename = "gdacs:country", alias = "country")]
    country: Option<String>,
}
#[derive(Debug, Deserialize)]
struct GeoPoint {
    #[serde(rename = "geo:lat", alias = "lat")]
    lat: f64,
    #[serde(rename = "geo:long", alias = "long")]
    long: f64,
}

fn parse_rfc2822_to_unix(ts: &str) -> Option<i64> {
    OffsetDateTime::parse(ts.trim(), &Rfc2822)
        .ok()
        .map(|dt| dt.to_offset(UtcOffset::UTC).unix_timestamp())
}

/// GDACS disaster alerts (RSS with geo/gdacs extensions).
pub struct GdacsRssAdapter {
    client: reqwest::Client,
}

impl GdacsRssAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn parse_items_from_str(
        config: &ExternalSourceConfig,
        s: &str,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let t0 = std::time::Instant::now();
        let xml_clean = scrub_html_entities_for_xml(s);
        let rss: Rss = from_str(&xml_clean)
            .map_err(|e| AdapterError::Malformed(format!("gdacs rss xml: {e}")))?;

        let mut out = Vec::with_capacity(rss.channel.item.len());
        for it in rss.channel.item {
            // alerts without a location cannot be placed on the map
            let Some(point) = it.point else { continue };
            let payload = json!({
                "title": it.title,
                "description": it.description,
                "link": it.link,
                "time": it.pub_date.as_deref().and_then(parse_rfc2822_to_unix),
                "latitude": point.lat,
                "longitude": point.long,
                "alert_level": it.alert_level,
                "event_type": it.event_type,
                "country": it.country,
            });
            out.push(RawRecord::new(config, "disaster_alert", payload.to_string()));
        }

        let ms = t0.elapsed().as_secs_f64() * 1_000.0;
        histogram!("ingest_parse_ms").record(ms);
        counter!("ingest_events_total").increment(out.len() as u64);
        Ok(out)
    }
}

#[async_trait]
impl DataSourceAdapter for GdacsRssAdapter {
    fn name(&self) -> &'static str {
        "gdacs"
    }

    async fn fetch(&self, config: &ExternalSourceConfig) -> Result<Vec<RawRecord>, AdapterError> {
        let url = config.param("url").unwrap_or(DEFAULT_FEED);
        let body = get_text(&self.client, url).await.map_err(|e| {
            tracing::warn!(error = %e, provider = "gdacs", "provider http error");
            counter!("ingest_provider_errors_total").increment(1);
            e
        })?;
        Self::parse_items_from_str(config, &body)
    }
}

fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}
