// src/transform/normalize.rs
//! Normalize → enrich → split.
//!
//! Providers disagree on field names, units and time formats. `normalize`
//! maps the known aliases onto one set of canonical keys and keeps every
//! other field as-is (open schema):
//!
//! | canonical     | aliases                                                     |
//! |---------------|-------------------------------------------------------------|
//! | `latitude`    | `lat`, GeoJSON `geometry.coordinates[1]`                    |
//! | `longitude`   | `lon`, `lng`, `long`, GeoJSON `geometry.coordinates[0]`     |
//! | `timestamp`   | `time`, `datetime`, `date`, `created_at`, FIRMS `acq_date`+`acq_time` |
//! | `intensity`   | `magnitude`, `mag`, `frp`, GDACS `alert_level` (green/orange/red) |
//! | `name`        | `title`                                                     |
//! | `description` | `summary`, `text`, `body`, `content`                        |
//! | `status`      | defaults to `active`                                        |

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

use crate::aggregate::FireStatus;
use crate::error::TransformError;
use crate::ingest::adapters::json_kind;
use crate::ingest::types::RawRecord;
use crate::transform::records::{EventRecord, GeoPoint, TimeSeriesPoint};

const LAT_KEYS: &[&str] = &["latitude", "lat"];
const LON_KEYS: &[&str] = &["longitude", "lon", "lng", "long"];
const TIME_KEYS: &[&str] = &["timestamp", "time", "datetime", "date", "created_at"];
const INTENSITY_KEYS: &[&str] = &["intensity", "magnitude", "mag", "frp"];
const NAME_KEYS: &[&str] = &["name", "title"];
const DESCRIPTION_KEYS: &[&str] = &["description", "summary", "text", "body", "content"];

/// Above this an epoch number is taken as milliseconds (year ~5138 in seconds).
const EPOCH_MS_THRESHOLD: f64 = 1e11;

const MAX_TEXT_CHARS: usize = 1500;

/// Normalized fields plus per-field validation notes.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub fields: Map<String, Value>,
    pub validation: BTreeMap<String, String>,
}

/// Clean up free text: decode entities, strip tags, ASCII quotes, collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    static RE_TAGS: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?is)</?[^>]+>").ok());
    static RE_WS: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\s+").ok());

    let mut out = html_escape::decode_html_entities(s).to_string();
    if let Some(re) = RE_TAGS.as_ref() {
        out = re.replace_all(&out, "").to_string();
    }
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");
    if let Some(re) = RE_WS.as_ref() {
        out = re.replace_all(&out, " ").to_string();
    }
    let mut out = out.trim().to_string();
    if out.chars().count() > MAX_TEXT_CHARS {
        out = out.chars().take(MAX_TEXT_CHARS).collect();
    }
    out
}

fn take_first(src: &mut Map<String, Value>, keys: &[&str]) -> Option<Value> {
    for k in keys {
        match src.remove(*k) {
            Some(Value::Null) | None => continue,
            Some(v) => return Some(v),
        }
    }
    None
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|f| f.is_finite())
}

fn number(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn take_coordinate(
    src: &mut Map<String, Value>,
    keys: &[&str],
    field: &'static str,
    range: f64,
) -> Result<Option<f64>, TransformError> {
    let Some(v) = take_first(src, keys) else {
        return Ok(None);
    };
    let f = as_f64(&v).ok_or_else(|| TransformError::InvalidField {
        field,
        message: format!("not a number: {v}"),
    })?;
    if !(-range..=range).contains(&f) {
        return Err(TransformError::InvalidField {
            field,
            message: format!("{f} outside ±{range}"),
        });
    }
    Ok(Some(f))
}

/// GeoJSON `geometry: {type: Point, coordinates: [lon, lat, ...]}`.
fn geometry_point(src: &Map<String, Value>) -> Option<(f64, f64)> {
    let coords = src.get("geometry")?.get("coordinates")?.as_array()?;
    let lon = as_f64(coords.first()?)?;
    let lat = as_f64(coords.get(1)?)?;
    Some((lat, lon))
}

fn epoch_to_utc(n: f64) -> Option<DateTime<Utc>> {
    if n.abs() >= EPOCH_MS_THRESHOLD {
        DateTime::from_timestamp_millis(n as i64)
    } else {
        DateTime::from_timestamp(n as i64, 0)
    }
}

fn parse_time_str(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(d.and_time(NaiveTime::MIN).and_utc());
    }
    s.parse::<f64>().ok().and_then(epoch_to_utc)
}

/// FIRMS splits acquisition time into `acq_date` (YYYY-MM-DD) and `acq_time` (HHMM, UTC).
fn firms_acquisition(src: &mut Map<String, Value>) -> Result<Option<DateTime<Utc>>, TransformError> {
    let Some(date) = src.get("acq_date").and_then(Value::as_str).map(str::to_string) else {
        return Ok(None);
    };
    let hhmm = match src.get("acq_time") {
        Some(Value::String(s)) => s.trim().parse::<u32>().ok(),
        Some(Value::Number(n)) => n.as_u64().map(|n| n as u32),
        _ => Some(0),
    };
    let day = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d").ok();
    let time = hhmm.and_then(|t| NaiveTime::from_hms_opt(t / 100, t % 100, 0));
    match (day, time) {
        (Some(d), Some(t)) => {
            src.remove("acq_date");
            src.remove("acq_time");
            Ok(Some(d.and_time(t).and_utc()))
        }
        _ => Err(TransformError::InvalidField {
            field: "timestamp",
            message: format!("bad acquisition date/time {date:?}"),
        }),
    }
}

fn take_timestamp(src: &mut Map<String, Value>) -> Result<Option<DateTime<Utc>>, TransformError> {
    if let Some(ts) = firms_acquisition(src)? {
        return Ok(Some(ts));
    }
    let Some(v) = take_first(src, TIME_KEYS) else {
        return Ok(None);
    };
    let parsed = match &v {
        Value::Number(n) => n.as_f64().and_then(epoch_to_utc),
        Value::String(s) => parse_time_str(s),
        _ => None,
    };
    parsed.map(Some).ok_or_else(|| TransformError::InvalidField {
        field: "timestamp",
        message: format!("unrecognized time {v}"),
    })
}

fn alert_level_intensity(level: &str) -> Option<f64> {
    match level.trim().to_ascii_lowercase().as_str() {
        "green" => Some(3.0),
        "orange" => Some(6.0),
        "red" => Some(9.0),
        _ => None,
    }
}

fn take_text(src: &mut Map<String, Value>, keys: &[&str]) -> Option<String> {
    take_first(src, keys)
        .and_then(|v| v.as_str().map(normalize_text))
        .filter(|s| !s.is_empty())
}

fn note(validation: &mut BTreeMap<String, String>, field: &str, ok: bool, missing: &str) {
    let v = if ok { "ok" } else { missing };
    validation.insert(field.to_string(), v.to_string());
}

/// Map a raw payload onto canonical keys. Fails only on unusable input
/// (non-object payload, out-of-range coordinates, unparseable time).
pub fn normalize(raw: &RawRecord) -> Result<Normalized, TransformError> {
    let value: Value = serde_json::from_str(&raw.payload)
        .map_err(|e| TransformError::InvalidPayload(e.to_string()))?;
    let mut src = match value {
        Value::Object(m) => m,
        other => return Err(TransformError::InvalidPayload(format!("got {}", json_kind(&other)))),
    };

    let mut fields = Map::new();
    let mut validation = BTreeMap::new();

    let mut lat = take_coordinate(&mut src, LAT_KEYS, "latitude", 90.0)?;
    let mut lon = take_coordinate(&mut src, LON_KEYS, "longitude", 180.0)?;
    if lat.is_none() || lon.is_none() {
        if let Some((g_lat, g_lon)) = geometry_point(&src) {
            if !(-90.0..=90.0).contains(&g_lat) || !(-180.0..=180.0).contains(&g_lon) {
                return Err(TransformError::InvalidField {
                    field: "geometry",
                    message: format!("({g_lon}, {g_lat}) out of range"),
                });
            }
            src.remove("geometry");
            lat = Some(g_lat);
            lon = Some(g_lon);
        }
    }
    let located = matches!((lat, lon), (Some(_), Some(_)));
    if let (Some(lat), Some(lon)) = (lat, lon) {
        fields.insert("latitude".into(), number(lat));
        fields.insert("longitude".into(), number(lon));
    }
    note(&mut validation, "location", located, "missing");

    let ts = take_timestamp(&mut src)?;
    if let Some(ts) = ts {
        fields.insert(
            "timestamp".into(),
            Value::String(ts.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
    }
    note(&mut validation, "timestamp", ts.is_some(), "missing");

    let intensity = take_first(&mut src, INTENSITY_KEYS)
        .and_then(|v| as_f64(&v))
        .or_else(|| {
            src.get("alert_level")
                .and_then(Value::as_str)
                .and_then(alert_level_intensity)
        });
    if let Some(i) = intensity {
        fields.insert("intensity".into(), number(i));
    }
    note(&mut validation, "intensity", intensity.is_some(), "missing");

    if let Some(name) = take_text(&mut src, NAME_KEYS) {
        fields.insert("name".into(), Value::String(name));
    }
    if let Some(desc) = take_text(&mut src, DESCRIPTION_KEYS) {
        fields.insert("description".into(), Value::String(desc));
    }

    let status = src
        .remove("status")
        .and_then(|v| v.as_str().and_then(FireStatus::parse));
    note(&mut validation, "status", status.is_some(), "defaulted");
    fields.insert(
        "status".into(),
        Value::String(status.unwrap_or(FireStatus::Active).as_str().to_string()),
    );

    for (k, v) in src {
        if !v.is_null() {
            fields.insert(k, v);
        }
    }
    Ok(Normalized { fields, validation })
}

fn severity_for(intensity: f64) -> &'static str {
    if intensity >= 7.0 {
        "high"
    } else if intensity >= 4.0 {
        "moderate"
    } else {
        "low"
    }
}

/// Attach provenance and computed fields. Never overwrites provider values.
pub fn enrich(fields: &mut Map<String, Value>, raw: &RawRecord, now: DateTime<Utc>) {
    let mut put = |k: &str, v: Value| {
        fields.entry(k.to_string()).or_insert(v);
    };
    put("source_id", Value::String(raw.source_id.clone()));
    put("source_type", Value::String(raw.source_type.to_string()));
    put("data_type", Value::String(raw.data_type.clone()));
    put(
        "ingested_at",
        Value::String(now.to_rfc3339_opts(SecondsFormat::Secs, true)),
    );
    if let Some(t) = raw.metadata.get("township") {
        put("township", Value::String(t.clone()));
    }
    if let Some(i) = fields.get("intensity").and_then(Value::as_f64) {
        fields
            .entry("severity".to_string())
            .or_insert_with(|| Value::String(severity_for(i).to_string()));
    }
}

/// Typed sub-records derived from one clean record.
#[derive(Debug, Default)]
pub struct Split {
    pub events: Vec<EventRecord>,
    pub time_series: Vec<TimeSeriesPoint>,
    pub geo_points: Vec<GeoPoint>,
}

/// Event needs a timestamp, time-series needs timestamp + intensity, geo needs a location.
pub fn split(clean_id: &str, raw: &RawRecord, fields: &Map<String, Value>) -> Split {
    let mut out = Split::default();
    let ts = fields
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc));
    let lat = fields.get("latitude").and_then(Value::as_f64);
    let lon = fields.get("longitude").and_then(Value::as_f64);
    let intensity = fields.get("intensity").and_then(Value::as_f64);

    if let Some(ts) = ts {
        out.events.push(EventRecord {
            id: format!("{clean_id}:event"),
            clean_record_id: clean_id.to_string(),
            source_id: raw.source_id.clone(),
            source_type: raw.source_type,
            event_type: raw.data_type.clone(),
            timestamp: ts,
            latitude: lat,
            longitude: lon,
            township: fields
                .get("township")
                .and_then(Value::as_str)
                .map(str::to_string),
            properties: fields.clone(),
        });
        if let Some(value) = intensity {
            out.time_series.push(TimeSeriesPoint {
                id: format!("{clean_id}:intensity"),
                clean_record_id: clean_id.to_string(),
                source_id: raw.source_id.clone(),
                metric: format!("{}.intensity", raw.source_type),
                timestamp: ts,
                value,
            });
        }
    }
    if let (Some(latitude), Some(longitude)) = (lat, lon) {
        out.geo_points.push(GeoPoint {
            id: format!("{clean_id}:geo"),
            clean_record_id: clean_id.to_string(),
            source_id: raw.source_id.clone(),
            latitude,
            longitude,
            properties: fields.clone(),
        });
    }
    out
}
