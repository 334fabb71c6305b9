//! Event filters and the daily summary.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::{FireEvent, FireStatus};

/// Point-in-rectangle, bounds inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn contains(&self, longitude: f64, latitude: f64) -> bool {
        (self.min_lon..=self.max_lon).contains(&longitude)
            && (self.min_lat..=self.max_lat).contains(&latitude)
    }

    pub fn is_valid(&self) -> bool {
        self.min_lon <= self.max_lon && self.min_lat <= self.max_lat
    }
}

/// ANDed filters; `None` fields do not filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventQuery {
    pub from_date: Option<DateTime<Utc>>,
    pub to_date: Option<DateTime<Utc>>,
    pub status: Option<String>,
    pub min_intensity: Option<f64>,
    pub max_intensity: Option<f64>,
    pub bbox: Option<BoundingBox>,
}

impl EventQuery {
    pub fn with_bbox(mut self, bbox: BoundingBox) -> Self {
        self.bbox = Some(bbox);
        self
    }

    /// Date range, then status, then intensity, then bounding box.
    pub fn matches(&self, e: &FireEvent) -> bool {
        let p = &e.properties;
        if self.from_date.is_some_and(|from| p.timestamp < from) {
            return false;
        }
        if self.to_date.is_some_and(|to| p.timestamp > to) {
            return false;
        }
        if let Some(status) = self.status.as_deref() {
            if !p.status.as_str().eq_ignore_ascii_case(status.trim()) {
                return false;
            }
        }
        if self.min_intensity.is_some_and(|min| p.intensity < min) {
            return false;
        }
        if self.max_intensity.is_some_and(|max| p.intensity > max) {
            return false;
        }
        if let Some(bbox) = &self.bbox {
            if !bbox.contains(e.geometry.longitude, e.geometry.latitude) {
                return false;
            }
        }
        true
    }

    /// Insertion order is preserved.
    pub fn apply(&self, events: &[FireEvent]) -> Vec<FireEvent> {
        events.iter().filter(|e| self.matches(e)).cloned().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TownshipSummary {
    pub township: String,
    pub event_count: usize,
    pub last_event_time: Option<DateTime<Utc>>,
    pub average_intensity: f64,
    pub most_severe_status: Option<FireStatus>,
}

/// Daily rollup: only events whose UTC calendar day is `today` count.
pub fn summarize(township: &str, events: &[FireEvent], today: NaiveDate) -> TownshipSummary {
    let todays: Vec<&FireEvent> = events
        .iter()
        .filter(|e| e.properties.timestamp.date_naive() == today)
        .collect();

    let mut summary = TownshipSummary {
        township: township.to_string(),
        event_count: todays.len(),
        last_event_time: None,
        average_intensity: 0.0,
        most_severe_status: None,
    };
    if todays.is_empty() {
        return summary;
    }

    summary.last_event_time = todays.iter().map(|e| e.properties.timestamp).max();
    summary.average_intensity =
        todays.iter().map(|e| e.properties.intensity).sum::<f64>() / todays.len() as f64;

    let mut worst = todays[0];
    for e in &todays[1..] {
        if e.properties.intensity > worst.properties.intensity {
            worst = e;
        }
    }
    summary.most_severe_status = Some(worst.properties.status);
    summary
}
