//! Records emitted by the transform stage and persisted by storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::ingest::types::{RawRecord, SourceType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Validated,
}

/// Normalized view of one raw record. Immutable once `Completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanRecord {
    pub id: String,
    pub raw_record_id: String,
    pub source_id: String,
    pub source_type: SourceType,
    pub data_type: String,
    pub payload: Map<String, Value>,
    pub status: ProcessingStatus,
    #[serde(default)]
    pub validation: BTreeMap<String, String>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CleanRecord {
    /// Storage seals a record once; later writes must not reopen it.
    pub fn mark_completed(&mut self) -> bool {
        match self.status {
            ProcessingStatus::Validated | ProcessingStatus::InProgress => {
                self.status = ProcessingStatus::Completed;
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub clean_record_id: String,
    pub source_id: String,
    pub source_type: SourceType,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub township: Option<String>,
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    pub id: String,
    pub clean_record_id: String,
    pub source_id: String,
    /// `<source-type>.intensity`, e.g. `seismic.intensity`.
    pub metric: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub id: String,
    pub clean_record_id: String,
    pub source_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub properties: Map<String, Value>,
}

/// Everything the transform stage produced for one raw record.
///
/// Sub-record ids are derived from the clean record id, so re-storing the
/// same result overwrites rather than duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanResult {
    pub raw: RawRecord,
    pub clean: CleanRecord,
    pub events: Vec<EventRecord>,
    pub time_series: Vec<TimeSeriesPoint>,
    pub geo_points: Vec<GeoPoint>,
}

impl CleanResult {
    pub fn id(&self) -> &str {
        &self.clean.id
    }

    pub fn is_failed(&self) -> bool {
        self.clean.status == ProcessingStatus::Failed
    }
}
