// src/ingest/types.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::error::IngestError;
use crate::ingest::resilient::CircuitState;

/// Kind of upstream feed. Also names the stream namespace a source publishes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceType {
    SatelliteFire,
    Seismic,
    DisasterAlert,
    Social,
    UserReport,
}

impl SourceType {
    pub const ALL: [SourceType; 5] = [
        SourceType::SatelliteFire,
        SourceType::Seismic,
        SourceType::DisasterAlert,
        SourceType::Social,
        SourceType::UserReport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::SatelliteFire => "satellite-fire",
            SourceType::Seismic => "seismic",
            SourceType::DisasterAlert => "disaster-alert",
            SourceType::Social => "social",
            SourceType::UserReport => "user-report",
        }
    }

    /// Case-insensitive parse; accepts `_` in place of `-` (webhook paths).
    pub fn parse(s: &str) -> Option<Self> {
        let norm = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL.into_iter().find(|t| t.as_str() == norm)
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serde helper: durations travel as (fractional) seconds.
pub(crate) mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let v = f64::deserialize(d)?;
        if !v.is_finite() || v < 0.0 {
            return Err(serde::de::Error::custom("duration must be >= 0 seconds"));
        }
        Ok(Duration::from_secs_f64(v))
    }
}

fn default_true() -> bool {
    true
}

/// Operator-supplied description of one upstream feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalSourceConfig {
    pub id: String,
    pub name: String,
    pub source_type: SourceType,
    /// Opaque provider parameters (url, api_key, area, ...).
    #[serde(default)]
    pub connection: BTreeMap<String, String>,
    /// Zero means webhook-only.
    #[serde(rename = "polling_interval_secs", with = "secs", default)]
    pub polling_interval: Duration,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl ExternalSourceConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>, source_type: SourceType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            source_type,
            connection: BTreeMap::new(),
            polling_interval: Duration::ZERO,
            is_active: true,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.connection.insert(key.into(), value.into());
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.connection
            .get(key)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }

    pub fn is_webhook_only(&self) -> bool {
        self.polling_interval.is_zero()
    }

    /// Structural checks that do not depend on the provider.
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.id.trim().is_empty() {
            return Err(IngestError::InvalidConfig("id must not be empty".into()));
        }
        if self.name.trim().is_empty() {
            return Err(IngestError::InvalidConfig("name must not be empty".into()));
        }
        Ok(())
    }
}

/// Lifecycle of a raw record as it moves through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Retrying,
}

impl IngestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionStatus::Pending => "pending",
            IngestionStatus::InProgress => "in_progress",
            IngestionStatus::Completed => "completed",
            IngestionStatus::Failed => "failed",
            IngestionStatus::Retrying => "retrying",
        }
    }

    /// Forward-only moves; `Retrying` is the single way back into `InProgress`.
    pub fn can_transition_to(self, next: IngestionStatus) -> bool {
        use IngestionStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Failed)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (Failed, Retrying)
                | (Retrying, InProgress)
                | (Retrying, Failed)
        ) || self == next
    }
}

/// Unit of data produced by an ingestion actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: String,
    pub source_id: String,
    pub source_type: SourceType,
    pub data_type: String,
    /// Provider payload; adapters hand over a JSON object per record.
    pub payload: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub status: IngestionStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

impl RawRecord {
    pub fn new(
        source: &ExternalSourceConfig,
        data_type: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_id: source.id.clone(),
            source_type: source.source_type,
            data_type: data_type.into(),
            payload: payload.into(),
            metadata: BTreeMap::new(),
            status: IngestionStatus::Pending,
            error: None,
            retry_count: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn transition(&mut self, next: IngestionStatus) -> Result<(), IngestError> {
        if !self.status.can_transition_to(next) {
            return Err(IngestError::IllegalTransition {
                from: self.status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), IngestError> {
        self.transition(IngestionStatus::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }

    /// Failed -> Retrying -> InProgress, counting the attempt.
    pub fn retry(&mut self) -> Result<(), IngestError> {
        self.transition(IngestionStatus::Retrying)?;
        self.retry_count += 1;
        self.error = None;
        self.transition(IngestionStatus::InProgress)
    }
}

/// Outcome of one fetch cycle (manual or timer driven).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionResult {
    pub source_id: String,
    pub success: bool,
    pub records_processed: usize,
    pub records_failed: usize,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Lifecycle of an ingestion actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorState {
    Uninitialized,
    Initialized,
    Polling,
    Idle,
    Deactivated,
    /// Placeholder for a status that could not be collected.
    Unavailable,
}

/// Point-in-time view of an ingestion actor's counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionStatusSnapshot {
    pub source_id: String,
    pub state: ActorState,
    pub is_polling: bool,
    pub total_fetches: u64,
    pub successful_fetches: u64,
    pub failed_fetches: u64,
    pub records_published: u64,
    pub publish_failures: u64,
    pub last_error: Option<String>,
    pub last_fetch_time: Option<DateTime<Utc>>,
    pub next_fetch_time: Option<DateTime<Utc>>,
    pub circuit: CircuitState,
}

impl IngestionStatusSnapshot {
    pub fn empty(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            state: ActorState::Uninitialized,
            is_polling: false,
            total_fetches: 0,
            successful_fetches: 0,
            failed_fetches: 0,
            records_published: 0,
            publish_failures: 0,
            last_error: None,
            last_fetch_time: None,
            next_fetch_time: None,
            circuit: CircuitState::Closed,
        }
    }

    /// Entry used by fan-in when an actor did not answer.
    pub fn unavailable(source_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            state: ActorState::Unavailable,
            last_error: Some(error.into()),
            ..Self::empty(source_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src() -> ExternalSourceConfig {
        ExternalSourceConfig::new("s1", "Quakes", SourceType::Seismic)
    }

    #[test]
    fn completed_never_regresses_to_pending() {
        let mut r = RawRecord::new(&src(), "earthquake", "{}");
        r.transition(IngestionStatus::InProgress).unwrap();
        r.transition(IngestionStatus::Completed).unwrap();
        assert!(r.transition(IngestionStatus::Pending).is_err());
        assert!(r.retry().is_err());
        assert_eq!(r.status, IngestionStatus::Completed);
    }

    #[test]
    fn retry_resets_to_in_progress_and_counts() {
        let mut r = RawRecord::new(&src(), "earthquake", "{}");
        r.transition(IngestionStatus::InProgress).unwrap();
        r.fail("boom").unwrap();
        r.retry().unwrap();
        assert_eq!(r.status, IngestionStatus::InProgress);
        assert_eq!(r.retry_count, 1);
        assert!(r.error.is_none());
    }

    #[test]
    fn source_type_parses_path_variants() {
        assert_eq!(SourceType::parse("Seismic"), Some(SourceType::Seismic));
        assert_eq!(
            SourceType::parse("satellite_fire"),
            Some(SourceType::SatelliteFire)
        );
        assert_eq!(SourceType::parse("rss"), None);
    }

    #[test]
    fn config_roundtrips_interval_as_seconds() {
        let json = r#"{"id":"a","name":"A","source_type":"disaster-alert","polling_interval_secs":1.5}"#;
        let cfg: ExternalSourceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.polling_interval, Duration::from_millis(1500));
        assert!(cfg.is_active);
        let back = serde_json::to_value(&cfg).unwrap();
        assert_eq!(back["polling_interval_secs"], 1.5);
    }
}
