// src/storage/store.rs
//! Persistence boundary. Every write is an upsert keyed by record id.
//!
//! `MemoryEventStore` keeps the secondary indexes a relational backend would:
//! raw records by (source, created_at), time-series by (metric, timestamp),
//! geo points by (lat, lon).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::aggregate::BoundingBox;
use crate::error::StorageError;
use crate::ingest::types::RawRecord;
use crate::transform::records::{CleanRecord, EventRecord, GeoPoint, ProcessingStatus, TimeSeriesPoint};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub raw_records: usize,
    pub clean_records: usize,
    pub events: usize,
    pub time_series: usize,
    pub geo_points: usize,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn upsert_raw(&self, record: &RawRecord) -> Result<(), StorageError>;
    /// A record already stored as `Completed` is left untouched.
    async fn upsert_clean(&self, record: &CleanRecord) -> Result<(), StorageError>;
    async fn upsert_event(&self, event: &EventRecord) -> Result<(), StorageError>;
    async fn upsert_time_series(&self, point: &TimeSeriesPoint) -> Result<(), StorageError>;
    async fn upsert_geo(&self, point: &GeoPoint) -> Result<(), StorageError>;

    async fn clean_record(&self, id: &str) -> Result<Option<CleanRecord>, StorageError>;
    async fn clean_records_for_source(&self, source_id: &str) -> Result<Vec<CleanRecord>, StorageError>;
    /// Page of a source's raw records created after `after`, oldest first.
    async fn raw_records_by_source(
        &self,
        source_id: &str,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<RawRecord>, StorageError>;
    async fn time_series(
        &self,
        metric: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TimeSeriesPoint>, StorageError>;
    async fn geo_points_in(&self, bbox: BoundingBox) -> Result<Vec<GeoPoint>, StorageError>;
    async fn geo_points_for_source(&self, source_id: &str) -> Result<Vec<GeoPoint>, StorageError>;
    async fn counts(&self) -> Result<StoreCounts, StorageError>;
}

/// Micro-degrees; f64 has no total order for the index.
fn micro(deg: f64) -> i64 {
    (deg * 1_000_000.0).round() as i64
}

#[derive(Default)]
struct Tables {
    raw: HashMap<String, RawRecord>,
    raw_by_source: BTreeSet<(String, DateTime<Utc>, String)>,
    clean: HashMap<String, CleanRecord>,
    events: HashMap<String, EventRecord>,
    series: HashMap<String, TimeSeriesPoint>,
    series_by_metric: BTreeSet<(String, DateTime<Utc>, String)>,
    geo: HashMap<String, GeoPoint>,
    geo_by_position: BTreeSet<(i64, i64, String)>,
}

#[derive(Default)]
pub struct MemoryEventStore {
    tables: RwLock<Tables>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn upsert_raw(&self, record: &RawRecord) -> Result<(), StorageError> {
        let mut t = self.write();
        if let Some(old) = t.raw.insert(record.id.clone(), record.clone()) {
            t.raw_by_source
                .remove(&(old.source_id, old.created_at, old.id));
        }
        t.raw_by_source.insert((
            record.source_id.clone(),
            record.created_at,
            record.id.clone(),
        ));
        Ok(())
    }

    async fn upsert_clean(&self, record: &CleanRecord) -> Result<(), StorageError> {
        let mut t = self.write();
        if t
            .clean
            .get(&record.id)
            .is_some_and(|c| c.status == ProcessingStatus::Completed)
        {
            return Ok(());
        }
        t.clean.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn upsert_event(&self, event: &EventRecord) -> Result<(), StorageError> {
        self.write().events.insert(event.id.clone(), event.clone());
        Ok(())
    }

    async fn upsert_time_series(&self, point: &TimeSeriesPoint) -> Result<(), StorageError> {
        let mut t = self.write();
        if let Some(old) = t.series.insert(point.id.clone(), point.clone()) {
            t.series_by_metric.remove(&(old.metric, old.timestamp, old.id));
        }
        t.series_by_metric
            .insert((point.metric.clone(), point.timestamp, point.id.clone()));
        Ok(())
    }

    async fn upsert_geo(&self, point: &GeoPoint) -> Result<(), StorageError> {
        let mut t = self.write();
        if let Some(old) = t.geo.insert(point.id.clone(), point.clone()) {
            t.geo_by_position
                .remove(&(micro(old.latitude), micro(old.longitude), old.id));
        }
        t.geo_by_position.insert((
            micro(point.latitude),
            micro(point.longitude),
            point.id.clone(),
        ));
        Ok(())
    }

    async fn clean_record(&self, id: &str) -> Result<Option<CleanRecord>, StorageError> {
        Ok(self.read().clean.get(id).cloned())
    }

    async fn clean_records_for_source(&self, source_id: &str) -> Result<Vec<CleanRecord>, StorageError> {
        let t = self.read();
        let mut out: Vec<CleanRecord> = t
            .clean
            .values()
            .filter(|c| c.source_id == source_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn raw_records_by_source(
        &self,
        source_id: &str,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<RawRecord>, StorageError> {
        let t = self.read();
        let start = (
            source_id.to_string(),
            after.unwrap_or(DateTime::<Utc>::MIN_UTC),
            String::new(),
        );
        Ok(t.raw_by_source
            .range(start..)
            .take_while(|(s, _, _)| s == source_id)
            .filter(|(_, ts, _)| after.map_or(true, |a| *ts > a))
            .filter_map(|(_, _, id)| t.raw.get(id).cloned())
            .take(limit)
            .collect())
    }

    async fn time_series(
        &self,
        metric: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TimeSeriesPoint>, StorageError> {
        let t = self.read();
        let start = (metric.to_string(), from, String::new());
        Ok(t.series_by_metric
            .range(start..)
            .take_while(|(m, ts, _)| m == metric && *ts <= to)
            .filter_map(|(_, _, id)| t.series.get(id).cloned())
            .collect())
    }

    async fn geo_points_in(&self, bbox: BoundingBox) -> Result<Vec<GeoPoint>, StorageError> {
        let t = self.read();
        let start = (micro(bbox.min_lat), i64::MIN, String::new());
        Ok(t.geo_by_position
            .range(start..)
            .take_while(|(lat, _, _)| *lat <= micro(bbox.max_lat))
            .filter(|(_, lon, _)| (micro(bbox.min_lon)..=micro(bbox.max_lon)).contains(lon))
            .filter_map(|(_, _, id)| t.geo.get(id).cloned())
            .collect())
    }

    async fn geo_points_for_source(&self, source_id: &str) -> Result<Vec<GeoPoint>, StorageError> {
        let t = self.read();
        let mut out: Vec<GeoPoint> = t
            .geo
            .values()
            .filter(|g| g.source_id == source_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn counts(&self) -> Result<StoreCounts, StorageError> {
        let t = self.read();
        Ok(StoreCounts {
            raw_records: t.raw.len(),
            clean_records: t.clean.len(),
            events: t.events.len(),
            time_series: t.series.len(),
            geo_points: t.geo.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::{ExternalSourceConfig, SourceType};
    use chrono::{Duration, TimeZone};
    use serde_json::Map;

    fn geo(id: &str, lat: f64, lon: f64) -> GeoPoint {
        GeoPoint {
            id: id.into(),
            clean_record_id: "c".into(),
            source_id: "s".into(),
            latitude: lat,
            longitude: lon,
            properties: Map::new(),
        }
    }

    #[tokio::test]
    async fn geo_index_is_inclusive_and_follows_upserts() {
        let store = MemoryEventStore::new();
        store.upsert_geo(&geo("edge", 35.0, -118.0)).await.unwrap();
        store.upsert_geo(&geo("moving", 35.5, -117.5)).await.unwrap();
        store.upsert_geo(&geo("moving", 50.0, 10.0)).await.unwrap();
        let bbox = BoundingBox {
            min_lon: -118.0,
            min_lat: 35.0,
            max_lon: -117.0,
            max_lat: 36.0,
        };
        let ids: Vec<String> = store.geo_points_in(bbox).await.unwrap().into_iter().map(|g| g.id).collect();
        assert_eq!(ids, vec!["edge"]);
        assert_eq!(store.counts().await.unwrap().geo_points, 2);
    }

    #[tokio::test]
    async fn raw_records_page_by_source_and_time() {
        let store = MemoryEventStore::new();
        let cfg = ExternalSourceConfig::new("s1", "A", SourceType::Social);
        let other = ExternalSourceConfig::new("s2", "B", SourceType::Social);
        let base = Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap();
        for i in 0..5 {
            let mut r = RawRecord::new(&cfg, "x", "{}");
            r.created_at = base + Duration::minutes(i);
            store.upsert_raw(&r).await.unwrap();
        }
        store.upsert_raw(&RawRecord::new(&other, "x", "{}")).await.unwrap();

        let first = store.raw_records_by_source("s1", None, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        let next = store
            .raw_records_by_source("s1", Some(first[1].created_at), 10)
            .await
            .unwrap();
        assert_eq!(next.len(), 3);
        assert!(next.iter().all(|r| r.source_id == "s1" && r.created_at > first[1].created_at));
    }

    #[tokio::test]
    async fn completed_clean_record_is_not_reopened() {
        let store = MemoryEventStore::new();
        let mut c = CleanRecord {
            id: "c1".into(),
            raw_record_id: "r1".into(),
            source_id: "s1".into(),
            source_type: SourceType::Seismic,
            data_type: "earthquake".into(),
            payload: Map::new(),
            status: ProcessingStatus::Completed,
            validation: Default::default(),
            error: None,
            created_at: Utc::now(),
        };
        store.upsert_clean(&c).await.unwrap();
        c.status = ProcessingStatus::Failed;
        store.upsert_clean(&c).await.unwrap();
        assert_eq!(
            store.clean_record("c1").await.unwrap().unwrap().status,
            ProcessingStatus::Completed
        );
    }

    #[tokio::test]
    async fn time_series_range_is_inclusive() {
        let store = MemoryEventStore::new();
        let t0 = Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap();
        for (i, metric) in ["seismic.intensity", "seismic.intensity", "social.intensity"].iter().enumerate() {
            store
                .upsert_time_series(&TimeSeriesPoint {
                    id: format!("p{i}"),
                    clean_record_id: "c".into(),
                    source_id: "s".into(),
                    metric: metric.to_string(),
                    timestamp: t0 + Duration::hours(i as i64),
                    value: i as f64,
                })
                .await
                .unwrap();
        }
        let pts = store
            .time_series("seismic.intensity", t0, t0 + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(pts.len(), 2);
    }
}
