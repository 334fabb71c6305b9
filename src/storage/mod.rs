// src/storage/mod.rs
//! Storage stage: persists clean results and projects located events into
//! their township actors.

pub mod store;

use metrics::counter;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::aggregate::{FireEvent, FireStatus, Point, TownshipDirectory};
use crate::error::StorageError;
use crate::realtime::group_key;
use crate::transform::records::{CleanResult, EventRecord, ProcessingStatus};
pub use store::{EventStore, MemoryEventStore, StoreCounts};

/// Per-call outcome. Ids are listed only for rows that were written.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreResult {
    pub success: bool,
    pub clean_record_ids: Vec<String>,
    pub raw_record_ids: Vec<String>,
    pub event_ids: Vec<String>,
    pub time_series_ids: Vec<String>,
    pub geo_point_ids: Vec<String>,
    pub errors: Vec<String>,
}

impl StoreResult {
    fn absorb(&mut self, other: StoreResult) {
        self.clean_record_ids.extend(other.clean_record_ids);
        self.raw_record_ids.extend(other.raw_record_ids);
        self.event_ids.extend(other.event_ids);
        self.time_series_ids.extend(other.time_series_ids);
        self.geo_point_ids.extend(other.geo_point_ids);
        self.errors.extend(other.errors);
        self.success = self.errors.is_empty();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub results_stored: u64,
    pub partial_failures: u64,
    pub projected_events: u64,
    pub projection_failures: u64,
}

enum StorageCommand {
    Store {
        result: Box<CleanResult>,
        reply: oneshot::Sender<StoreResult>,
    },
    StoreBatch {
        results: Vec<CleanResult>,
        reply: oneshot::Sender<StoreResult>,
    },
    Stats(oneshot::Sender<StorageStats>),
}

#[derive(Clone)]
pub struct StorageHandle {
    tx: mpsc::Sender<StorageCommand>,
    store: Arc<dyn EventStore>,
}

impl StorageHandle {
    /// Read side. Writes go through the actor.
    pub fn reader(&self) -> Arc<dyn EventStore> {
        self.store.clone()
    }

    pub async fn store_processed_data(&self, result: CleanResult) -> Result<StoreResult, StorageError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StorageCommand::Store {
                result: Box::new(result),
                reply,
            })
            .await
            .map_err(|_| StorageError::Unavailable)?;
        rx.await.map_err(|_| StorageError::Unavailable)
    }

    pub async fn store_batch(&self, results: Vec<CleanResult>) -> Result<StoreResult, StorageError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StorageCommand::StoreBatch { results, reply })
            .await
            .map_err(|_| StorageError::Unavailable)?;
        rx.await.map_err(|_| StorageError::Unavailable)
    }

    pub async fn stats(&self) -> Result<StorageStats, StorageError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StorageCommand::Stats(reply))
            .await
            .map_err(|_| StorageError::Unavailable)?;
        rx.await.map_err(|_| StorageError::Unavailable)
    }
}

pub struct StorageActor {
    store: Arc<dyn EventStore>,
    townships: Option<TownshipDirectory>,
    stats: StorageStats,
}

impl StorageActor {
    /// Spawn the actor; it consumes `input` until every sender is gone.
    pub fn spawn(
        store: Arc<dyn EventStore>,
        townships: Option<TownshipDirectory>,
        input: mpsc::Receiver<CleanResult>,
    ) -> (StorageHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(32);
        let actor = StorageActor {
            store: store.clone(),
            townships,
            stats: StorageStats::default(),
        };
        let task = tokio::spawn(actor.run(rx, input));
        (StorageHandle { tx, store }, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<StorageCommand>, mut input: mpsc::Receiver<CleanResult>) {
        let mut input_open = true;
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(StorageCommand::Store { result, reply }) => {
                        let res = self.store_one(*result).await;
                        let _ = reply.send(res);
                    }
                    Some(StorageCommand::StoreBatch { results, reply }) => {
                        let res = self.store_batch(results).await;
                        let _ = reply.send(res);
                    }
                    Some(StorageCommand::Stats(reply)) => {
                        let _ = reply.send(self.stats.clone());
                    }
                    None if !input_open => break,
                    None => {
                        // handles gone; drain the stream until transform stops
                        while let Some(result) = input.recv().await {
                            self.store_one(result).await;
                        }
                        break;
                    }
                },
                next = input.recv(), if input_open => match next {
                    Some(result) => {
                        self.store_one(result).await;
                    }
                    None => input_open = false,
                },
            }
        }
        tracing::info!(target: "storage", stats = ?self.stats, "storage stage stopped");
    }

    /// Items are written in order; projection happens once for the whole batch.
    async fn store_batch(&mut self, results: Vec<CleanResult>) -> StoreResult {
        let mut total = StoreResult {
            success: true,
            ..StoreResult::default()
        };
        let mut located = Vec::new();
        for result in results {
            let (one, events) = self.persist(result).await;
            total.absorb(one);
            located.extend(events);
        }
        self.project(&located).await;
        total
    }

    async fn store_one(&mut self, result: CleanResult) -> StoreResult {
        let (out, events) = self.persist(result).await;
        self.project(&events).await;
        out
    }

    /// Writes every row of one result; returns the events eligible for projection.
    async fn persist(&mut self, mut result: CleanResult) -> (StoreResult, Vec<EventRecord>) {
        let mut out = StoreResult::default();
        let clean_id = result.clean.id.clone();

        if let Err(e) = self.store.upsert_raw(&result.raw).await {
            out.errors.push(format!("raw {}: {e}", result.raw.id));
        } else {
            out.raw_record_ids.push(result.raw.id.clone());
        }

        for event in &result.events {
            match self.store.upsert_event(event).await {
                Ok(()) => out.event_ids.push(event.id.clone()),
                Err(e) => out.errors.push(format!("event {}: {e}", event.id)),
            }
        }
        for point in &result.time_series {
            match self.store.upsert_time_series(point).await {
                Ok(()) => out.time_series_ids.push(point.id.clone()),
                Err(e) => out.errors.push(format!("time-series {}: {e}", point.id)),
            }
        }
        for point in &result.geo_points {
            match self.store.upsert_geo(point).await {
                Ok(()) => out.geo_point_ids.push(point.id.clone()),
                Err(e) => out.errors.push(format!("geo {}: {e}", point.id)),
            }
        }

        // sealed last, once its sub-records are down
        if out.errors.is_empty() {
            result.clean.mark_completed();
        }
        match self.store.upsert_clean(&result.clean).await {
            Ok(()) => out.clean_record_ids.push(clean_id.clone()),
            Err(e) => out.errors.push(format!("clean {clean_id}: {e}")),
        }

        out.success = out.errors.is_empty();
        if out.success {
            self.stats.results_stored += 1;
            counter!("storage_results_total", "outcome" => "stored").increment(1);
        } else {
            self.stats.partial_failures += 1;
            counter!("storage_results_total", "outcome" => "partial").increment(1);
            tracing::error!(target: "storage", clean_id = %clean_id, errors = ?out.errors, "clean result partially stored");
        }

        let events = if result.clean.status == ProcessingStatus::Failed {
            Vec::new()
        } else {
            result.events
        };
        (out, events)
    }

    /// Hand located events that name a township to that township's actor.
    /// Several events for one township travel as a single batch.
    async fn project(&mut self, events: &[EventRecord]) {
        let Some(dir) = self.townships.clone() else { return };
        let mut by_township: BTreeMap<String, Vec<FireEvent>> = BTreeMap::new();
        for fire in events.iter().filter_map(fire_event_from) {
            by_township.entry(group_key(&fire.township)).or_default().push(fire);
        }
        for (township, mut fires) in by_township {
            let count = fires.len() as u64;
            let res = match dir.get(&township) {
                Ok(handle) if fires.len() == 1 => match fires.pop() {
                    Some(fire) => handle.add_event(fire).await.map(|_| ()),
                    None => Ok(()),
                },
                Ok(handle) => handle.add_events(fires).await.map(|_| ()),
                Err(e) => Err(e),
            };
            match res {
                Ok(()) => self.stats.projected_events += count,
                Err(e) => {
                    self.stats.projection_failures += count;
                    counter!("storage_projection_failures_total").increment(count);
                    tracing::warn!(target: "storage", township = %township, events = count, error = %e, "township projection failed");
                }
            }
        }
    }
}

const CORE_KEYS: &[&str] = &[
    "latitude",
    "longitude",
    "timestamp",
    "intensity",
    "name",
    "description",
    "status",
    "township",
];

/// `None` unless the event has a location and a township.
pub fn fire_event_from(event: &EventRecord) -> Option<FireEvent> {
    let township = event.township.as_deref()?.trim();
    if township.is_empty() {
        return None;
    }
    let (latitude, longitude) = (event.latitude?, event.longitude?);
    let p = &event.properties;
    let text = |k: &str| p.get(k).and_then(Value::as_str).unwrap_or_default().to_string();

    let mut fire = FireEvent::new(event.id.clone(), longitude, latitude, event.timestamp);
    fire.township = township.to_string();
    fire.geometry = Point { longitude, latitude };
    fire.properties.name = text("name");
    fire.properties.description = text("description");
    fire.properties.intensity = p.get("intensity").and_then(Value::as_f64).unwrap_or(0.0);
    fire.properties.status = p
        .get("status")
        .and_then(Value::as_str)
        .and_then(FireStatus::parse)
        .unwrap_or(FireStatus::Active);
    fire.properties.extra = p
        .iter()
        .filter(|(k, _)| !CORE_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect::<Map<String, Value>>();
    Some(fire)
}
