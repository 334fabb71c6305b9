// src/aggregate/mod.rs
//! Per-township aggregate actors.
//!
//! Each township key has exactly one actor task owning its `AggregateState`.
//! Mutations are write-through: the new state is persisted before the caller
//! gets an answer, and a failed write rolls the in-memory state back.

pub mod query;
pub mod state_store;

use chrono::{DateTime, NaiveDate, Utc};
use futures::future::join_all;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};

use crate::error::AggregateError;
use crate::realtime::{Notification, RealtimeFanout};
pub use query::{summarize, BoundingBox, EventQuery, TownshipSummary};
pub use state_store::{AggregateStateStore, JsonFileStateStore, MemoryStateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FireStatus {
    Active,
    Contained,
    Resolved,
}

impl FireStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FireStatus::Active => "active",
            FireStatus::Contained => "contained",
            FireStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Some(FireStatus::Active),
            "contained" => Some(FireStatus::Contained),
            "resolved" => Some(FireStatus::Resolved),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub longitude: f64,
    pub latitude: f64,
}

/// Core fields are typed; anything else a provider sends lives in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FireEventProperties {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub intensity: f64,
    #[serde(default = "default_status")]
    pub status: FireStatus,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_status() -> FireStatus {
    FireStatus::Active
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FireEvent {
    pub id: String,
    /// Owning township; always overwritten by the township actor.
    #[serde(default)]
    pub township: String,
    pub geometry: Point,
    pub properties: FireEventProperties,
}

impl FireEvent {
    pub fn new(id: impl Into<String>, longitude: f64, latitude: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            township: String::new(),
            geometry: Point { longitude, latitude },
            properties: FireEventProperties {
                name: String::new(),
                description: String::new(),
                timestamp,
                intensity: 0.0,
                status: FireStatus::Active,
                extra: Map::new(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateState {
    pub events: Vec<FireEvent>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Township keys are trimmed and case-insensitive.
pub fn township_key(name: &str) -> Result<String, AggregateError> {
    let key = crate::realtime::group_key(name);
    if key.is_empty() {
        return Err(AggregateError::InvalidKey(name.to_string()));
    }
    Ok(key)
}

type Reply<T> = oneshot::Sender<Result<T, AggregateError>>;

enum TownshipCommand {
    Query { query: EventQuery, reply: Reply<Vec<FireEvent>> },
    Add { event: FireEvent, reply: Reply<FireEvent> },
    AddMany { events: Vec<FireEvent>, reply: Reply<Vec<FireEvent>> },
    Update { event: FireEvent, reply: Reply<bool> },
    Remove { id: String, reply: Reply<bool> },
    Summary { day: NaiveDate, reply: Reply<TownshipSummary> },
}

#[derive(Clone, Debug)]
pub struct TownshipHandle {
    key: String,
    tx: mpsc::Sender<TownshipCommand>,
}

impl TownshipHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> TownshipCommand) -> Result<T, AggregateError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| AggregateError::Unavailable(self.key.clone()))?;
        rx.await
            .map_err(|_| AggregateError::Unavailable(self.key.clone()))?
    }

    pub async fn get_events(&self, query: EventQuery) -> Result<Vec<FireEvent>, AggregateError> {
        self.request(|reply| TownshipCommand::Query { query, reply }).await
    }

    /// Upsert by id; returns the stored event (with its township set).
    pub async fn add_event(&self, event: FireEvent) -> Result<FireEvent, AggregateError> {
        self.request(|reply| TownshipCommand::Add { event, reply }).await
    }

    /// Upsert several events in one write; subscribers get a single batch notice.
    pub async fn add_events(&self, events: Vec<FireEvent>) -> Result<Vec<FireEvent>, AggregateError> {
        self.request(|reply| TownshipCommand::AddMany { events, reply }).await
    }

    /// `Ok(false)` when no event has this id.
    pub async fn update_event(&self, event: FireEvent) -> Result<bool, AggregateError> {
        self.request(|reply| TownshipCommand::Update { event, reply }).await
    }

    pub async fn remove_event(&self, id: impl Into<String>) -> Result<bool, AggregateError> {
        let id = id.into();
        self.request(|reply| TownshipCommand::Remove { id, reply }).await
    }

    pub async fn get_summary(&self) -> Result<TownshipSummary, AggregateError> {
        self.get_summary_on(Utc::now().date_naive()).await
    }

    pub async fn get_summary_on(&self, day: NaiveDate) -> Result<TownshipSummary, AggregateError> {
        self.request(|reply| TownshipCommand::Summary { day, reply }).await
    }
}

struct TownshipActor {
    key: String,
    store: Arc<dyn AggregateStateStore>,
    fanout: RealtimeFanout,
    state: Option<AggregateState>,
}

impl TownshipActor {
    fn spawn(
        key: String,
        store: Arc<dyn AggregateStateStore>,
        fanout: RealtimeFanout,
        mailbox: usize,
    ) -> TownshipHandle {
        let (tx, rx) = mpsc::channel(mailbox.max(1));
        let actor = TownshipActor {
            key: key.clone(),
            store,
            fanout,
            state: None,
        };
        tokio::spawn(actor.run(rx));
        TownshipHandle { key, tx }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<TownshipCommand>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                TownshipCommand::Query { query, reply } => {
                    let res = self.loaded().await.map(|s| query.apply(&s.events));
                    let _ = reply.send(res);
                }
                TownshipCommand::Summary { day, reply } => {
                    let key = self.key.clone();
                    let res = self.loaded().await.map(|s| summarize(&key, &s.events, day));
                    let _ = reply.send(res);
                }
                TownshipCommand::Add { event, reply } => {
                    let _ = reply.send(self.add(event).await);
                }
                TownshipCommand::AddMany { events, reply } => {
                    let _ = reply.send(self.add_many(events).await);
                }
                TownshipCommand::Update { event, reply } => {
                    let _ = reply.send(self.update(event).await);
                }
                TownshipCommand::Remove { id, reply } => {
                    let _ = reply.send(self.remove(&id).await);
                }
            }
        }
    }

    /// Lazy load on first use; a failed load is retried on the next command.
    async fn loaded(&mut self) -> Result<&mut AggregateState, AggregateError> {
        if self.state.is_none() {
            let loaded = self.store.load(&self.key).await?.unwrap_or_default();
            tracing::debug!(target: "aggregate", township = %self.key, events = loaded.events.len(), "township state loaded");
            self.state = Some(loaded);
        }
        self.state
            .as_mut()
            .ok_or_else(|| AggregateError::Unavailable(self.key.clone()))
    }

    /// Apply `mutate` to a copy, persist it, then swap it in.
    async fn commit<T>(
        &mut self,
        mutate: impl FnOnce(&mut AggregateState) -> Option<T>,
    ) -> Result<Option<T>, AggregateError> {
        let mut next = self.loaded().await?.clone();
        let Some(out) = mutate(&mut next) else {
            return Ok(None);
        };
        next.last_updated = Some(Utc::now());
        if let Err(e) = self.store.save(&self.key, &next).await {
            tracing::error!(target: "aggregate", township = %self.key, error = %e, "township state not persisted; change discarded");
            counter!("aggregate_persist_failures_total").increment(1);
            return Err(e);
        }
        self.state = Some(next);
        Ok(Some(out))
    }

    async fn add(&mut self, mut event: FireEvent) -> Result<FireEvent, AggregateError> {
        event.township = self.key.clone();
        let stored = event.clone();
        let replaced = self
            .commit(move |s| {
                let replaced = match s.events.iter_mut().find(|e| e.id == event.id) {
                    Some(slot) => {
                        *slot = event;
                        true
                    }
                    None => {
                        s.events.push(event);
                        false
                    }
                };
                Some(replaced)
            })
            .await?
            .unwrap_or(false);

        counter!("aggregate_mutations_total", "op" => "add").increment(1);
        let group = self.key.clone();
        self.fanout.publish(if replaced {
            Notification::EventUpdated { group, event: stored.clone() }
        } else {
            Notification::EventAdded { group, event: stored.clone() }
        });
        Ok(stored)
    }

    async fn add_many(&mut self, mut events: Vec<FireEvent>) -> Result<Vec<FireEvent>, AggregateError> {
        if events.is_empty() {
            return Ok(events);
        }
        for e in &mut events {
            e.township = self.key.clone();
        }
        let stored = events.clone();
        self.commit(move |s| {
            for event in events {
                match s.events.iter_mut().find(|e| e.id == event.id) {
                    Some(slot) => *slot = event,
                    None => s.events.push(event),
                }
            }
            Some(())
        })
        .await?;

        counter!("aggregate_mutations_total", "op" => "add_batch").increment(1);
        self.fanout.publish_batch(&self.key, stored.clone());
        Ok(stored)
    }

    async fn update(&mut self, mut event: FireEvent) -> Result<bool, AggregateError> {
        event.township = self.key.clone();
        let stored = event.clone();
        let done = self
            .commit(move |s| {
                let slot = s.events.iter_mut().find(|e| e.id == event.id)?;
                *slot = event;
                Some(())
            })
            .await?;
        if done.is_none() {
            return Ok(false);
        }
        counter!("aggregate_mutations_total", "op" => "update").increment(1);
        self.fanout.publish(Notification::EventUpdated {
            group: self.key.clone(),
            event: stored,
        });
        Ok(true)
    }

    async fn remove(&mut self, id: &str) -> Result<bool, AggregateError> {
        let done = self
            .commit(|s| {
                let idx = s.events.iter().position(|e| e.id == id)?;
                s.events.remove(idx);
                Some(())
            })
            .await?;
        if done.is_none() {
            return Ok(false);
        }
        counter!("aggregate_mutations_total", "op" => "remove").increment(1);
        self.fanout.publish(Notification::EventRemoved {
            group: self.key.clone(),
            event_id: id.to_string(),
        });
        Ok(true)
    }
}

/// Key → actor lookup; spawns on first use.
#[derive(Clone)]
pub struct TownshipDirectory {
    actors: Arc<Mutex<HashMap<String, TownshipHandle>>>,
    store: Arc<dyn AggregateStateStore>,
    fanout: RealtimeFanout,
    mailbox: usize,
}

impl TownshipDirectory {
    pub fn new(store: Arc<dyn AggregateStateStore>, fanout: RealtimeFanout) -> Self {
        Self {
            actors: Arc::new(Mutex::new(HashMap::new())),
            store,
            fanout,
            mailbox: 64,
        }
    }

    pub fn fanout(&self) -> &RealtimeFanout {
        &self.fanout
    }

    pub fn get(&self, name: &str) -> Result<TownshipHandle, AggregateError> {
        let key = township_key(name)?;
        let mut guard = self.actors.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(h) = guard.get(&key) {
            if !h.tx.is_closed() {
                return Ok(h.clone());
            }
        }
        let handle = TownshipActor::spawn(key.clone(), self.store.clone(), self.fanout.clone(), self.mailbox);
        guard.insert(key, handle.clone());
        Ok(handle)
    }

    /// Townships with a live actor or persisted state.
    pub async fn known_townships(&self) -> Vec<String> {
        let mut keys: BTreeSet<String> = {
            let guard = self.actors.lock().unwrap_or_else(PoisonError::into_inner);
            guard.keys().cloned().collect()
        };
        match self.store.keys().await {
            Ok(stored) => keys.extend(stored),
            Err(e) => tracing::warn!(target: "aggregate", error = %e, "listing persisted townships failed"),
        }
        keys.into_iter().collect()
    }

    /// Fan a query out to every known township; failing townships are skipped.
    pub async fn query_all(&self, query: EventQuery) -> Vec<FireEvent> {
        let handles: Vec<TownshipHandle> = self
            .known_townships()
            .await
            .iter()
            .filter_map(|k| self.get(k).ok())
            .collect();
        let results = join_all(handles.iter().map(|h| h.get_events(query.clone()))).await;
        let mut out = Vec::new();
        for (h, res) in handles.iter().zip(results) {
            match res {
                Ok(events) => out.extend(events),
                Err(e) => tracing::warn!(target: "aggregate", township = %h.key(), error = %e, "township query failed"),
            }
        }
        out
    }

    pub async fn query_bbox(&self, bbox: BoundingBox, query: EventQuery) -> Vec<FireEvent> {
        self.query_all(query.with_bbox(bbox)).await
    }

    /// Summaries of townships with at least one event on `day`.
    pub async fn active_on(&self, day: NaiveDate) -> Vec<TownshipSummary> {
        let handles: Vec<TownshipHandle> = self
            .known_townships()
            .await
            .iter()
            .filter_map(|k| self.get(k).ok())
            .collect();
        let results = join_all(handles.iter().map(|h| h.get_summary_on(day))).await;
        results
            .into_iter()
            .filter_map(|r| match r {
                Ok(s) if s.event_count > 0 => Some(s),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(target: "aggregate", error = %e, "township summary failed");
                    None
                }
            })
            .collect()
    }

    pub async fn active_today(&self) -> Vec<TownshipSummary> {
        self.active_on(Utc::now().date_naive()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn ev(id: &str, intensity: f64) -> FireEvent {
        let mut e = FireEvent::new(id, -117.6, 35.6, Utc::now());
        e.properties.intensity = intensity;
        e
    }

    fn directory() -> (TownshipDirectory, Arc<MemoryStateStore>) {
        let store = Arc::new(MemoryStateStore::new());
        (TownshipDirectory::new(store.clone(), RealtimeFanout::new(16)), store)
    }

    #[tokio::test]
    async fn upsert_update_remove_match_reference_list() {
        let (dir, _) = directory();
        let t = dir.get("Ridgecrest").unwrap();

        t.add_event(ev("a", 1.0)).await.unwrap();
        t.add_event(ev("b", 2.0)).await.unwrap();
        t.add_event(ev("a", 5.0)).await.unwrap();
        assert!(!t.update_event(ev("zzz", 9.0)).await.unwrap());
        assert!(t.update_event(ev("b", 3.0)).await.unwrap());
        t.add_event(ev("c", 4.0)).await.unwrap();
        assert!(t.remove_event("a").await.unwrap());
        assert!(!t.remove_event("a").await.unwrap());

        let got: Vec<(String, f64)> = t
            .get_events(EventQuery::default())
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.id, e.properties.intensity))
            .collect();
        assert_eq!(got, vec![("b".to_string(), 3.0), ("c".to_string(), 4.0)]);
    }

    #[tokio::test]
    async fn random_mutation_sequences_match_reference_list() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        for seed in 0..20u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let (dir, _) = directory();
            let t = dir.get(&format!("seed-{seed}")).unwrap();
            // insertion-ordered (id, intensity)
            let mut reference: Vec<(String, f64)> = Vec::new();

            for step in 0..60 {
                let id = format!("e{}", rng.random_range(0..8u32));
                let intensity = f64::from(step);
                match rng.random_range(0..3u8) {
                    0 => {
                        t.add_event(ev(&id, intensity)).await.unwrap();
                        match reference.iter_mut().find(|(k, _)| *k == id) {
                            Some(slot) => slot.1 = intensity,
                            None => reference.push((id, intensity)),
                        }
                    }
                    1 => {
                        let updated = t.update_event(ev(&id, intensity)).await.unwrap();
                        let slot = reference.iter_mut().find(|(k, _)| *k == id);
                        assert_eq!(updated, slot.is_some(), "seed {seed} step {step}");
                        if let Some(slot) = slot {
                            slot.1 = intensity;
                        }
                    }
                    _ => {
                        let removed = t.remove_event(id.clone()).await.unwrap();
                        let before = reference.len();
                        reference.retain(|(k, _)| *k != id);
                        assert_eq!(removed, reference.len() < before, "seed {seed} step {step}");
                    }
                }
            }

            let got: Vec<(String, f64)> = t
                .get_events(EventQuery::default())
                .await
                .unwrap()
                .into_iter()
                .map(|e| (e.id, e.properties.intensity))
                .collect();
            assert_eq!(got, reference, "seed {seed}");
        }
    }

    #[tokio::test]
    async fn actor_owns_township_key() {
        let (dir, store) = directory();
        let mut e = ev("a", 1.0);
        e.township = "elsewhere".into();
        let stored = dir.get(" RidgeCrest ").unwrap().add_event(e).await.unwrap();
        assert_eq!(stored.township, "ridgecrest");
        let persisted = store.load("ridgecrest").await.unwrap().unwrap();
        assert_eq!(persisted.events[0].township, "ridgecrest");
        assert!(persisted.last_updated.is_some());
    }

    #[tokio::test]
    async fn state_reloads_lazily_from_store() {
        let store = Arc::new(MemoryStateStore::new());
        let first = TownshipDirectory::new(store.clone(), RealtimeFanout::default());
        first.get("paradise").unwrap().add_event(ev("a", 1.0)).await.unwrap();

        let second = TownshipDirectory::new(store, RealtimeFanout::default());
        assert_eq!(second.known_townships().await, vec!["paradise"]);
        let events = second.get("paradise").unwrap().get_events(EventQuery::default()).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    struct FlakyStore {
        inner: MemoryStateStore,
        fail: AtomicBool,
    }

    #[async_trait]
    impl AggregateStateStore for FlakyStore {
        async fn load(&self, key: &str) -> Result<Option<AggregateState>, AggregateError> {
            self.inner.load(key).await
        }
        async fn save(&self, key: &str, state: &AggregateState) -> Result<(), AggregateError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(AggregateError::Persist {
                    key: key.into(),
                    message: "disk full".into(),
                });
            }
            self.inner.save(key, state).await
        }
        async fn keys(&self) -> Result<Vec<String>, AggregateError> {
            self.inner.keys().await
        }
    }

    #[tokio::test]
    async fn failed_persist_rolls_back() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStateStore::new(),
            fail: AtomicBool::new(false),
        });
        let dir = TownshipDirectory::new(store.clone(), RealtimeFanout::default());
        let t = dir.get("x").unwrap();
        t.add_event(ev("a", 1.0)).await.unwrap();
        store.fail.store(true, Ordering::SeqCst);
        assert!(matches!(t.add_event(ev("b", 1.0)).await, Err(AggregateError::Persist { .. })));
        assert_eq!(t.get_events(EventQuery::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn bbox_query_fans_out_and_mutations_notify() {
        let (dir, _) = directory();
        let mut live = dir.fanout().subscribe("north");
        let mut far = ev("far", 2.0);
        far.geometry = Point { longitude: 10.0, latitude: 10.0 };
        dir.get("north").unwrap().add_event(ev("n1", 2.0)).await.unwrap();
        dir.get("south").unwrap().add_event(far).await.unwrap();

        let bbox = BoundingBox { min_lon: -118.0, min_lat: 35.0, max_lon: -117.0, max_lat: 36.0 };
        let hits = dir.query_bbox(bbox, EventQuery::default()).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "n1");

        assert!(matches!(live.recv().await, Some(Notification::EventAdded { .. })));
        assert_eq!(dir.active_today().await.len(), 2);
    }

    #[tokio::test]
    async fn batch_add_is_one_write_and_one_notice() {
        let (dir, store) = directory();
        let mut live = dir.fanout().subscribe("paradise");
        let t = dir.get("Paradise").unwrap();
        t.add_event(ev("a", 1.0)).await.unwrap();
        assert!(matches!(live.recv().await, Some(Notification::EventAdded { .. })));

        let stored = t.add_events(vec![ev("a", 4.0), ev("b", 2.0)]).await.unwrap();
        assert!(stored.iter().all(|e| e.township == "paradise"));
        match live.recv().await {
            Some(Notification::Batch { group, events }) => {
                assert_eq!(group, "paradise");
                assert_eq!(events.len(), 2);
            }
            other => panic!("expected batch, got {other:?}"),
        }
        let persisted = store.load("paradise").await.unwrap().unwrap();
        let got: Vec<(String, f64)> = persisted
            .events
            .into_iter()
            .map(|e| (e.id, e.properties.intensity))
            .collect();
        assert_eq!(got, vec![("a".to_string(), 4.0), ("b".to_string(), 2.0)]);
    }

    #[test]
    fn empty_township_name_is_rejected() {
        assert!(matches!(township_key("  "), Err(AggregateError::InvalidKey(_))));
    }
}
