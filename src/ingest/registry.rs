// src/ingest/registry.rs
//! Directory of ingestion actors keyed by source id.
//!
//! Lifecycle sequences (register, update, unregister) take a per-id async
//! lock, so two operations on the same id never interleave while different
//! ids proceed concurrently. The entry map itself is only touched briefly
//! under a std mutex and never across an await. Creating a brand-new source
//! also takes a registry-wide lock, since name uniqueness spans all ids.

use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::IngestError;
use crate::ingest::actor::{IngestionActor, IngestionContext, IngestionHandle};
use crate::ingest::types::{ExternalSourceConfig, IngestionStatusSnapshot};

#[derive(Clone)]
struct Entry {
    config: ExternalSourceConfig,
    handle: IngestionHandle,
}

/// Per-actor outcome of a start/stop fan-out.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FanOutReport {
    pub succeeded: Vec<String>,
    pub failed: BTreeMap<String, String>,
}

#[derive(Clone)]
pub struct DataSourceRegistry {
    ctx: IngestionContext,
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
    create: Arc<tokio::sync::Mutex<()>>,
}

impl DataSourceRegistry {
    pub fn new(ctx: IngestionContext) -> Self {
        Self {
            ctx,
            entries: Arc::new(Mutex::new(HashMap::new())),
            locks: Arc::new(Mutex::new(HashMap::new())),
            create: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn id_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(id.to_string()).or_default().clone()
    }

    /// Forget the lock for `id` unless another caller still holds a clone.
    fn release_lock(&self, id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // one reference in the table, one here
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(id);
        }
    }

    /// Number of per-id locks currently tracked.
    pub fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Create or reconfigure the actor for `config.id`. On failure nothing is stored.
    pub async fn register_source(&self, config: ExternalSourceConfig) -> Result<(), IngestError> {
        config.validate()?;
        let lock = self.id_lock(&config.id);
        let _guard = lock.lock().await;

        let existing = self.entries().get(&config.id).cloned();
        match existing {
            Some(entry) if entry.handle.is_alive() => {
                self.reconfigure(&entry, config).await?;
            }
            _ => self.spawn_entry(config).await?,
        }
        Ok(())
    }

    /// Register a source whose id and name are both unused. Unlike
    /// [`register_source`](Self::register_source) this never reconfigures.
    pub async fn add_source(&self, config: ExternalSourceConfig) -> Result<(), IngestError> {
        config.validate()?;
        let _create = self.create.lock().await;
        let lock = self.id_lock(&config.id);
        let _guard = lock.lock().await;

        if self.entries().contains_key(&config.id) {
            return Err(IngestError::Duplicate(format!("source id {:?}", config.id)));
        }
        if self.find_by_name(&config.name).is_some() {
            return Err(IngestError::Duplicate(format!("a source named {:?}", config.name)));
        }
        self.spawn_entry(config).await
    }

    async fn spawn_entry(&self, config: ExternalSourceConfig) -> Result<(), IngestError> {
        let handle = IngestionActor::spawn(config.id.clone(), self.ctx.clone());
        if let Err(e) = handle.initialize(config.clone()).await {
            let _ = handle.deactivate().await;
            tracing::warn!(target: "ingest", source_id = %config.id, error = %e, "source registration failed");
            return Err(e);
        }
        tracing::info!(target: "ingest", source_id = %config.id, source_type = %config.source_type, "source registered");
        self.entries().insert(config.id.clone(), Entry { config, handle });
        Ok(())
    }

    /// Stop → re-initialize → restart if it was polling.
    async fn reconfigure(
        &self,
        entry: &Entry,
        config: ExternalSourceConfig,
    ) -> Result<(), IngestError> {
        let was_polling = entry.handle.stop_polling().await?;
        if let Err(e) = entry.handle.initialize(config.clone()).await {
            // old config stays bound; put polling back the way it was
            if was_polling {
                let _ = entry.handle.start_polling().await;
            }
            return Err(e);
        }
        self.entries().insert(
            config.id.clone(),
            Entry {
                config: config.clone(),
                handle: entry.handle.clone(),
            },
        );
        if was_polling {
            entry.handle.start_polling().await?;
        }
        tracing::info!(target: "ingest", source_id = %config.id, "source reconfigured");
        Ok(())
    }

    /// Requires the id to be registered.
    pub async fn update_source(&self, config: ExternalSourceConfig) -> Result<(), IngestError> {
        config.validate()?;
        let lock = self.id_lock(&config.id);
        let _guard = lock.lock().await;
        let entry = self
            .entries()
            .get(&config.id)
            .cloned()
            .ok_or_else(|| IngestError::NotFound(config.id.clone()))?;
        self.reconfigure(&entry, config).await
    }

    /// `Ok(false)` for an unknown id.
    pub async fn unregister_source(&self, id: &str) -> Result<bool, IngestError> {
        let lock = self.id_lock(id);
        let guard = lock.lock().await;
        let removed = self.remove_entry(id).await;
        drop(guard);
        self.release_lock(id, lock);
        Ok(removed)
    }

    async fn remove_entry(&self, id: &str) -> bool {
        let Some(entry) = self.entries().get(id).cloned() else {
            return false;
        };
        if let Err(e) = entry.handle.stop_polling().await {
            tracing::warn!(target: "ingest", source_id = %id, error = %e, "stop before unregister failed");
        }
        if let Err(e) = entry.handle.deactivate().await {
            tracing::warn!(target: "ingest", source_id = %id, error = %e, "deactivate on unregister failed");
        }
        self.entries().remove(id);
        tracing::info!(target: "ingest", source_id = %id, "source unregistered");
        true
    }

    pub async fn start_polling(&self, id: &str) -> Result<bool, IngestError> {
        self.handle(id)?.start_polling().await
    }

    pub async fn stop_polling(&self, id: &str) -> Result<bool, IngestError> {
        self.handle(id)?.stop_polling().await
    }

    pub async fn start_all_polling(&self) -> FanOutReport {
        let handles = self.handles();
        let results = join_all(handles.iter().map(|h| h.start_polling())).await;
        Self::report("start_polling", &handles, results)
    }

    pub async fn stop_all_polling(&self) -> FanOutReport {
        let handles = self.handles();
        let results = join_all(handles.iter().map(|h| h.stop_polling())).await;
        Self::report("stop_polling", &handles, results)
    }

    fn report<T>(
        op: &str,
        handles: &[IngestionHandle],
        results: Vec<Result<T, IngestError>>,
    ) -> FanOutReport {
        let mut report = FanOutReport::default();
        for (h, res) in handles.iter().zip(results) {
            match res {
                Ok(_) => report.succeeded.push(h.source_id().to_string()),
                Err(e) => {
                    tracing::warn!(target: "ingest", source_id = %h.source_id(), op, error = %e, "fan-out call failed");
                    report.failed.insert(h.source_id().to_string(), e.to_string());
                }
            }
        }
        report
    }

    /// One entry per registered id; an actor that fails to answer gets a placeholder.
    pub async fn get_all_status(&self) -> BTreeMap<String, IngestionStatusSnapshot> {
        let handles = self.handles();
        let results = join_all(handles.iter().map(|h| h.get_status())).await;
        handles
            .iter()
            .zip(results)
            .map(|(h, res)| {
                let id = h.source_id().to_string();
                let snap = res.unwrap_or_else(|e| {
                    tracing::warn!(target: "ingest", source_id = %id, error = %e, "status unavailable");
                    IngestionStatusSnapshot::unavailable(&id, e.to_string())
                });
                (id, snap)
            })
            .collect()
    }

    pub async fn get_status(&self, id: &str) -> Result<IngestionStatusSnapshot, IngestError> {
        self.handle(id)?.get_status().await
    }

    pub fn handle(&self, id: &str) -> Result<IngestionHandle, IngestError> {
        self.entries()
            .get(id)
            .map(|e| e.handle.clone())
            .ok_or_else(|| IngestError::NotFound(id.to_string()))
    }

    /// Handles sorted by source id.
    pub fn handles(&self) -> Vec<IngestionHandle> {
        let mut v: Vec<IngestionHandle> = self.entries().values().map(|e| e.handle.clone()).collect();
        v.sort_by(|a, b| a.source_id().cmp(b.source_id()));
        v
    }

    pub fn get(&self, id: &str) -> Option<ExternalSourceConfig> {
        self.entries().get(id).map(|e| e.config.clone())
    }

    pub fn list(&self) -> Vec<ExternalSourceConfig> {
        let mut v: Vec<ExternalSourceConfig> = self.entries().values().map(|e| e.config.clone()).collect();
        v.sort_by(|a, b| a.id.cmp(&b.id));
        v
    }

    /// Case-insensitive name lookup.
    pub fn find_by_name(&self, name: &str) -> Option<ExternalSourceConfig> {
        let name = name.trim();
        self.entries()
            .values()
            .find(|e| e.config.name.trim().eq_ignore_ascii_case(name))
            .map(|e| e.config.clone())
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}
