// src/pipeline.rs
//! Wires every stage into one running system:
//! ingestion actors → per-type streams → transform → storage → townships → realtime.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::aggregate::state_store::{AggregateStateStore, JsonFileStateStore, MemoryStateStore};
use crate::aggregate::TownshipDirectory;
use crate::config::PipelineConfig;
use crate::ingest::actor::{IngestionContext, DEFAULT_MAILBOX_CAPACITY};
use crate::ingest::adapters::AdapterCatalog;
use crate::ingest::registry::DataSourceRegistry;
use crate::ingest::scheduler::{
    FileReminderStore, IngestionScheduler, MemoryReminderStore, ReminderStore, SchedulerHandle,
};
use crate::realtime::RealtimeFanout;
use crate::storage::{EventStore, MemoryEventStore, StorageActor, StorageHandle};
use crate::stream::StreamHub;
use crate::transform::{TransformActor, TransformHandle, TransformStats};

const STORAGE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Pipeline {
    config: PipelineConfig,
    registry: DataSourceRegistry,
    townships: TownshipDirectory,
    storage: StorageHandle,
    storage_task: JoinHandle<()>,
    transform: TransformHandle,
    scheduler: SchedulerHandle,
}

impl Pipeline {
    /// Stores come from the config: JSON files when paths are set, memory otherwise.
    pub async fn start(config: PipelineConfig, catalog: AdapterCatalog) -> Result<Self> {
        let aggregate_store: Arc<dyn AggregateStateStore> = match &config.aggregate.state_dir {
            Some(dir) => Arc::new(JsonFileStateStore::new(dir)),
            None => Arc::new(MemoryStateStore::new()),
        };
        let reminders: Arc<dyn ReminderStore> = match &config.scheduler.reminder_path {
            Some(path) => Arc::new(FileReminderStore::new(path)),
            None => Arc::new(MemoryReminderStore::default()),
        };
        Self::start_with(config, catalog, aggregate_store, Arc::new(MemoryEventStore::new()), reminders).await
    }

    pub async fn start_with(
        config: PipelineConfig,
        catalog: AdapterCatalog,
        aggregate_store: Arc<dyn AggregateStateStore>,
        event_store: Arc<dyn EventStore>,
        reminders: Arc<dyn ReminderStore>,
    ) -> Result<Self> {
        config.validate().context("validating pipeline config")?;
        crate::ingest::describe_metrics();

        let hub = StreamHub::new(config.stream.capacity, config.publish_timeout());
        let streams = hub.subscribe_all().context("subscribing transform stage")?;

        let fanout = RealtimeFanout::new(config.realtime.channel_capacity);
        let townships = TownshipDirectory::new(aggregate_store, fanout);

        let (clean_tx, clean_rx) = mpsc::channel(config.stream.capacity.max(1));
        let (storage, storage_task) = StorageActor::spawn(event_store, Some(townships.clone()), clean_rx);
        let transform = TransformActor::spawn(streams, clean_tx, config.transform_settings());

        let registry = DataSourceRegistry::new(IngestionContext {
            catalog,
            hub,
            policy: config.resilience_policy(),
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        });

        for source in &config.sources {
            if let Err(e) = registry.register_source(source.clone()).await {
                tracing::warn!(target: "ingest", source_id = %source.id, error = %e, "configured source not registered");
            }
        }
        let report = registry.start_all_polling().await;
        if !report.failed.is_empty() {
            tracing::warn!(target: "ingest", failed = ?report.failed, "some sources did not start polling");
        }

        let scheduler = IngestionScheduler::new(registry.clone(), reminders, config.scheduler_settings())
            .activate()
            .await
            .context("activating ingestion scheduler")?;

        tracing::info!(
            target: "pipeline",
            sources = registry.len(),
            polling = report.succeeded.len(),
            "pipeline started"
        );

        Ok(Self {
            config,
            registry,
            townships,
            storage,
            storage_task,
            transform,
            scheduler,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &DataSourceRegistry {
        &self.registry
    }

    pub fn townships(&self) -> &TownshipDirectory {
        &self.townships
    }

    pub fn storage(&self) -> &StorageHandle {
        &self.storage
    }

    pub fn fanout(&self) -> &RealtimeFanout {
        self.townships.fanout()
    }

    pub async fn transform_stats(&self) -> Option<TransformStats> {
        self.transform.stats().await
    }

    /// Scheduler first, then sources, then the stages downstream of them.
    pub async fn shutdown(self) {
        self.scheduler.shutdown().await;
        for id in self.registry.list().into_iter().map(|c| c.id) {
            if let Err(e) = self.registry.unregister_source(&id).await {
                tracing::warn!(target: "pipeline", source_id = %id, error = %e, "unregister on shutdown failed");
            }
        }
        let stats = self.transform.shutdown().await;

        // storage exits once its input and every handle are gone
        drop(self.storage);
        let abort = self.storage_task.abort_handle();
        if tokio::time::timeout(STORAGE_DRAIN_TIMEOUT, self.storage_task).await.is_err() {
            tracing::warn!(target: "pipeline", "storage stage still held elsewhere; aborting");
            abort.abort();
        }
        tracing::info!(target: "pipeline", transform = ?stats, "pipeline stopped");
    }
}
