// src/ingest/mod.rs
pub mod actor;
pub mod adapters;
pub mod registry;
pub mod resilient;
pub mod scheduler;
pub mod types;

use metrics::{describe_counter, describe_gauge, describe_histogram};
use once_cell::sync::OnceCell;

pub use actor::{IngestionActor, IngestionContext, IngestionHandle, WebhookOutcome};
pub use adapters::{AdapterCatalog, DataSourceAdapter, DynAdapter};
pub use registry::{DataSourceRegistry, FanOutReport};
pub use resilient::{CircuitState, ResiliencePolicy, ResilientAdapter};
pub use scheduler::{IngestionScheduler, SchedulerHandle, SchedulerSettings};
pub use types::{
    ExternalSourceConfig, IngestionResult, IngestionStatus, IngestionStatusSnapshot, RawRecord, SourceType,
};

/// One-time metrics registration (so series show up on /metrics).
pub fn describe_metrics() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_fetch_total", "Polled fetch cycles by result.");
        describe_counter!("ingest_events_total", "Raw records parsed from adapters.");
        describe_counter!("ingest_provider_errors_total", "Adapter fetch/parse errors.");
        describe_counter!("ingest_webhooks_total", "Webhook payloads received.");
        describe_counter!("ingest_webhook_failures_total", "Webhook payloads that failed to parse.");
        describe_counter!("ingest_ticks_skipped_total", "Polling ticks dropped while a fetch cycle was still pending.");
        describe_histogram!("ingest_parse_ms", "Adapter parse time in milliseconds.");
        describe_counter!("adapter_retries_total", "Retried upstream attempts.");
        describe_counter!("adapter_circuit_open_total", "Times a circuit breaker opened.");
        describe_counter!("adapter_short_circuited_total", "Calls rejected while a breaker was open.");
        describe_counter!("stream_published_total", "Raw records published to stage streams.");
        describe_counter!("stream_publish_timeouts_total", "Publishes that hit a full stream.");
        describe_counter!("transform_records_total", "Raw records handled by the transform stage, by outcome.");
        describe_counter!("transform_dropped_total", "Clean results dropped after publish retries.");
        describe_counter!("storage_results_total", "Clean results stored.");
        describe_counter!("storage_projection_failures_total", "Events that could not be projected into a township.");
        describe_counter!("aggregate_mutations_total", "Township event mutations by operation.");
        describe_counter!("aggregate_persist_failures_total", "Township writes rolled back after a persist failure.");
        describe_counter!("realtime_notifications_total", "Notifications published to subscribers.");
        describe_counter!("realtime_lagged_total", "Subscribers that fell behind and were told to resync.");
        describe_counter!("scheduler_wakeups_total", "Scheduler sweeps.");
        describe_gauge!("scheduler_last_wakeup_ts", "Unix ts of the last scheduler sweep.");
    });
}
