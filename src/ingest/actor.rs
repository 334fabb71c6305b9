// src/ingest/actor.rs
//! One ingestion actor per registered source.
//!
//! The actor is a spawned task that owns all per-source state and handles one
//! command at a time from its mailbox. The polling timer is a separate task
//! that only enqueues `Tick`s; it holds a weak sender, so it can never keep a
//! dropped actor alive, and it is aborted on stop, deactivation, and drop.
//!
//! At most one `Tick` is queued or running per timer. Ticks that fall due
//! while a fetch cycle is still in flight are dropped, so a slow upstream
//! never builds a backlog in front of `StopPolling`.

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::IngestError;
use crate::ingest::adapters::AdapterCatalog;
use crate::ingest::resilient::{CircuitState, ResiliencePolicy, ResilientAdapter};
use crate::ingest::types::{
    ActorState, ExternalSourceConfig, IngestionResult, IngestionStatus, IngestionStatusSnapshot,
    RawRecord,
};
use crate::stream::{StreamHub, StreamPublisher};

pub const DEFAULT_MAILBOX_CAPACITY: usize = 64;

/// Everything an ingestion actor needs besides its configuration.
#[derive(Clone)]
pub struct IngestionContext {
    pub catalog: AdapterCatalog,
    pub hub: StreamHub,
    pub policy: ResiliencePolicy,
    pub mailbox_capacity: usize,
}

/// Result of handing a webhook payload to an actor. Never an error for the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Accepted { record_id: String },
    Empty,
    Failed { error: String },
}

enum Command {
    Initialize {
        config: ExternalSourceConfig,
        reply: oneshot::Sender<Result<(), IngestError>>,
    },
    StartPolling {
        reply: oneshot::Sender<Result<bool, IngestError>>,
    },
    StopPolling {
        reply: oneshot::Sender<bool>,
    },
    Webhook {
        payload: String,
        reply: oneshot::Sender<WebhookOutcome>,
    },
    TriggerFetch {
        reply: oneshot::Sender<Result<IngestionResult, IngestError>>,
    },
    Status {
        reply: oneshot::Sender<IngestionStatusSnapshot>,
    },
    Tick {
        generation: u64,
    },
    Deactivate {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable address of an ingestion actor.
#[derive(Clone, Debug)]
pub struct IngestionHandle {
    source_id: String,
    tx: mpsc::Sender<Command>,
}

impl IngestionHandle {
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// False once the actor task has stopped.
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, IngestError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| IngestError::ActorUnavailable(self.source_id.clone()))?;
        rx.await
            .map_err(|_| IngestError::ActorUnavailable(self.source_id.clone()))
    }

    pub async fn initialize(&self, config: ExternalSourceConfig) -> Result<(), IngestError> {
        self.request(|reply| Command::Initialize { config, reply }).await?
    }

    /// `Ok(true)` when a timer was started, `Ok(false)` for a no-op.
    pub async fn start_polling(&self) -> Result<bool, IngestError> {
        self.request(|reply| Command::StartPolling { reply }).await?
    }

    /// `Ok(true)` when a running timer was cancelled.
    pub async fn stop_polling(&self) -> Result<bool, IngestError> {
        self.request(|reply| Command::StopPolling { reply }).await
    }

    pub async fn process_webhook(&self, payload: impl Into<String>) -> WebhookOutcome {
        let payload = payload.into();
        match self.request(|reply| Command::Webhook { payload, reply }).await {
            Ok(outcome) => outcome,
            Err(e) => WebhookOutcome::Failed {
                error: e.to_string(),
            },
        }
    }

    pub async fn trigger_fetch(&self) -> Result<IngestionResult, IngestError> {
        self.request(|reply| Command::TriggerFetch { reply }).await?
    }

    pub async fn get_status(&self) -> Result<IngestionStatusSnapshot, IngestError> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Cancels polling and ends the actor task.
    pub async fn deactivate(&self) -> Result<(), IngestError> {
        self.request(|reply| Command::Deactivate { reply }).await
    }
}

struct PollTimer {
    generation: u64,
    interval: Duration,
    // set by the timer when it enqueues a tick, cleared once that tick's cycle ends
    pending: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Drop for PollTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Debug, Default)]
struct Stats {
    total_fetches: u64,
    successful_fetches: u64,
    failed_fetches: u64,
    records_published: u64,
    publish_failures: u64,
    last_error: Option<String>,
    last_fetch_time: Option<DateTime<Utc>>,
    next_fetch_time: Option<DateTime<Utc>>,
}

pub struct IngestionActor {
    source_id: String,
    ctx: IngestionContext,
    self_tx: mpsc::WeakSender<Command>,
    config: Option<ExternalSourceConfig>,
    adapter: Option<ResilientAdapter>,
    publisher: Option<StreamPublisher>,
    state: ActorState,
    stopped_since_init: bool,
    timer: Option<PollTimer>,
    generation: u64,
    stats: Stats,
}

impl IngestionActor {
    /// Spawn the actor task and return its handle.
    pub fn spawn(source_id: impl Into<String>, ctx: IngestionContext) -> IngestionHandle {
        let source_id = source_id.into();
        let (tx, rx) = mpsc::channel(ctx.mailbox_capacity.max(1));
        let actor = IngestionActor {
            source_id: source_id.clone(),
            ctx,
            self_tx: tx.downgrade(),
            config: None,
            adapter: None,
            publisher: None,
            state: ActorState::Uninitialized,
            stopped_since_init: false,
            timer: None,
            generation: 0,
            stats: Stats::default(),
        };
        tokio::spawn(actor.run(rx));
        IngestionHandle { source_id, tx }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        tracing::debug!(target: "ingest", source_id = %self.source_id, "ingestion actor activated");
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Initialize { config, reply } => {
                    let _ = reply.send(self.initialize(config));
                }
                Command::StartPolling { reply } => {
                    let _ = reply.send(self.start_polling());
                }
                Command::StopPolling { reply } => {
                    let _ = reply.send(self.stop_polling());
                }
                Command::Webhook { payload, reply } => {
                    let outcome = self.process_webhook(&payload).await;
                    let _ = reply.send(outcome);
                }
                Command::TriggerFetch { reply } => {
                    let res = match self.config.is_some() {
                        true => Ok(self.fetch_cycle().await),
                        false => Err(IngestError::NotInitialized(self.source_id.clone())),
                    };
                    let _ = reply.send(res);
                }
                Command::Status { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                Command::Tick { generation } => {
                    let current = self.timer.as_ref().map(|t| t.generation);
                    if current == Some(generation) {
                        self.fetch_cycle().await;
                        if let Some(timer) = &self.timer {
                            timer.pending.store(false, Ordering::Release);
                        }
                    } else {
                        tracing::debug!(target: "ingest", source_id = %self.source_id, generation, "stale tick ignored");
                    }
                }
                Command::Deactivate { reply } => {
                    self.stop_polling();
                    self.state = ActorState::Deactivated;
                    let _ = reply.send(());
                    break;
                }
            }
        }
        // dropping `self` aborts any timer still attached
        tracing::debug!(target: "ingest", source_id = %self.source_id, "ingestion actor deactivated");
    }

    fn initialize(&mut self, config: ExternalSourceConfig) -> Result<(), IngestError> {
        config.validate()?;
        if config.id != self.source_id {
            return Err(IngestError::InvalidConfig(format!(
                "config id {} does not match actor {}",
                config.id, self.source_id
            )));
        }
        if let Some(current) = &self.config {
            if *current == config {
                return Ok(());
            }
            if !self.stopped_since_init {
                return Err(IngestError::AlreadyInitialized(self.source_id.clone()));
            }
        }

        let adapter = self.ctx.catalog.get(config.source_type).ok_or_else(|| {
            IngestError::InvalidConfig(format!("no adapter for source type {}", config.source_type))
        })?;
        adapter.check_config(&config)?;

        self.publisher = Some(self.ctx.hub.publisher(config.source_type));
        self.adapter = Some(ResilientAdapter::new(adapter, self.ctx.policy.clone()));
        tracing::info!(
            target: "ingest",
            source_id = %self.source_id,
            source_type = %config.source_type,
            interval_secs = config.polling_interval.as_secs_f64(),
            "source initialized"
        );
        self.config = Some(config);
        self.state = ActorState::Initialized;
        self.stopped_since_init = false;
        Ok(())
    }

    fn start_polling(&mut self) -> Result<bool, IngestError> {
        let Some(config) = &self.config else {
            return Err(IngestError::NotInitialized(self.source_id.clone()));
        };
        if self.timer.is_some() {
            tracing::warn!(target: "ingest", source_id = %self.source_id, "start_polling ignored: already polling");
            return Ok(false);
        }
        if !config.is_active {
            tracing::warn!(target: "ingest", source_id = %self.source_id, "start_polling ignored: source inactive");
            return Ok(false);
        }
        if config.is_webhook_only() {
            tracing::info!(target: "ingest", source_id = %self.source_id, "webhook-only source, no polling timer");
            return Ok(false);
        }

        let interval = config.polling_interval;
        self.generation += 1;
        let generation = self.generation;
        let weak = self.self_tx.clone();
        let pending = Arc::new(AtomicBool::new(false));
        let timer_pending = pending.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if timer_pending.swap(true, Ordering::AcqRel) {
                    counter!("ingest_ticks_skipped_total").increment(1);
                    continue;
                }
                let Some(tx) = weak.upgrade() else { break };
                match tx.try_send(Command::Tick { generation }) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        counter!("ingest_ticks_skipped_total").increment(1);
                        timer_pending.store(false, Ordering::Release);
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
        });
        // flag and timer change together
        self.timer = Some(PollTimer {
            generation,
            interval,
            pending,
            task,
        });
        self.state = ActorState::Polling;
        self.stats.next_fetch_time = Some(Utc::now());
        self.stopped_since_init = false;
        tracing::info!(target: "ingest", source_id = %self.source_id, "polling started");
        Ok(true)
    }

    fn stop_polling(&mut self) -> bool {
        self.stopped_since_init = true;
        let Some(timer) = self.timer.take() else {
            return false;
        };
        drop(timer);
        self.state = ActorState::Idle;
        self.stats.next_fetch_time = None;
        tracing::info!(target: "ingest", source_id = %self.source_id, "polling stopped");
        true
    }

    async fn process_webhook(&mut self, payload: &str) -> WebhookOutcome {
        counter!("ingest_webhooks_total").increment(1);
        let (Some(config), Some(adapter)) = (&self.config, &self.adapter) else {
            let error = IngestError::NotInitialized(self.source_id.clone()).to_string();
            self.record_failure(error.clone());
            return WebhookOutcome::Failed { error };
        };

        self.stats.total_fetches += 1;
        self.stats.last_fetch_time = Some(Utc::now());
        // webhooks are single-attempt: no retry/breaker envelope
        let parsed = adapter.inner().parse_webhook(config, payload);
        match parsed {
            Ok(None) => {
                self.stats.successful_fetches += 1;
                WebhookOutcome::Empty
            }
            Ok(Some(record)) => {
                let record_id = record.id.clone();
                match self.publish(record).await {
                    Ok(()) => {
                        self.stats.successful_fetches += 1;
                        WebhookOutcome::Accepted { record_id }
                    }
                    Err(error) => {
                        self.stats.failed_fetches += 1;
                        self.stats.last_error = Some(error.clone());
                        WebhookOutcome::Failed { error }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(target: "ingest", source_id = %self.source_id, error = %e, "webhook payload rejected");
                counter!("ingest_webhook_failures_total").increment(1);
                let error = e.to_string();
                self.stats.failed_fetches += 1;
                self.stats.last_error = Some(error.clone());
                WebhookOutcome::Failed { error }
            }
        }
    }

    fn record_failure(&mut self, error: String) {
        self.stats.total_fetches += 1;
        self.stats.failed_fetches += 1;
        self.stats.last_error = Some(error);
    }

    /// Mark, tag and publish one record. Publish problems are counted, not raised.
    async fn publish(&mut self, mut record: RawRecord) -> Result<(), String> {
        if let Some(township) = self.config.as_ref().and_then(|c| c.param("township")) {
            record
                .metadata
                .entry("township".to_string())
                .or_insert_with(|| township.to_string());
        }
        if let Err(e) = record.transition(IngestionStatus::InProgress) {
            self.stats.publish_failures += 1;
            return Err(e.to_string());
        }
        let Some(publisher) = &self.publisher else {
            self.stats.publish_failures += 1;
            return Err(IngestError::NotInitialized(self.source_id.clone()).to_string());
        };
        match publisher.publish(record).await {
            Ok(()) => {
                self.stats.records_published += 1;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(target: "ingest", source_id = %self.source_id, error = %e, "record publish failed");
                self.stats.publish_failures += 1;
                Err(e.to_string())
            }
        }
    }

    async fn fetch_cycle(&mut self) -> IngestionResult {
        let started_at = Utc::now();
        self.stats.total_fetches += 1;
        self.stats.last_fetch_time = Some(started_at);

        let fetched = match (&self.config, &self.adapter) {
            (Some(config), Some(adapter)) => adapter.fetch(config).await,
            _ => Err(crate::error::AdapterError::Config("source not initialized".into())),
        };

        let result = match fetched {
            Ok(records) => {
                let mut processed = 0usize;
                let mut failed = 0usize;
                for record in records {
                    match self.publish(record).await {
                        Ok(()) => processed += 1,
                        Err(_) => failed += 1,
                    }
                }
                self.stats.successful_fetches += 1;
                counter!("ingest_fetch_total", "result" => "ok").increment(1);
                tracing::debug!(target: "ingest", source_id = %self.source_id, processed, failed, "fetch cycle finished");
                IngestionResult {
                    source_id: self.source_id.clone(),
                    success: true,
                    records_processed: processed,
                    records_failed: failed,
                    error: None,
                    started_at,
                    completed_at: Utc::now(),
                }
            }
            Err(e) => {
                // polling keeps going: upstream outages are transient by policy
                tracing::warn!(target: "ingest", source_id = %self.source_id, error = %e, "fetch cycle failed");
                counter!("ingest_fetch_total", "result" => "error").increment(1);
                counter!("ingest_provider_errors_total").increment(1);
                self.stats.failed_fetches += 1;
                self.stats.last_error = Some(e.to_string());
                IngestionResult {
                    source_id: self.source_id.clone(),
                    success: false,
                    records_processed: 0,
                    records_failed: 0,
                    error: Some(e.to_string()),
                    started_at,
                    completed_at: Utc::now(),
                }
            }
        };

        if let Some(timer) = &self.timer {
            let next = chrono::Duration::from_std(timer.interval).unwrap_or_else(|_| chrono::Duration::zero());
            self.stats.next_fetch_time = Some(Utc::now() + next);
        }
        result
    }

    fn snapshot(&self) -> IngestionStatusSnapshot {
        IngestionStatusSnapshot {
            source_id: self.source_id.clone(),
            state: self.state,
            is_polling: self.timer.is_some(),
            total_fetches: self.stats.total_fetches,
            successful_fetches: self.stats.successful_fetches,
            failed_fetches: self.stats.failed_fetches,
            records_published: self.stats.records_published,
            publish_failures: self.stats.publish_failures,
            last_error: self.stats.last_error.clone(),
            last_fetch_time: self.stats.last_fetch_time,
            next_fetch_time: self.stats.next_fetch_time,
            circuit: self
                .adapter
                .as_ref()
                .map(|a| a.circuit_state())
                .unwrap_or(CircuitState::Closed),
        }
    }
}
