// src/transform/mod.rs
//! ETL stage between the raw-record streams and storage.
//!
//! Per record: normalize → dedupe → enrich → split. One bad record is marked
//! failed and the loop moves on; a result the storage channel will not take
//! is retried a bounded number of times and then dropped.

pub mod dedupe;
pub mod normalize;
pub mod records;

use chrono::Utc;
use metrics::counter;
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::ingest::types::{IngestionStatus, RawRecord};
use crate::stream::RawRecordStreams;
pub use dedupe::DedupeWindow;
pub use normalize::normalize_text;
pub use records::{CleanRecord, CleanResult, EventRecord, GeoPoint, ProcessingStatus, TimeSeriesPoint};

#[derive(Debug, Clone, PartialEq)]
pub enum TransformOutcome {
    Transformed(CleanResult),
    /// Same derived key already seen inside the dedupe window.
    Skipped { raw_id: String, key: String },
    /// The record could not be transformed; the result carries the failed clean record.
    Failed(CleanResult),
}

/// Synchronous part of the stage; owns the dedupe window.
#[derive(Debug)]
pub struct Transformer {
    dedupe: DedupeWindow,
}

impl Transformer {
    pub fn new(dedupe_window: Duration) -> Self {
        Self {
            dedupe: DedupeWindow::new(dedupe_window),
        }
    }

    pub fn on_record(&mut self, mut raw: RawRecord, now: Instant) -> TransformOutcome {
        let clean_id = uuid::Uuid::new_v4().to_string();
        let created_at = Utc::now();

        let normalized = match normalize::normalize(&raw) {
            Ok(n) => n,
            Err(e) => {
                let error = e.to_string();
                if let Err(te) = raw.fail(error.clone()) {
                    tracing::debug!(target: "transform", raw_id = %raw.id, error = %te, "raw status left unchanged");
                }
                let clean = CleanRecord {
                    id: clean_id,
                    raw_record_id: raw.id.clone(),
                    source_id: raw.source_id.clone(),
                    source_type: raw.source_type,
                    data_type: raw.data_type.clone(),
                    payload: Default::default(),
                    status: ProcessingStatus::Failed,
                    validation: Default::default(),
                    error: Some(error),
                    created_at,
                };
                return TransformOutcome::Failed(CleanResult {
                    raw,
                    clean,
                    events: Vec::new(),
                    time_series: Vec::new(),
                    geo_points: Vec::new(),
                });
            }
        };

        let key = dedupe::derive_key(&raw.data_type, &normalized.fields);
        if !self.dedupe.check_and_insert(&key, now) {
            return TransformOutcome::Skipped { raw_id: raw.id, key };
        }

        let mut fields = normalized.fields;
        normalize::enrich(&mut fields, &raw, created_at);
        let parts = normalize::split(&clean_id, &raw, &fields);

        if raw.status == IngestionStatus::Pending {
            let _ = raw.transition(IngestionStatus::InProgress);
        }
        if let Err(e) = raw.transition(IngestionStatus::Completed) {
            tracing::debug!(target: "transform", raw_id = %raw.id, error = %e, "raw status left unchanged");
        }

        TransformOutcome::Transformed(CleanResult {
            clean: CleanRecord {
                id: clean_id,
                raw_record_id: raw.id.clone(),
                source_id: raw.source_id.clone(),
                source_type: raw.source_type,
                data_type: raw.data_type.clone(),
                payload: fields,
                status: ProcessingStatus::Validated,
                validation: normalized.validation,
                error: None,
                created_at,
            },
            raw,
            events: parts.events,
            time_series: parts.time_series,
            geo_points: parts.geo_points,
        })
    }
}

#[derive(Debug, Clone)]
pub struct TransformSettings {
    pub dedupe_window: Duration,
    /// Attempts per result before it is dropped.
    pub publish_retries: u32,
    pub publish_timeout: Duration,
}

impl Default for TransformSettings {
    fn default() -> Self {
        Self {
            dedupe_window: Duration::from_secs(3600),
            publish_retries: 3,
            publish_timeout: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransformStats {
    pub received: u64,
    pub transformed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub dropped: u64,
}

enum TransformCommand {
    Stats(oneshot::Sender<TransformStats>),
    Shutdown(oneshot::Sender<TransformStats>),
}

pub struct TransformHandle {
    tx: mpsc::Sender<TransformCommand>,
    task: JoinHandle<()>,
}

impl TransformHandle {
    pub async fn stats(&self) -> Option<TransformStats> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(TransformCommand::Stats(reply)).await.ok()?;
        rx.await.ok()
    }

    /// Stop consuming; returns final counters.
    pub async fn shutdown(self) -> Option<TransformStats> {
        let (reply, rx) = oneshot::channel();
        let sent = self.tx.send(TransformCommand::Shutdown(reply)).await.is_ok();
        let stats = if sent { rx.await.ok() } else { None };
        let _ = self.task.await;
        stats
    }
}

pub struct TransformActor {
    transformer: Transformer,
    out: mpsc::Sender<CleanResult>,
    settings: TransformSettings,
    stats: TransformStats,
}

impl TransformActor {
    /// Consume every namespace of `streams`, forwarding results to `out`.
    pub fn spawn(
        streams: RawRecordStreams,
        out: mpsc::Sender<CleanResult>,
        settings: TransformSettings,
    ) -> TransformHandle {
        let (tx, rx) = mpsc::channel(8);
        let actor = TransformActor {
            transformer: Transformer::new(settings.dedupe_window),
            out,
            settings,
            stats: TransformStats::default(),
        };
        let task = tokio::spawn(actor.run(streams, rx));
        TransformHandle { tx, task }
    }

    async fn run(mut self, mut streams: RawRecordStreams, mut rx: mpsc::Receiver<TransformCommand>) {
        tracing::info!(target: "transform", namespaces = ?streams.namespaces(), "transform stage subscribed");
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(TransformCommand::Stats(reply)) => {
                        let _ = reply.send(self.stats.clone());
                    }
                    Some(TransformCommand::Shutdown(reply)) => {
                        let _ = reply.send(self.stats.clone());
                        break;
                    }
                    None => break,
                },
                rec = streams.recv() => match rec {
                    Some(raw) => self.handle(raw).await,
                    None => break,
                },
            }
        }
        tracing::info!(target: "transform", stats = ?self.stats, "transform stage stopped");
    }

    async fn handle(&mut self, raw: RawRecord) {
        self.stats.received += 1;
        let outcome = self.transformer.on_record(raw, Instant::now());
        let result = match outcome {
            TransformOutcome::Skipped { raw_id, key } => {
                self.stats.skipped += 1;
                counter!("transform_records_total", "outcome" => "skipped").increment(1);
                tracing::debug!(target: "transform", raw_id = %raw_id, key = %key, "duplicate record skipped");
                return;
            }
            TransformOutcome::Failed(result) => {
                self.stats.failed += 1;
                counter!("transform_records_total", "outcome" => "failed").increment(1);
                tracing::warn!(
                    target: "transform",
                    raw_id = %result.raw.id,
                    source_id = %result.raw.source_id,
                    error = result.clean.error.as_deref().unwrap_or_default(),
                    "record failed to transform"
                );
                result
            }
            TransformOutcome::Transformed(result) => {
                self.stats.transformed += 1;
                counter!("transform_records_total", "outcome" => "transformed").increment(1);
                result
            }
        };
        self.publish(result).await;
    }

    async fn publish(&mut self, mut result: CleanResult) {
        let attempts = self.settings.publish_retries.max(1);
        for attempt in 1..=attempts {
            match self.out.send_timeout(result, self.settings.publish_timeout).await {
                Ok(()) => return,
                Err(SendTimeoutError::Timeout(back)) => {
                    tracing::warn!(target: "transform", attempt, clean_id = %back.id(), "storage channel full, retrying");
                    result = back;
                }
                Err(SendTimeoutError::Closed(back)) => {
                    result = back;
                    break;
                }
            }
        }
        self.stats.dropped += 1;
        counter!("transform_dropped_total").increment(1);
        tracing::error!(
            target: "transform",
            clean_id = %result.id(),
            raw_id = %result.raw.id,
            "clean result dropped after publish retries"
        );
    }
}
