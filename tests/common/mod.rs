// tests/common/mod.rs
//
// Shared fixtures: a scripted adapter with a call counter and small
// constructors for contexts and registries.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fire_ingest_pipeline::error::AdapterError;
use fire_ingest_pipeline::ingest::actor::IngestionContext;
use fire_ingest_pipeline::ingest::adapters::{AdapterCatalog, DataSourceAdapter};
use fire_ingest_pipeline::ingest::registry::DataSourceRegistry;
use fire_ingest_pipeline::ingest::resilient::ResiliencePolicy;
use fire_ingest_pipeline::ingest::types::{ExternalSourceConfig, RawRecord, SourceType};
use fire_ingest_pipeline::stream::StreamHub;

/// What one call to `fetch` does.
#[derive(Debug, Clone)]
pub enum Step {
    Records(usize),
    Fail(AdapterError),
}

pub fn transient() -> AdapterError {
    AdapterError::Upstream {
        status: 503,
        message: "unavailable".into(),
    }
}

pub struct MockAdapter {
    calls: AtomicUsize,
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    delay: Duration,
}

impl MockAdapter {
    /// Every call yields one record.
    pub fn ok() -> Arc<Self> {
        Self::build(Vec::new(), Step::Records(1), Duration::ZERO)
    }

    /// Every call fails with a transient 503.
    pub fn failing() -> Arc<Self> {
        Self::build(Vec::new(), Step::Fail(transient()), Duration::ZERO)
    }

    /// Runs `script` in order, then succeeds with one record per call.
    pub fn scripted(script: Vec<Step>) -> Arc<Self> {
        Self::build(script, Step::Records(1), Duration::ZERO)
    }

    pub fn slow(script: Vec<Step>, delay: Duration) -> Arc<Self> {
        Self::build(script, Step::Records(1), delay)
    }

    fn build(script: Vec<Step>, fallback: Step, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            script: Mutex::new(script.into()),
            fallback,
            delay,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataSourceAdapter for MockAdapter {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn fetch(&self, config: &ExternalSourceConfig) -> Result<Vec<RawRecord>, AdapterError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match step {
            Step::Fail(e) => Err(e),
            Step::Records(count) => Ok((0..count)
                .map(|i| {
                    // distinct timestamps keep the dedupe window out of the way
                    let ts = Utc::now() + ChronoDuration::seconds((n * 100 + i) as i64);
                    let payload = json!({
                        "latitude": 35.6,
                        "longitude": -117.6,
                        "timestamp": ts.to_rfc3339(),
                        "intensity": 5.0,
                        "name": format!("mock fire {n}-{i}"),
                    });
                    RawRecord::new(config, "fire_detection", payload.to_string())
                })
                .collect()),
        }
    }
}

/// No sleeping between retries, short cool-down.
pub fn fast_policy() -> ResiliencePolicy {
    ResiliencePolicy {
        failure_threshold: 3,
        open_duration: Duration::from_millis(50),
        max_attempts: 1,
        initial_backoff: Duration::from_millis(1),
        attempt_timeout: Duration::from_secs(2),
    }
}

/// Same adapter behind every source type.
pub fn catalog_with(adapter: Arc<MockAdapter>) -> AdapterCatalog {
    SourceType::ALL
        .into_iter()
        .fold(AdapterCatalog::empty(), |c, t| c.with(t, adapter.clone()))
}

pub fn context(adapter: Arc<MockAdapter>) -> (IngestionContext, StreamHub) {
    let hub = StreamHub::new(1024, Duration::from_millis(200));
    let ctx = IngestionContext {
        catalog: catalog_with(adapter),
        hub: hub.clone(),
        policy: fast_policy(),
        mailbox_capacity: 64,
    };
    (ctx, hub)
}

pub fn registry(adapter: Arc<MockAdapter>) -> DataSourceRegistry {
    DataSourceRegistry::new(context(adapter).0)
}

pub fn polled(id: &str, every: Duration) -> ExternalSourceConfig {
    ExternalSourceConfig::new(id, format!("Source {id}"), SourceType::SatelliteFire).with_interval(every)
}

pub fn webhook_only(id: &str, source_type: SourceType) -> ExternalSourceConfig {
    ExternalSourceConfig::new(id, format!("Hook {id}"), source_type)
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
