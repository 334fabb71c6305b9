// src/ingest/resilient.rs
//! Circuit breaker + exponential-backoff retry around a `DataSourceAdapter`.
//!
//! - Closed: calls pass, logical-call failures are counted.
//! - Open: calls fail fast with `AdapterError::CircuitOpen` until the cool-down ends.
//! - HalfOpen: exactly one trial call (single attempt); success closes, failure re-opens.
//!
//! Retries happen only for transient errors, inside one logical call.

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::AdapterError;
use crate::ingest::adapters::DynAdapter;
use crate::ingest::types::{ExternalSourceConfig, RawRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResiliencePolicy {
    pub failure_threshold: u32,
    pub open_duration: Duration,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    /// Budget for a single upstream attempt.
    pub attempt_timeout: Duration,
}

impl Default for ResiliencePolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            open_duration: Duration::from_secs(120),
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    last_failure: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permit {
    Normal,
    Trial,
}

/// Releases a half-open trial slot if the call future is dropped mid-flight.
struct TrialGuard<'a> {
    breaker: &'a Mutex<Breaker>,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut b = self.breaker.lock().unwrap_or_else(PoisonError::into_inner);
            b.trial_in_flight = false;
        }
    }
}

pub struct ResilientAdapter {
    inner: DynAdapter,
    policy: ResiliencePolicy,
    breaker: Mutex<Breaker>,
}

impl ResilientAdapter {
    pub fn new(inner: DynAdapter, policy: ResiliencePolicy) -> Self {
        Self {
            inner,
            policy,
            breaker: Mutex::new(Breaker {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                last_failure: None,
                trial_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Breaker> {
        self.breaker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn inner(&self) -> &DynAdapter {
        &self.inner
    }

    pub fn policy(&self) -> &ResiliencePolicy {
        &self.policy
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn last_failure(&self) -> Option<DateTime<Utc>> {
        self.lock().last_failure
    }

    fn acquire(&self, source_id: &str) -> Result<Permit, AdapterError> {
        let mut b = self.lock();
        match b.state {
            CircuitState::Closed => Ok(Permit::Normal),
            CircuitState::Open => {
                let opened = b.opened_at.unwrap_or_else(Instant::now);
                let elapsed = opened.elapsed();
                if elapsed < self.policy.open_duration {
                    counter!("adapter_short_circuited_total").increment(1);
                    return Err(AdapterError::CircuitOpen {
                        source_id: source_id.to_string(),
                        retry_after: self.policy.open_duration - elapsed,
                    });
                }
                b.state = CircuitState::HalfOpen;
                b.trial_in_flight = true;
                tracing::info!(target: "ingest", source_id, "circuit half-open, allowing trial call");
                Ok(Permit::Trial)
            }
            CircuitState::HalfOpen => {
                if b.trial_in_flight {
                    counter!("adapter_short_circuited_total").increment(1);
                    return Err(AdapterError::CircuitOpen {
                        source_id: source_id.to_string(),
                        retry_after: Duration::ZERO,
                    });
                }
                b.trial_in_flight = true;
                Ok(Permit::Trial)
            }
        }
    }

    fn on_success(&self, source_id: &str) {
        let mut b = self.lock();
        if b.state != CircuitState::Closed {
            tracing::info!(target: "ingest", source_id, from = ?b.state, "circuit closed");
        }
        b.state = CircuitState::Closed;
        b.consecutive_failures = 0;
        b.opened_at = None;
        b.trial_in_flight = false;
    }

    fn on_failure(&self, source_id: &str, permit: Permit, error: &AdapterError) {
        let mut b = self.lock();
        b.last_failure = Some(Utc::now());
        b.trial_in_flight = false;
        b.consecutive_failures = b.consecutive_failures.saturating_add(1);
        let trip = permit == Permit::Trial
            || b.consecutive_failures >= self.policy.failure_threshold.max(1);
        if trip && b.state != CircuitState::Open {
            tracing::warn!(
                target: "ingest",
                source_id,
                failures = b.consecutive_failures,
                cooldown_secs = self.policy.open_duration.as_secs_f64(),
                error = %error,
                "circuit opened"
            );
            counter!("adapter_circuit_open_total").increment(1);
        }
        if trip {
            b.state = CircuitState::Open;
            b.opened_at = Some(Instant::now());
        }
    }

    /// One logical fetch: breaker check, then up to `max_attempts` attempts.
    pub async fn fetch(&self, config: &ExternalSourceConfig) -> Result<Vec<RawRecord>, AdapterError> {
        let permit = self.acquire(&config.id)?;
        let mut guard = TrialGuard {
            breaker: &self.breaker,
            armed: permit == Permit::Trial,
        };
        let attempts = match permit {
            Permit::Trial => 1,
            Permit::Normal => self.policy.max_attempts.max(1),
        };

        let mut backoff = self.policy.initial_backoff;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let res = match tokio::time::timeout(self.policy.attempt_timeout, self.inner.fetch(config)).await {
                Ok(r) => r,
                Err(_) => Err(AdapterError::Timeout(self.policy.attempt_timeout)),
            };
            match res {
                Ok(records) => {
                    guard.armed = false;
                    self.on_success(&config.id);
                    return Ok(records);
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    tracing::warn!(
                        target: "ingest",
                        source_id = %config.id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "transient upstream error, retrying"
                    );
                    counter!("adapter_retries_total").increment(1);
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => {
                    guard.armed = false;
                    self.on_failure(&config.id, permit, &e);
                    return Err(e);
                }
            }
        }
    }

    /// Connectivity probe; bypasses the breaker.
    pub async fn validate(&self, config: &ExternalSourceConfig) -> Result<(), AdapterError> {
        match tokio::time::timeout(self.policy.attempt_timeout, self.inner.validate(config)).await {
            Ok(r) => r,
            Err(_) => Err(AdapterError::Timeout(self.policy.attempt_timeout)),
        }
    }
}
