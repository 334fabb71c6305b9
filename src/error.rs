//! Error types for the ingestion pipeline.
//!
//! Background cycles (timer fetches, scheduler wake-ups, stream handling)
//! catch and count these; direct calls return them to the caller.

use std::time::Duration;
use thiserror::Error;

/// Failure of a single upstream call made by a `DataSourceAdapter`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdapterError {
    /// Connection refused, DNS failure, reset, ...
    #[error("network error: {0}")]
    Network(String),

    /// The upstream call did not finish within its attempt budget.
    #[error("upstream call timed out after {0:?}")]
    Timeout(Duration),

    /// 5xx or 429 from the provider.
    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    /// Any other 4xx from the provider.
    #[error("upstream rejected request with {status}: {message}")]
    Rejected { status: u16, message: String },

    /// The provider answered but the body could not be parsed.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// Missing or invalid connection parameters.
    #[error("configuration error: {0}")]
    Config(String),

    /// The circuit breaker is open; the call was not attempted.
    #[error("circuit open for {source_id}, retry after {retry_after:?}")]
    CircuitOpen {
        source_id: String,
        retry_after: Duration,
    },
}

impl AdapterError {
    /// Only transient errors are retried by the resilience envelope.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AdapterError::Network(_) | AdapterError::Timeout(_) | AdapterError::Upstream { .. }
        )
    }

    /// Classify an HTTP status the way the retry policy expects.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status >= 500 || status == 429 {
            AdapterError::Upstream { status, message }
        } else {
            AdapterError::Rejected { status, message }
        }
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AdapterError::Timeout(Duration::ZERO)
        } else if let Some(status) = e.status() {
            AdapterError::from_status(status.as_u16(), e.to_string())
        } else if e.is_decode() {
            AdapterError::Malformed(e.to_string())
        } else {
            AdapterError::Network(e.to_string())
        }
    }
}

/// Errors surfaced by ingestion actors and the registry.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IngestError {
    #[error("source {0} is not initialized")]
    NotInitialized(String),

    #[error("source {0} is already initialized with a different configuration; stop it first")]
    AlreadyInitialized(String),

    #[error("source {0} is not registered")]
    NotFound(String),

    #[error("{0} already exists")]
    Duplicate(String),

    #[error("ingestion actor for {0} is unavailable")]
    ActorUnavailable(String),

    #[error("invalid source configuration: {0}")]
    InvalidConfig(String),

    #[error("illegal record status transition {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

/// Errors on the channels between stages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream {0} is closed")]
    Closed(String),

    #[error("stream {0} is full (publish timed out)")]
    Full(String),

    #[error("stream {0} was already subscribed")]
    AlreadySubscribed(String),
}

/// Per-record transform failures. Isolated to the record; the stream keeps going.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("payload is not a JSON object: {0}")]
    InvalidPayload(String),

    #[error("invalid {field}: {message}")]
    InvalidField { field: &'static str, message: String },
}

/// Errors from the persistence boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("storage actor is unavailable")]
    Unavailable,

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Errors from township aggregates.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AggregateError {
    #[error("failed to persist township {key}: {message}")]
    Persist { key: String, message: String },

    #[error("failed to load township {key}: {message}")]
    Load { key: String, message: String },

    #[error("township actor {0} is unavailable")]
    Unavailable(String),

    #[error("invalid township key: {0:?}")]
    InvalidKey(String),
}

/// Semantic configuration problems. File I/O and parse failures are reported
/// through `anyhow` context by the loaders.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} points to non-existent path {path}")]
    MissingPath { var: &'static str, path: String },

    #[error("environment variable {var} (referenced by source {source_id}) is not set")]
    MissingEnv { var: String, source_id: String },

    #[error("duplicate source id {0} in configuration")]
    DuplicateSource(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
