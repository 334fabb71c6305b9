// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod aggregate;
pub mod api;
pub mod config;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod pipeline;
pub mod realtime;
pub mod storage;
pub mod stream;
pub mod transform;

// ---- Re-exports for stable public API ----
pub use crate::api::router;
pub use crate::config::PipelineConfig;
pub use crate::pipeline::Pipeline;
