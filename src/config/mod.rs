// src/config/mod.rs
pub mod pipeline;

pub use pipeline::{
    AggregateSection, PipelineConfig, RealtimeSection, ResilienceSection, SchedulerSection, StreamSection,
    TransformSection, ENV_CONFIG_PATH,
};
