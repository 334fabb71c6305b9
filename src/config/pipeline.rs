// src/config/pipeline.rs
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::ingest::resilient::ResiliencePolicy;
use crate::ingest::scheduler::{SchedulerSettings, DEFAULT_REMINDER_NAME};
use crate::ingest::types::ExternalSourceConfig;
use crate::transform::TransformSettings;

pub const ENV_CONFIG_PATH: &str = "PIPELINE_CONFIG_PATH";
pub const DEFAULT_TOML_PATH: &str = "config/pipeline.toml";
pub const DEFAULT_JSON_PATH: &str = "config/pipeline.json";

/// Connection values of this form are read from the environment.
const ENV_PREFIX: &str = "ENV:";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub interval_secs: u64,
    pub check_every_secs: u64,
    /// `None` keeps the reminder in memory only.
    pub reminder_path: Option<PathBuf>,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            check_every_secs: 5,
            reminder_path: Some(PathBuf::from("state/reminders.json")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceSection {
    pub failure_threshold: u32,
    pub open_duration_secs: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub attempt_timeout_secs: u64,
}

impl Default for ResilienceSection {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            open_duration_secs: 120,
            max_attempts: 3,
            initial_backoff_ms: 1000,
            attempt_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSection {
    pub capacity: usize,
    pub publish_timeout_ms: u64,
    pub publish_retries: u32,
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            capacity: crate::stream::DEFAULT_STREAM_CAPACITY,
            publish_timeout_ms: 500,
            publish_retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformSection {
    pub dedupe_window_secs: u64,
}

impl Default for TransformSection {
    fn default() -> Self {
        Self { dedupe_window_secs: 3600 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateSection {
    /// `None` keeps township state in memory only.
    pub state_dir: Option<PathBuf>,
}

impl Default for AggregateSection {
    fn default() -> Self {
        Self {
            state_dir: Some(PathBuf::from("state/townships")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeSection {
    pub channel_capacity: usize,
}

impl Default for RealtimeSection {
    fn default() -> Self {
        Self {
            channel_capacity: crate::realtime::DEFAULT_REALTIME_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub scheduler: SchedulerSection,
    pub resilience: ResilienceSection,
    pub stream: StreamSection,
    pub transform: TransformSection,
    pub aggregate: AggregateSection,
    pub realtime: RealtimeSection,
    pub sources: Vec<ExternalSourceConfig>,
}

impl PipelineConfig {
    /// Configuration with nothing on disk: state stays in memory.
    pub fn in_memory() -> Self {
        let mut cfg = Self::default();
        cfg.scheduler.reminder_path = None;
        cfg.aggregate.state_dir = None;
        cfg
    }

    /// Load from an explicit path. TOML or JSON, chosen by extension.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading pipeline config from {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let mut cfg = parse(&content, ext.as_str())
            .with_context(|| format!("parsing pipeline config {}", path.display()))?;
        cfg.resolve_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Env var + fallbacks:
    /// 1) $PIPELINE_CONFIG_PATH (must exist)
    /// 2) config/pipeline.toml
    /// 3) config/pipeline.json
    /// 4) built-in defaults
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(&p);
            if !pb.exists() {
                return Err(ConfigError::MissingPath {
                    var: ENV_CONFIG_PATH,
                    path: p,
                }
                .into());
            }
            return Self::load_from(&pb);
        }
        for candidate in [DEFAULT_TOML_PATH, DEFAULT_JSON_PATH] {
            let pb = PathBuf::from(candidate);
            if pb.exists() {
                return Self::load_from(&pb);
            }
        }
        Ok(Self::default())
    }

    /// Replace `ENV:NAME` connection values with the variable's value.
    pub fn resolve_env(&mut self) -> Result<(), ConfigError> {
        for source in &mut self.sources {
            for value in source.connection.values_mut() {
                let Some(var) = value.trim().strip_prefix(ENV_PREFIX) else {
                    continue;
                };
                let var = var.trim().to_string();
                *value = std::env::var(&var).map_err(|_| ConfigError::MissingEnv {
                    var,
                    source_id: source.id.clone(),
                })?;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resilience.failure_threshold == 0 {
            return Err(ConfigError::Invalid("resilience.failure_threshold must be at least 1".into()));
        }
        if self.resilience.max_attempts == 0 {
            return Err(ConfigError::Invalid("resilience.max_attempts must be at least 1".into()));
        }
        if self.stream.capacity == 0 {
            return Err(ConfigError::Invalid("stream.capacity must be at least 1".into()));
        }
        if self.scheduler.interval_secs == 0 {
            return Err(ConfigError::Invalid("scheduler.interval_secs must be at least 1".into()));
        }
        let mut seen = HashSet::new();
        for source in &self.sources {
            source
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("source {:?}: {e}", source.id)))?;
            if !seen.insert(source.id.trim()) {
                return Err(ConfigError::DuplicateSource(source.id.clone()));
            }
        }
        Ok(())
    }

    pub fn resilience_policy(&self) -> ResiliencePolicy {
        let r = &self.resilience;
        ResiliencePolicy {
            failure_threshold: r.failure_threshold,
            open_duration: Duration::from_secs(r.open_duration_secs),
            max_attempts: r.max_attempts,
            initial_backoff: Duration::from_millis(r.initial_backoff_ms),
            attempt_timeout: Duration::from_secs(r.attempt_timeout_secs),
        }
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            reminder_name: DEFAULT_REMINDER_NAME.to_string(),
            period: Duration::from_secs(self.scheduler.interval_secs),
            check_every: Duration::from_secs(self.scheduler.check_every_secs),
        }
    }

    pub fn transform_settings(&self) -> TransformSettings {
        TransformSettings {
            dedupe_window: Duration::from_secs(self.transform.dedupe_window_secs),
            publish_retries: self.stream.publish_retries,
            publish_timeout: self.publish_timeout(),
        }
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.stream.publish_timeout_ms)
    }
}

fn parse(s: &str, hint_ext: &str) -> Result<PipelineConfig> {
    match hint_ext {
        "toml" => Ok(toml::from_str(s)?),
        "json" => Ok(serde_json::from_str(s)?),
        _ => toml::from_str(s)
            .map_err(anyhow::Error::from)
            .or_else(|_| serde_json::from_str(s).map_err(anyhow::Error::from))
            .map_err(|_| anyhow!("unsupported pipeline config format")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::SourceType;
    use std::{env, fs};

    const SAMPLE: &str = r#"
[scheduler]
interval_secs = 60

[resilience]
failure_threshold = 5

[[sources]]
id = "firms-ca"
name = "FIRMS California"
source_type = "satellite-fire"
polling_interval_secs = 900
[sources.connection]
api_key = "ENV:FIP_TEST_FIRMS_KEY"
area = "-124,32,-114,42"

[[sources]]
id = "quake-hook"
name = "Quake webhook"
source_type = "seismic"
"#;

    #[test]
    fn toml_sections_default_independently() {
        let cfg = parse(SAMPLE, "toml").unwrap();
        assert_eq!(cfg.scheduler.interval_secs, 60);
        assert_eq!(cfg.scheduler.check_every_secs, 5);
        assert_eq!(cfg.resilience.failure_threshold, 5);
        assert_eq!(cfg.resilience.max_attempts, 3);
        assert_eq!(cfg.transform.dedupe_window_secs, 3600);
        assert_eq!(cfg.sources.len(), 2);
        assert_eq!(cfg.sources[0].source_type, SourceType::SatelliteFire);
        assert_eq!(cfg.sources[0].polling_interval, Duration::from_secs(900));
        assert!(cfg.sources[1].is_webhook_only());
        assert!(cfg.sources[1].is_active);

        let policy = cfg.resilience_policy();
        assert_eq!(policy.failure_threshold, 5);
        assert_eq!(policy.initial_backoff, Duration::from_millis(1000));
    }

    #[test]
    fn json_without_extension_hint_still_parses() {
        let cfg = parse(r#"{"stream": {"capacity": 16}}"#, "").unwrap();
        assert_eq!(cfg.stream.capacity, 16);
        assert_eq!(cfg.stream.publish_retries, 3);
        assert!(parse("not = [valid", "").is_err());
    }

    #[test]
    fn duplicate_source_ids_are_rejected() {
        let mut cfg = PipelineConfig::in_memory();
        cfg.sources = vec![
            ExternalSourceConfig::new("a", "A", SourceType::Seismic),
            ExternalSourceConfig::new("a", "A again", SourceType::Social),
        ];
        assert!(matches!(cfg.validate(), Err(ConfigError::DuplicateSource(id)) if id == "a"));
    }

    #[serial_test::serial]
    #[test]
    fn env_indirection_resolves_or_fails() {
        let mut cfg = parse(SAMPLE, "toml").unwrap();
        env::remove_var("FIP_TEST_FIRMS_KEY");
        let err = cfg.clone().resolve_env().unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv { ref var, ref source_id }
            if var == "FIP_TEST_FIRMS_KEY" && source_id == "firms-ca"));

        env::set_var("FIP_TEST_FIRMS_KEY", "secret");
        cfg.resolve_env().unwrap();
        assert_eq!(cfg.sources[0].param("api_key"), Some("secret"));
        assert_eq!(cfg.sources[0].param("area"), Some("-124,32,-114,42"));
        env::remove_var("FIP_TEST_FIRMS_KEY");
    }

    #[serial_test::serial]
    #[test]
    fn default_uses_env_then_fallbacks() {
        let old = env::current_dir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        env::set_current_dir(tmp.path()).unwrap();
        env::remove_var(ENV_CONFIG_PATH);

        // nothing on disk
        let cfg = PipelineConfig::load_default().unwrap();
        assert_eq!(cfg, PipelineConfig::default());

        fs::create_dir_all("config").unwrap();
        fs::write(DEFAULT_JSON_PATH, r#"{"transform": {"dedupe_window_secs": 10}}"#).unwrap();
        assert_eq!(PipelineConfig::load_default().unwrap().transform.dedupe_window_secs, 10);

        // toml wins over json
        fs::write(DEFAULT_TOML_PATH, "[transform]\ndedupe_window_secs = 20\n").unwrap();
        assert_eq!(PipelineConfig::load_default().unwrap().transform.dedupe_window_secs, 20);

        // env path wins over both
        let explicit = tmp.path().join("explicit.json");
        fs::write(&explicit, r#"{"transform": {"dedupe_window_secs": 30}}"#).unwrap();
        env::set_var(ENV_CONFIG_PATH, explicit.display().to_string());
        assert_eq!(PipelineConfig::load_default().unwrap().transform.dedupe_window_secs, 30);

        env::set_var(ENV_CONFIG_PATH, tmp.path().join("missing.toml").display().to_string());
        let err = PipelineConfig::load_default().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::MissingPath { .. })
        ));

        env::remove_var(ENV_CONFIG_PATH);
        env::set_current_dir(&old).unwrap();
    }
}
