// src/ingest/scheduler.rs
//! Safety-net sweep that re-triggers every pollable source on a coarse period.
//!
//! The wake-up is a durable reminder: its next fire time lives in a
//! `ReminderStore`, so a restarted process picks up the same schedule (and
//! fires immediately if a wake-up was missed while it was down). A light
//! ticker checks the reminder every few seconds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::StorageError;
use crate::ingest::registry::DataSourceRegistry;

pub const DEFAULT_REMINDER_NAME: &str = "ingestion-sweep";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reminder {
    pub name: String,
    pub period_secs: u64,
    pub next_fire_at: DateTime<Utc>,
}

#[async_trait]
pub trait ReminderStore: Send + Sync {
    async fn load(&self, name: &str) -> Result<Option<Reminder>, StorageError>;
    async fn save(&self, reminder: &Reminder) -> Result<(), StorageError>;
}

#[derive(Default)]
pub struct MemoryReminderStore {
    reminders: Mutex<HashMap<String, Reminder>>,
}

#[async_trait]
impl ReminderStore for MemoryReminderStore {
    async fn load(&self, name: &str) -> Result<Option<Reminder>, StorageError> {
        let guard = self.reminders.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.get(name).cloned())
    }

    async fn save(&self, reminder: &Reminder) -> Result<(), StorageError> {
        let mut guard = self.reminders.lock().unwrap_or_else(PoisonError::into_inner);
        guard.insert(reminder.name.clone(), reminder.clone());
        Ok(())
    }
}

/// All reminders in one JSON object keyed by name.
pub struct FileReminderStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileReminderStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<BTreeMap<String, Reminder>, StorageError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(body) if body.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(body) => serde_json::from_str(&body)
                .map_err(|e| StorageError::Serialization(format!("{}: {e}", self.path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(StorageError::Backend(format!("{}: {e}", self.path.display()))),
        }
    }
}

#[async_trait]
impl ReminderStore for FileReminderStore {
    async fn load(&self, name: &str) -> Result<Option<Reminder>, StorageError> {
        Ok(self.read_all().await?.remove(name))
    }

    async fn save(&self, reminder: &Reminder) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut all = self.read_all().await?;
        all.insert(reminder.name.clone(), reminder.clone());
        let body = serde_json::to_vec_pretty(&all).map_err(|e| StorageError::Serialization(e.to_string()))?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::Backend(format!("{}: {e}", parent.display())))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| StorageError::Backend(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StorageError::Backend(format!("{}: {e}", self.path.display())))
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub reminder_name: String,
    pub period: Duration,
    pub check_every: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            reminder_name: DEFAULT_REMINDER_NAME.to_string(),
            period: Duration::from_secs(300),
            check_every: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub triggered: Vec<String>,
    pub failed: BTreeMap<String, String>,
    /// Inactive and webhook-only sources have nothing to fetch.
    pub skipped: Vec<String>,
}

/// One sweep over the registry. Errors are logged and reported, never raised.
pub async fn wake_once(registry: &DataSourceRegistry) -> SweepReport {
    let mut report = SweepReport::default();
    let mut due = Vec::new();
    for handle in registry.handles() {
        let pollable = registry
            .get(handle.source_id())
            .is_some_and(|c| c.is_active && !c.is_webhook_only());
        if pollable {
            due.push(handle);
        } else {
            report.skipped.push(handle.source_id().to_string());
        }
    }

    let results = join_all(due.iter().map(|h| h.trigger_fetch())).await;
    for (h, res) in due.iter().zip(results) {
        let id = h.source_id().to_string();
        match res {
            Ok(r) if r.success => report.triggered.push(id),
            Ok(r) => {
                let error = r.error.unwrap_or_else(|| "fetch failed".into());
                tracing::warn!(target: "scheduler", source_id = %id, error = %error, "scheduled fetch failed");
                report.failed.insert(id, error);
            }
            Err(e) => {
                tracing::warn!(target: "scheduler", source_id = %id, error = %e, "scheduled trigger failed");
                report.failed.insert(id, e.to_string());
            }
        }
    }
    counter!("scheduler_wakeups_total").increment(1);
    gauge!("scheduler_last_wakeup_ts").set(Utc::now().timestamp() as f64);
    tracing::info!(
        target: "scheduler",
        triggered = report.triggered.len(),
        failed = report.failed.len(),
        skipped = report.skipped.len(),
        "scheduler wake-up"
    );
    report
}

pub struct IngestionScheduler {
    registry: DataSourceRegistry,
    store: Arc<dyn ReminderStore>,
    settings: SchedulerSettings,
}

pub struct SchedulerHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub async fn shutdown(self) {
        let _ = self.stop.send(());
        let _ = self.task.await;
    }
}

fn chrono_period(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::seconds(300))
}

impl IngestionScheduler {
    pub fn new(registry: DataSourceRegistry, store: Arc<dyn ReminderStore>, settings: SchedulerSettings) -> Self {
        Self {
            registry,
            store,
            settings,
        }
    }

    /// Load or register the durable reminder.
    async fn register_reminder(&self) -> Result<Reminder, StorageError> {
        let period_secs = self.settings.period.as_secs().max(1);
        let now = Utc::now();
        let reminder = match self.store.load(&self.settings.reminder_name).await? {
            Some(mut r) => {
                if r.period_secs != period_secs {
                    let sooner = now + chrono::Duration::seconds(period_secs as i64);
                    r.next_fire_at = r.next_fire_at.min(sooner);
                    r.period_secs = period_secs;
                }
                tracing::info!(target: "scheduler", name = %r.name, next_fire_at = %r.next_fire_at, "reminder restored");
                r
            }
            None => {
                let r = Reminder {
                    name: self.settings.reminder_name.clone(),
                    period_secs,
                    next_fire_at: now + chrono::Duration::seconds(period_secs as i64),
                };
                tracing::info!(target: "scheduler", name = %r.name, period_secs, "reminder registered");
                r
            }
        };
        self.store.save(&reminder).await?;
        Ok(reminder)
    }

    /// Register the reminder and start the ticker.
    pub async fn activate(self) -> Result<SchedulerHandle, StorageError> {
        let mut reminder = self.register_reminder().await?;
        let (stop, mut stopped) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.check_every.max(Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {}
                }
                let now = Utc::now();
                if now < reminder.next_fire_at {
                    continue;
                }
                // persist first so a crash mid-sweep does not re-fire in a loop
                reminder.next_fire_at = now + chrono_period(Duration::from_secs(reminder.period_secs));
                if let Err(e) = self.store.save(&reminder).await {
                    tracing::error!(target: "scheduler", error = %e, "failed to persist reminder");
                }
                wake_once(&self.registry).await;
            }
            tracing::info!(target: "scheduler", "scheduler stopped");
        });
        Ok(SchedulerHandle { stop, task })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_store_keeps_reminders_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("reminders.json");
        let r = Reminder {
            name: "sweep".into(),
            period_secs: 300,
            next_fire_at: Utc::now(),
        };
        FileReminderStore::new(&path).save(&r).await.unwrap();
        let other = Reminder {
            name: "other".into(),
            ..r.clone()
        };
        FileReminderStore::new(&path).save(&other).await.unwrap();

        let reopened = FileReminderStore::new(&path);
        assert_eq!(reopened.load("sweep").await.unwrap(), Some(r));
        assert!(reopened.load("other").await.unwrap().is_some());
        assert!(reopened.load("missing").await.unwrap().is_none());
    }
}
