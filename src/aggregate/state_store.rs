//! Durable per-township state.
//!
//! The JSON file store writes `<dir>/<encoded-key>.json` through a temp file
//! and a rename, so a crash mid-write leaves the previous state intact.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use super::AggregateState;
use crate::error::AggregateError;

#[async_trait]
pub trait AggregateStateStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<AggregateState>, AggregateError>;
    async fn save(&self, key: &str, state: &AggregateState) -> Result<(), AggregateError>;
    /// Every key with persisted state.
    async fn keys(&self) -> Result<Vec<String>, AggregateError>;
}

#[derive(Default)]
pub struct MemoryStateStore {
    states: Mutex<HashMap<String, AggregateState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AggregateStateStore for MemoryStateStore {
    async fn load(&self, key: &str) -> Result<Option<AggregateState>, AggregateError> {
        let guard = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.get(key).cloned())
    }

    async fn save(&self, key: &str, state: &AggregateState) -> Result<(), AggregateError> {
        let mut guard = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        guard.insert(key.to_string(), state.clone());
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, AggregateError> {
        let guard = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<String> = guard.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

pub struct JsonFileStateStore {
    dir: PathBuf,
}

impl JsonFileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_key(key)))
    }
}

/// `[a-z0-9_-]` pass through; every other byte becomes `%XX`.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        match b {
            b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

fn decode_key(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[async_trait]
impl AggregateStateStore for JsonFileStateStore {
    async fn load(&self, key: &str) -> Result<Option<AggregateState>, AggregateError> {
        let path = self.path_for(key);
        let body = match tokio::fs::read_to_string(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(AggregateError::Load {
                    key: key.to_string(),
                    message: format!("{}: {e}", path.display()),
                })
            }
        };
        serde_json::from_str(&body)
            .map(Some)
            .map_err(|e| AggregateError::Load {
                key: key.to_string(),
                message: format!("{}: {e}", path.display()),
            })
    }

    async fn save(&self, key: &str, state: &AggregateState) -> Result<(), AggregateError> {
        let persist_err = |message: String| AggregateError::Persist {
            key: key.to_string(),
            message,
        };
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| persist_err(format!("{}: {e}", self.dir.display())))?;
        let body = serde_json::to_vec_pretty(state).map_err(|e| persist_err(e.to_string()))?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| persist_err(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| persist_err(format!("{}: {e}", path.display())))
    }

    async fn keys(&self) -> Result<Vec<String>, AggregateError> {
        let mut rd = match tokio::fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(AggregateError::Load {
                    key: "*".into(),
                    message: format!("{}: {e}", self.dir.display()),
                })
            }
        };
        let mut keys = Vec::new();
        while let Ok(Some(entry)) = rd.next_entry().await {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Some(key) = decode_key(stem) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}
