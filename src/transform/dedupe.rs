use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Remembers derived keys for `window` after their first sighting.
#[derive(Debug)]
pub struct DedupeWindow {
    window: Duration,
    seen: HashMap<String, Instant>,
    inserts_since_prune: usize,
}

const PRUNE_EVERY: usize = 512;

impl DedupeWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
            inserts_since_prune: 0,
        }
    }

    /// `true` when `key` is new (or its previous sighting has expired).
    pub fn check_and_insert(&mut self, key: &str, now: Instant) -> bool {
        if let Some(first) = self.seen.get(key) {
            if now.saturating_duration_since(*first) < self.window {
                return false;
            }
        }
        self.seen.insert(key.to_string(), now);
        self.inserts_since_prune += 1;
        if self.inserts_since_prune >= PRUNE_EVERY {
            self.prune(now);
        }
        true
    }

    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.seen
            .retain(|_, first| now.saturating_duration_since(*first) < window);
        self.inserts_since_prune = 0;
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Content key: data type + location (4 decimals, ~11 m) + timestamp.
/// Records without both location and timestamp fall back to hashing the
/// whole normalized payload.
pub fn derive_key(data_type: &str, normalized: &Map<String, Value>) -> String {
    let mut h = Sha256::new();
    h.update(data_type.as_bytes());
    h.update([0u8]);

    let lat = normalized.get("latitude").and_then(Value::as_f64);
    let lon = normalized.get("longitude").and_then(Value::as_f64);
    let ts = normalized.get("timestamp").and_then(Value::as_str);
    match (lat, lon, ts) {
        (Some(lat), Some(lon), Some(ts)) => {
            h.update(format!("{lat:.4}|{lon:.4}|{ts}").as_bytes());
        }
        _ => {
            // normalize emits keys in a fixed order, so equal payloads hash equally
            h.update(Value::Object(normalized.clone()).to_string().as_bytes());
        }
    }
    hex(&h.finalize())
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn duplicate_within_window_is_rejected() {
        let mut w = DedupeWindow::new(Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(w.check_and_insert("k", t0));
        assert!(!w.check_and_insert("k", t0 + Duration::from_secs(59)));
        assert!(w.check_and_insert("k", t0 + Duration::from_secs(61)));
    }

    #[test]
    fn prune_drops_expired_keys() {
        let mut w = DedupeWindow::new(Duration::from_secs(10));
        let t0 = Instant::now();
        w.check_and_insert("a", t0);
        w.check_and_insert("b", t0 + Duration::from_secs(8));
        w.prune(t0 + Duration::from_secs(12));
        assert_eq!(w.len(), 1);
    }

    #[test]
    fn key_ignores_sub_meter_jitter_but_not_time() {
        let a = obj(json!({"latitude": 40.123_41, "longitude": -3.7, "timestamp": "2025-01-10T12:00:00Z"}));
        let b = obj(json!({"latitude": 40.123_44, "longitude": -3.7, "timestamp": "2025-01-10T12:00:00Z", "extra": 1}));
        let c = obj(json!({"latitude": 40.123_41, "longitude": -3.7, "timestamp": "2025-01-10T12:05:00Z"}));
        assert_eq!(derive_key("fire_detection", &a), derive_key("fire_detection", &b));
        assert_ne!(derive_key("fire_detection", &a), derive_key("fire_detection", &c));
        assert_ne!(derive_key("fire_detection", &a), derive_key("earthquake", &a));
    }
}
