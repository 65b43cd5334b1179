//! Bounded TTL cache for capability decisions.
//!
//! Pattern evaluation is pure, so a decision for (participant, kind,
//! payload) stays valid until that participant's capability set changes.
//! Entries therefore carry a TTL as a backstop and the router invalidates
//! a participant's entries eagerly on every grant/revoke.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;
use tokio::sync::Mutex;

pub const DEFAULT_DECISION_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_DECISION_CAPACITY: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DecisionKey {
    participant_id: String,
    kind: String,
    payload_fingerprint: u64,
}

#[derive(Debug, Clone, Copy)]
struct DecisionEntry {
    allowed: bool,
    expires_at: Instant,
}

pub struct DecisionCache {
    inner: Mutex<HashMap<DecisionKey, DecisionEntry>>,
    ttl: Duration,
    capacity: usize,
}

impl DecisionCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl,
            capacity,
        }
    }

    fn key(participant_id: &str, kind: &str, payload: &JsonValue) -> DecisionKey {
        let mut hasher = DefaultHasher::new();
        // serde_json renders a given Value deterministically, which is all
        // fingerprinting one candidate payload needs.
        payload.to_string().hash(&mut hasher);
        DecisionKey {
            participant_id: participant_id.to_string(),
            kind: kind.to_string(),
            payload_fingerprint: hasher.finish(),
        }
    }

    pub async fn get(&self, participant_id: &str, kind: &str, payload: &JsonValue) -> Option<bool> {
        let key = Self::key(participant_id, kind, payload);
        let mut cache = self.inner.lock().await;
        match cache.get(&key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.allowed),
            Some(_) => {
                cache.remove(&key);
                None
            }
            None => None,
        }
    }

    pub async fn insert(
        &self,
        participant_id: &str,
        kind: &str,
        payload: &JsonValue,
        allowed: bool,
    ) {
        let key = Self::key(participant_id, kind, payload);
        let mut cache = self.inner.lock().await;
        if cache.len() >= self.capacity {
            let now = Instant::now();
            cache.retain(|_, entry| entry.expires_at > now);
            if cache.len() >= self.capacity {
                cache.clear();
            }
        }
        cache.insert(
            key,
            DecisionEntry {
                allowed,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Drop every cached decision for one participant. Called whenever
    /// that participant's capability set changes.
    pub async fn invalidate(&self, participant_id: &str) {
        self.inner
            .lock()
            .await
            .retain(|key, _| key.participant_id != participant_id);
    }
}
