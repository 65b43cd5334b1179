//! Request/response correlation tracking.
//!
//! Request-shaped envelopes are tracked by id until every expected
//! responder has answered with a `correlation_id` referencing them, or the
//! timeout window elapses. Timed-out and disconnect-evicted entries notify
//! the original requester instead of leaving it hanging, and always leave
//! the table — the table is bounded by outstanding work, not history.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Default window before an unanswered request fails.
pub const DEFAULT_CORRELATION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct PendingCorrelation {
    pub request_id: String,
    pub requester_id: String,
    pub kind: String,
    pub created_at: Instant,
    deadline: Instant,
    /// Responders still expected. Multi-recipient requests track each
    /// recipient separately rather than a single boolean.
    pending: HashSet<String>,
}

/// An entry that left the table without being fully answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationFailure {
    pub request_id: String,
    pub requester_id: String,
    pub kind: String,
    pub reason: FailureReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Timeout,
    ResponderDisconnected { responder_id: String },
}

pub struct CorrelationTracker {
    inner: Mutex<HashMap<String, PendingCorrelation>>,
    timeout: Duration,
}

impl CorrelationTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Track a request awaiting answers from `responders`. Tracking with
    /// no responders is a no-op (nothing to wait for).
    pub async fn track(
        &self,
        request_id: &str,
        requester_id: &str,
        kind: &str,
        responders: impl IntoIterator<Item = String>,
    ) {
        let pending: HashSet<String> = responders.into_iter().collect();
        if pending.is_empty() {
            return;
        }
        let now = Instant::now();
        self.inner.lock().await.insert(
            request_id.to_string(),
            PendingCorrelation {
                request_id: request_id.to_string(),
                requester_id: requester_id.to_string(),
                kind: kind.to_string(),
                created_at: now,
                deadline: now + self.timeout,
                pending,
            },
        );
    }

    /// Record that `responder` answered the given correlation ids. Entries
    /// whose pending set empties are removed and returned.
    pub async fn resolve(
        &self,
        correlation_ids: &[String],
        responder: &str,
    ) -> Vec<PendingCorrelation> {
        let mut table = self.inner.lock().await;
        let mut completed = Vec::new();
        for id in correlation_ids {
            if let Some(entry) = table.get_mut(id) {
                entry.pending.remove(responder);
                if entry.pending.is_empty() {
                    if let Some(entry) = table.remove(id) {
                        completed.push(entry);
                    }
                }
            }
        }
        completed
    }

    /// Evict entries whose window elapsed. Each evicted entry yields
    /// exactly one failure, because eviction removes it from the table.
    pub async fn sweep(&self) -> Vec<CorrelationFailure> {
        let now = Instant::now();
        let mut table = self.inner.lock().await;
        let expired: Vec<String> = table
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| table.remove(&id))
            .map(|entry| CorrelationFailure {
                request_id: entry.request_id,
                requester_id: entry.requester_id,
                kind: entry.kind,
                reason: FailureReason::Timeout,
            })
            .collect()
    }

    /// A participant disconnected: requests they originated are dropped,
    /// and requests still waiting on them fail with a disconnect reason
    /// rather than silence.
    pub async fn evict_participant(&self, participant_id: &str) -> Vec<CorrelationFailure> {
        let mut table = self.inner.lock().await;
        let mut failures = Vec::new();

        table.retain(|_, entry| entry.requester_id != participant_id);

        let affected: Vec<String> = table
            .iter()
            .filter(|(_, entry)| entry.pending.contains(participant_id))
            .map(|(id, _)| id.clone())
            .collect();
        for id in affected {
            if let Some(entry) = table.remove(&id) {
                failures.push(CorrelationFailure {
                    request_id: entry.request_id,
                    requester_id: entry.requester_id,
                    kind: entry.kind,
                    reason: FailureReason::ResponderDisconnected {
                        responder_id: participant_id.to_string(),
                    },
                });
            }
        }
        failures
    }

    /// Number of outstanding entries (for leak assertions in tests).
    pub async fn outstanding(&self) -> usize {
        self.inner.lock().await.len()
    }
}
