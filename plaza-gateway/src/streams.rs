//! Stream lifecycle manager.
//!
//! Streams run `Requested -> Open -> Closed`. The gateway assigns every
//! stream id at request time; a client can never pick its own, which is
//! what makes the `stream_id -> owner` binding trustworthy. Raw frames
//! carry no authorization of their own — admission is owner + Open state,
//! nothing else, so the fast path stays cheap.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use plaza_core::payloads::{StreamDirection, StreamRequestPayload};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("Unknown stream: {0}")]
    Unknown(String),
    #[error("Stream {0} is not open")]
    NotOpen(String),
    #[error("Stream {0} is closed")]
    Closed(String),
    #[error("Participant {sender} does not own stream {stream_id}")]
    NotOwner { stream_id: String, sender: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Requested,
    Open,
    Closed,
}

#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub stream_id: String,
    pub owner: String,
    pub direction: StreamDirection,
    pub description: Option<String>,
    pub state: StreamState,
    pub last_activity: Instant,
}

/// Tracks every stream in one space. Streams reference their owner by
/// logical id, never by handle, so participant teardown stays independent.
pub struct StreamManager {
    inner: RwLock<HashMap<String, Arc<Mutex<StreamEntry>>>>,
}

impl Default for StreamManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamManager {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Record a requested stream and assign its id.
    pub async fn request(&self, owner: &str, payload: &StreamRequestPayload) -> String {
        let stream_id = format!("stream-{}", uuid::Uuid::new_v4());
        let entry = StreamEntry {
            stream_id: stream_id.clone(),
            owner: owner.to_string(),
            direction: payload.direction,
            description: payload.description.clone(),
            state: StreamState::Requested,
            last_activity: Instant::now(),
        };
        self.inner
            .write()
            .await
            .insert(stream_id.clone(), Arc::new(Mutex::new(entry)));
        stream_id
    }

    async fn entry(&self, stream_id: &str) -> Option<Arc<Mutex<StreamEntry>>> {
        self.inner.read().await.get(stream_id).cloned()
    }

    /// Transition `Requested -> Open`.
    pub async fn open(&self, stream_id: &str) -> Result<(), StreamError> {
        let entry = self
            .entry(stream_id)
            .await
            .ok_or_else(|| StreamError::Unknown(stream_id.to_string()))?;
        let mut entry = entry.lock().await;
        match entry.state {
            StreamState::Requested => {
                entry.state = StreamState::Open;
                entry.last_activity = Instant::now();
                Ok(())
            }
            StreamState::Open => Ok(()),
            StreamState::Closed => Err(StreamError::Closed(stream_id.to_string())),
        }
    }

    /// Transition to `Closed` (terminal). Either peer may close.
    pub async fn close(&self, stream_id: &str) -> Result<StreamEntry, StreamError> {
        let entry = self
            .entry(stream_id)
            .await
            .ok_or_else(|| StreamError::Unknown(stream_id.to_string()))?;
        let mut entry = entry.lock().await;
        entry.state = StreamState::Closed;
        entry.last_activity = Instant::now();
        Ok(entry.clone())
    }

    /// Admission check for a raw frame: the stream must be Open and the
    /// sender must be the recorded owner. Updates last-activity on accept.
    pub async fn admit_frame(&self, stream_id: &str, sender: &str) -> Result<(), StreamError> {
        let entry = self
            .entry(stream_id)
            .await
            .ok_or_else(|| StreamError::Unknown(stream_id.to_string()))?;
        let mut entry = entry.lock().await;
        match entry.state {
            StreamState::Requested => return Err(StreamError::NotOpen(stream_id.to_string())),
            StreamState::Closed => return Err(StreamError::Closed(stream_id.to_string())),
            StreamState::Open => {}
        }
        if entry.owner != sender {
            return Err(StreamError::NotOwner {
                stream_id: stream_id.to_string(),
                sender: sender.to_string(),
            });
        }
        entry.last_activity = Instant::now();
        Ok(())
    }

    /// Snapshot of a stream's entry, for announcements and diagnostics.
    pub async fn get(&self, stream_id: &str) -> Option<StreamEntry> {
        let entry = self.entry(stream_id).await?;
        let entry = entry.lock().await;
        Some(entry.clone())
    }

    /// Snapshot of every currently open stream, sorted by id. Joiners get
    /// this in their welcome so frames on streams announced before they
    /// arrived are still attributable.
    pub async fn open_streams(&self) -> Vec<StreamEntry> {
        let entries: Vec<Arc<Mutex<StreamEntry>>> =
            self.inner.read().await.values().cloned().collect();
        let mut open = Vec::new();
        for entry in entries {
            let entry = entry.lock().await;
            if entry.state == StreamState::Open {
                open.push(entry.clone());
            }
        }
        open.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        open
    }

    /// Close every open stream owned by a departing participant. Returns
    /// the closed stream ids so the router can announce them.
    pub async fn close_owned_by(&self, owner: &str) -> Vec<String> {
        let entries: Vec<Arc<Mutex<StreamEntry>>> =
            self.inner.read().await.values().cloned().collect();
        let mut closed = Vec::new();
        for entry in entries {
            let mut entry = entry.lock().await;
            if entry.owner == owner && entry.state != StreamState::Closed {
                entry.state = StreamState::Closed;
                closed.push(entry.stream_id.clone());
            }
        }
        closed.sort();
        closed
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn make_request() -> StreamRequestPayload {
        StreamRequestPayload {
            direction: StreamDirection::Download,
            description: Some("reasoning tokens".to_string()),
            expected_size_bytes: None,
        }
    }

    #[tokio::test]
    async fn test_request_assigns_unique_ids() {
        let manager = StreamManager::new();
        let a = manager.request("assistant", &make_request()).await;
        let b = manager.request("assistant", &make_request()).await;
        assert_ne!(a, b);
        assert!(a.starts_with("stream-"));
    }

    #[tokio::test]
    async fn test_lifecycle_requested_open_closed() {
        let manager = StreamManager::new();
        let id = manager.request("assistant", &make_request()).await;
        assert_eq!(manager.get(&id).await.unwrap().state, StreamState::Requested);

        manager.open(&id).await.unwrap();
        assert_eq!(manager.get(&id).await.unwrap().state, StreamState::Open);

        manager.close(&id).await.unwrap();
        assert_eq!(manager.get(&id).await.unwrap().state, StreamState::Closed);

        // Closed is terminal.
        assert_eq!(
            manager.open(&id).await,
            Err(StreamError::Closed(id.clone()))
        );
    }

    #[tokio::test]
    async fn test_admit_frame_owner_only() {
        let manager = StreamManager::new();
        let id = manager.request("assistant", &make_request()).await;
        manager.open(&id).await.unwrap();

        assert!(manager.admit_frame(&id, "assistant").await.is_ok());
        assert_eq!(
            manager.admit_frame(&id, "interloper").await,
            Err(StreamError::NotOwner {
                stream_id: id.clone(),
                sender: "interloper".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_admit_frame_requires_open() {
        let manager = StreamManager::new();
        let id = manager.request("assistant", &make_request()).await;
        assert_eq!(
            manager.admit_frame(&id, "assistant").await,
            Err(StreamError::NotOpen(id.clone()))
        );

        manager.open(&id).await.unwrap();
        manager.close(&id).await.unwrap();
        assert_eq!(
            manager.admit_frame(&id, "assistant").await,
            Err(StreamError::Closed(id.clone()))
        );
    }

    #[tokio::test]
    async fn test_unknown_stream() {
        let manager = StreamManager::new();
        assert_eq!(
            manager.admit_frame("stream-missing", "assistant").await,
            Err(StreamError::Unknown("stream-missing".to_string()))
        );
    }

    #[tokio::test]
    async fn test_open_streams_snapshot() {
        let manager = StreamManager::new();
        let requested = manager.request("assistant", &make_request()).await;
        let open = manager.request("assistant", &make_request()).await;
        let closed = manager.request("human", &make_request()).await;
        manager.open(&open).await.unwrap();
        manager.open(&closed).await.unwrap();
        manager.close(&closed).await.unwrap();

        let snapshot = manager.open_streams().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].stream_id, open);
        assert_eq!(snapshot[0].owner, "assistant");
        assert_ne!(snapshot[0].stream_id, requested);
    }

    #[tokio::test]
    async fn test_close_owned_by() {
        let manager = StreamManager::new();
        let a = manager.request("assistant", &make_request()).await;
        let b = manager.request("assistant", &make_request()).await;
        let other = manager.request("human", &make_request()).await;
        manager.open(&a).await.unwrap();
        manager.open(&other).await.unwrap();

        let mut expected = vec![a.clone(), b.clone()];
        expected.sort();
        assert_eq!(manager.close_owned_by("assistant").await, expected);

        assert_eq!(manager.get(&a).await.unwrap().state, StreamState::Closed);
        assert_eq!(manager.get(&other).await.unwrap().state, StreamState::Open);
    }
}
