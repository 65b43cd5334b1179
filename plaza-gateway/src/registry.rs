//! Participant registry: logical identity, live connections, capabilities.
//!
//! The load-bearing invariant here is the bidirectional mapping between a
//! participant's stable logical id (from space configuration and envelope
//! addressing) and the ephemeral runtime connection id assigned at socket
//! join. An envelope addressed to either form must reach the same live
//! socket; losing that mapping is a silent delivery failure.
//!
//! Grants are cumulative and individually revocable by grant id. Static
//! (configuration-defined) capabilities are never revocable. Identity and
//! granted capabilities persist across reconnect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};

use plaza_core::codec::Frame;
use plaza_core::pattern::CapabilityPattern;
use plaza_core::payloads::StatusPayload;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Unknown participant: {0}")]
    UnknownParticipant(String),
    #[error("Participant already connected: {0}")]
    AlreadyConnected(String),
    #[error("Unknown grant id: {0}")]
    UnknownGrant(String),
}

/// Emitted when a participant's effective capability set changes. The
/// runtime reacts by pushing a fresh snapshot to the live connection
/// rather than participants polling their own state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    CapabilitiesChanged { participant_id: String },
}

/// Handle to a live connection's outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub connection_id: String,
    pub outbound: mpsc::Sender<Frame>,
}

/// One runtime-granted capability set.
#[derive(Debug, Clone, PartialEq)]
pub struct Grant {
    pub grant_id: String,
    pub granted_by: String,
    pub capabilities: Vec<CapabilityPattern>,
}

#[derive(Debug, Clone)]
struct PauseState {
    until: Option<Instant>,
    reason: Option<String>,
}

#[derive(Debug, Default)]
struct ParticipantState {
    static_capabilities: Vec<CapabilityPattern>,
    grants: Vec<Grant>,
    connection: Option<ConnectionHandle>,
    status: Option<StatusPayload>,
    pause: Option<PauseState>,
    messages_routed: u64,
}

#[derive(Default)]
struct RegistryInner {
    participants: HashMap<String, Arc<Mutex<ParticipantState>>>,
    /// Runtime connection id -> logical id.
    runtime_index: HashMap<String, String>,
}

/// Registry of participants in one space. Owned, injected state — no
/// process-wide singletons, so independent spaces and tests coexist.
pub struct ParticipantRegistry {
    inner: RwLock<RegistryInner>,
    events: mpsc::UnboundedSender<RegistryEvent>,
}

impl ParticipantRegistry {
    /// Create a registry and the receiving end of its event channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RegistryEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                inner: RwLock::new(RegistryInner::default()),
                events,
            },
            rx,
        )
    }

    /// Seed a participant's static capability set from configuration.
    /// Creates the participant entry when first referenced.
    pub async fn seed(&self, logical_id: &str, capabilities: Vec<CapabilityPattern>) {
        let state = self.state_or_create(logical_id).await;
        let mut state = state.lock().await;
        state.static_capabilities = capabilities;
    }

    async fn state_or_create(&self, logical_id: &str) -> Arc<Mutex<ParticipantState>> {
        {
            let inner = self.inner.read().await;
            if let Some(state) = inner.participants.get(logical_id) {
                return state.clone();
            }
        }
        let mut inner = self.inner.write().await;
        inner
            .participants
            .entry(logical_id.to_string())
            .or_default()
            .clone()
    }

    async fn state(&self, logical_id: &str) -> Option<Arc<Mutex<ParticipantState>>> {
        self.inner.read().await.participants.get(logical_id).cloned()
    }

    /// Bind a fresh runtime connection id to a logical identity and record
    /// the connection's outbound handle. Fails if the participant already
    /// has a live connection.
    pub async fn attach(
        &self,
        logical_id: &str,
        outbound: mpsc::Sender<Frame>,
    ) -> Result<ConnectionHandle, RegistryError> {
        let state = self.state_or_create(logical_id).await;
        let connection_id = format!("conn-{}", uuid::Uuid::new_v4());
        let handle = ConnectionHandle {
            connection_id: connection_id.clone(),
            outbound,
        };
        {
            let mut state = state.lock().await;
            if state.connection.is_some() {
                return Err(RegistryError::AlreadyConnected(logical_id.to_string()));
            }
            state.connection = Some(handle.clone());
        }
        let mut inner = self.inner.write().await;
        inner.runtime_index.insert(connection_id, logical_id.to_string());
        Ok(handle)
    }

    /// Detach a connection. Identity and granted capabilities persist.
    pub async fn detach(&self, logical_id: &str, connection_id: &str) {
        if let Some(state) = self.state(logical_id).await {
            let mut state = state.lock().await;
            if state
                .connection
                .as_ref()
                .is_some_and(|c| c.connection_id == connection_id)
            {
                state.connection = None;
            }
        }
        self.inner.write().await.runtime_index.remove(connection_id);
    }

    /// Resolve a logical OR runtime id to the logical id and, when live,
    /// the connection handle.
    pub async fn resolve(&self, id: &str) -> Option<(String, Option<ConnectionHandle>)> {
        let logical_id = {
            let inner = self.inner.read().await;
            if inner.participants.contains_key(id) {
                id.to_string()
            } else {
                inner.runtime_index.get(id)?.clone()
            }
        };
        let state = self.state(&logical_id).await?;
        let connection = state.lock().await.connection.clone();
        Some((logical_id, connection))
    }

    /// Logical ids of currently connected participants.
    pub async fn connected_ids(&self) -> Vec<String> {
        let states: Vec<(String, Arc<Mutex<ParticipantState>>)> = {
            let inner = self.inner.read().await;
            inner
                .participants
                .iter()
                .map(|(id, state)| (id.clone(), state.clone()))
                .collect()
        };
        let mut connected = Vec::new();
        for (id, state) in states {
            if state.lock().await.connection.is_some() {
                connected.push(id);
            }
        }
        connected.sort();
        connected
    }

    /// Effective capability set: static patterns first, then grants in
    /// grant order. Order matters for first-match explainability.
    pub async fn effective_capabilities(&self, logical_id: &str) -> Vec<CapabilityPattern> {
        let Some(state) = self.state(logical_id).await else {
            return Vec::new();
        };
        let state = state.lock().await;
        let mut capabilities = state.static_capabilities.clone();
        for grant in &state.grants {
            capabilities.extend(grant.capabilities.iter().cloned());
        }
        capabilities
    }

    /// Append (or replace, for an existing grant id) a runtime grant.
    pub async fn grant(
        &self,
        recipient: &str,
        granted_by: &str,
        capabilities: Vec<CapabilityPattern>,
        grant_id: String,
    ) -> Result<(), RegistryError> {
        for pattern in &capabilities {
            if pattern.is_superuser() {
                tracing::warn!(
                    recipient,
                    granted_by,
                    grant_id = %grant_id,
                    "granting superuser capability (kind \"**\", no payload clause)"
                );
            }
        }
        let state = self.state_or_create(recipient).await;
        {
            let mut state = state.lock().await;
            let grant = Grant {
                grant_id: grant_id.clone(),
                granted_by: granted_by.to_string(),
                capabilities,
            };
            match state.grants.iter_mut().find(|g| g.grant_id == grant_id) {
                Some(existing) => *existing = grant,
                None => state.grants.push(grant),
            }
        }
        tracing::info!(recipient, granted_by, grant_id = %grant_id, "capability grant recorded");
        let _ = self.events.send(RegistryEvent::CapabilitiesChanged {
            participant_id: recipient.to_string(),
        });
        Ok(())
    }

    /// Remove exactly the named grant. Static capabilities are untouched.
    pub async fn revoke(&self, recipient: &str, grant_id: &str) -> Result<(), RegistryError> {
        let state = self
            .state(recipient)
            .await
            .ok_or_else(|| RegistryError::UnknownParticipant(recipient.to_string()))?;
        {
            let mut state = state.lock().await;
            let before = state.grants.len();
            state.grants.retain(|g| g.grant_id != grant_id);
            if state.grants.len() == before {
                return Err(RegistryError::UnknownGrant(grant_id.to_string()));
            }
        }
        tracing::info!(recipient, grant_id, "capability grant revoked");
        let _ = self.events.send(RegistryEvent::CapabilitiesChanged {
            participant_id: recipient.to_string(),
        });
        Ok(())
    }

    /// Record a status report from the participant.
    pub async fn set_status(&self, logical_id: &str, status: StatusPayload) {
        if let Some(state) = self.state(logical_id).await {
            state.lock().await.status = Some(status);
        }
    }

    pub async fn status(&self, logical_id: &str) -> Option<StatusPayload> {
        let state = self.state(logical_id).await?;
        let state = state.lock().await;
        state.status.clone()
    }

    /// Count an envelope routed on behalf of this participant.
    pub async fn record_message(&self, logical_id: &str) {
        if let Some(state) = self.state(logical_id).await {
            state.lock().await.messages_routed += 1;
        }
    }

    pub async fn messages_routed(&self, logical_id: &str) -> u64 {
        match self.state(logical_id).await {
            Some(state) => state.lock().await.messages_routed,
            None => 0,
        }
    }

    /// Pause a participant, optionally for a bounded duration.
    pub async fn pause(&self, logical_id: &str, timeout: Option<Duration>, reason: Option<String>) {
        let state = self.state_or_create(logical_id).await;
        state.lock().await.pause = Some(PauseState {
            until: timeout.map(|t| Instant::now() + t),
            reason,
        });
    }

    pub async fn resume(&self, logical_id: &str) {
        if let Some(state) = self.state(logical_id).await {
            state.lock().await.pause = None;
        }
    }

    /// Current pause state: `Some(reason)` while paused, carrying whatever
    /// advisory reason the pausing envelope supplied. Expired pauses are
    /// cleared lazily here.
    pub async fn paused(&self, logical_id: &str) -> Option<Option<String>> {
        let state = self.state(logical_id).await?;
        let mut state = state.lock().await;
        let expired = state
            .pause
            .as_ref()
            .is_some_and(|pause| pause.until.is_some_and(|until| until <= Instant::now()));
        if expired {
            state.pause = None;
        }
        state.pause.as_ref().map(|pause| pause.reason.clone())
    }

    pub async fn is_paused(&self, logical_id: &str) -> bool {
        self.paused(logical_id).await.is_some()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_outbound() -> (mpsc::Sender<Frame>, mpsc::Receiver<Frame>) {
        mpsc::channel(16)
    }

    #[tokio::test]
    async fn test_attach_assigns_runtime_id() {
        let (registry, _rx) = ParticipantRegistry::new();
        let (tx, _out) = make_outbound();
        let handle = registry.attach("assistant", tx).await.unwrap();
        assert!(handle.connection_id.starts_with("conn-"));
    }

    #[tokio::test]
    async fn test_resolve_by_logical_and_runtime_id() {
        let (registry, _rx) = ParticipantRegistry::new();
        let (tx, _out) = make_outbound();
        let handle = registry.attach("assistant", tx).await.unwrap();

        let (logical, conn) = registry.resolve("assistant").await.unwrap();
        assert_eq!(logical, "assistant");
        assert_eq!(
            conn.unwrap().connection_id,
            handle.connection_id,
            "logical id must reach the live socket"
        );

        let (logical, conn) = registry.resolve(&handle.connection_id).await.unwrap();
        assert_eq!(logical, "assistant");
        assert!(conn.is_some());
    }

    #[tokio::test]
    async fn test_second_connection_rejected() {
        let (registry, _rx) = ParticipantRegistry::new();
        let (tx1, _out1) = make_outbound();
        let (tx2, _out2) = make_outbound();
        registry.attach("assistant", tx1).await.unwrap();
        let result = registry.attach("assistant", tx2).await;
        assert!(matches!(result, Err(RegistryError::AlreadyConnected(_))));
    }

    #[tokio::test]
    async fn test_detach_keeps_identity_and_grants() {
        let (registry, _rx) = ParticipantRegistry::new();
        let (tx, _out) = make_outbound();
        let handle = registry.attach("assistant", tx).await.unwrap();
        registry
            .grant(
                "assistant",
                "operator",
                vec![CapabilityPattern::for_kind("mcp.*")],
                "g1".to_string(),
            )
            .await
            .unwrap();

        registry.detach("assistant", &handle.connection_id).await;

        let (_, conn) = registry.resolve("assistant").await.unwrap();
        assert!(conn.is_none());
        assert!(registry.resolve(&handle.connection_id).await.is_none());
        assert_eq!(registry.effective_capabilities("assistant").await.len(), 1);
    }

    #[tokio::test]
    async fn test_effective_capabilities_static_then_grants() {
        let (registry, _rx) = ParticipantRegistry::new();
        registry
            .seed("assistant", vec![CapabilityPattern::for_kind("chat")])
            .await;
        registry
            .grant(
                "assistant",
                "operator",
                vec![CapabilityPattern::for_kind("mcp.*")],
                "g1".to_string(),
            )
            .await
            .unwrap();

        let capabilities = registry.effective_capabilities("assistant").await;
        assert_eq!(capabilities.len(), 2);
        assert!(capabilities[0].matches("chat", &json!({})));
        assert!(capabilities[1].matches("mcp.request", &json!({})));
    }

    #[tokio::test]
    async fn test_grant_revoke_independence() {
        let (registry, _rx) = ParticipantRegistry::new();
        registry
            .grant(
                "assistant",
                "operator",
                vec![CapabilityPattern::for_kind("stream.*")],
                "g1".to_string(),
            )
            .await
            .unwrap();
        registry
            .grant(
                "assistant",
                "operator",
                vec![CapabilityPattern::for_kind("mcp.*")],
                "g2".to_string(),
            )
            .await
            .unwrap();

        registry.revoke("assistant", "g1").await.unwrap();

        let capabilities = registry.effective_capabilities("assistant").await;
        assert_eq!(capabilities.len(), 1);
        assert!(capabilities[0].matches("mcp.request", &json!({})));
        assert!(!capabilities
            .iter()
            .any(|c| c.matches("stream.request", &json!({}))));
    }

    #[tokio::test]
    async fn test_revoke_unknown_grant() {
        let (registry, _rx) = ParticipantRegistry::new();
        registry.seed("assistant", Vec::new()).await;
        let result = registry.revoke("assistant", "nope").await;
        assert!(matches!(result, Err(RegistryError::UnknownGrant(_))));
    }

    #[tokio::test]
    async fn test_grant_emits_capabilities_changed() {
        let (registry, mut rx) = ParticipantRegistry::new();
        registry
            .grant(
                "assistant",
                "operator",
                vec![CapabilityPattern::for_kind("chat")],
                "g1".to_string(),
            )
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            RegistryEvent::CapabilitiesChanged {
                participant_id: "assistant".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_regrant_same_id_replaces() {
        let (registry, _rx) = ParticipantRegistry::new();
        registry
            .grant(
                "assistant",
                "operator",
                vec![CapabilityPattern::for_kind("chat")],
                "g1".to_string(),
            )
            .await
            .unwrap();
        registry
            .grant(
                "assistant",
                "operator",
                vec![CapabilityPattern::for_kind("mcp.*")],
                "g1".to_string(),
            )
            .await
            .unwrap();

        let capabilities = registry.effective_capabilities("assistant").await;
        assert_eq!(capabilities.len(), 1);
        assert!(capabilities[0].matches("mcp.request", &json!({})));
    }

    #[tokio::test]
    async fn test_pause_and_expiry() {
        let (registry, _rx) = ParticipantRegistry::new();
        registry.seed("assistant", Vec::new()).await;

        registry.pause("assistant", None, Some("review".to_string())).await;
        assert!(registry.is_paused("assistant").await);
        assert_eq!(
            registry.paused("assistant").await,
            Some(Some("review".to_string()))
        );

        registry.resume("assistant").await;
        assert!(!registry.is_paused("assistant").await);

        registry
            .pause("assistant", Some(Duration::from_millis(10)), None)
            .await;
        assert!(registry.is_paused("assistant").await);
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(!registry.is_paused("assistant").await, "pause should expire");
    }

    #[tokio::test]
    async fn test_connected_ids_sorted() {
        let (registry, _rx) = ParticipantRegistry::new();
        let (tx1, _o1) = make_outbound();
        let (tx2, _o2) = make_outbound();
        registry.attach("zeta", tx1).await.unwrap();
        registry.attach("alpha", tx2).await.unwrap();
        registry.seed("offline", Vec::new()).await;
        assert_eq!(registry.connected_ids().await, vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn test_message_counter() {
        let (registry, _rx) = ParticipantRegistry::new();
        registry.seed("assistant", Vec::new()).await;
        registry.record_message("assistant").await;
        registry.record_message("assistant").await;
        assert_eq!(registry.messages_routed("assistant").await, 2);
    }
}
