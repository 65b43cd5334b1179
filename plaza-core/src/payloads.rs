//! Typed payloads for the administrative and gateway-originated kinds.
//!
//! Application kinds keep free-form JSON payloads; only the kinds the
//! gateway itself consumes or produces get typed shapes here.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::pattern::CapabilityPattern;

/// `space.join` — first envelope on every connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinPayload {
    pub participant_id: String,
    pub token: String,
}

/// `system.welcome` — sent to a participant after a successful join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WelcomePayload {
    pub participant_id: String,
    /// Runtime connection id assigned to this socket.
    pub connection_id: String,
    /// Effective capability set (static plus granted) at join time.
    pub capabilities: Vec<CapabilityPattern>,
    /// Logical ids of the currently connected participants.
    pub participants: Vec<String>,
    /// Streams currently open, so a late joiner can attribute raw frames
    /// it was not around to see announced.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub streams: Vec<StreamOpenPayload>,
}

/// `system.capabilities` — refreshed snapshot after a grant or revoke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySnapshotPayload {
    pub capabilities: Vec<CapabilityPattern>,
}

/// `system.presence` — broadcast on join and leave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresencePayload {
    pub participant_id: String,
    pub event: PresenceEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceEvent {
    Join,
    Leave,
}

/// `capability.grant` — add a runtime capability set to a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrantPayload {
    /// Logical id of the recipient.
    pub recipient: String,
    pub capabilities: Vec<CapabilityPattern>,
    /// Client-chosen id for later revocation; assigned by the gateway when
    /// omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grant_id: Option<String>,
}

/// `capability.grant-ack` — recipient confirms it saw the new snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrantAckPayload {
    pub grant_id: String,
}

/// `capability.revoke` — remove exactly one named grant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevokePayload {
    pub recipient: String,
    pub grant_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamDirection {
    Upload,
    Download,
    Bidirectional,
}

/// `stream.request` — ask the gateway to negotiate a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRequestPayload {
    pub direction: StreamDirection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_size_bytes: Option<u64>,
}

/// `stream.open` — gateway broadcast announcing a negotiated stream.
///
/// Carries everything a late joiner needs to attribute raw frames: the
/// server-assigned id, the owner, and the request's description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamOpenPayload {
    pub stream_id: String,
    pub owner: String,
    pub direction: StreamDirection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

/// `stream.close` — either peer ends the stream; reason is advisory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamClosePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `participant.pause` — suspend a participant's non-administrative traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PausePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `participant.status` — counters reported by a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    pub messages_in_context: u64,
    pub status: String,
}

/// Decode a typed payload out of an envelope's JSON payload.
pub fn decode<T: for<'de> Deserialize<'de>>(payload: &JsonValue) -> Result<T, PayloadError> {
    serde_json::from_value(payload.clone()).map_err(PayloadError::Decode)
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("payload decode error: {0}")]
    Decode(#[source] serde_json::Error),
}
