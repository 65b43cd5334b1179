//! Core envelope types for the Plaza protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Protocol version tag carried in every envelope.
pub const PROTOCOL_VERSION: &str = "plaza/v1";

/// Reserved identity for gateway-originated envelopes. No participant may
/// join under this id.
pub const GATEWAY_ID: &str = "system:gateway";

/// Well-known envelope kinds that are not administrative (see [`AdminKind`]).
pub mod kinds {
    /// First envelope on a connection: `{participant_id, token}`.
    pub const SPACE_JOIN: &str = "space.join";
    /// Gateway → joiner: identity, effective capabilities, current roster.
    pub const SYSTEM_WELCOME: &str = "system.welcome";
    /// Gateway → participant: refreshed capability snapshot after grant/revoke.
    pub const SYSTEM_CAPABILITIES: &str = "system.capabilities";
    /// Gateway broadcast on join/leave.
    pub const SYSTEM_PRESENCE: &str = "system.presence";
    /// Gateway → sender: error report (never silent denial).
    pub const SYSTEM_ERROR: &str = "system.error";
    /// MCP request/response/proposal application kinds.
    pub const MCP_REQUEST: &str = "mcp.request";
    pub const MCP_RESPONSE: &str = "mcp.response";
    pub const MCP_PROPOSAL: &str = "mcp.proposal";
    /// Plain chat message.
    pub const CHAT: &str = "chat";
}

/// A routed message. The gateway is the sole writer of `from`; a
/// client-supplied value is overwritten on ingress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version tag, e.g. `"plaza/v1"`.
    pub protocol: String,
    /// Unique envelope id.
    pub id: String,
    /// Creation timestamp.
    pub ts: DateTime<Utc>,
    /// Sender identity, gateway-assigned.
    #[serde(default)]
    pub from: String,
    /// Recipient identities. Absent or empty means broadcast to all other
    /// participants.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<String>,
    /// Dot-namespaced kind, e.g. `mcp.request`, `chat`, `stream.open`.
    pub kind: String,
    /// Kind-specific payload.
    #[serde(default)]
    pub payload: JsonValue,
    /// Envelope ids this envelope answers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub correlation_id: Vec<String>,
    /// Opaque grouping key (e.g. a reasoning session).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl Envelope {
    /// Create an envelope with a fresh id and the current timestamp.
    /// `from` is left empty; the gateway stamps it on ingress.
    pub fn new(kind: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            protocol: PROTOCOL_VERSION.to_string(),
            id: Uuid::new_v4().to_string(),
            ts: Utc::now(),
            from: String::new(),
            to: Vec::new(),
            kind: kind.into(),
            payload,
            correlation_id: Vec::new(),
            context: None,
        }
    }

    /// Create a gateway-originated envelope (`from = system:gateway`).
    pub fn from_gateway(kind: impl Into<String>, payload: JsonValue) -> Self {
        let mut envelope = Self::new(kind, payload);
        envelope.from = GATEWAY_ID.to_string();
        envelope
    }

    /// Address the envelope to explicit recipients.
    pub fn to(mut self, recipients: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.to = recipients.into_iter().map(Into::into).collect();
        self
    }

    /// Record the envelope ids this envelope answers.
    pub fn correlating(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.correlation_id = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Set the grouping context.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// True when the envelope has no explicit recipients.
    pub fn is_broadcast(&self) -> bool {
        self.to.is_empty()
    }
}

/// Closed enumeration of the administrative kinds the gateway itself
/// consumes. Application kinds stay as open strings and are routed
/// untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminKind {
    CapabilityGrant,
    CapabilityGrantAck,
    CapabilityRevoke,
    StreamRequest,
    StreamOpen,
    StreamClose,
    ParticipantPause,
    ParticipantResume,
    ParticipantRequestStatus,
    ParticipantStatus,
}

impl AdminKind {
    /// Parse a kind string; `None` for application-defined kinds.
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "capability.grant" => Some(Self::CapabilityGrant),
            "capability.grant-ack" => Some(Self::CapabilityGrantAck),
            "capability.revoke" => Some(Self::CapabilityRevoke),
            "stream.request" => Some(Self::StreamRequest),
            "stream.open" => Some(Self::StreamOpen),
            "stream.close" => Some(Self::StreamClose),
            "participant.pause" => Some(Self::ParticipantPause),
            "participant.resume" => Some(Self::ParticipantResume),
            "participant.request-status" => Some(Self::ParticipantRequestStatus),
            "participant.status" => Some(Self::ParticipantStatus),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CapabilityGrant => "capability.grant",
            Self::CapabilityGrantAck => "capability.grant-ack",
            Self::CapabilityRevoke => "capability.revoke",
            Self::StreamRequest => "stream.request",
            Self::StreamOpen => "stream.open",
            Self::StreamClose => "stream.close",
            Self::ParticipantPause => "participant.pause",
            Self::ParticipantResume => "participant.resume",
            Self::ParticipantRequestStatus => "participant.request-status",
            Self::ParticipantStatus => "participant.status",
        }
    }
}

/// Error codes carried in `system.error` payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    CapabilityViolation,
    UnknownRecipient,
    StreamProtocolViolation,
    CorrelationTimeout,
    ParticipantDisconnected,
    ParticipantPaused,
    MalformedEnvelope,
    JoinRejected,
}

/// Payload of a `system.error` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: ErrorCode,
    pub message: String,
    /// The kind the sender attempted, when relevant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempted_kind: Option<String>,
}

impl ErrorPayload {
    pub fn new(error: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error,
            message: message.into(),
            attempted_kind: None,
        }
    }

    pub fn with_attempted_kind(mut self, kind: impl Into<String>) -> Self {
        self.attempted_kind = Some(kind.into());
        self
    }

    /// Build the `system.error` envelope for this payload, addressed to
    /// `recipient` and correlated to the offending envelope when known.
    pub fn into_envelope(self, recipient: &str, correlates: Option<&str>) -> Envelope {
        let payload = serde_json::to_value(&self).unwrap_or(JsonValue::Null);
        let mut envelope = Envelope::from_gateway(kinds::SYSTEM_ERROR, payload).to([recipient]);
        if let Some(id) = correlates {
            envelope.correlation_id = vec![id.to_string()];
        }
        envelope
    }
}
