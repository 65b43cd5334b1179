#![cfg_attr(test, allow(clippy::panic))]
// plaza-core
//! Wire types and pure logic for the Plaza protocol: envelopes, capability
//! patterns, the wire codec, and space configuration.

pub mod codec;
pub mod config;
pub mod envelope;
pub mod pattern;
pub mod payloads;

pub use codec::{Frame, WireCodec, MAX_LINE_LENGTH};
pub use config::{ConfigError, ParticipantConfig, SpaceConfig};
pub use envelope::{kinds, AdminKind, Envelope, ErrorCode, ErrorPayload, GATEWAY_ID, PROTOCOL_VERSION};
pub use pattern::{first_match, CapabilityPattern};
pub use payloads::{
    CapabilitySnapshotPayload, GrantAckPayload, GrantPayload, JoinPayload, PausePayload,
    PayloadError, PresenceEvent, PresencePayload, RevokePayload, StatusPayload,
    StreamClosePayload, StreamDirection, StreamOpenPayload, StreamRequestPayload, WelcomePayload,
};
