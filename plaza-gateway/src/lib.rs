// plaza-gateway
//! The Plaza gateway: accepts participant connections, authenticates
//! joins against space configuration, and routes envelopes and raw
//! stream frames between participants under capability checks.

pub mod cache;
pub mod connection;
pub mod correlation;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod streams;

pub use cache::DecisionCache;
pub use connection::ConnectionSettings;
pub use correlation::{CorrelationFailure, CorrelationTracker, FailureReason};
pub use registry::{ConnectionHandle, Grant, ParticipantRegistry, RegistryError, RegistryEvent};
pub use router::EnvelopeRouter;
pub use runtime::{GatewayConfig, GatewayError, GatewayRuntime, ListenerHandle};
pub use streams::{StreamEntry, StreamError, StreamManager, StreamState};
