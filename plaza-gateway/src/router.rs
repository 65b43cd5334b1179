//! Envelope router: the top-level dispatcher.
//!
//! For every inbound envelope: stamp `from`, gate on the sender's
//! capability set, resolve recipients, fan out, then run administrative
//! side effects. Raw stream frames take a separate fast path that never
//! waits behind envelope processing.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value as JsonValue;

use plaza_core::codec::Frame;
use plaza_core::envelope::{kinds, AdminKind, Envelope, ErrorCode, ErrorPayload};
use plaza_core::pattern::first_match;
use plaza_core::payloads::{
    self, CapabilitySnapshotPayload, GrantPayload, PausePayload, PresenceEvent, PresencePayload,
    RevokePayload, StatusPayload, StreamClosePayload, StreamOpenPayload, StreamRequestPayload,
};

use crate::cache::DecisionCache;
use crate::correlation::{CorrelationFailure, CorrelationTracker, FailureReason};
use crate::registry::ParticipantRegistry;
use crate::streams::StreamManager;

pub struct EnvelopeRouter {
    registry: Arc<ParticipantRegistry>,
    streams: Arc<StreamManager>,
    correlations: Arc<CorrelationTracker>,
    cache: DecisionCache,
}

impl EnvelopeRouter {
    pub fn new(
        registry: Arc<ParticipantRegistry>,
        streams: Arc<StreamManager>,
        correlations: Arc<CorrelationTracker>,
        cache: DecisionCache,
    ) -> Self {
        Self {
            registry,
            streams,
            correlations,
            cache,
        }
    }

    /// Route one envelope from an authenticated sender.
    pub async fn route(&self, mut envelope: Envelope, sender_id: &str) {
        // The gateway is the sole writer of `from`.
        envelope.from = sender_id.to_string();

        if !pause_exempt(&envelope.kind) {
            if let Some(reason) = self.registry.paused(sender_id).await {
                let message = match reason {
                    Some(reason) => format!("participant is paused: {reason}"),
                    None => "participant is paused".to_string(),
                };
                self.send_error(
                    sender_id,
                    ErrorPayload::new(ErrorCode::ParticipantPaused, message)
                        .with_attempted_kind(&envelope.kind),
                    Some(&envelope.id),
                )
                .await;
                return;
            }
        }

        if !gate_exempt(&envelope.kind)
            && !self.authorize(sender_id, &envelope.kind, &envelope.payload).await
        {
            tracing::warn!(
                sender = sender_id,
                kind = %envelope.kind,
                envelope_id = %envelope.id,
                "capability violation"
            );
            self.send_error(
                sender_id,
                ErrorPayload::new(
                    ErrorCode::CapabilityViolation,
                    format!("no capability authorizes kind '{}'", envelope.kind),
                )
                .with_attempted_kind(&envelope.kind),
                Some(&envelope.id),
            )
            .await;
            return;
        }

        // Resolve recipients: broadcast to everyone else, or the explicit
        // `to` list. Unresolvable recipients are skipped, not fatal.
        let mut delivered_to = Vec::new();
        let mut undeliverable = Vec::new();
        if envelope.is_broadcast() {
            for id in self.registry.connected_ids().await {
                if id != sender_id {
                    delivered_to.push(id);
                }
            }
        } else {
            for id in &envelope.to {
                match self.registry.resolve(id).await {
                    Some((logical_id, Some(_))) => delivered_to.push(logical_id),
                    _ => undeliverable.push(id.clone()),
                }
            }
        }

        for recipient in &delivered_to {
            self.deliver(recipient, envelope.clone()).await;
        }

        if !undeliverable.is_empty() {
            // At most one aggregated warning per envelope.
            self.send_error(
                sender_id,
                ErrorPayload::new(
                    ErrorCode::UnknownRecipient,
                    format!("undeliverable recipients: {}", undeliverable.join(", ")),
                )
                .with_attempted_kind(&envelope.kind),
                Some(&envelope.id),
            )
            .await;
        }

        self.registry.record_message(sender_id).await;

        // Answers first, then new expectations.
        if !envelope.correlation_id.is_empty() {
            let completed = self
                .correlations
                .resolve(&envelope.correlation_id, sender_id)
                .await;
            for entry in completed {
                tracing::debug!(
                    request_id = %entry.request_id,
                    requester = %entry.requester_id,
                    "correlation fully resolved"
                );
            }
        }
        if envelope.kind == kinds::MCP_REQUEST && !delivered_to.is_empty() {
            self.correlations
                .track(&envelope.id, sender_id, &envelope.kind, delivered_to.clone())
                .await;
        }

        if let Some(admin) = AdminKind::parse(&envelope.kind) {
            self.handle_admin(admin, &envelope, sender_id).await;
        }
    }

    /// Fast path for raw stream frames. Authorization happened at
    /// `stream.request` time; admission is owner + Open state only.
    pub async fn route_stream_frame(&self, stream_id: &str, payload: Bytes, sender_id: &str) {
        if let Err(err) = self.streams.admit_frame(stream_id, sender_id).await {
            tracing::debug!(stream_id, sender = sender_id, %err, "stream frame rejected");
            self.send_error(
                sender_id,
                ErrorPayload::new(ErrorCode::StreamProtocolViolation, err.to_string()),
                None,
            )
            .await;
            return;
        }

        for id in self.registry.connected_ids().await {
            if id == sender_id {
                continue;
            }
            let Some((_, Some(connection))) = self.registry.resolve(&id).await else {
                continue;
            };
            let frame = Frame::Stream {
                stream_id: stream_id.to_string(),
                payload: payload.clone(),
            };
            // Streams are lossy by design: a saturated recipient drops
            // frames instead of buffering without bound.
            if connection.outbound.try_send(frame).is_err() {
                tracing::warn!(
                    stream_id,
                    recipient = %id,
                    "outbound buffer saturated, dropping stream frame"
                );
            }
        }
    }

    /// Deliver a gateway-originated envelope to every connected participant.
    pub async fn broadcast_from_gateway(&self, envelope: Envelope) {
        for id in self.registry.connected_ids().await {
            self.deliver(&id, envelope.clone()).await;
        }
    }

    /// Push a fresh capability snapshot to a participant's live connection.
    /// Driven by `RegistryEvent::CapabilitiesChanged`.
    pub async fn push_capability_snapshot(&self, participant_id: &str) {
        self.cache.invalidate(participant_id).await;
        let capabilities = self.registry.effective_capabilities(participant_id).await;
        let payload = match serde_json::to_value(CapabilitySnapshotPayload { capabilities }) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(%err, "capability snapshot serialization failed");
                return;
            }
        };
        let envelope =
            Envelope::from_gateway(kinds::SYSTEM_CAPABILITIES, payload).to([participant_id]);
        self.deliver(participant_id, envelope).await;
    }

    /// A participant's connection went away: close their streams, fail
    /// correlations waiting on them, and announce the departure.
    pub async fn handle_disconnect(&self, participant_id: &str) {
        for stream_id in self.streams.close_owned_by(participant_id).await {
            let payload = serde_json::to_value(StreamClosePayload {
                stream_id: Some(stream_id),
                reason: Some("owner disconnected".to_string()),
            })
            .unwrap_or(JsonValue::Null);
            self.broadcast_from_gateway(Envelope::from_gateway(
                AdminKind::StreamClose.as_str(),
                payload,
            ))
            .await;
        }

        let failures = self.correlations.evict_participant(participant_id).await;
        self.notify_failures(failures).await;

        let payload = serde_json::to_value(PresencePayload {
            participant_id: participant_id.to_string(),
            event: PresenceEvent::Leave,
        })
        .unwrap_or(JsonValue::Null);
        self.broadcast_from_gateway(Envelope::from_gateway(kinds::SYSTEM_PRESENCE, payload))
            .await;
    }

    /// Report correlation failures (timeout or responder disconnect) to
    /// the requesters that are still waiting.
    pub async fn notify_failures(&self, failures: Vec<CorrelationFailure>) {
        for failure in failures {
            let (code, message) = match &failure.reason {
                FailureReason::Timeout => (
                    ErrorCode::CorrelationTimeout,
                    format!("no response to {} within the timeout window", failure.kind),
                ),
                FailureReason::ResponderDisconnected { responder_id } => (
                    ErrorCode::ParticipantDisconnected,
                    format!("{responder_id} disconnected before answering {}", failure.kind),
                ),
            };
            self.send_error(
                &failure.requester_id,
                ErrorPayload::new(code, message).with_attempted_kind(&failure.kind),
                Some(&failure.request_id),
            )
            .await;
        }
    }

    async fn authorize(&self, sender_id: &str, kind: &str, payload: &JsonValue) -> bool {
        if let Some(cached) = self.cache.get(sender_id, kind, payload).await {
            return cached;
        }
        let capabilities = self.registry.effective_capabilities(sender_id).await;
        let decision = first_match(&capabilities, kind, payload);
        if let Some(index) = decision {
            tracing::debug!(sender = sender_id, kind, pattern_index = index, "authorized");
        }
        let allowed = decision.is_some();
        self.cache.insert(sender_id, kind, payload, allowed).await;
        allowed
    }

    async fn deliver(&self, recipient: &str, envelope: Envelope) {
        let Some((_, Some(connection))) = self.registry.resolve(recipient).await else {
            return;
        };
        // Awaited send on the per-connection queue keeps per-sender FIFO
        // order; the channel only closes when the connection is going away.
        if connection.outbound.send(Frame::Envelope(envelope)).await.is_err() {
            tracing::debug!(recipient, "outbound channel closed during delivery");
        }
    }

    async fn send_error(&self, recipient: &str, payload: ErrorPayload, correlates: Option<&str>) {
        self.deliver(recipient, payload.into_envelope(recipient, correlates))
            .await;
    }

    async fn handle_admin(&self, admin: AdminKind, envelope: &Envelope, sender_id: &str) {
        match admin {
            AdminKind::CapabilityGrant => {
                let grant: GrantPayload = match payloads::decode(&envelope.payload) {
                    Ok(grant) => grant,
                    Err(err) => {
                        self.reject_malformed(sender_id, envelope, &err.to_string()).await;
                        return;
                    }
                };
                let grant_id = grant
                    .grant_id
                    .unwrap_or_else(|| format!("grant-{}", uuid::Uuid::new_v4()));
                let recipient = grant.recipient.clone();
                if self
                    .registry
                    .grant(&recipient, sender_id, grant.capabilities, grant_id)
                    .await
                    .is_ok()
                {
                    // The recipient is expected to acknowledge the grant.
                    self.correlations
                        .track(&envelope.id, sender_id, &envelope.kind, [recipient])
                        .await;
                }
            }
            AdminKind::CapabilityRevoke => {
                let revoke: RevokePayload = match payloads::decode(&envelope.payload) {
                    Ok(revoke) => revoke,
                    Err(err) => {
                        self.reject_malformed(sender_id, envelope, &err.to_string()).await;
                        return;
                    }
                };
                if let Err(err) = self.registry.revoke(&revoke.recipient, &revoke.grant_id).await {
                    self.send_error(
                        sender_id,
                        ErrorPayload::new(ErrorCode::MalformedEnvelope, err.to_string())
                            .with_attempted_kind(&envelope.kind),
                        Some(&envelope.id),
                    )
                    .await;
                }
            }
            AdminKind::StreamRequest => {
                let request: StreamRequestPayload = match payloads::decode(&envelope.payload) {
                    Ok(request) => request,
                    Err(err) => {
                        self.reject_malformed(sender_id, envelope, &err.to_string()).await;
                        return;
                    }
                };
                let stream_id = self.streams.request(sender_id, &request).await;
                if let Err(err) = self.streams.open(&stream_id).await {
                    tracing::error!(stream_id, %err, "freshly requested stream failed to open");
                    return;
                }
                // Broadcast carries everything a late joiner needs to
                // attribute raw frames to this stream.
                let payload = serde_json::to_value(StreamOpenPayload {
                    stream_id,
                    owner: sender_id.to_string(),
                    direction: request.direction,
                    description: request.description,
                    encoding: None,
                })
                .unwrap_or(JsonValue::Null);
                let open = Envelope::from_gateway(AdminKind::StreamOpen.as_str(), payload)
                    .correlating([envelope.id.clone()]);
                self.broadcast_from_gateway(open).await;
            }
            AdminKind::StreamClose => {
                let close: StreamClosePayload = match payloads::decode(&envelope.payload) {
                    Ok(close) => close,
                    Err(err) => {
                        self.reject_malformed(sender_id, envelope, &err.to_string()).await;
                        return;
                    }
                };
                let Some(stream_id) = close.stream_id else {
                    self.reject_malformed(sender_id, envelope, "stream.close without stream_id")
                        .await;
                    return;
                };
                if let Err(err) = self.streams.close(&stream_id).await {
                    self.send_error(
                        sender_id,
                        ErrorPayload::new(ErrorCode::StreamProtocolViolation, err.to_string())
                            .with_attempted_kind(&envelope.kind),
                        Some(&envelope.id),
                    )
                    .await;
                }
            }
            AdminKind::ParticipantPause => {
                let pause: PausePayload = payloads::decode(&envelope.payload).unwrap_or(
                    PausePayload {
                        timeout_seconds: None,
                        reason: None,
                    },
                );
                let timeout = pause
                    .timeout_seconds
                    .map(std::time::Duration::from_secs);
                for target in &envelope.to {
                    if let Some((logical_id, _)) = self.registry.resolve(target).await {
                        self.registry
                            .pause(&logical_id, timeout, pause.reason.clone())
                            .await;
                    }
                }
            }
            AdminKind::ParticipantResume => {
                for target in &envelope.to {
                    if let Some((logical_id, _)) = self.registry.resolve(target).await {
                        self.registry.resume(&logical_id).await;
                    }
                }
            }
            AdminKind::ParticipantStatus => {
                if let Ok(status) = payloads::decode::<StatusPayload>(&envelope.payload) {
                    self.registry.set_status(sender_id, status).await;
                }
            }
            AdminKind::StreamOpen => {
                // Server-assigned streams only; a client-sent stream.open
                // carries no side effect.
                tracing::warn!(sender = sender_id, "ignoring client-sent stream.open");
            }
            AdminKind::CapabilityGrantAck | AdminKind::ParticipantRequestStatus => {}
        }
    }

    async fn reject_malformed(&self, sender_id: &str, envelope: &Envelope, reason: &str) {
        tracing::warn!(
            sender = sender_id,
            kind = %envelope.kind,
            reason,
            "malformed administrative payload"
        );
        self.send_error(
            sender_id,
            ErrorPayload::new(ErrorCode::MalformedEnvelope, reason)
                .with_attempted_kind(&envelope.kind),
            Some(&envelope.id),
        )
        .await;
    }
}

/// Kinds a paused participant may still send: acknowledgements and status
/// reports keep flowing so pause stays observable.
fn pause_exempt(kind: &str) -> bool {
    matches!(
        AdminKind::parse(kind),
        Some(AdminKind::CapabilityGrantAck | AdminKind::ParticipantStatus)
    )
}

/// Kinds that bypass the capability gate. A grant recipient usually holds
/// no `capability.*` pattern of its own (that is exactly why it is being
/// granted things), so the acknowledgement that completes the grant
/// exchange must not require one.
fn gate_exempt(kind: &str) -> bool {
    matches!(AdminKind::parse(kind), Some(AdminKind::CapabilityGrantAck))
}
