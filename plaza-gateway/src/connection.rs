//! Per-connection task: join handshake, outbound writer, read loop.
//!
//! Each accepted socket gets one of these. The first envelope must be a
//! `space.join`; everything after authentication flows through the
//! router. The connection owns a bounded outbound queue so one slow
//! reader cannot stall the rest of the space.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use plaza_core::codec::{Frame, WireCodec};
use plaza_core::config::SpaceConfig;
use plaza_core::envelope::{kinds, Envelope, ErrorCode, ErrorPayload, GATEWAY_ID};
use plaza_core::payloads::{
    self, JoinPayload, PresenceEvent, PresencePayload, StreamOpenPayload, WelcomePayload,
};

use crate::registry::ParticipantRegistry;
use crate::router::EnvelopeRouter;
use crate::streams::StreamManager;

/// How long a fresh connection gets to present its `space.join`.
const JOIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Window over which malformed frames are counted toward the threshold.
const MALFORMED_WINDOW: Duration = Duration::from_secs(10);

/// Tunables threaded down from the runtime.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub outbound_buffer: usize,
    pub max_line_length: usize,
    /// Malformed frames tolerated within [`MALFORMED_WINDOW`] before teardown.
    pub malformed_rate_threshold: u32,
}

pub(crate) struct ConnectionContext {
    pub registry: Arc<ParticipantRegistry>,
    pub router: Arc<EnvelopeRouter>,
    pub streams: Arc<StreamManager>,
    pub space: Arc<SpaceConfig>,
    pub settings: ConnectionSettings,
}

/// Drive one socket for its whole lifetime. Returns when the peer hangs
/// up, fails the handshake, or exceeds the malformed-frame threshold.
pub(crate) async fn serve_connection<S>(stream: S, ctx: Arc<ConnectionContext>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut framed = Framed::new(
        stream,
        WireCodec::with_max_line_length(ctx.settings.max_line_length),
    );

    let participant_id = match handshake(&mut framed, &ctx).await {
        Some(id) => id,
        None => return,
    };

    let (outbound_tx, mut outbound_rx) = mpsc::channel(ctx.settings.outbound_buffer);
    let handle = match ctx.registry.attach(&participant_id, outbound_tx).await {
        Ok(handle) => handle,
        Err(err) => {
            let _ = framed
                .send(Frame::Envelope(
                    ErrorPayload::new(ErrorCode::JoinRejected, err.to_string())
                        .into_envelope(&participant_id, None),
                ))
                .await;
            return;
        }
    };
    let connection_id = handle.connection_id.clone();
    tracing::info!(
        participant = %participant_id,
        connection = %connection_id,
        "participant joined"
    );

    let (mut sink, mut frames) = framed.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(err) = sink.send(frame).await {
                tracing::debug!(%err, "outbound write failed, stopping writer");
                break;
            }
        }
    });

    send_welcome(&ctx, &participant_id, &connection_id).await;
    announce_presence(&ctx, &participant_id, PresenceEvent::Join).await;

    // Envelopes route on their own task so a recipient with a full
    // outbound queue stalls only envelope processing, never the read
    // loop. Raw stream frames stay on the fast path below.
    let (route_tx, mut route_rx) =
        mpsc::channel::<Envelope>(ctx.settings.outbound_buffer);
    let routing = {
        let ctx = ctx.clone();
        let participant_id = participant_id.clone();
        tokio::spawn(async move {
            while let Some(envelope) = route_rx.recv().await {
                ctx.router.route(envelope, &participant_id).await;
            }
        })
    };

    let mut malformed_at: VecDeque<Instant> = VecDeque::new();
    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(participant = %participant_id, %err, "read error");
                break;
            }
        };
        match frame {
            Frame::Envelope(envelope) => {
                if envelope.kind == kinds::SPACE_JOIN {
                    tracing::warn!(participant = %participant_id, "duplicate space.join ignored");
                    continue;
                }
                if route_tx.send(envelope).await.is_err() {
                    break;
                }
            }
            Frame::Stream { stream_id, payload } => {
                ctx.router
                    .route_stream_frame(&stream_id, payload, &participant_id)
                    .await;
            }
            Frame::Malformed { reason } => {
                let now = Instant::now();
                malformed_at.push_back(now);
                while malformed_at
                    .front()
                    .is_some_and(|at| now.duration_since(*at) > MALFORMED_WINDOW)
                {
                    malformed_at.pop_front();
                }
                tracing::warn!(
                    participant = %participant_id,
                    recent = malformed_at.len(),
                    reason = %reason,
                    "malformed frame"
                );
                deliver_to_self(
                    &ctx,
                    &participant_id,
                    ErrorPayload::new(ErrorCode::MalformedEnvelope, reason)
                        .into_envelope(&participant_id, None),
                )
                .await;
                if malformed_at.len() >= ctx.settings.malformed_rate_threshold as usize {
                    tracing::warn!(
                        participant = %participant_id,
                        "malformed-frame rate exceeded, closing connection"
                    );
                    break;
                }
            }
        }
    }

    // Drain envelopes already accepted before tearing down.
    drop(route_tx);
    let _ = routing.await;

    ctx.registry.detach(&participant_id, &connection_id).await;
    ctx.router.handle_disconnect(&participant_id).await;
    writer.abort();
    tracing::info!(participant = %participant_id, "participant left");
}

/// Run the join handshake on the unsplit transport. Returns the
/// authenticated logical id, or `None` after reporting the rejection.
async fn handshake<S>(
    framed: &mut Framed<S, WireCodec>,
    ctx: &ConnectionContext,
) -> Option<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let first = match tokio::time::timeout(JOIN_TIMEOUT, framed.next()).await {
        Ok(Some(Ok(frame))) => frame,
        Ok(Some(Err(err))) => {
            tracing::debug!(%err, "read error before join");
            return None;
        }
        Ok(None) => return None,
        Err(_) => {
            tracing::debug!("connection idle before join, closing");
            return None;
        }
    };

    let rejection = |message: String| {
        ErrorPayload::new(ErrorCode::JoinRejected, message).into_envelope("", None)
    };

    let envelope = match first {
        Frame::Envelope(envelope) if envelope.kind == kinds::SPACE_JOIN => envelope,
        _ => {
            let _ = framed
                .send(Frame::Envelope(rejection(
                    "first frame must be space.join".to_string(),
                )))
                .await;
            return None;
        }
    };

    let join: JoinPayload = match payloads::decode(&envelope.payload) {
        Ok(join) => join,
        Err(err) => {
            let _ = framed.send(Frame::Envelope(rejection(err.to_string()))).await;
            return None;
        }
    };

    if join.participant_id == GATEWAY_ID
        || ctx
            .space
            .authenticate(&join.participant_id, &join.token)
            .is_none()
    {
        tracing::warn!(participant = %join.participant_id, "join rejected");
        let _ = framed
            .send(Frame::Envelope(rejection(
                "unknown participant or bad token".to_string(),
            )))
            .await;
        return None;
    }

    Some(join.participant_id)
}

async fn send_welcome(ctx: &ConnectionContext, participant_id: &str, connection_id: &str) {
    let streams = ctx
        .streams
        .open_streams()
        .await
        .into_iter()
        .map(|entry| StreamOpenPayload {
            stream_id: entry.stream_id,
            owner: entry.owner,
            direction: entry.direction,
            description: entry.description,
            encoding: None,
        })
        .collect();
    let welcome = WelcomePayload {
        participant_id: participant_id.to_string(),
        connection_id: connection_id.to_string(),
        capabilities: ctx.registry.effective_capabilities(participant_id).await,
        participants: ctx.registry.connected_ids().await,
        streams,
    };
    let payload = match serde_json::to_value(&welcome) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::error!(%err, "welcome serialization failed");
            return;
        }
    };
    deliver_to_self(
        ctx,
        participant_id,
        Envelope::from_gateway(kinds::SYSTEM_WELCOME, payload).to([participant_id]),
    )
    .await;
}

async fn announce_presence(ctx: &ConnectionContext, participant_id: &str, event: PresenceEvent) {
    let payload = match serde_json::to_value(PresencePayload {
        participant_id: participant_id.to_string(),
        event,
    }) {
        Ok(payload) => payload,
        Err(_) => return,
    };
    ctx.router
        .broadcast_from_gateway(Envelope::from_gateway(kinds::SYSTEM_PRESENCE, payload))
        .await;
}

/// Queue a gateway envelope on the participant's own connection.
async fn deliver_to_self(ctx: &ConnectionContext, participant_id: &str, envelope: Envelope) {
    if let Some((_, Some(connection))) = ctx.registry.resolve(participant_id).await {
        if connection
            .outbound
            .send(Frame::Envelope(envelope))
            .await
            .is_err()
        {
            tracing::debug!(participant = %participant_id, "outbound closed");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::cache::{DecisionCache, DEFAULT_DECISION_CAPACITY, DEFAULT_DECISION_TTL};
    use crate::correlation::{CorrelationTracker, DEFAULT_CORRELATION_TIMEOUT};
    use crate::streams::StreamManager;
    use plaza_core::config::ParticipantConfig;
    use plaza_core::pattern::CapabilityPattern;
    use serde_json::json;

    async fn make_context() -> Arc<ConnectionContext> {
        let space = SpaceConfig {
            space_id: "test-space".to_string(),
            participants: vec![
                ParticipantConfig {
                    id: "alice".to_string(),
                    token: "alice-token".to_string(),
                    capabilities: vec![
                        CapabilityPattern::for_kind("chat"),
                        CapabilityPattern::for_kind("stream.*"),
                    ],
                },
                ParticipantConfig {
                    id: "bob".to_string(),
                    token: "bob-token".to_string(),
                    capabilities: Vec::new(),
                },
            ],
        };
        let (registry, _events) = ParticipantRegistry::new();
        let registry = Arc::new(registry);
        for participant in &space.participants {
            registry
                .seed(&participant.id, participant.capabilities.clone())
                .await;
        }
        let streams = Arc::new(StreamManager::new());
        let router = Arc::new(EnvelopeRouter::new(
            registry.clone(),
            streams.clone(),
            Arc::new(CorrelationTracker::new(DEFAULT_CORRELATION_TIMEOUT)),
            DecisionCache::new(DEFAULT_DECISION_TTL, DEFAULT_DECISION_CAPACITY),
        ));
        Arc::new(ConnectionContext {
            registry,
            router,
            streams,
            space: Arc::new(space),
            settings: ConnectionSettings {
                outbound_buffer: 64,
                max_line_length: 65536,
                malformed_rate_threshold: 5,
            },
        })
    }

    fn client_framed(
        stream: tokio::io::DuplexStream,
    ) -> Framed<tokio::io::DuplexStream, WireCodec> {
        Framed::new(stream, WireCodec::new())
    }

    fn join_envelope(id: &str, token: &str) -> Frame {
        Frame::Envelope(Envelope::new(
            kinds::SPACE_JOIN,
            json!({"participant_id": id, "token": token}),
        ))
    }

    async fn next_envelope(
        framed: &mut Framed<tokio::io::DuplexStream, WireCodec>,
    ) -> Envelope {
        match framed.next().await.unwrap().unwrap() {
            Frame::Envelope(envelope) => envelope,
            other => panic!("expected envelope, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_join_handshake_yields_welcome() {
        let ctx = make_context().await;
        let (client, server) = tokio::io::duplex(65536);
        let task = tokio::spawn(serve_connection(server, ctx));

        let mut client = client_framed(client);
        client.send(join_envelope("alice", "alice-token")).await.unwrap();

        let welcome = next_envelope(&mut client).await;
        assert_eq!(welcome.kind, kinds::SYSTEM_WELCOME);
        assert_eq!(welcome.from, GATEWAY_ID);
        assert_eq!(welcome.payload["participant_id"], "alice");
        assert!(welcome.payload["connection_id"]
            .as_str()
            .unwrap()
            .starts_with("conn-"));
        let roster = welcome.payload["participants"].as_array().unwrap();
        assert!(roster.iter().any(|p| p == "alice"));

        let presence = next_envelope(&mut client).await;
        assert_eq!(presence.kind, kinds::SYSTEM_PRESENCE);
        assert_eq!(presence.payload["event"], "join");

        drop(client);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_join_with_bad_token_rejected() {
        let ctx = make_context().await;
        let (client, server) = tokio::io::duplex(65536);
        let task = tokio::spawn(serve_connection(server, ctx));

        let mut client = client_framed(client);
        client.send(join_envelope("alice", "wrong")).await.unwrap();

        let rejection = next_envelope(&mut client).await;
        assert_eq!(rejection.kind, kinds::SYSTEM_ERROR);
        assert_eq!(rejection.payload["error"], "join_rejected");
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_first_frame_must_be_join() {
        let ctx = make_context().await;
        let (client, server) = tokio::io::duplex(65536);
        let task = tokio::spawn(serve_connection(server, ctx));

        let mut client = client_framed(client);
        client
            .send(Frame::Envelope(Envelope::new(kinds::CHAT, json!({}))))
            .await
            .unwrap();

        let rejection = next_envelope(&mut client).await;
        assert_eq!(rejection.payload["error"], "join_rejected");
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_gateway_identity_cannot_join() {
        let ctx = make_context().await;
        let (client, server) = tokio::io::duplex(65536);
        let task = tokio::spawn(serve_connection(server, ctx));

        let mut client = client_framed(client);
        client.send(join_envelope(GATEWAY_ID, "any")).await.unwrap();

        let rejection = next_envelope(&mut client).await;
        assert_eq!(rejection.payload["error"], "join_rejected");
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_threshold_tears_down() {
        let ctx = make_context().await;
        let (client, server) = tokio::io::duplex(65536);
        let task = tokio::spawn(serve_connection(server, ctx.clone()));

        let mut client = client_framed(client);
        client.send(join_envelope("alice", "alice-token")).await.unwrap();
        let _ = next_envelope(&mut client).await; // welcome
        let _ = next_envelope(&mut client).await; // presence

        // Raw garbage lines; each comes back as a malformed-envelope error.
        use tokio::io::AsyncWriteExt;
        let mut inner = client.into_inner();
        for _ in 0..ctx.settings.malformed_rate_threshold {
            inner.write_all(b"{not json\n").await.unwrap();
        }
        inner.flush().await.unwrap();

        task.await.unwrap();
        let (_, connection) = ctx.registry.resolve("alice").await.unwrap();
        assert!(connection.is_none(), "connection torn down and detached");
    }

    #[tokio::test]
    async fn test_malformed_rate_counts_across_valid_frames() {
        let ctx = make_context().await;
        let (client, server) = tokio::io::duplex(65536);
        let task = tokio::spawn(serve_connection(server, ctx.clone()));

        let mut client = client_framed(client);
        client.send(join_envelope("alice", "alice-token")).await.unwrap();
        let _ = next_envelope(&mut client).await; // welcome
        let _ = next_envelope(&mut client).await; // presence

        // Well-formed envelopes between the garbage lines must not reset
        // the count; the threshold is a rate, not a streak.
        use tokio::io::AsyncWriteExt;
        let mut inner = client.into_inner();
        for _ in 0..ctx.settings.malformed_rate_threshold {
            inner.write_all(b"{not json\n").await.unwrap();
            let mut line =
                serde_json::to_vec(&Envelope::new(kinds::CHAT, json!({}))).unwrap();
            line.push(b'\n');
            inner.write_all(&line).await.unwrap();
        }
        inner.flush().await.unwrap();

        task.await.unwrap();
        let (_, connection) = ctx.registry.resolve("alice").await.unwrap();
        assert!(connection.is_none(), "connection torn down and detached");
    }

    #[tokio::test]
    async fn test_stream_frames_bypass_stalled_envelope_routing() {
        let ctx = make_context().await;
        let (client, server) = tokio::io::duplex(65536);
        let _task = tokio::spawn(serve_connection(server, ctx.clone()));

        let mut client = client_framed(client);
        client.send(join_envelope("alice", "alice-token")).await.unwrap();
        let _ = next_envelope(&mut client).await; // welcome
        let _ = next_envelope(&mut client).await; // presence

        // One recipient with a single-slot queue it never drains, one
        // observer that keeps up.
        let (stalled_tx, _stalled_rx) = mpsc::channel(1);
        ctx.registry.attach("stalled", stalled_tx).await.unwrap();
        let (observer_tx, mut observer_rx) = mpsc::channel(64);
        ctx.registry.attach("observer", observer_tx).await.unwrap();

        client
            .send(Frame::Envelope(Envelope::new(
                "stream.request",
                json!({"direction": "upload"}),
            )))
            .await
            .unwrap();
        let open = next_envelope(&mut client).await;
        assert_eq!(open.kind, "stream.open");
        let stream_id = open.payload["stream_id"].as_str().unwrap().to_string();

        // The request broadcast filled the stalled queue, so the open
        // announcement is stuck there and this chat queues behind it.
        client
            .send(Frame::Envelope(Envelope::new(kinds::CHAT, json!({"text": "hi"}))))
            .await
            .unwrap();
        client
            .send(Frame::Stream {
                stream_id: stream_id.clone(),
                payload: bytes::Bytes::from_static(b"tok"),
            })
            .await
            .unwrap();

        match observer_rx.recv().await.unwrap() {
            Frame::Envelope(envelope) => assert_eq!(envelope.kind, "stream.request"),
            other => panic!("expected request broadcast, got {other:?}"),
        }
        match observer_rx.recv().await.unwrap() {
            Frame::Envelope(envelope) => assert_eq!(envelope.kind, "stream.open"),
            other => panic!("expected open broadcast, got {other:?}"),
        }
        // The raw frame overtakes the chat still queued behind the
        // stalled recipient.
        match observer_rx.recv().await.unwrap() {
            Frame::Stream { stream_id: got, payload } => {
                assert_eq!(got, stream_id);
                assert_eq!(&payload[..], b"tok");
            }
            other => panic!("expected raw frame ahead of queued envelopes, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_welcome_lists_open_streams() {
        let ctx = make_context().await;
        let stream_id = ctx
            .streams
            .request(
                "bob",
                &plaza_core::payloads::StreamRequestPayload {
                    direction: plaza_core::payloads::StreamDirection::Upload,
                    description: Some("reasoning tokens".to_string()),
                    expected_size_bytes: None,
                },
            )
            .await;
        ctx.streams.open(&stream_id).await.unwrap();

        let (client, server) = tokio::io::duplex(65536);
        let _task = tokio::spawn(serve_connection(server, ctx));

        let mut client = client_framed(client);
        client.send(join_envelope("alice", "alice-token")).await.unwrap();
        let welcome = next_envelope(&mut client).await;
        assert_eq!(welcome.kind, kinds::SYSTEM_WELCOME);
        let streams = welcome.payload["streams"].as_array().unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0]["stream_id"], stream_id.as_str());
        assert_eq!(streams[0]["owner"], "bob");
        assert_eq!(streams[0]["description"], "reasoning tokens");
    }

    #[tokio::test]
    async fn test_duplicate_connection_rejected() {
        let ctx = make_context().await;
        let (client1, server1) = tokio::io::duplex(65536);
        let _task1 = tokio::spawn(serve_connection(server1, ctx.clone()));
        let mut client1 = client_framed(client1);
        client1.send(join_envelope("alice", "alice-token")).await.unwrap();
        let _ = next_envelope(&mut client1).await; // welcome

        let (client2, server2) = tokio::io::duplex(65536);
        let task2 = tokio::spawn(serve_connection(server2, ctx));
        let mut client2 = client_framed(client2);
        client2.send(join_envelope("alice", "alice-token")).await.unwrap();

        let rejection = next_envelope(&mut client2).await;
        assert_eq!(rejection.payload["error"], "join_rejected");
        task2.await.unwrap();
    }
}
