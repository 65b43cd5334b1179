// plaza-client
//! Client library for the Plaza gateway: connect, join a space, and
//! exchange envelopes and raw stream frames.

use std::collections::VecDeque;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

use plaza_core::codec::{Frame, WireCodec};
use plaza_core::envelope::{kinds, Envelope};
use plaza_core::payloads::{self, JoinPayload, WelcomePayload};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Join rejected: {0}")]
    Rejected(String),
    #[error("Connection closed by gateway")]
    Closed,
    #[error("Timed out waiting for a response")]
    Timeout,
    #[error("Unexpected frame during handshake")]
    Handshake,
    #[error(transparent)]
    Payload(#[from] payloads::PayloadError),
}

/// Something the gateway sent us.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Envelope(Envelope),
    Stream { stream_id: String, payload: Bytes },
}

trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// A joined connection to a Plaza gateway.
///
/// `request` parks unrelated traffic internally; drain it with `recv`
/// afterwards, nothing is dropped.
pub struct PlazaClient {
    framed: Framed<Box<dyn Transport>, WireCodec>,
    welcome: WelcomePayload,
    deferred: VecDeque<ClientEvent>,
}

impl PlazaClient {
    /// Connect over TCP and join as `participant_id`.
    pub async fn connect_tcp(
        addr: SocketAddr,
        participant_id: &str,
        token: &str,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        Self::join(Box::new(stream), participant_id, token).await
    }

    /// Connect over a Unix domain socket and join as `participant_id`.
    #[cfg(unix)]
    pub async fn connect_uds(
        path: &Path,
        participant_id: &str,
        token: &str,
    ) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(path).await?;
        Self::join(Box::new(stream), participant_id, token).await
    }

    async fn join(
        transport: Box<dyn Transport>,
        participant_id: &str,
        token: &str,
    ) -> Result<Self, ClientError> {
        let mut framed = Framed::new(transport, WireCodec::new());
        let join = JoinPayload {
            participant_id: participant_id.to_string(),
            token: token.to_string(),
        };
        let payload = serde_json::to_value(&join).map_err(|_| ClientError::Handshake)?;
        framed
            .send(Frame::Envelope(Envelope::new(kinds::SPACE_JOIN, payload)))
            .await?;

        // The gateway answers with system.welcome or system.error.
        loop {
            let frame = framed.next().await.ok_or(ClientError::Closed)??;
            match frame {
                Frame::Envelope(envelope) if envelope.kind == kinds::SYSTEM_WELCOME => {
                    let welcome: WelcomePayload = payloads::decode(&envelope.payload)?;
                    tracing::debug!(
                        participant = %welcome.participant_id,
                        connection = %welcome.connection_id,
                        "joined space"
                    );
                    return Ok(Self {
                        framed,
                        welcome,
                        deferred: VecDeque::new(),
                    });
                }
                Frame::Envelope(envelope) if envelope.kind == kinds::SYSTEM_ERROR => {
                    let message = envelope.payload["message"]
                        .as_str()
                        .unwrap_or("join rejected")
                        .to_string();
                    return Err(ClientError::Rejected(message));
                }
                _ => return Err(ClientError::Handshake),
            }
        }
    }

    /// The welcome payload received at join: identity, capabilities, roster.
    pub fn welcome(&self) -> &WelcomePayload {
        &self.welcome
    }

    pub fn participant_id(&self) -> &str {
        &self.welcome.participant_id
    }

    /// Send one envelope.
    pub async fn send(&mut self, envelope: Envelope) -> Result<(), ClientError> {
        self.framed.send(Frame::Envelope(envelope)).await?;
        Ok(())
    }

    /// Send one raw frame on an open stream.
    pub async fn send_stream_frame(
        &mut self,
        stream_id: &str,
        payload: impl Into<Bytes>,
    ) -> Result<(), ClientError> {
        self.framed
            .send(Frame::stream(stream_id, payload.into()))
            .await?;
        Ok(())
    }

    /// Receive the next event, deferred traffic first.
    pub async fn recv(&mut self) -> Result<ClientEvent, ClientError> {
        if let Some(event) = self.deferred.pop_front() {
            return Ok(event);
        }
        self.read_event().await
    }

    /// Receive with a deadline.
    pub async fn recv_timeout(&mut self, limit: Duration) -> Result<ClientEvent, ClientError> {
        if let Some(event) = self.deferred.pop_front() {
            return Ok(event);
        }
        tokio::time::timeout(limit, self.read_event())
            .await
            .map_err(|_| ClientError::Timeout)?
    }

    /// Send a request and wait for the first envelope correlated to it.
    /// Unrelated traffic arriving meanwhile is parked for `recv`.
    pub async fn request(
        &mut self,
        envelope: Envelope,
        limit: Duration,
    ) -> Result<Envelope, ClientError> {
        let request_id = envelope.id.clone();
        self.send(envelope).await?;
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or(ClientError::Timeout)?;
            let event = match tokio::time::timeout(remaining, self.read_event()).await {
                Ok(event) => event?,
                Err(_) => return Err(ClientError::Timeout),
            };
            match event {
                ClientEvent::Envelope(envelope)
                    if envelope.correlation_id.contains(&request_id) =>
                {
                    return Ok(envelope);
                }
                other => self.deferred.push_back(other),
            }
        }
    }

    async fn read_event(&mut self) -> Result<ClientEvent, ClientError> {
        loop {
            let frame = self.framed.next().await.ok_or(ClientError::Closed)??;
            match frame {
                Frame::Envelope(envelope) => return Ok(ClientEvent::Envelope(envelope)),
                Frame::Stream { stream_id, payload } => {
                    return Ok(ClientEvent::Stream { stream_id, payload });
                }
                Frame::Malformed { reason } => {
                    tracing::warn!(%reason, "gateway sent an unparseable line, skipping");
                }
            }
        }
    }
}
