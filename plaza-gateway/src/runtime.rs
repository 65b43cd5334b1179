//! Gateway runtime: wires the registry, router, and listeners together
//! and owns the background tasks (capability-snapshot push and the
//! correlation sweep). Listener tasks abort on drop, so dropping the
//! runtime shuts the gateway down.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use plaza_core::codec::MAX_LINE_LENGTH;
use plaza_core::config::SpaceConfig;

use crate::cache::{DecisionCache, DEFAULT_DECISION_CAPACITY, DEFAULT_DECISION_TTL};
use crate::connection::{serve_connection, ConnectionContext, ConnectionSettings};
use crate::correlation::{CorrelationTracker, DEFAULT_CORRELATION_TIMEOUT};
use crate::registry::{ParticipantRegistry, RegistryEvent};
use crate::router::EnvelopeRouter;
use crate::streams::StreamManager;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Gateway already started")]
    AlreadyStarted,
}

/// Runtime configuration for one gateway instance.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// TCP listen address, if any. Port 0 binds an ephemeral port.
    pub listen_tcp: Option<SocketAddr>,
    /// Unix domain socket path, if any.
    pub listen_uds: Option<PathBuf>,
    pub space: SpaceConfig,
    pub correlation_timeout: Duration,
    /// How often expired correlations are swept.
    pub sweep_interval: Duration,
    /// Per-connection outbound queue depth.
    pub outbound_buffer: usize,
    pub max_line_length: usize,
    pub malformed_rate_threshold: u32,
    pub decision_cache_ttl: Duration,
    pub decision_cache_capacity: usize,
}

impl GatewayConfig {
    pub fn new(space: SpaceConfig) -> Self {
        Self {
            listen_tcp: None,
            listen_uds: None,
            space,
            correlation_timeout: DEFAULT_CORRELATION_TIMEOUT,
            sweep_interval: Duration::from_secs(1),
            outbound_buffer: 256,
            max_line_length: MAX_LINE_LENGTH,
            malformed_rate_threshold: 10,
            decision_cache_ttl: DEFAULT_DECISION_TTL,
            decision_cache_capacity: DEFAULT_DECISION_CAPACITY,
        }
    }
}

/// Handle to a bound listener. The accept loop aborts when this drops.
pub struct ListenerHandle {
    local_addr: Option<SocketAddr>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// The bound address, for TCP listeners. Useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct GatewayRuntime {
    ctx: Arc<ConnectionContext>,
    router: Arc<EnvelopeRouter>,
    correlations: Arc<CorrelationTracker>,
    config: GatewayConfig,
    events: Option<mpsc::UnboundedReceiver<RegistryEvent>>,
    listeners: Vec<ListenerHandle>,
    background: Vec<JoinHandle<()>>,
}

impl GatewayRuntime {
    pub async fn new(config: GatewayConfig) -> Self {
        let (registry, events) = ParticipantRegistry::new();
        let registry = Arc::new(registry);
        for participant in &config.space.participants {
            registry
                .seed(&participant.id, participant.capabilities.clone())
                .await;
        }
        let streams = Arc::new(StreamManager::new());
        let correlations = Arc::new(CorrelationTracker::new(config.correlation_timeout));
        let router = Arc::new(EnvelopeRouter::new(
            registry.clone(),
            streams.clone(),
            correlations.clone(),
            DecisionCache::new(config.decision_cache_ttl, config.decision_cache_capacity),
        ));
        let ctx = Arc::new(ConnectionContext {
            registry,
            router: router.clone(),
            streams,
            space: Arc::new(config.space.clone()),
            settings: ConnectionSettings {
                outbound_buffer: config.outbound_buffer,
                max_line_length: config.max_line_length,
                malformed_rate_threshold: config.malformed_rate_threshold,
            },
        });
        Self {
            ctx,
            router,
            correlations,
            config,
            events: Some(events),
            listeners: Vec::new(),
            background: Vec::new(),
        }
    }

    /// Bind the configured listeners and spawn the background loops.
    pub async fn start(&mut self) -> Result<(), GatewayError> {
        let Some(events) = self.events.take() else {
            return Err(GatewayError::AlreadyStarted);
        };
        self.background.push(self.spawn_event_loop(events));
        self.background.push(self.spawn_sweep_loop());

        if let Some(addr) = self.config.listen_tcp {
            let handle = self.start_tcp_listener(addr).await?;
            self.listeners.push(handle);
        }
        #[cfg(unix)]
        if let Some(path) = self.config.listen_uds.clone() {
            let handle = self.start_uds_listener(&path)?;
            self.listeners.push(handle);
        }
        tracing::info!(space = %self.config.space.space_id, "gateway started");
        Ok(())
    }

    /// Bound TCP address of the first TCP listener, once started.
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.listeners.iter().find_map(ListenerHandle::local_addr)
    }

    async fn start_tcp_listener(&self, addr: SocketAddr) -> Result<ListenerHandle, GatewayError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "listening on tcp");
        let ctx = self.ctx.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "accepted tcp connection");
                        tokio::spawn(serve_connection(stream, ctx.clone()));
                    }
                    Err(err) => {
                        tracing::warn!(%err, "tcp accept failed");
                        break;
                    }
                }
            }
        });
        Ok(ListenerHandle {
            local_addr: Some(local_addr),
            task,
        })
    }

    #[cfg(unix)]
    fn start_uds_listener(&self, path: &std::path::Path) -> Result<ListenerHandle, GatewayError> {
        // A stale socket file from a previous run blocks the bind.
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        tracing::info!(path = %path.display(), "listening on unix socket");
        let ctx = self.ctx.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        tracing::debug!("accepted unix connection");
                        tokio::spawn(serve_connection(stream, ctx.clone()));
                    }
                    Err(err) => {
                        tracing::warn!(%err, "unix accept failed");
                        break;
                    }
                }
            }
        });
        Ok(ListenerHandle {
            local_addr: None,
            task,
        })
    }

    fn spawn_event_loop(
        &self,
        mut events: mpsc::UnboundedReceiver<RegistryEvent>,
    ) -> JoinHandle<()> {
        let router = self.router.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    RegistryEvent::CapabilitiesChanged { participant_id } => {
                        router.push_capability_snapshot(&participant_id).await;
                    }
                }
            }
        })
    }

    fn spawn_sweep_loop(&self) -> JoinHandle<()> {
        let router = self.router.clone();
        let correlations = self.correlations.clone();
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                let failures = correlations.sweep().await;
                if !failures.is_empty() {
                    router.notify_failures(failures).await;
                }
            }
        })
    }

    /// Stop accepting and cancel the background loops. Existing
    /// connections wind down as their sockets close.
    pub fn shutdown(&mut self) {
        self.listeners.clear();
        for task in self.background.drain(..) {
            task.abort();
        }
        tracing::info!("gateway stopped");
    }
}

impl Drop for GatewayRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
