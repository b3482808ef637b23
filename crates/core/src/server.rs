use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{RelayConfig, TargetMode};
use crate::error::{RelayError, Result};
use crate::media::{JpegTranscoder, Transcoder};
use crate::session::{SessionInfo, SessionRegistry, Supervisor};
use crate::transport::tcp;
use crate::upstream::{HttpUpstream, Upstream};

/// High-level relay server orchestrator.
///
/// Owns the session registry and the shared [`Supervisor`]. Delegates
/// connection handling to [`transport::tcp`](crate::transport::tcp).
pub struct Server {
    config: Arc<RelayConfig>,
    supervisor: Arc<Supervisor>,
    registry: SessionRegistry,
    shutdown: Option<CancellationToken>,
    accept_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Server {
    /// Create a server that reads cameras over HTTP and re-encodes with the
    /// configured JPEG quality.
    pub fn new(config: RelayConfig) -> Result<Self> {
        let upstream = Arc::new(HttpUpstream::new(config.upstream.clone())?);
        let transcoder = Arc::new(JpegTranscoder::new(config.effective_quality()));
        Ok(Self::with_components(config, upstream, transcoder))
    }

    /// Create a server with custom upstream and transcoder implementations.
    pub fn with_components(
        config: RelayConfig,
        upstream: Arc<dyn Upstream>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Self {
        let config = Arc::new(config);
        Self {
            supervisor: Arc::new(Supervisor::new(config.clone(), upstream, transcoder)),
            config,
            registry: SessionRegistry::new(),
            shutdown: None,
            accept_task: None,
            local_addr: None,
        }
    }

    /// Bind the listener and start accepting consumers.
    ///
    /// Returns the bound address, which differs from the configured one
    /// when port 0 was requested.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.is_running() {
            return Err(RelayError::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        let addr = listener.local_addr()?;

        let shutdown = CancellationToken::new();
        self.accept_task = Some(tokio::spawn(tcp::accept_loop(
            listener,
            self.supervisor.clone(),
            self.registry.clone(),
            shutdown.clone(),
        )));
        self.shutdown = Some(shutdown);
        self.local_addr = Some(addr);

        let mode = match &self.config.target_mode {
            TargetMode::Dynamic => "dynamic",
            TargetMode::Fixed(_) => "fixed",
        };
        tracing::info!(
            %addr,
            target_mode = mode,
            wire_mode = %self.config.wire_mode,
            quality = self.config.effective_quality(),
            "MJPEG relay listening"
        );

        Ok(addr)
    }

    /// Stop accepting and close every live session.
    pub async fn stop(&mut self) {
        let Some(shutdown) = self.shutdown.take() else {
            return;
        };
        tracing::info!(sessions = self.registry.len(), "server stopping");
        shutdown.cancel();

        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "accept loop ended abnormally");
            }
        }
        self.local_addr = None;
    }

    pub fn is_running(&self) -> bool {
        self.shutdown.is_some()
    }

    /// Address the listener is bound to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Snapshot of the sessions currently being relayed.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.registry.snapshot()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.cancel();
        }
    }
}
