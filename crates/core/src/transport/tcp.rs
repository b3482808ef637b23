use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::{RelayChannel, WsChannel};
use crate::config::TargetMode;
use crate::session::{SessionRegistry, Supervisor};

/// Accept loop. Runs until `shutdown` is cancelled.
///
/// Every accepted socket gets its own task; sessions never share an
/// upstream connection.
pub async fn accept_loop(
    listener: TcpListener,
    supervisor: Arc<Supervisor>,
    registry: SessionRegistry,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    let supervisor = supervisor.clone();
                    let registry = registry.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        Connection::handle(stream, peer_addr, supervisor, registry, shutdown).await;
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}

/// A single WebSocket consumer with its own lifecycle.
struct Connection;

impl Connection {
    /// Entry point: upgrade, resolve the camera URL, run one session.
    async fn handle(
        stream: TcpStream,
        peer_addr: SocketAddr,
        supervisor: Arc<Supervisor>,
        registry: SessionRegistry,
        shutdown: CancellationToken,
    ) {
        tracing::info!(%peer_addr, "client connected");

        let mut ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                tracing::warn!(%peer_addr, error = %e, "WebSocket handshake failed");
                return;
            }
        };

        let config = supervisor.config();
        let url = match &config.target_mode {
            TargetMode::Fixed(url) => url.clone(),
            TargetMode::Dynamic => {
                match tokio::time::timeout(config.target_timeout, read_target(&mut ws)).await {
                    Ok(Some(url)) => url,
                    Ok(None) => {
                        tracing::info!(%peer_addr, "client left before sending a camera URL");
                        return;
                    }
                    Err(_) => {
                        tracing::info!(
                            %peer_addr,
                            timeout_ms = config.target_timeout.as_millis() as u64,
                            "no camera URL received, closing"
                        );
                        let _ = ws.close(None).await;
                        return;
                    }
                }
            }
        };
        tracing::info!(%peer_addr, url = %url, "camera URL resolved");

        let mut channel = WsChannel::new(
            ws,
            config.wire_mode,
            config.camera_name.clone(),
            config.keepalive,
        );
        let session = registry.create_session(peer_addr, &url);

        let reason = tokio::select! {
            report = supervisor.run(&session, &mut channel) => match report.error {
                Some(kind) => format!("session failed: {kind}"),
                None => format!("session closed after {} frames", report.frames_sent),
            },
            _ = shutdown.cancelled() => "server shutting down".to_string(),
        };

        channel.close().await;
        registry.remove_session(&session.id);

        tracing::info!(%peer_addr, session_id = %session.id, reason = %reason, "client disconnected");
    }
}

/// Wait for the first message and treat it as the camera URL.
///
/// Returns `None` when the peer closes first. Validation is left to the
/// session so an unusable URL is reported like any other failure.
async fn read_target<S>(ws: &mut WebSocketStream<S>) -> Option<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(msg) = ws.next().await {
        match msg {
            Ok(Message::Text(text)) => return Some(text.trim().to_string()),
            Ok(Message::Binary(data)) => return Some(String::from_utf8_lossy(&data).trim().to_string()),
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(error = %e, "read error while waiting for camera URL");
                return None;
            }
        }
    }
    None
}
