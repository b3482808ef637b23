use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::message::OutboundMessage;
use super::{ErrorReport, RelayChannel, WireMode};
use crate::config::Keepalive;
use crate::error::{RelayError, Result};
use crate::media::EncodedFrame;

/// Upper bound on flushing the close frame to a peer that stopped reading.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type SharedSink<S> = Arc<Mutex<SplitSink<WebSocketStream<S>, Message>>>;

/// [`RelayChannel`] over an accepted WebSocket.
///
/// The stream is split: the write half stays here, the read half moves to
/// a watcher task that cancels [`disconnected`](RelayChannel::disconnected)
/// when the peer sends Close, errors out, drops the TCP connection, or
/// stays silent past the keepalive deadline. Pings from the peer are
/// answered by tungstenite itself on the next write.
pub struct WsChannel<S> {
    sink: SharedSink<S>,
    wire_mode: WireMode,
    camera_name: Option<String>,
    disconnected: CancellationToken,
    watcher: JoinHandle<()>,
    closed: bool,
}

impl<S> WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        ws: WebSocketStream<S>,
        wire_mode: WireMode,
        camera_name: Option<String>,
        keepalive: Option<Keepalive>,
    ) -> Self {
        let (sink, stream) = ws.split();
        let sink = Arc::new(Mutex::new(sink));
        let disconnected = CancellationToken::new();
        let watcher = tokio::spawn(watch_peer(
            stream,
            sink.clone(),
            keepalive,
            disconnected.clone(),
        ));

        Self {
            sink,
            wire_mode,
            camera_name,
            disconnected,
            watcher,
            closed: false,
        }
    }

    async fn deliver(&mut self, message: Message) -> Result<()> {
        if self.closed || self.disconnected.is_cancelled() {
            return Err(RelayError::PeerDisconnected);
        }
        if let Err(e) = self.sink.lock().await.send(message).await {
            tracing::debug!(error = %e, "WebSocket send failed");
            self.disconnected.cancel();
            return Err(RelayError::PeerDisconnected);
        }
        Ok(())
    }
}

/// Drain the read half until the peer goes away, pinging it on the
/// keepalive schedule.
///
/// At most one ping is outstanding. Its deadline is armed when the ping is
/// queued, so a peer that stopped reading (and thus blocks the ping behind
/// a full socket) is caught as well. Any inbound message clears it.
async fn watch_peer<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    sink: SharedSink<S>,
    keepalive: Option<Keepalive>,
    disconnected: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut ticker = keepalive.map(|k| {
        let mut ticker = tokio::time::interval_at(Instant::now() + k.ping_interval, k.ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let mut pong_deadline: Option<Instant> = None;
    let mut in_flight: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            _ = disconnected.cancelled() => break,
            _ = tick(&mut ticker) => {
                if pong_deadline.is_none() {
                    if let Some(k) = keepalive {
                        pong_deadline = Some(Instant::now() + k.pong_timeout);
                        in_flight = Some(tokio::spawn(send_ping(sink.clone())));
                    }
                }
            }
            _ = expire(pong_deadline) => {
                tracing::info!("peer missed keepalive deadline");
                break;
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(?frame, "peer sent close");
                    break;
                }
                Some(Ok(msg)) => {
                    pong_deadline = None;
                    if let Message::Text(text) = msg {
                        tracing::debug!(len = text.len(), "ignoring text message mid-session");
                    }
                }
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "WebSocket read error");
                    break;
                }
                None => break,
            }
        }
    }

    if let Some(ping) = in_flight {
        ping.abort();
    }
    disconnected.cancel();
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn send_ping<S>(sink: SharedSink<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = sink.lock().await.send(Message::Ping(Vec::new())).await {
        tracing::debug!(error = %e, "keepalive ping failed");
    } else {
        tracing::trace!("keepalive ping sent");
    }
}

#[async_trait]
impl<S> RelayChannel for WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_frame(&mut self, frame: EncodedFrame) -> Result<()> {
        let message = match self.wire_mode {
            WireMode::Json => {
                let envelope = OutboundMessage::frame(&frame, self.camera_name.as_deref());
                Message::Text(envelope.to_json()?)
            }
            WireMode::Binary => Message::Binary(frame.payload.to_vec()),
        };
        self.deliver(message).await
    }

    async fn send_error(&mut self, report: &ErrorReport) {
        let text = match OutboundMessage::error(report).to_json() {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize error report");
                return;
            }
        };
        if let Err(e) = self.deliver(Message::Text(text)).await {
            tracing::debug!(error = %e, kind = report.kind, "error report not delivered");
        }
    }

    fn disconnected(&self) -> CancellationToken {
        self.disconnected.clone()
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.watcher.abort();
        if !self.disconnected.is_cancelled() {
            let sink = self.sink.clone();
            let closing = async move { sink.lock().await.close().await };
            if tokio::time::timeout(CLOSE_TIMEOUT, closing).await.is_err() {
                tracing::debug!("peer did not take the close frame in time");
            }
        }
        self.disconnected.cancel();
    }
}

impl<S> Drop for WsChannel<S> {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}
