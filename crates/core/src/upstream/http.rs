use std::collections::VecDeque;
use std::error::Error as StdError;
use std::fmt::Display;
use std::io;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::time::Instant;

use super::{FrameSource, Upstream};
use crate::config::UpstreamConfig;
use crate::error::{RelayError, Result};
use crate::media::scanner::SOI;
use crate::media::{FrameScanner, RawFrame};
use crate::session::StreamTarget;

type ByteStream = Pin<Box<dyn Stream<Item = std::result::Result<Bytes, String>> + Send>>;

/// HTTP(S) camera connector built on a shared `reqwest` client.
///
/// The client carries only the connect timeout; no overall request timeout
/// is set because the response body is unbounded. Response headers are
/// bounded separately by the connect timeout.
pub struct HttpUpstream {
    client: reqwest::Client,
    config: UpstreamConfig,
}

impl HttpUpstream {
    pub fn new(config: UpstreamConfig) -> Result<Self> {
        if config.accept_invalid_certs {
            tracing::warn!("TLS certificate verification disabled for camera connections");
        }

        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| RelayError::Request(format!("failed to create HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    /// Advisory HEAD request. Never fails the connection.
    async fn probe(&self, target: &StreamTarget, headers: &HeaderMap) {
        let request = self
            .client
            .head(target.url().clone())
            .headers(headers.clone())
            .timeout(self.config.head_timeout);

        match request.send().await {
            Ok(response) => {
                tracing::info!(url = %target.as_str(), status = response.status().as_u16(), "HEAD probe");
                tracing::debug!(headers = ?response.headers(), "HEAD probe response headers");
            }
            Err(e) => {
                tracing::warn!(url = %target.as_str(), error = %error_chain(&e), "HEAD probe failed");
            }
        }
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn open(&self, target: &StreamTarget) -> Result<Box<dyn FrameSource>> {
        let headers = header_map(target.headers());

        if self.config.probe_with_head {
            self.probe(target, &headers).await;
        }

        tracing::info!(url = %target.as_str(), "connecting to camera");

        let request = self.client.get(target.url().clone()).headers(headers);
        let timeout = self.config.connect_timeout;
        let response = match tokio::time::timeout(timeout, request.send()).await {
            Err(_) => return Err(RelayError::ConnectTimeout(timeout)),
            Ok(Err(e)) => return Err(classify_request_error(&e, timeout)),
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(url = %target.as_str(), status = status.as_u16(), "camera rejected stream request");
            return Err(RelayError::UpstreamStatus(status.as_u16()));
        }

        tracing::debug!(
            url = %target.as_str(),
            status = status.as_u16(),
            content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown"),
            "camera stream opened"
        );

        Ok(Box::new(HttpFrameSource::from_stream(
            response.bytes_stream(),
            self.config.read_timeout,
            self.config.max_buffered_bytes,
        )))
    }
}

/// Frame source over a chunked HTTP body.
///
/// Owns the body stream, the [`FrameScanner`] buffer and a queue of frames
/// already cut from the buffer but not yet handed out.
pub struct HttpFrameSource {
    body: Option<ByteStream>,
    scanner: FrameScanner,
    ready: VecDeque<RawFrame>,
    read_timeout: Duration,
    max_buffered: usize,
}

impl HttpFrameSource {
    /// Wrap any stream of byte chunks.
    pub fn from_stream<S, E>(stream: S, read_timeout: Duration, max_buffered: usize) -> Self
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
        E: Display,
    {
        let body: ByteStream = Box::pin(stream.map(|chunk| chunk.map_err(|e| e.to_string())));
        Self {
            body: Some(body),
            scanner: FrameScanner::new(),
            ready: VecDeque::new(),
            read_timeout,
            max_buffered,
        }
    }
}

#[async_trait]
impl FrameSource for HttpFrameSource {
    async fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        let deadline = Instant::now() + self.read_timeout;

        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(Some(frame));
            }

            let Some(body) = self.body.as_mut() else {
                return Err(RelayError::StreamClosed("connection already closed".into()));
            };

            let chunk = match tokio::time::timeout_at(deadline, body.next()).await {
                Err(_) => return Err(RelayError::ReadTimeout(self.read_timeout)),
                Ok(None) => {
                    tracing::debug!(
                        remainder = self.scanner.buffered(),
                        partial_frame = self.scanner.remainder().starts_with(&SOI),
                        "camera ended the stream"
                    );
                    self.close();
                    return Ok(None);
                }
                Ok(Some(Err(e))) => {
                    self.close();
                    return Err(RelayError::StreamClosed(e));
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            self.ready.extend(self.scanner.push(&chunk));

            let buffered = self.scanner.buffered();
            if buffered > self.max_buffered {
                tracing::warn!(buffered, limit = self.max_buffered, "frame buffer bound exceeded");
                self.close();
                return Err(RelayError::MalformedStream {
                    buffered,
                    limit: self.max_buffered,
                });
            }
        }
    }

    fn close(&mut self) {
        if self.body.take().is_some() {
            tracing::trace!("camera connection released");
        }
        self.scanner.clear();
        self.ready.clear();
    }
}

/// Convert configured header pairs, skipping (and logging) invalid ones.
fn header_map(headers: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => tracing::warn!(header = %name, "skipping invalid request header"),
        }
    }
    map
}

fn classify_request_error(err: &reqwest::Error, timeout: Duration) -> RelayError {
    let detail = error_chain(err);
    if err.is_timeout() {
        return RelayError::ConnectTimeout(timeout);
    }
    if io_error_kind(err).is_some_and(is_refusal) {
        return RelayError::ConnectRefused(detail);
    }
    // The top-level message embeds the request URL; only the causes are
    // inspected.
    let causes = err.source().map(error_chain).unwrap_or_default();
    if looks_like_tls(&causes) {
        RelayError::Tls(detail)
    } else if err.is_connect() {
        RelayError::ConnectRefused(detail)
    } else {
        RelayError::Request(detail)
    }
}

/// Kind of the first `io::Error` in the source chain.
fn io_error_kind(err: &(dyn StdError + 'static)) -> Option<io::ErrorKind> {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<io::Error>() {
            return Some(io.kind());
        }
        source = cause.source();
    }
    None
}

fn is_refusal(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::AddrNotAvailable
    )
}

/// reqwest does not expose TLS failures as a kind; the rustls error sits
/// somewhere in the source chain.
fn looks_like_tls(detail: &str) -> bool {
    let lower = detail.to_ascii_lowercase();
    ["certificate", "tls", "handshake", "ssl"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// `err: source: source ...` on one line.
fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
