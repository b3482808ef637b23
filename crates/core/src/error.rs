//! Error types for the MJPEG relay library.

use std::fmt;
use std::time::Duration;

/// Errors that can occur while relaying a camera stream.
///
/// Variants map to specific failure modes across the pipeline:
///
/// - **Target**: [`InvalidTarget`](Self::InvalidTarget): the URL cannot be used.
/// - **Upstream connect**: [`ConnectTimeout`](Self::ConnectTimeout),
///   [`ConnectRefused`](Self::ConnectRefused), [`Tls`](Self::Tls),
///   [`UpstreamStatus`](Self::UpstreamStatus), [`Request`](Self::Request).
/// - **Upstream read**: [`ReadTimeout`](Self::ReadTimeout),
///   [`StreamClosed`](Self::StreamClosed),
///   [`MalformedStream`](Self::MalformedStream).
/// - **Transcoder**: [`Decode`](Self::Decode): one corrupt frame.
/// - **Channel**: [`PeerDisconnected`](Self::PeerDisconnected),
///   [`WebSocket`](Self::WebSocket), [`Serialization`](Self::Serialization).
/// - **Server**: [`AlreadyRunning`](Self::AlreadyRunning).
///
/// The session supervisor never inspects messages; it branches on
/// [`disposition`](Self::disposition).
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream URL is malformed or lacks a scheme/host.
    #[error("invalid camera URL: {0}")]
    InvalidTarget(String),

    /// The upstream did not answer within the connect timeout.
    #[error("connection to camera timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The upstream refused or reset the connection.
    #[error("camera connection refused: {0}")]
    ConnectRefused(String),

    /// TLS handshake or certificate validation failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The camera answered with a non-2xx status.
    #[error("camera responded with HTTP status {0}")]
    UpstreamStatus(u16),

    /// Any other request failure while opening the stream.
    #[error("camera request failed: {0}")]
    Request(String),

    /// No complete frame arrived within the stall timeout.
    #[error("no frame received for {0:?}")]
    ReadTimeout(Duration),

    /// The upstream body ended or broke mid-stream.
    #[error("camera stream closed: {0}")]
    StreamClosed(String),

    /// The byte buffer exceeded its bound without yielding a frame.
    #[error("malformed MJPEG stream: {buffered} bytes buffered without a complete frame (limit {limit})")]
    MalformedStream { buffered: usize, limit: usize },

    /// A single frame could not be decoded as JPEG.
    #[error("frame decode error: {0}")]
    Decode(String),

    /// The downstream consumer went away.
    #[error("downstream peer disconnected")]
    PeerDisconnected,

    /// WebSocket protocol failure on the downstream side.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// An outbound message could not be serialized.
    #[error("message serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,
}

/// Pipeline component an error originated from, reported to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Target,
    Upstream,
    Transcoder,
    Channel,
    Server,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Target => write!(f, "target"),
            Self::Upstream => write!(f, "upstream"),
            Self::Transcoder => write!(f, "transcoder"),
            Self::Channel => write!(f, "channel"),
            Self::Server => write!(f, "server"),
        }
    }
}

/// How the session supervisor must react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Retry after the backoff, within the reconnect budget.
    Transient,
    /// Report once downstream and close.
    Fatal,
    /// Drop the current frame and keep streaming.
    SkipFrame,
    /// Close immediately; nobody is left to report to.
    Disconnect,
}

impl RelayError {
    /// Classify this error for the session state machine.
    ///
    /// TLS failures are fatal unless certificate verification was
    /// explicitly disabled, in which case they count against the same
    /// reconnect budget as any other transient failure.
    pub fn disposition(&self, tls_verification_disabled: bool) -> Disposition {
        match self {
            Self::ConnectTimeout(_)
            | Self::ConnectRefused(_)
            | Self::Request(_)
            | Self::ReadTimeout(_)
            | Self::StreamClosed(_)
            | Self::Io(_) => Disposition::Transient,
            Self::UpstreamStatus(status) => {
                if matches!(status, 401 | 403 | 407) {
                    Disposition::Fatal
                } else {
                    Disposition::Transient
                }
            }
            Self::Tls(_) if tls_verification_disabled => Disposition::Transient,
            Self::Tls(_)
            | Self::InvalidTarget(_)
            | Self::MalformedStream { .. }
            | Self::Serialization(_)
            | Self::AlreadyRunning => Disposition::Fatal,
            Self::Decode(_) => Disposition::SkipFrame,
            Self::PeerDisconnected | Self::WebSocket(_) => Disposition::Disconnect,
        }
    }

    /// The component this error is attributed to.
    pub fn component(&self) -> Component {
        match self {
            Self::InvalidTarget(_) => Component::Target,
            Self::Decode(_) => Component::Transcoder,
            Self::PeerDisconnected | Self::WebSocket(_) | Self::Serialization(_) => {
                Component::Channel
            }
            Self::AlreadyRunning => Component::Server,
            _ => Component::Upstream,
        }
    }

    /// Stable snake_case name used in downstream error envelopes.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::InvalidTarget(_) => "invalid_target",
            Self::ConnectTimeout(_) => "connect_timeout",
            Self::ConnectRefused(_) => "connect_refused",
            Self::Tls(_) => "tls_error",
            Self::UpstreamStatus(_) => "upstream_status",
            Self::Request(_) => "request_failed",
            Self::ReadTimeout(_) => "read_timeout",
            Self::StreamClosed(_) => "stream_closed",
            Self::MalformedStream { .. } => "malformed_stream",
            Self::Decode(_) => "decode_error",
            Self::PeerDisconnected => "peer_disconnected",
            Self::WebSocket(_) => "websocket",
            Self::Serialization(_) => "serialization",
            Self::AlreadyRunning => "already_running",
        }
    }
}

/// Convenience alias for `Result<T, RelayError>`.
pub type Result<T> = std::result::Result<T, RelayError>;
