//! Relay configuration.
//!
//! Built once at startup and shared read-only (`Arc<RelayConfig>`) by every
//! session. Nothing in the library mutates it after construction.

use std::time::Duration;

use crate::transport::WireMode;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8765";
pub const DEFAULT_QUALITY: u8 = 70;
pub const DEFAULT_PACING: Duration = Duration::from_millis(40);
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_BUFFERED_BYTES: usize = 8 * 1024 * 1024;
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_TARGET_TIMEOUT: Duration = Duration::from_secs(30);

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36";

/// Where a session gets its camera URL from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetMode {
    /// The consumer sends the URL as its first text message.
    Dynamic,
    /// Every session streams the same configured URL; no input is read.
    Fixed(String),
}

/// When the reconnect counter goes back to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptReset {
    /// After every frame delivered downstream.
    OnFrameDelivered,
    /// Never; the budget covers the whole session.
    PerSession,
}

/// Reconnection policy for transient upstream failures.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Reconnects allowed before the session fails.
    pub max_attempts: u32,
    /// Fixed wait before each reconnect.
    pub backoff: Duration,
    pub reset: AttemptReset,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            backoff: DEFAULT_RECONNECT_BACKOFF,
            reset: AttemptReset::OnFrameDelivered,
        }
    }
}

/// WebSocket keepalive towards the consumer.
///
/// A ping goes out every `ping_interval`; a consumer that sends nothing back
/// within `pong_timeout` of a ping is treated as gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

impl Default for Keepalive {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            pong_timeout: DEFAULT_PONG_TIMEOUT,
        }
    }
}

/// HTTP client settings for the camera connection.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Request headers sent with both the probe and the stream request.
    pub headers: Vec<(String, String)>,
    pub connect_timeout: Duration,
    /// Longest time `next_frame` may wait without producing a frame.
    pub read_timeout: Duration,
    /// Unconsumed bytes tolerated before the stream is declared malformed.
    pub max_buffered_bytes: usize,
    /// Skip certificate validation (self-signed camera certificates).
    pub accept_invalid_certs: bool,
    /// Issue an advisory HEAD request before streaming.
    pub probe_with_head: bool,
    pub head_timeout: Duration,
}

impl UpstreamConfig {
    /// Headers that make the request look like an ordinary browser, which
    /// some camera firmwares insist on.
    pub fn browser_headers() -> Vec<(String, String)> {
        [
            ("User-Agent", BROWSER_USER_AGENT),
            ("Accept", "multipart/x-mixed-replace, */*"),
            ("Connection", "keep-alive"),
            ("Cache-Control", "no-cache"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            headers: Self::browser_headers(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            max_buffered_bytes: DEFAULT_MAX_BUFFERED_BYTES,
            accept_invalid_certs: false,
            probe_with_head: false,
            head_timeout: Duration::from_secs(5),
        }
    }
}

/// Top-level relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// WebSocket listen address (host:port).
    pub listen_addr: String,
    pub target_mode: TargetMode,
    pub wire_mode: WireMode,
    /// JPEG re-encode quality, 1–100.
    pub quality: u8,
    /// Delay inserted after every frame sent downstream.
    pub pacing: Duration,
    pub reconnect: ReconnectPolicy,
    /// Optional label echoed in JSON frame envelopes.
    pub camera_name: Option<String>,
    /// `None` disables pings.
    pub keepalive: Option<Keepalive>,
    /// How long a consumer in dynamic mode may take to send the camera URL.
    pub target_timeout: Duration,
    pub upstream: UpstreamConfig,
}

impl RelayConfig {
    /// Quality clamped to the range the JPEG encoder accepts.
    pub fn effective_quality(&self) -> u8 {
        self.quality.clamp(1, 100)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            target_mode: TargetMode::Dynamic,
            wire_mode: WireMode::Json,
            quality: DEFAULT_QUALITY,
            pacing: DEFAULT_PACING,
            reconnect: ReconnectPolicy::default(),
            camera_name: None,
            keepalive: Some(Keepalive::default()),
            target_timeout: DEFAULT_TARGET_TIMEOUT,
            upstream: UpstreamConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.listen_addr, "127.0.0.1:8765");
        assert_eq!(config.pacing, Duration::from_millis(40));
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.reconnect.backoff, Duration::from_secs(2));
        assert!(!config.upstream.accept_invalid_certs);
        let keepalive = config.keepalive.expect("keepalive on by default");
        assert_eq!(keepalive.ping_interval, Duration::from_secs(30));
        assert_eq!(keepalive.pong_timeout, Duration::from_secs(10));
    }

    #[test]
    fn quality_is_clamped() {
        let config = RelayConfig {
            quality: 0,
            ..RelayConfig::default()
        };
        assert_eq!(config.effective_quality(), 1);

        let config = RelayConfig {
            quality: 250,
            ..RelayConfig::default()
        };
        assert_eq!(config.effective_quality(), 100);
    }

    #[test]
    fn browser_headers_accept_multipart() {
        let headers = UpstreamConfig::browser_headers();
        assert!(
            headers
                .iter()
                .any(|(k, v)| k == "Accept" && v.starts_with("multipart/x-mixed-replace"))
        );
        assert!(headers.iter().any(|(k, _)| k == "User-Agent"));
    }
}
