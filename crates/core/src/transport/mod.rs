//! Downstream delivery.
//!
//! The relay speaks to each consumer over one WebSocket:
//!
//! - **TCP** ([`tcp`]): accept loop; one task per connection performs the
//!   WebSocket upgrade, resolves the camera URL and runs a session.
//!
//! - **WebSocket** ([`ws`]): [`RelayChannel`] implementation that writes
//!   frame and error messages and watches the read side for the peer going
//!   away.
//!
//! Message layouts live in [`message`].

pub mod message;
pub mod tcp;
pub mod ws;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::{Component, RelayError, Result};
use crate::media::EncodedFrame;
pub use ws::WsChannel;

/// How frames are put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireMode {
    /// JSON envelope with the JPEG base64-encoded plus frame metadata.
    #[default]
    Json,
    /// One binary message per frame carrying the raw JPEG bytes.
    Binary,
}

impl FromStr for WireMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "binary" | "raw" => Ok(Self::Binary),
            other => Err(format!("unknown wire mode '{other}' (expected json or binary)")),
        }
    }
}

impl fmt::Display for WireMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Binary => write!(f, "binary"),
        }
    }
}

/// Terminal failure details sent to the consumer.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub kind: &'static str,
    pub message: String,
    pub component: Component,
    pub camera_url: Option<String>,
    pub reconnect_attempts: u32,
    pub timestamp: DateTime<Utc>,
}

impl ErrorReport {
    pub fn new(error: &RelayError, camera_url: Option<&str>, reconnect_attempts: u32) -> Self {
        Self {
            kind: error.kind_name(),
            message: error.to_string(),
            component: error.component(),
            camera_url: camera_url.map(str::to_string),
            reconnect_attempts,
            timestamp: Utc::now(),
        }
    }
}

/// The downstream side of one session.
#[async_trait]
pub trait RelayChannel: Send {
    /// Deliver one frame. Fails with
    /// [`RelayError::PeerDisconnected`] once the consumer is gone.
    async fn send_frame(&mut self, frame: EncodedFrame) -> Result<()>;

    /// Best-effort terminal error; delivery failures are swallowed.
    async fn send_error(&mut self, report: &ErrorReport);

    /// Token cancelled as soon as the peer disconnects, whether noticed on
    /// a failed send or on the receive side.
    fn disconnected(&self) -> CancellationToken;

    /// Close the channel. Idempotent.
    async fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_mode_parses() {
        assert_eq!("json".parse::<WireMode>().unwrap(), WireMode::Json);
        assert_eq!("Binary".parse::<WireMode>().unwrap(), WireMode::Binary);
        assert!("xml".parse::<WireMode>().is_err());
        assert_eq!(WireMode::Binary.to_string(), "binary");
    }

    #[test]
    fn error_report_carries_context() {
        let err = RelayError::UpstreamStatus(503);
        let report = ErrorReport::new(&err, Some("http://cam/video"), 3);
        assert_eq!(report.kind, "upstream_status");
        assert_eq!(report.component, Component::Upstream);
        assert_eq!(report.camera_url.as_deref(), Some("http://cam/video"));
        assert_eq!(report.reconnect_attempts, 3);
        assert!(report.message.contains("503"));
    }
}
