//! JSON messages sent to consumers.
//!
//! ```text
//! {"type":"frame","image":"/9j/4AAQ...","timestamp":"2024-03-01T08:00:00.040Z",
//!  "frame_number":1,"fps":24.97,"camera_name":"gate"}
//!
//! {"type":"error","error":"connect_timeout","message":"...","timestamp":"...",
//!  "details":{"component":"upstream","camera_url":"http://...","reconnect_attempts":3}}
//! ```
//!
//! Errors are always JSON text, also in binary wire mode.

use base64::prelude::{BASE64_STANDARD, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use super::ErrorReport;
use crate::media::EncodedFrame;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage<'a> {
    Frame {
        image: String,
        timestamp: String,
        frame_number: u64,
        fps: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        camera_name: Option<&'a str>,
    },
    Error {
        error: &'a str,
        message: &'a str,
        timestamp: String,
        details: ErrorDetails<'a>,
    },
}

#[derive(Debug, Serialize)]
pub struct ErrorDetails<'a> {
    pub component: String,
    pub camera_url: Option<&'a str>,
    pub reconnect_attempts: u32,
}

impl<'a> OutboundMessage<'a> {
    pub fn frame(frame: &EncodedFrame, camera_name: Option<&'a str>) -> Self {
        Self::Frame {
            image: BASE64_STANDARD.encode(&frame.payload),
            timestamp: rfc3339(&frame.timestamp),
            frame_number: frame.sequence_number,
            fps: (frame.fps_estimate * 100.0).round() / 100.0,
            camera_name,
        }
    }

    pub fn error(report: &'a ErrorReport) -> Self {
        Self::Error {
            error: report.kind,
            message: &report.message,
            timestamp: rfc3339(&report.timestamp),
            details: ErrorDetails {
                component: report.component.to_string(),
                camera_url: report.camera_url.as_deref(),
                reconnect_attempts: report.reconnect_attempts,
            },
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

fn rfc3339(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use bytes::Bytes;
    use serde_json::Value;

    fn encoded(payload: &'static [u8], seq: u64, fps: f64) -> EncodedFrame {
        EncodedFrame {
            payload: Bytes::from_static(payload),
            sequence_number: seq,
            timestamp: Utc::now(),
            fps_estimate: fps,
        }
    }

    #[test]
    fn frame_envelope_layout() {
        let frame = encoded(&[0xFF, 0xD8, 0xFF, 0xD9], 7, 24.987);
        let json = OutboundMessage::frame(&frame, Some("gate")).to_json().unwrap();
        let v: Value = serde_json::from_str(&json).unwrap();

        assert_eq!(v["type"], "frame");
        assert_eq!(v["image"], "/9j/2Q==");
        assert_eq!(v["frame_number"], 7);
        assert_eq!(v["fps"], 24.99);
        assert_eq!(v["camera_name"], "gate");
        assert!(v["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn camera_name_is_omitted_when_unset() {
        let frame = encoded(b"x", 1, 0.0);
        let json = OutboundMessage::frame(&frame, None).to_json().unwrap();
        let v: Value = serde_json::from_str(&json).unwrap();
        assert!(v.get("camera_name").is_none());
        assert_eq!(v["fps"], 0.0);
    }

    #[test]
    fn error_envelope_layout() {
        let err = RelayError::InvalidTarget("nope".into());
        let report = ErrorReport::new(&err, Some("nope"), 0);
        let json = OutboundMessage::error(&report).to_json().unwrap();
        let v: Value = serde_json::from_str(&json).unwrap();

        assert_eq!(v["type"], "error");
        assert_eq!(v["error"], "invalid_target");
        assert_eq!(v["details"]["component"], "target");
        assert_eq!(v["details"]["camera_url"], "nope");
        assert_eq!(v["details"]["reconnect_attempts"], 0);
        assert!(v["message"].as_str().unwrap().contains("nope"));
    }
}
