use url::Url;

use crate::error::{RelayError, Result};

/// The camera endpoint a session streams from.
///
/// Validated on construction and immutable afterwards; a reconnect always
/// reuses the same target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTarget {
    url: Url,
    headers: Vec<(String, String)>,
}

impl StreamTarget {
    /// Parse and validate a camera URL.
    ///
    /// Requires an `http` or `https` scheme and a non-empty host.
    ///
    /// ## Examples
    ///
    /// ```
    /// use mjpeg_relay::session::StreamTarget;
    ///
    /// let t = StreamTarget::parse("http://10.0.0.7:8080/video.mjpg", Vec::new()).unwrap();
    /// assert_eq!(t.as_str(), "http://10.0.0.7:8080/video.mjpg");
    ///
    /// assert!(StreamTarget::parse("not a url", Vec::new()).is_err());
    /// assert!(StreamTarget::parse("file:///dev/video0", Vec::new()).is_err());
    /// ```
    pub fn parse(raw: &str, headers: Vec<(String, String)>) -> Result<Self> {
        let raw = raw.trim();
        let url = Url::parse(raw).map_err(|e| RelayError::InvalidTarget(format!("{raw}: {e}")))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(RelayError::InvalidTarget(format!(
                "{raw}: unsupported scheme '{}'",
                url.scheme()
            )));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(RelayError::InvalidTarget(format!("{raw}: missing host")));
        }

        Ok(Self { url, headers })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }
}
