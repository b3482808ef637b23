use std::time::Duration;

use clap::{Parser, ValueEnum};
use mjpeg_relay::config::{DEFAULT_LISTEN_ADDR, DEFAULT_MAX_BUFFERED_BYTES};
use mjpeg_relay::{AttemptReset, Keepalive, RelayConfig, Server, TargetMode, WireMode};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "mjpeg-relay",
    about = "Relay MJPEG camera streams to WebSocket consumers"
)]
struct Args {
    /// Listen address (host:port)
    #[arg(long, short, default_value = DEFAULT_LISTEN_ADDR)]
    listen: String,

    /// Camera URL served to every consumer. Without it, each consumer
    /// sends the URL as its first message.
    #[arg(long, short)]
    url: Option<String>,

    /// Downstream wire format: json or binary
    #[arg(long, default_value = "json")]
    wire: WireMode,

    /// JPEG re-encode quality (1-100)
    #[arg(long, default_value_t = 70)]
    quality: u8,

    /// Delay after every frame sent, in milliseconds
    #[arg(long, default_value_t = 40)]
    pacing_ms: u64,

    /// Reconnects allowed before a session fails
    #[arg(long, default_value_t = 3)]
    max_reconnects: u32,

    /// Wait before each reconnect, in milliseconds
    #[arg(long, default_value_t = 2000)]
    reconnect_delay_ms: u64,

    /// When the reconnect budget is restored
    #[arg(long, value_enum, default_value_t = ResetArg::Frame)]
    reset_attempts: ResetArg,

    /// Extra request header for the camera, "Name: value" (repeatable)
    #[arg(long = "header", short = 'H', value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Camera connect timeout, in seconds
    #[arg(long, default_value_t = 10)]
    connect_timeout_secs: u64,

    /// Longest wait for the next frame, in seconds
    #[arg(long, default_value_t = 10)]
    read_timeout_secs: u64,

    /// Bytes buffered without a complete frame before giving up
    #[arg(long, default_value_t = DEFAULT_MAX_BUFFERED_BYTES)]
    max_buffer_bytes: usize,

    /// Skip TLS certificate verification for camera connections
    #[arg(long)]
    insecure: bool,

    /// Send an advisory HEAD request before streaming
    #[arg(long)]
    probe: bool,

    /// Label included in JSON frame messages
    #[arg(long)]
    camera_name: Option<String>,

    /// Keepalive ping interval towards consumers, in seconds (0 disables)
    #[arg(long, default_value_t = 30)]
    ping_interval_secs: u64,

    /// Disconnect a consumer that does not answer a ping within this many seconds
    #[arg(long, default_value_t = 10)]
    ping_timeout_secs: u64,

    /// How long a consumer may take to send the camera URL, in seconds
    #[arg(long, default_value_t = 30)]
    url_timeout_secs: u64,
}

#[derive(Clone, Copy, ValueEnum)]
enum ResetArg {
    /// After every delivered frame
    Frame,
    /// Never; one budget per session
    Session,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected \"Name: value\", got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in '{raw}'"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

impl Args {
    fn into_config(self) -> RelayConfig {
        let mut config = RelayConfig {
            listen_addr: self.listen,
            target_mode: match self.url {
                Some(url) => TargetMode::Fixed(url),
                None => TargetMode::Dynamic,
            },
            wire_mode: self.wire,
            quality: self.quality,
            pacing: Duration::from_millis(self.pacing_ms),
            camera_name: self.camera_name,
            keepalive: (self.ping_interval_secs > 0).then(|| Keepalive {
                ping_interval: Duration::from_secs(self.ping_interval_secs),
                pong_timeout: Duration::from_secs(self.ping_timeout_secs),
            }),
            target_timeout: Duration::from_secs(self.url_timeout_secs),
            ..RelayConfig::default()
        };

        config.reconnect.max_attempts = self.max_reconnects;
        config.reconnect.backoff = Duration::from_millis(self.reconnect_delay_ms);
        config.reconnect.reset = match self.reset_attempts {
            ResetArg::Frame => AttemptReset::OnFrameDelivered,
            ResetArg::Session => AttemptReset::PerSession,
        };

        let upstream = &mut config.upstream;
        upstream.connect_timeout = Duration::from_secs(self.connect_timeout_secs);
        upstream.read_timeout = Duration::from_secs(self.read_timeout_secs);
        upstream.max_buffered_bytes = self.max_buffer_bytes;
        upstream.accept_invalid_certs = self.insecure;
        upstream.probe_with_head = self.probe;
        for (name, value) in self.headers {
            upstream.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
            upstream.headers.push((name, value));
        }

        config
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Args::parse().into_config();

    let mut server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("Failed to create relay: {}", e);
            std::process::exit(1);
        }
    };

    let addr = match server.start().await {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("Failed to start server: {}", e);
            std::process::exit(1);
        }
    };

    println!("MJPEG relay on ws://{} (Ctrl+C to stop)", addr);

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
    }

    server.stop().await;
}
