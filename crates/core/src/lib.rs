pub mod config;
pub mod error;
pub mod media;
pub mod server;
pub mod session;
pub mod transport;
pub mod upstream;

pub use config::{AttemptReset, Keepalive, ReconnectPolicy, RelayConfig, TargetMode, UpstreamConfig};
pub use error::{RelayError, Result};
pub use media::Transcoder;
pub use server::Server;
pub use session::{SessionInfo, SessionPhase};
pub use transport::WireMode;
