//! socktun - expose a remote WebSocket tunnel as a plain local TCP port.
//!
//! The proxy first polls the remote status endpoint until the target
//! application is confirmed reachable, then listens on a local port and
//! bridges every accepted TCP connection onto its own outbound WebSocket.

pub mod config;
pub mod error;
pub mod forwarder;
pub mod poller;
pub mod server;
pub mod sink;
pub mod status;

pub use config::{Credentials, ProxyConfig, TunnelTarget};
pub use error::{FatalCause, ProxyError, StatusError};
pub use forwarder::{Forwarder, ForwarderEvent};
pub use poller::wait_until_ready;
pub use server::TunnelProxyServer;
pub use sink::{LogSink, TracingSink};
pub use status::{classify, Classification, RemoteState, RemoteStatus, RemoteStatusChecker};

/// User-Agent sent on every status request and WebSocket handshake.
pub(crate) const USER_AGENT: &str = concat!("socktun/", env!("CARGO_PKG_VERSION"));

/// Well-known SSH port reported by the remote while an SSH tunnel is active.
pub(crate) const SSH_TUNNEL_PORT: u16 = 2222;
