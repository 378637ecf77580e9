//! Immutable proxy configuration: credentials, remote target, local port.

use std::fmt;
use std::time::Duration;

use url::Url;

/// Path of the status-check endpoint on the tunnel host.
const STATUS_PATH: &str = "status";

/// Query string selecting the v2 status API.
const STATUS_QUERY: &str = "GetStatus&GetStatusAPIVer=2";

/// Path of the WebSocket tunnel endpoint on the tunnel host.
const WS_PATH: &str = "tunnel";

/// Basic-auth pair used for both the status endpoint and the WebSocket
/// handshake. Immutable for the lifetime of a proxy instance.
#[derive(Clone)]
pub struct Credentials {
    pub user: String,
    secret: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            secret: secret.into(),
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

// Keep the secret out of logs and error chains.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// The remote tunnel endpoint: status URL, wake URL, and WebSocket URL,
/// all derived from a single host name.
#[derive(Debug, Clone)]
pub struct TunnelTarget {
    status_url: Url,
    wake_url: Url,
    ws_url: Url,
}

impl TunnelTarget {
    /// Builds the standard secure URLs for a tunnel host.
    pub fn new(host: &str) -> Result<Self, url::ParseError> {
        let status_url = Url::parse(&format!("https://{host}/{STATUS_PATH}?{STATUS_QUERY}"))?;
        let wake_url = Url::parse(&format!("https://{host}/"))?;
        let ws_url = Url::parse(&format!("wss://{host}/{WS_PATH}"))?;
        Ok(Self {
            status_url,
            wake_url,
            ws_url,
        })
    }

    /// Builds a target from explicit URLs, for deployments that do not use
    /// the standard paths.
    pub fn from_urls(status_url: Url, wake_url: Url, ws_url: Url) -> Self {
        Self {
            status_url,
            wake_url,
            ws_url,
        }
    }

    pub fn status_url(&self) -> &Url {
        &self.status_url
    }

    pub fn wake_url(&self) -> &Url {
        &self.wake_url
    }

    pub fn ws_url(&self) -> &Url {
        &self.ws_url
    }
}

/// Proxy instance configuration. Immutable after construction.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Local port to listen on. Port 0 picks an ephemeral port.
    pub local_port: u16,

    /// Whether this proxy fronts the remote's SSH port rather than an
    /// application port. Affects status interpretation only.
    pub is_ssh_tunnel: bool,

    /// Upper bound on the readiness wait. Matches the remote platform's own
    /// application-start timeout.
    pub ready_timeout: Duration,

    /// Pause between readiness polls.
    pub poll_interval: Duration,
}

impl ProxyConfig {
    pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(240);
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

    pub fn new(local_port: u16, is_ssh_tunnel: bool) -> Self {
        Self {
            local_port,
            is_ssh_tunnel,
            ready_timeout: Self::DEFAULT_READY_TIMEOUT,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }
}
