//! Error taxonomy for the proxy startup path.
//!
//! Faults local to one tunneled connection never appear here; they are
//! logged and end that connection only.

use std::time::Duration;

use thiserror::Error;

/// Failure while querying the remote status endpoint. Never retried.
#[derive(Debug, Error)]
pub enum StatusError {
    #[error("status request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("status response could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A status classification that ends the readiness wait immediately.
#[derive(Debug, Error)]
pub enum FatalCause {
    #[error(transparent)]
    StatusQuery(#[from] StatusError),

    #[error("remote application started but port {port} is unreachable: {message}")]
    PortUnreachable { port: u16, message: String },

    #[error("remote reported an unexpected state {state:?}")]
    UnexpectedState { state: String },
}

/// Error surfaced by [`TunnelProxyServer::start_proxy`].
///
/// [`TunnelProxyServer::start_proxy`]: crate::server::TunnelProxyServer::start_proxy
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("remote did not become ready within {0:?}")]
    Timeout(Duration),

    #[error("tunnel failed: {0}")]
    Failed(#[from] FatalCause),

    #[error("failed to listen on 127.0.0.1:{port}: {source}")]
    Listen {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("proxy was disposed")]
    Disposed,
}
