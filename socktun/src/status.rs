//! Remote status checking and readiness classification.
//!
//! Fetching is I/O (`RemoteStatusChecker`); deciding retry-vs-fatal is the
//! pure function [`classify`], so the policy is testable without a network.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::config::{Credentials, TunnelTarget};
use crate::error::{FatalCause, StatusError};
use crate::sink::LogSink;
use crate::{SSH_TUNNEL_PORT, USER_AGENT};

const STATUS_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Wire Types
// =============================================================================

/// Application state reported by the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum RemoteState {
    Started,
    Starting,
    Stopped,
    /// Any value outside the known set, kept verbatim for diagnostics.
    Other(String),
}

impl From<String> for RemoteState {
    fn from(value: String) -> Self {
        match value.as_str() {
            "STARTED" => RemoteState::Started,
            "STARTING" => RemoteState::Starting,
            "STOPPED" => RemoteState::Stopped,
            _ => RemoteState::Other(value),
        }
    }
}

/// One status snapshot, produced fresh per poll.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteStatus {
    pub port: u16,
    #[serde(rename = "canReachPort")]
    pub can_reach_port: bool,
    pub state: RemoteState,
    #[serde(rename = "msg", default)]
    pub message: String,
}

// =============================================================================
// Classification
// =============================================================================

/// Why a poll outcome is worth retrying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryCause {
    /// Remote reports STARTING.
    Starting,
    /// Remote reports STOPPED; a wake ping should be issued before retrying.
    Stopped,
    /// Remote reports STARTED but on the wrong port class, which happens
    /// while the tunnel is still switching ports after a restart.
    PortSwitching { reported: u16 },
}

/// Outcome of interpreting one status snapshot.
#[derive(Debug)]
pub enum Classification {
    Ready,
    Retry(RetryCause),
    Fatal(FatalCause),
}

/// Interprets a status snapshot against the expected port class.
///
/// The remote reports port 2222 while its SSH tunnel is up; seeing that
/// port on a non-SSH proxy (or an application port on an SSH proxy) means
/// the remote is still mid-restart, not ready and not failed.
pub fn classify(status: &RemoteStatus, is_ssh_tunnel: bool) -> Classification {
    match &status.state {
        RemoteState::Started => {
            let reported_ssh_port = status.port == SSH_TUNNEL_PORT;
            if reported_ssh_port != is_ssh_tunnel {
                Classification::Retry(RetryCause::PortSwitching {
                    reported: status.port,
                })
            } else if status.can_reach_port {
                Classification::Ready
            } else {
                Classification::Fatal(FatalCause::PortUnreachable {
                    port: status.port,
                    message: status.message.clone(),
                })
            }
        }
        RemoteState::Starting => Classification::Retry(RetryCause::Starting),
        RemoteState::Stopped => Classification::Retry(RetryCause::Stopped),
        RemoteState::Other(state) => Classification::Fatal(FatalCause::UnexpectedState {
            state: state.clone(),
        }),
    }
}

// =============================================================================
// Status Checker
// =============================================================================

/// Capability to fetch the remote status and to wake a stopped remote.
/// Implemented by [`RemoteStatusChecker`] and by scripted mocks in tests.
#[allow(async_fn_in_trait)]
pub trait StatusProbe {
    async fn check_status(&self) -> Result<RemoteStatus, StatusError>;
    async fn ping_wake(&self);
}

/// Issues authenticated status requests against the tunnel host.
pub struct RemoteStatusChecker {
    client: reqwest::Client,
    target: TunnelTarget,
    credentials: Credentials,
    log: Arc<dyn LogSink>,
}

impl RemoteStatusChecker {
    pub fn new(
        target: TunnelTarget,
        credentials: Credentials,
        log: Arc<dyn LogSink>,
    ) -> Result<Self, StatusError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(STATUS_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            target,
            credentials,
            log,
        })
    }
}

impl StatusProbe for RemoteStatusChecker {
    /// Fetches and decodes one status snapshot.
    async fn check_status(&self) -> Result<RemoteStatus, StatusError> {
        let response = self
            .client
            .get(self.target.status_url().clone())
            .basic_auth(&self.credentials.user, Some(self.credentials.secret()))
            .send()
            .await?
            .error_for_status()?;

        let body = response.text().await?;
        let status: RemoteStatus = serde_json::from_str(&body)?;
        tracing::debug!(
            port = status.port,
            can_reach_port = status.can_reach_port,
            state = ?status.state,
            "fetched remote status"
        );
        Ok(status)
    }

    /// Best-effort GET against the default application URL to trigger an
    /// application start. Any response, including an error status, counts
    /// as delivered; the status code is only logged.
    async fn ping_wake(&self) {
        match self.client.get(self.target.wake_url().clone()).send().await {
            Ok(response) => {
                self.log
                    .append(&format!("wake ping delivered (HTTP {})", response.status()));
            }
            Err(e) => {
                self.log.append(&format!("wake ping not delivered: {e}"));
            }
        }
    }
}
