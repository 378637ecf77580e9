//! Bounded-duration readiness polling.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{FatalCause, ProxyError};
use crate::sink::LogSink;
use crate::status::{classify, Classification, RetryCause, StatusProbe};

/// Polls `probe` until the remote classifies as ready.
///
/// Returns as soon as a poll classifies Ready; fails immediately on a fatal
/// classification or a status-query failure; otherwise sleeps `interval`
/// between polls until `timeout` elapses. Cancelling `cancel` interrupts
/// the wait at the next suspension point and no further polls happen.
pub async fn wait_until_ready<P: StatusProbe>(
    probe: &P,
    is_ssh_tunnel: bool,
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
    log: &dyn LogSink,
) -> Result<(), ProxyError> {
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        if cancel.is_cancelled() {
            return Err(ProxyError::Disposed);
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => return Err(ProxyError::Disposed),
            result = probe.check_status() => {
                result.map_err(|e| ProxyError::Failed(FatalCause::StatusQuery(e)))?
            }
        };

        let retry = match classify(&status, is_ssh_tunnel) {
            Classification::Ready => {
                log.append(&format!(
                    "remote is ready (port {} reachable)",
                    status.port
                ));
                return Ok(());
            }
            Classification::Fatal(cause) => return Err(ProxyError::Failed(cause)),
            Classification::Retry(cause) => cause,
        };

        match &retry {
            RetryCause::Starting => {
                log.append(&format!(
                    "remote is starting; retrying in {}s",
                    interval.as_secs()
                ));
            }
            RetryCause::Stopped => {
                log.append("remote is stopped; sending wake ping");
                probe.ping_wake().await;
            }
            RetryCause::PortSwitching { reported } => {
                log.append(&format!(
                    "remote is still switching ports (reported {reported}); retrying in {}s",
                    interval.as_secs()
                ));
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(ProxyError::Disposed),
            _ = tokio::time::sleep(interval) => {}
        }
    }

    Err(ProxyError::Timeout(timeout))
}
