//! The tunnel proxy server: readiness gate, local listener, and the
//! registry of live connection forwarders.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::{Credentials, ProxyConfig, TunnelTarget};
use crate::error::{FatalCause, ProxyError};
use crate::forwarder::{Forwarder, ForwarderEvent};
use crate::poller::wait_until_ready;
use crate::sink::LogSink;
use crate::status::RemoteStatusChecker;

/// Local TCP front for one remote WebSocket tunnel.
///
/// `start_proxy()` waits for remote readiness, then listens on
/// `127.0.0.1:<local_port>`; every accepted connection gets its own
/// [`Forwarder`]. `dispose()` tears everything down and is safe to call at
/// any point, any number of times.
pub struct TunnelProxyServer {
    inner: Arc<Inner>,
}

struct Inner {
    config: ProxyConfig,
    target: TunnelTarget,
    credentials: Credentials,
    log: Arc<dyn LogSink>,
    cancel: CancellationToken,
    registry: Mutex<HashMap<u64, Forwarder>>,
    next_id: AtomicU64,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TunnelProxyServer {
    pub fn new(
        config: ProxyConfig,
        target: TunnelTarget,
        credentials: Credentials,
        log: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                target,
                credentials,
                log,
                cancel: CancellationToken::new(),
                registry: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                local_addr: Mutex::new(None),
                accept_task: Mutex::new(None),
            }),
        }
    }

    /// Waits for the remote to become ready, then starts listening.
    ///
    /// No local socket exists until the readiness check has succeeded, so
    /// no client can connect prematurely. Fails with whatever the readiness
    /// wait raised, or with [`ProxyError::Listen`] on a bind failure.
    pub async fn start_proxy(&self) -> Result<(), ProxyError> {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return Err(ProxyError::Disposed);
        }

        let checker = RemoteStatusChecker::new(
            inner.target.clone(),
            inner.credentials.clone(),
            inner.log.clone(),
        )
        .map_err(|e| ProxyError::Failed(FatalCause::StatusQuery(e)))?;

        wait_until_ready(
            &checker,
            inner.config.is_ssh_tunnel,
            inner.config.ready_timeout,
            inner.config.poll_interval,
            &inner.cancel,
            inner.log.as_ref(),
        )
        .await?;

        let listener = bind_local(inner.config.local_port).map_err(|source| ProxyError::Listen {
            port: inner.config.local_port,
            source,
        })?;
        let addr = listener.local_addr().map_err(|source| ProxyError::Listen {
            port: inner.config.local_port,
            source,
        })?;
        *inner.local_addr.lock().unwrap() = Some(addr);
        inner.log.append(&format!("tunnel proxy listening on {addr}"));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(reap_closed(inner.clone(), events_rx));
        let task = tokio::spawn(accept_loop(inner.clone(), listener, events_tx));
        *inner.accept_task.lock().unwrap() = Some(task);
        Ok(())
    }

    /// Address of the listening socket, once `start_proxy()` has succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().unwrap()
    }

    /// Number of currently open tunneled connections.
    pub fn open_connections(&self) -> usize {
        self.inner.registry.lock().unwrap().len()
    }

    /// Disposes every live forwarder and releases the listening socket.
    ///
    /// Idempotent; also interrupts a `start_proxy()` call still waiting for
    /// remote readiness.
    pub async fn dispose(&self) {
        let inner = &self.inner;
        if !inner.cancel.is_cancelled() {
            inner.log.append("disposing tunnel proxy");
        }
        inner.cancel.cancel();

        let forwarders: Vec<Forwarder> = {
            let mut registry = inner.registry.lock().unwrap();
            registry.drain().map(|(_, f)| f).collect()
        };
        for forwarder in &forwarders {
            forwarder.dispose();
        }

        let task = inner.accept_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

fn bind_local(port: u16) -> std::io::Result<TcpListener> {
    let socket = TcpSocket::new_v4()?;
    socket.bind(SocketAddr::from(([127, 0, 0, 1], port)))?;
    // Backlog of 1: this proxy fronts one interactive session at a time.
    socket.listen(1)
}

async fn accept_loop(
    inner: Arc<Inner>,
    listener: TcpListener,
    events: mpsc::UnboundedSender<ForwarderEvent>,
) {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let id = inner.next_id.fetch_add(1, Ordering::SeqCst);
                    let forwarder = Forwarder::spawn(
                        id,
                        stream,
                        &inner.target,
                        &inner.credentials,
                        inner.cancel.child_token(),
                        events.clone(),
                        inner.log.clone(),
                    );
                    let open = {
                        let mut registry = inner.registry.lock().unwrap();
                        registry.insert(id, forwarder);
                        registry.len()
                    };
                    inner
                        .log
                        .append(&format!("connection #{id} accepted from {peer} ({open} open)"));
                }
                Err(e) => {
                    error!("listener error: {e}");
                    inner.log.append(&format!("listener error: {e}; shutting down proxy"));
                    inner.cancel.cancel();
                    break;
                }
            }
        }
    }
    // Dropping the listener here releases the local port.
    debug!("accept loop finished");
}

async fn reap_closed(inner: Arc<Inner>, mut events: mpsc::UnboundedReceiver<ForwarderEvent>) {
    while let Some(event) = events.recv().await {
        let open = {
            let mut registry = inner.registry.lock().unwrap();
            registry.remove(&event.id());
            registry.len()
        };
        debug!(id = event.id(), open, "forwarder finished");
    }
}
