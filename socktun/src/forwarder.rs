//! Per-connection bridge between one local TCP socket and one outbound
//! WebSocket connection.
//!
//! A forwarder owns both legs exclusively. It has no retry policy: the
//! first leg to close or error ends the connection, both legs are torn
//! down, and exactly one terminal event reaches the owner.

use std::sync::Arc;

use base64::prelude::*;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{Credentials, TunnelTarget};
use crate::sink::LogSink;
use crate::USER_AGENT;

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Terminal notification emitted exactly once per forwarder.
#[derive(Debug)]
pub enum ForwarderEvent {
    Closed { id: u64 },
    Errored { id: u64, error: String },
}

impl ForwarderEvent {
    pub fn id(&self) -> u64 {
        match self {
            ForwarderEvent::Closed { id } | ForwarderEvent::Errored { id, .. } => *id,
        }
    }
}

/// Fault on either leg of one tunneled connection. Never surfaced past the
/// affected connection.
#[derive(Debug, thiserror::Error)]
enum LegError {
    #[error("local socket error: {0}")]
    Local(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("invalid websocket request: {0}")]
    Request(#[from] http::Error),
}

/// Handle to one running connection forwarder.
pub struct Forwarder {
    id: u64,
    cancel: CancellationToken,
}

impl Forwarder {
    /// Takes ownership of an accepted local socket and begins async setup.
    ///
    /// The socket is not read until the WebSocket handshake completes, so
    /// bytes arriving early wait in the OS receive buffer instead of being
    /// dropped. Exactly one [`ForwarderEvent`] is sent on `events` when the
    /// connection reaches its terminal state.
    pub fn spawn(
        id: u64,
        local: TcpStream,
        target: &TunnelTarget,
        credentials: &Credentials,
        cancel: CancellationToken,
        events: mpsc::UnboundedSender<ForwarderEvent>,
        log: Arc<dyn LogSink>,
    ) -> Self {
        let target = target.clone();
        let credentials = credentials.clone();
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            let event = match pump(id, local, &target, &credentials, &task_cancel).await {
                Ok(()) => {
                    log.append(&format!("connection #{id} closed"));
                    ForwarderEvent::Closed { id }
                }
                Err(e) => {
                    log.append(&format!("connection #{id} failed: {e}"));
                    ForwarderEvent::Errored {
                        id,
                        error: e.to_string(),
                    }
                }
            };
            let _ = events.send(event);
        });

        Self { id, cancel }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Tears down both legs. Idempotent; safe from any error path.
    pub fn dispose(&self) {
        self.cancel.cancel();
    }
}

/// Client handshake request for the tunnel endpoint: basic auth plus
/// cache-bypass headers so no intermediary interferes with the upgrade.
fn build_ws_request(
    target: &TunnelTarget,
    credentials: &Credentials,
) -> Result<http::Request<()>, http::Error> {
    let ws_url = target.ws_url();
    let host = match (ws_url.host_str(), ws_url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => "localhost".to_string(),
    };
    let auth = BASE64_STANDARD.encode(format!("{}:{}", credentials.user, credentials.secret()));

    http::Request::builder()
        .uri(ws_url.as_str())
        .header("Host", host)
        .header("Authorization", format!("Basic {auth}"))
        .header("User-Agent", USER_AGENT)
        .header("Cache-Control", "no-cache")
        .header("Pragma", "no-cache")
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header(
            "Sec-WebSocket-Key",
            tungstenite::handshake::client::generate_key(),
        )
        .body(())
}

/// Connects the outbound leg, then shuttles bytes until either leg ends.
async fn pump(
    id: u64,
    local: TcpStream,
    target: &TunnelTarget,
    credentials: &Credentials,
    cancel: &CancellationToken,
) -> Result<(), LegError> {
    let request = build_ws_request(target, credentials)?;

    let ws = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        connected = connect_async(request) => {
            let (ws, response) = connected?;
            debug!(id, status = %response.status(), "websocket leg established");
            ws
        }
    };

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (mut local_rx, mut local_tx) = local.into_split();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_tx.close().await;
                return Ok(());
            }
            read = local_rx.read(&mut buf) => match read {
                Ok(0) => {
                    debug!(id, "local socket closed");
                    let _ = ws_tx.close().await;
                    return Ok(());
                }
                Ok(n) => {
                    ws_tx
                        .send(WsMessage::Binary(Bytes::copy_from_slice(&buf[..n])))
                        .await?;
                }
                Err(e) => {
                    let _ = ws_tx.close().await;
                    return Err(e.into());
                }
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(WsMessage::Binary(data))) => {
                    local_tx.write_all(&data).await?;
                }
                Some(Ok(WsMessage::Ping(data))) => {
                    ws_tx.send(WsMessage::Pong(data)).await?;
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!(id, ?frame, "websocket leg closed");
                    return Ok(());
                }
                // Text, pong, and raw frames carry no tunneled bytes.
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => {
                    debug!(id, "websocket stream ended");
                    return Ok(());
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_hdr_async;
    use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
    use url::Url;

    use super::*;
    use crate::sink::NullSink;

    fn test_target(ws_addr: SocketAddr) -> TunnelTarget {
        TunnelTarget::from_urls(
            Url::parse("http://127.0.0.1:1/status").unwrap(),
            Url::parse("http://127.0.0.1:1/").unwrap(),
            Url::parse(&format!("ws://{ws_addr}/tunnel")).unwrap(),
        )
    }

    fn creds() -> Credentials {
        Credentials::new("user", "secret")
    }

    /// Accepted local socket plus the client end that writes into it.
    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (accepted.unwrap().0, client.unwrap())
    }

    fn spawn_forwarder(
        local: TcpStream,
        ws_addr: SocketAddr,
    ) -> (Forwarder, mpsc::UnboundedReceiver<ForwarderEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let forwarder = Forwarder::spawn(
            7,
            local,
            &test_target(ws_addr),
            &creds(),
            CancellationToken::new(),
            events_tx,
            Arc::new(NullSink),
        );
        (forwarder, events_rx)
    }

    #[tokio::test]
    async fn buffers_early_bytes_and_forwards_them_in_order() {
        let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_addr = ws_listener.local_addr().unwrap();

        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            let (stream, _) = ws_listener.accept().await.unwrap();
            // Hold the handshake back so local bytes arrive first.
            tokio::time::sleep(Duration::from_millis(200)).await;
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    WsMessage::Binary(data) => frames_tx.send(data.to_vec()).unwrap(),
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
        });

        let (accepted, mut client) = tcp_pair().await;
        let (_forwarder, mut events_rx) = spawn_forwarder(accepted, ws_addr);

        // Written while the websocket leg is still handshaking.
        client.write_all(b"hello ").await.unwrap();
        client.write_all(b"world").await.unwrap();

        let mut received = Vec::new();
        while received.len() < b"hello world".len() {
            let frame = tokio::time::timeout(Duration::from_secs(5), frames_rx.recv())
                .await
                .expect("timed out waiting for forwarded bytes")
                .expect("frame channel closed early");
            received.extend_from_slice(&frame);
        }
        assert_eq!(received, b"hello world");

        // Closing the local socket ends the connection with one event.
        drop(client);
        let event = events_rx.recv().await.unwrap();
        assert!(matches!(event, ForwarderEvent::Closed { id: 7 }));
        assert!(events_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn established_leg_carries_basic_auth_and_echoes_both_ways() {
        let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_addr = ws_listener.local_addr().unwrap();

        let (auth_tx, auth_rx) = tokio::sync::oneshot::channel::<String>();
        tokio::spawn(async move {
            let (stream, _) = ws_listener.accept().await.unwrap();
            let mut ws = accept_hdr_async(stream, move |req: &Request, resp: Response| {
                let auth = req
                    .headers()
                    .get("Authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let _ = auth_tx.send(auth);
                Ok(resp)
            })
            .await
            .unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_binary() && ws.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let (accepted, mut client) = tcp_pair().await;
        let (_forwarder, mut events_rx) = spawn_forwarder(accepted, ws_addr);

        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");

        let auth = auth_rx.await.unwrap();
        let expected = BASE64_STANDARD.encode("user:secret");
        assert_eq!(auth, format!("Basic {expected}"));

        drop(client);
        assert!(matches!(
            events_rx.recv().await.unwrap(),
            ForwarderEvent::Closed { .. }
        ));
    }

    #[tokio::test]
    async fn failed_connect_emits_single_error_event() {
        // Reserve a port, then free it so the connect is refused.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_addr = listener.local_addr().unwrap();
        drop(listener);

        let (accepted, _client) = tcp_pair().await;
        let (_forwarder, mut events_rx) = spawn_forwarder(accepted, ws_addr);

        let event = events_rx.recv().await.unwrap();
        assert!(matches!(event, ForwarderEvent::Errored { id: 7, .. }));
        assert!(events_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn dispose_tears_down_both_legs_once() {
        let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_addr = ws_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = ws_listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let (accepted, mut client) = tcp_pair().await;
        let (forwarder, mut events_rx) = spawn_forwarder(accepted, ws_addr);

        // Make sure the leg is up before disposing.
        client.write_all(b"x").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        forwarder.dispose();
        forwarder.dispose();

        let event = events_rx.recv().await.unwrap();
        assert!(matches!(event, ForwarderEvent::Closed { .. }));
        assert!(events_rx.recv().await.is_none());

        // Local leg is gone: the client observes EOF.
        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
