//! Server dispatch engine: the accept loop, per-connection handshake and
//! decode state machine, label-operator handling, and multicast fanout.
//!
//! Grounded on the reference `pkg/server/server.go` state machine and on
//! the teacher's `ipc::run`/`handle_connection` accept-loop-with-shutdown
//! and HTTP-vs-upgrade peeking pattern.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::connection::{ByteStream, Connection, ConnectionId};
use crate::error::{BrokerError, Result};
use crate::frame::{Action, Frame};
use crate::metrics::SharedMetrics;
use crate::observability::HealthStatus;
use crate::registry::LabelRegistry;
use crate::ws::WsByteStream;

/// Shared broker state: one instance per running server, held behind an
/// `Arc` and cloned into every connection task.
pub struct BrokerState {
    pub config: BrokerConfig,
    pub registry: LabelRegistry,
    pub metrics: SharedMetrics,
}

impl BrokerState {
    pub fn new(config: BrokerConfig, metrics: SharedMetrics) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: LabelRegistry::new(),
            metrics,
        })
    }
}

/// Run the accept loop until `shutdown` fires. Also starts a dedicated
/// WebSocket accept loop if `ws_listen_addr` is configured.
pub async fn serve(state: Arc<BrokerState>, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let listener = TcpListener::bind(state.config.listen_addr).await?;
    info!(addr = %state.config.listen_addr, "broker listening");

    if let Some(ws_addr) = state.config.ws_listen_addr {
        let ws_state = state.clone();
        let mut ws_shutdown = shutdown.resubscribe();
        tokio::spawn(async move {
            if let Err(e) = serve_ws_only(ws_state, ws_addr, &mut ws_shutdown).await {
                error!(err = %e, "websocket listener exited");
            }
        });
    }

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("shutdown requested, accept loop stopping");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = accept_sniffed(state, stream, peer).await {
                        debug!(%peer, err = %e, "connection ended");
                    }
                });
            }
        }
    }
}

async fn serve_ws_only(
    state: Arc<BrokerState>,
    addr: SocketAddr,
    shutdown: &mut broadcast::Receiver<()>,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "websocket listener listening");
    loop {
        tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = upgrade_and_handle(state, stream, peer).await {
                        debug!(%peer, err = %e, "websocket connection ended");
                    }
                });
            }
        }
    }
}

/// Peek the first bytes of a freshly accepted stream to tell apart a raw
/// binary-protocol client, an HTTP health/metrics probe, and a WebSocket
/// upgrade request, without consuming bytes the protocol decoder needs.
async fn accept_sniffed(state: Arc<BrokerState>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let mut probe = [0u8; 24];
    let n = stream.peek(&mut probe).await?;
    let head = &probe[..n];

    if head.starts_with(b"GET /health") {
        return serve_health(stream, &state).await;
    }
    if head.starts_with(b"GET /metrics") {
        return serve_metrics(stream, &state).await;
    }
    if head.starts_with(b"GET ") {
        return upgrade_and_handle(state, stream, peer).await;
    }

    let boxed: Box<dyn ByteStream> = Box::new(stream);
    handle_connection(state, boxed, peer).await
}

async fn upgrade_and_handle(state: Arc<BrokerState>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| BrokerError::protocol(format!("websocket upgrade failed: {e}")))?;
    let boxed: Box<dyn ByteStream> = Box::new(WsByteStream::new(ws));
    handle_connection(state, boxed, peer).await
}

async fn serve_health(mut stream: TcpStream, state: &BrokerState) -> Result<()> {
    let body = serde_json::to_string(&HealthStatus::ok(
        state.metrics.uptime_secs(),
        state.metrics.active_connections(),
    ))
    .expect("HealthStatus always serializes");
    write_http_response(&mut stream, "application/json", &body).await
}

async fn serve_metrics(mut stream: TcpStream, state: &BrokerState) -> Result<()> {
    let body = state.metrics.render_prometheus();
    write_http_response(&mut stream, "text/plain; version=0.0.4", &body).await
}

async fn write_http_response(stream: &mut TcpStream, content_type: &str, body: &str) -> Result<()> {
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Drive one connection through `AWAIT_HANDSHAKE -> READY -> CLOSED`.
async fn handle_connection(
    state: Arc<BrokerState>,
    stream: Box<dyn ByteStream>,
    peer: SocketAddr,
) -> Result<()> {
    state.metrics.inc_connections_accepted();
    let (mut read_half, write_half) = tokio::io::split(stream);
    let conn = Connection::new(write_half, state.config.conn_write_timeout);
    debug!(%peer, conn = %conn.id, "accepted");

    let result = run_connection(&state, &conn, &mut read_half).await;

    state.registry.remove(conn.id);
    conn.mark_closed();
    state.metrics.inc_connection_closed();
    if let Err(ref e) = result {
        debug!(%peer, conn = %conn.id, err = %e, "connection closed");
    }
    result
}

async fn run_connection<R>(
    state: &Arc<BrokerState>,
    conn: &Arc<Connection>,
    read_half: &mut R,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    await_handshake(state, conn, read_half).await?;
    ready_loop(state, conn, read_half).await
}

async fn await_handshake<R>(
    state: &Arc<BrokerState>,
    conn: &Arc<Connection>,
    read_half: &mut R,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let frame = tokio::time::timeout(state.config.conn_read_duration, Frame::decode(read_half))
        .await
        .map_err(|_| BrokerError::Timeout)??;

    let valid = matches!(frame.act, Action::Handshake) && frame.payload.as_ref() == state.config.secret;
    if !valid {
        state.metrics.inc_handshake_failures();
        return Err(BrokerError::Auth);
    }
    state.metrics.inc_frames_decoded();
    conn.write_frame(&Frame::response(Bytes::new())).await?;
    state.metrics.inc_frames_encoded();
    Ok(())
}

async fn ready_loop<R>(
    state: &Arc<BrokerState>,
    conn: &Arc<Connection>,
    read_half: &mut R,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame =
            match tokio::time::timeout(state.config.conn_read_duration, Frame::decode(read_half)).await {
                Ok(Ok(frame)) => frame,
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(BrokerError::Timeout),
            };
        state.metrics.inc_frames_decoded();

        match frame.act {
            Action::Response => {
                // Heartbeat: no reply, only keeps the read deadline alive.
            }
            Action::Handshake => {
                return Err(BrokerError::protocol("handshake frame received after registration"));
            }
            Action::Label => {
                let reply = apply_label_op(state, conn, &frame);
                conn.write_frame(&reply).await?;
                state.metrics.inc_frames_encoded();
            }
            Action::Multicast => {
                spawn_fanout(state.clone(), frame);
            }
        }
    }
}

fn apply_label_op(state: &Arc<BrokerState>, conn: &Arc<Connection>, frame: &Frame) -> Frame {
    let outcome = match frame.payload.first() {
        Some(b'+') => {
            state.registry.register(&frame.label, conn.clone());
            Ok(())
        }
        Some(b'-') => {
            if state.registry.dislabel(&frame.label, conn.id) {
                Ok(())
            } else {
                Err("connection label does not exist".to_string())
            }
        }
        Some(b'*') => {
            for part in frame.label.split('|').filter(|p| !p.is_empty()) {
                state.registry.register(part, conn.clone());
            }
            Ok(())
        }
        Some(b'/') => {
            let mut missing = Vec::new();
            for part in frame.label.split('|').filter(|p| !p.is_empty()) {
                if !state.registry.dislabel(part, conn.id) {
                    missing.push(part.to_string());
                }
            }
            if missing.is_empty() {
                Ok(())
            } else {
                Err(format!(
                    "connection label does not exist: {}",
                    missing.join("|")
                ))
            }
        }
        _ => Err("unknown operator".to_string()),
    };

    match outcome {
        Ok(()) => Frame::response(Bytes::new()),
        Err(msg) => Frame::response(Bytes::copy_from_slice(msg.as_bytes())),
    }
}

/// Fan a multicast publication out to every member of its label's pool, in
/// a freshly spawned task per publication and a further task per
/// recipient write. The publisher is not filtered out of its own pool
/// membership — self-receipt is accepted behavior, not a bug.
fn spawn_fanout(state: Arc<BrokerState>, frame: Frame) {
    tokio::spawn(async move {
        state.metrics.inc_multicast_fanouts();
        let encoded = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(err = %e, "dropping multicast frame that failed to re-encode for fanout");
                return;
            }
        };
        let Some(pool) = state.registry.pool(&frame.label) else {
            return;
        };
        for member in pool.iter() {
            let state = state.clone();
            let encoded = encoded.clone();
            tokio::spawn(async move {
                if member.write_raw(&encoded).await.is_err() {
                    state.metrics.inc_fanout_write_failures();
                    state.registry.remove(member.id);
                    member.mark_closed();
                }
            });
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrokerConfig, ConfigOverrides};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncWriteExt as _};

    /// Writes the secret to a throwaway file instead of the process-wide
    /// `CLAWD_BROKER_SECRET` env var, so concurrent tests don't race on it.
    fn test_config(port: u16) -> BrokerConfig {
        let dir = tempfile::tempdir().unwrap();
        let secret_path = dir.path().join("secret");
        std::fs::write(&secret_path, "topsecret").unwrap();
        let cfg = BrokerConfig::load(ConfigOverrides {
            port: Some(port),
            data_dir: Some(dir.path().to_path_buf()),
            secret_file: Some(secret_path),
            ..Default::default()
        })
        .unwrap();
        std::mem::forget(dir);
        cfg
    }

    #[tokio::test]
    async fn rejects_wrong_handshake_secret() {
        let state = BrokerState::new(test_config(0), Arc::new(crate::metrics::BrokerMetrics::new()));
        let (mut client, server) = duplex(4096);

        let boxed: Box<dyn ByteStream> = Box::new(server);
        let handle = tokio::spawn(handle_connection(state.clone(), boxed, "127.0.0.1:1".parse().unwrap()));

        let bad = Frame::handshake(Bytes::from_static(b"wrong"));
        client.write_all(&bad.encode().unwrap()).await.unwrap();
        drop(client);

        let result = handle.await.unwrap();
        assert!(result.is_err());
        assert_eq!(
            state.metrics.handshake_failures.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn accepts_correct_handshake_and_registers_label() {
        let state = BrokerState::new(test_config(0), Arc::new(crate::metrics::BrokerMetrics::new()));
        let (mut client, server) = duplex(8192);

        let boxed: Box<dyn ByteStream> = Box::new(server);
        tokio::spawn(handle_connection(state.clone(), boxed, "127.0.0.1:1".parse().unwrap()));

        let hs = Frame::handshake(Bytes::from_static(b"topsecret"));
        client.write_all(&hs.encode().unwrap()).await.unwrap();
        let reply = Frame::decode(&mut client).await.unwrap();
        assert!(matches!(reply.act, Action::Response));
        assert!(reply.payload.is_empty());

        let label = Frame::label_op("room", b'+');
        client.write_all(&label.encode().unwrap()).await.unwrap();
        let reply = Frame::decode(&mut client).await.unwrap();
        assert!(reply.payload.is_empty());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(state.registry.label_count(), 1);
    }

    #[tokio::test]
    async fn unknown_label_operator_returns_error_response() {
        let state = BrokerState::new(test_config(0), Arc::new(crate::metrics::BrokerMetrics::new()));
        let (mut client, server) = duplex(8192);
        let boxed: Box<dyn ByteStream> = Box::new(server);
        tokio::spawn(handle_connection(state.clone(), boxed, "127.0.0.1:1".parse().unwrap()));

        let hs = Frame::handshake(Bytes::from_static(b"topsecret"));
        client.write_all(&hs.encode().unwrap()).await.unwrap();
        Frame::decode(&mut client).await.unwrap();

        let bad_op = Frame::label_op("room", b'?');
        client.write_all(&bad_op.encode().unwrap()).await.unwrap();
        let reply = Frame::decode(&mut client).await.unwrap();
        assert_eq!(reply.payload.as_ref(), b"unknown operator");
    }

    #[tokio::test]
    async fn dislabel_of_unheld_label_returns_error_response() {
        let state = BrokerState::new(test_config(0), Arc::new(crate::metrics::BrokerMetrics::new()));
        let (mut client, server) = duplex(8192);
        let boxed: Box<dyn ByteStream> = Box::new(server);
        tokio::spawn(handle_connection(state.clone(), boxed, "127.0.0.1:1".parse().unwrap()));

        let hs = Frame::handshake(Bytes::from_static(b"topsecret"));
        client.write_all(&hs.encode().unwrap()).await.unwrap();
        Frame::decode(&mut client).await.unwrap();

        let dislabel = Frame::label_op("room", b'-');
        client.write_all(&dislabel.encode().unwrap()).await.unwrap();
        let reply = Frame::decode(&mut client).await.unwrap();
        assert_eq!(reply.payload.as_ref(), b"connection label does not exist");
    }
}
