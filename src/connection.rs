//! A single accepted connection: transport-agnostic byte stream, identity,
//! and a write path serialized by a per-connection lock so the read loop
//! and concurrent multicast fanout tasks never interleave partial frames.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::Mutex;

use crate::error::{BrokerError, Result};
use crate::frame::Frame;

/// Any duplex byte stream a connection can run over (raw TCP, or a
/// WebSocket binary-frame adapter). Transport adapters besides TCP are
/// external collaborators; this is the contract they must satisfy.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque per-connection identity, stable for the connection's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A live connection's write-side handle. Shared (via `Arc`) between the
/// owning read loop, the registry's pools, and any multicast fanout task
/// currently writing to this connection.
pub struct Connection {
    pub id: ConnectionId,
    write_half: Mutex<WriteHalf<Box<dyn ByteStream>>>,
    write_timeout: Duration,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(write_half: WriteHalf<Box<dyn ByteStream>>, write_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::next(),
            write_half: Mutex::new(write_half),
            write_timeout,
            closed: AtomicBool::new(false),
        })
    }

    /// Encode and write a frame, bounded by the connection's write timeout.
    pub async fn write_frame(&self, frame: &Frame) -> Result<()> {
        let encoded = frame.encode()?;
        self.write_raw(&encoded).await
    }

    /// Write pre-encoded wire bytes verbatim — used by multicast fanout,
    /// which forwards the publisher's already-encoded frame without
    /// re-encoding it per recipient.
    pub async fn write_raw(&self, bytes: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Transport(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connection closed",
            )));
        }
        let mut half = self.write_half.lock().await;
        tokio::time::timeout(self.write_timeout, half.write_all(bytes))
            .await
            .map_err(|_| BrokerError::Timeout)??;
        Ok(())
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Action;
    use tokio::io::duplex;

    fn boxed_stream(
        s: tokio::io::DuplexStream,
    ) -> (
        tokio::io::ReadHalf<Box<dyn ByteStream>>,
        tokio::io::WriteHalf<Box<dyn ByteStream>>,
    ) {
        let boxed: Box<dyn ByteStream> = Box::new(s);
        tokio::io::split(boxed)
    }

    #[tokio::test]
    async fn write_frame_roundtrips_through_stream() {
        let (client, server) = duplex(4096);
        let (_r, w) = boxed_stream(server);
        let conn = Connection::new(w, Duration::from_secs(1));

        let frame = Frame::multicast("room", bytes::Bytes::from_static(b"hi"));
        conn.write_frame(&frame).await.unwrap();

        let mut client = client;
        let decoded = Frame::decode(&mut client).await.unwrap();
        assert!(matches!(decoded.act, Action::Multicast));
        assert_eq!(decoded.label, "room");
    }

    #[tokio::test]
    async fn write_after_close_fails() {
        let (_client, server) = duplex(4096);
        let (_r, w) = boxed_stream(server);
        let conn = Connection::new(w, Duration::from_secs(1));
        conn.mark_closed();

        let frame = Frame::response(bytes::Bytes::new());
        assert!(conn.write_frame(&frame).await.is_err());
    }
}
