//! Broker error kinds, per the error-handling design: transport, protocol,
//! authentication, and application errors each recover differently.

use std::io;

/// Errors surfaced by the frame codec, connection I/O, and registry.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Read/write/accept failure, timeout, or premature EOF. The owning
    /// loop closes the connection; the client triggers reconnect.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// Malformed frame, oversized payload/label, or unknown action byte.
    /// The connection is closed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Handshake mismatch or timeout. The connection is closed without a
    /// response frame.
    #[error("authentication failed")]
    Auth,

    /// Unknown label operator, dislabel of an absent label, or label add on
    /// an already-removed connection. The connection stays open; this is
    /// surfaced to the caller as an `ActResponse` error string.
    #[error("{0}")]
    Application(String),

    /// A request timed out waiting for its response.
    #[error("request timed out")]
    Timeout,
}

impl BrokerError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn application(msg: impl Into<String>) -> Self {
        Self::Application(msg.into())
    }

    /// Whether this error kind warrants tearing down the connection, vs.
    /// replying with an error string and continuing (Application errors).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, BrokerError::Application(_))
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
