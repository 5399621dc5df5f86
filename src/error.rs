//! Error types for the client core.
//!
//! Handler failures are plain `anyhow::Error`s; they are caught, logged,
//! and discarded by the dispatcher. The types here cover the session
//! lifecycle: why a connection ended, and why a send was refused.

use thiserror::Error;

/// Why a session ended.
///
/// A clean disconnect (the user called [`disconnect`](crate::state::IrcState::disconnect),
/// or the server closed the stream without incident) carries no cause; the
/// on-disconnect action receives `None` in that case.
#[derive(Debug, Error)]
pub enum Disconnect {
    /// No frame arrived within the configured read timeout.
    #[error("read timed out")]
    Timeout,

    /// The socket failed.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// TLS setup or handshake failed.
    #[error("tls error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),

    /// The peer violated the protocol in a way the session cannot survive.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Why a message was not accepted for sending.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The session is not in the Connected phase; the send queue is closed.
    #[error("not connected: the send queue is closed")]
    NotConnected,
}
