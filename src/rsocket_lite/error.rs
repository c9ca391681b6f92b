use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::rsocket_lite::frame::FrameType;
use crate::rsocket_lite::payload::CodecError;
use crate::rsocket_lite::session::SessionToken;

/// Errors raised while building, dialing, or writing to a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("TLS error")]
    Tls(#[from] rustls::Error),

    /// Key or trust material could not be loaded.
    #[error("failed to load TLS material from {}: {reason}", path.display())]
    TlsMaterial { path: PathBuf, reason: String },

    #[error("invalid TLS server name '{0}'")]
    InvalidServerName(String),

    #[error("websocket error")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid endpoint")]
    InvalidEndpoint(#[from] url::ParseError),

    /// A received frame could not be decoded.
    #[error("frame decode error")]
    Decode(#[from] prost::DecodeError),

    #[error("server did not answer the handshake in time")]
    HandshakeTimeout,

    /// The server refused the setup frame.
    #[error("server rejected setup (code {code:#x}): {message}")]
    Rejected { code: u32, message: String },

    #[error("unexpected {0:?} frame during handshake")]
    UnexpectedFrame(FrameType),

    /// The transport closed while an operation was in flight.
    #[error("transport closed")]
    Closed,

    /// No live connection exists for the operation.
    #[error("no live connection")]
    NotConnected,
}

/// The server refused to resume a session. Handled internally by reconnecting with a fresh
/// session, and reported through connection events.
#[derive(Debug, Clone, Error)]
#[error("server rejected resumption of session {token}: {message}")]
pub struct ResumptionRejected {
    pub token: SessionToken,
    pub message: String,
}

/// Errors returned by
/// [`ConnectionManager::connect`](crate::rsocket_lite::ConnectionManager::connect).
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The manager already holds a live connection.
    #[error("session {0} is still live")]
    AlreadyConnected(SessionToken),

    /// The transport configuration could not be turned into a connector.
    #[error("invalid transport configuration")]
    InvalidConfig(#[source] TransportError),

    /// Dialing or handshaking failed.
    #[error("failed to establish a connection")]
    Unreachable(#[source] TransportError),

    /// The server kept rejecting resumption beyond the retry bound.
    #[error("server rejected resumption {attempts} times in a row")]
    ResumptionRejected { attempts: u32 },

    /// A dropped session could not be resumed in time.
    #[error("session could not be resumed within {0:?}")]
    ResumeWindowElapsed(Duration),

    /// The server closed the connection with a connection-level error.
    #[error("server closed the connection (code {code:#x}): {message}")]
    ClosedByPeer { code: u32, message: String },

    /// The connection was shut down locally.
    #[error("connection shut down")]
    Shutdown,
}

/// Errors reported on a single exchange.
#[derive(Debug, Error)]
pub enum InteractionError {
    /// The remote peer answered the request with an error frame.
    #[error("remote error (code {code:#x}): {message}")]
    Remote { code: u32, message: String },

    /// A request-response stream completed without carrying a payload.
    #[error("stream completed without a response")]
    Empty,

    /// The session ended before the exchange completed.
    #[error("connection closed before the interaction completed")]
    ConnectionClosed,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors returned synchronously by the typed dispatcher operations.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}
