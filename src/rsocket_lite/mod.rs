//! # rsocket_lite
//!
//! A client for a multiplexed, resumable request/response protocol in the style of RSocket.
//!
//! A session is set up once per connection and identified by a resume token. Every interaction
//! runs on its own stream, so any number of them share one transport:
//!
//! - **metadata push**: connection-level metadata, no reply
//! - **fire-and-forget**: one request, no reply
//! - **request-response**: one request, one response
//! - **request-stream**: one request, many responses
//! - **request-channel**: many requests and many responses, flowing concurrently
//!
//! When the transport breaks, the session is resumed on a new transport within the resume
//! timeout. When the server refuses to resume, a fresh session is set up instead, a bounded
//! number of times in a row.
//!
//! ## Transports
//!
//! | Kind | Framing |
//! |------|---------|
//! | `tcp` | 24-bit length prefix per frame |
//! | `tls` | as `tcp`, inside TLS |
//! | `ws` | one binary websocket message per frame |
//! | `wss` | as `ws`, inside TLS |
//!
//! ```ignore
//! use rsocket_prototype::rsocket_lite::{
//!     ConnectConfig, ConnectionManager, TlsConfig, TransportConfig, TransportKind,
//! };
//!
//! let config = ConnectConfig::builder()
//!     .transport(
//!         TransportConfig::builder()
//!             .host("localhost")
//!             .port(7878)
//!             .kind(TransportKind::Tls)
//!             .tls(TlsConfig::insecure())
//!             .build(),
//!     )
//!     .build();
//!
//! let mut manager = ConnectionManager::new();
//! let connection = manager.connect(config).await?;
//! ```

mod error;
mod frame;
mod payload;
mod session;
mod tracker;

pub mod client;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{
    ConnectionError, DispatchError, InteractionError, ResumptionRejected, TransportError,
};
pub use frame::{
    CONNECTION_STREAM, Frame, FrameCodec, FrameType, MAX_FRAME_LENGTH, UNBOUNDED_REQUEST_N,
    error_code,
};
pub use payload::{CodecError, JsonCodec, Payload, PayloadCodec};
pub use session::SessionToken;
pub use tracker::{CompletionTracker, WaitOutcome};

pub use client::{
    ConnectConfig, Connection, ConnectionEvent, ConnectionManager, ErrorPolicy,
    InteractionDispatcher, InteractionKind, InteractionRequest, RetryPolicy, SessionConfig,
};
pub use transport::{
    ClientIdentity, Connector, TlsConfig, TransportConfig, TransportFactory, TransportKind,
    TrustConfig,
};
