//! Transports carrying frames between client and server.
//!
//! A transport is anything that is both a `Sink<Frame>` and a `Stream` of frames. Byte streams
//! (TCP, TLS) are framed with [`FrameCodec`]; websockets carry one frame per binary message.
//! [`TransportFactory`] builds the transport selected by a [`TransportConfig`].

mod tls;
mod websocket;

use std::fmt;
use std::str::FromStr;

use bon::Builder;
use futures::future::BoxFuture;
use futures::{Sink, Stream};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tracing::debug;
use url::Url;

pub use tls::{ClientIdentity, TlsConfig, TrustConfig};
pub use websocket::frames as websocket_frames;

use crate::rsocket_lite::error::TransportError;
use crate::rsocket_lite::frame::{Frame, FrameCodec};

/// A bidirectional frame transport.
pub trait FrameIo:
    Sink<Frame, Error = TransportError>
    + Stream<Item = Result<Frame, TransportError>>
    + Send
    + Unpin
{
}

impl<T> FrameIo for T where
    T: Sink<Frame, Error = TransportError>
        + Stream<Item = Result<Frame, TransportError>>
        + Send
        + Unpin
{
}

pub type FrameTransport = Box<dyn FrameIo>;

/// Frame a byte stream with the length-prefixed frame codec.
pub fn framed<IO>(io: IO) -> FrameTransport
where
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    Box::new(Framed::new(io, FrameCodec::new()))
}

/// Something that can open a new frame transport to the server.
///
/// Called once per connection attempt, including reconnects and resumes.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'_, Result<FrameTransport, TransportError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    Tcp,
    Tls,
    WebSocket,
    SecureWebSocket,
}

impl TransportKind {
    pub fn is_secure(&self) -> bool {
        matches!(self, TransportKind::Tls | TransportKind::SecureWebSocket)
    }
}

/// A transport name other than `tcp`, `tls`, `ws` or `wss`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown transport kind '{0}'")]
pub struct UnknownTransportKind(pub String);

impl FromStr for TransportKind {
    type Err = UnknownTransportKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(TransportKind::Tcp),
            "tls" => Ok(TransportKind::Tls),
            "ws" | "websocket" => Ok(TransportKind::WebSocket),
            "wss" => Ok(TransportKind::SecureWebSocket),
            _ => Err(UnknownTransportKind(s.to_string())),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Tls => "tls",
            TransportKind::WebSocket => "ws",
            TransportKind::SecureWebSocket => "wss",
        };
        f.write_str(name)
    }
}

/// Where and how to reach the server.
#[derive(Debug, Clone, Builder)]
pub struct TransportConfig {
    #[builder(into, default = "localhost".to_string())]
    pub host: String,

    #[builder(default = 7878)]
    pub port: u16,

    #[builder(default)]
    pub kind: TransportKind,

    /// Used by [`TransportKind::Tls`] and [`TransportKind::SecureWebSocket`].
    #[builder(default)]
    pub tls: TlsConfig,

    /// Request path for websocket upgrades.
    #[builder(into, default = "/".to_string())]
    pub websocket_path: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl TransportConfig {
    /// Websocket URL for this endpoint, e.g. `wss://localhost:7878/`.
    pub fn websocket_url(&self) -> Result<Url, TransportError> {
        let scheme = if self.kind.is_secure() { "wss" } else { "ws" };
        let mut url = Url::parse(&format!("{scheme}://{}:{}", self.host, self.port))?;
        url.set_path(&self.websocket_path);
        Ok(url)
    }
}

/// Builds transports for a [`TransportConfig`].
///
/// TLS material is loaded once, when the factory is created.
#[derive(Clone)]
pub struct TransportFactory {
    config: TransportConfig,
    tls: Option<(TlsConnector, ServerName<'static>)>,
}

impl TransportFactory {
    pub fn new(config: TransportConfig) -> Result<Self, TransportError> {
        let tls = if config.kind.is_secure() {
            let name = config
                .tls
                .server_name
                .clone()
                .unwrap_or_else(|| config.host.clone());
            let server_name = ServerName::try_from(name.clone())
                .map_err(|_| TransportError::InvalidServerName(name))?;
            let connector = TlsConnector::from(config.tls.client_config()?);
            Some((connector, server_name))
        } else {
            None
        };

        Ok(Self { config, tls })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    async fn tcp(&self) -> Result<TcpStream, TransportError> {
        let stream = TcpStream::connect((self.config.host.as_str(), self.config.port)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    async fn tls(
        &self,
        stream: TcpStream,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>, TransportError> {
        let (connector, server_name) = self
            .tls
            .as_ref()
            .ok_or_else(|| TransportError::InvalidServerName(self.config.host.clone()))?;
        Ok(connector.connect(server_name.clone(), stream).await?)
    }

    async fn open(&self) -> Result<FrameTransport, TransportError> {
        let kind = self.config.kind;
        debug!(
            host = %self.config.host,
            port = self.config.port,
            kind = %kind,
            "Opening transport"
        );

        let stream = self.tcp().await?;
        match kind {
            TransportKind::Tcp => Ok(framed(stream)),
            TransportKind::Tls => Ok(framed(self.tls(stream).await?)),
            TransportKind::WebSocket => {
                let url = self.config.websocket_url()?;
                let (ws, _) = tokio_tungstenite::client_async(url.as_str(), stream).await?;
                Ok(websocket_frames(ws))
            }
            TransportKind::SecureWebSocket => {
                let url = self.config.websocket_url()?;
                let stream = self.tls(stream).await?;
                let (ws, _) = tokio_tungstenite::client_async(url.as_str(), stream).await?;
                Ok(websocket_frames(ws))
            }
        }
    }
}

impl Connector for TransportFactory {
    fn connect(&self) -> BoxFuture<'_, Result<FrameTransport, TransportError>> {
        Box::pin(self.open())
    }
}
