use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{error, info};

use crate::rsocket_lite::client::config::{ConnectConfig, SessionConfig};
use crate::rsocket_lite::client::connection::Connection;
use crate::rsocket_lite::client::supervisor::Supervisor;
use crate::rsocket_lite::error::{ConnectionError, TransportError};
use crate::rsocket_lite::session::SessionToken;
use crate::rsocket_lite::transport::{Connector, TransportFactory};
use crate::state_machine::lifecycle::LifecycleInput;

const EVENT_CAPACITY: usize = 64;

/// Lifecycle notifications published by a [`ConnectionManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A session was set up, or an existing one resumed.
    Connected { token: SessionToken, resumed: bool },
    /// The server refused session `token`. A fresh session follows unless retries are exhausted.
    ResumptionRejected { token: SessionToken, attempt: u32 },
    /// The transport of session `token` broke. Resumption follows.
    TransportLost { token: SessionToken },
    /// The session ended.
    Disconnected,
}

/// Owns the single live [`Connection`] to a server.
///
/// # Example
///
/// ```ignore
/// let mut manager = ConnectionManager::new();
/// let connection = manager
///     .connect(
///         ConnectConfig::builder()
///             .transport(TransportConfig::builder().kind(TransportKind::Tls).build())
///             .build(),
///     )
///     .await?;
///
/// let dispatcher = InteractionDispatcher::new(connection);
/// ```
pub struct ConnectionManager {
    current: Option<Connection>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            current: None,
            events,
        }
    }

    /// Receive lifecycle events, including reconnects that `connect` handles silently.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Establish a session using the transport described by `config`.
    ///
    /// Resumption rejections are answered with a fresh session, up to the retry bound. Any other
    /// failure is returned and leaves no live connection.
    pub async fn connect(&mut self, config: ConnectConfig) -> Result<Connection, ConnectionError> {
        self.ensure_idle()?;
        let factory =
            TransportFactory::new(config.transport).map_err(ConnectionError::InvalidConfig)?;
        self.connect_with(factory, config.session).await
    }

    /// Establish a session over transports opened by `connector`.
    pub async fn connect_with<C: Connector>(
        &mut self,
        connector: C,
        session: SessionConfig,
    ) -> Result<Connection, ConnectionError> {
        self.ensure_idle()?;

        let mut supervisor = Supervisor::new(Arc::new(connector), session, self.events.clone());
        supervisor.feed(LifecycleInput::Connect);

        match supervisor.establish().await {
            Ok((io, _)) => {
                let connection = Connection::spawn(supervisor, io);
                info!(token = %connection.token(), "Connected");
                self.current = Some(connection.clone());
                Ok(connection)
            }
            Err(e) => {
                error!(error = %e, "Connect failed");
                self.current = None;
                Err(e)
            }
        }
    }

    fn ensure_idle(&self) -> Result<(), ConnectionError> {
        match &self.current {
            Some(connection) if connection.is_live() => {
                Err(ConnectionError::AlreadyConnected(connection.token()))
            }
            _ => Ok(()),
        }
    }

    /// The live connection.
    pub fn connection(&self) -> Result<Connection, TransportError> {
        self.current
            .as_ref()
            .filter(|connection| connection.is_live())
            .cloned()
            .ok_or(TransportError::NotConnected)
    }

    pub fn is_connected(&self) -> bool {
        self.connection().is_ok()
    }

    /// Close the live connection, if any.
    pub async fn shutdown(&mut self) {
        if let Some(connection) = self.current.take() {
            connection.close().await;
        }
    }
}
