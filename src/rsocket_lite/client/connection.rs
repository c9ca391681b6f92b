use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, trace, warn};

use crate::rsocket_lite::client::manager::ConnectionEvent;
use crate::rsocket_lite::client::supervisor::Supervisor;
use crate::rsocket_lite::error::{InteractionError, TransportError};
use crate::rsocket_lite::frame::{CONNECTION_STREAM, Frame, FrameType, error_code};
use crate::rsocket_lite::payload::Payload;
use crate::rsocket_lite::session::SessionToken;
use crate::rsocket_lite::transport::FrameTransport;
use crate::state_machine::lifecycle::{ConnectionState, LifecycleInput};

/// First stream id allocated by a client. Client ids are odd.
const FIRST_STREAM_ID: u32 = 1;

pub(crate) enum Command {
    Send {
        frame: Frame,
        written: Option<oneshot::Sender<Result<(), TransportError>>>,
    },
    Close,
}

/// What the driver routes to an open stream.
#[derive(Debug)]
pub(crate) enum Inbound {
    Next { payload: Payload, complete: bool },
    Complete,
    Error(InteractionError),
}

type StreamRegistry = DashMap<u32, mpsc::UnboundedSender<Inbound>, ahash::RandomState>;

struct Shared {
    commands: mpsc::UnboundedSender<Command>,
    streams: Arc<StreamRegistry>,
    token: Arc<Mutex<SessionToken>>,
    state: watch::Receiver<ConnectionState>,
    resume_timeout: Duration,
    next_stream_id: AtomicU32,
}

/// Handle to a live session.
///
/// Cheap to clone. The session is driven by a background task that owns the transport, routes
/// inbound frames to their streams, answers keepalives and resumes the session after transport
/// loss. The task stops on [`close`](Self::close), on an unrecoverable failure, or once every
/// handle is dropped.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("token", &self.token())
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Spawn the driver for a handshaken transport and return the handle.
    pub(crate) fn spawn(supervisor: Supervisor, io: FrameTransport) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let streams = Arc::new(StreamRegistry::default());

        let connection = Self {
            shared: Arc::new(Shared {
                commands,
                streams: streams.clone(),
                token: supervisor.shared_token(),
                state: supervisor.watch_state(),
                resume_timeout: supervisor.config().resume_timeout,
                next_stream_id: AtomicU32::new(FIRST_STREAM_ID),
            }),
        };

        let keepalive = keepalive_interval(supervisor.config().keepalive_interval);
        let driver = Driver {
            supervisor,
            io,
            commands: command_rx,
            streams,
            keepalive,
        };
        tokio::spawn(driver.run());

        connection
    }

    /// Current session token. Changes when the server forces a fresh session.
    pub fn token(&self) -> SessionToken {
        self.shared
            .token
            .lock()
            .expect("session token lock poisoned")
            .clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Whether the session is connected or being resumed.
    pub fn is_live(&self) -> bool {
        self.state() != ConnectionState::Disconnected
    }

    pub fn resume_timeout(&self) -> Duration {
        self.shared.resume_timeout
    }

    /// Number of streams waiting for responses.
    pub fn open_streams(&self) -> usize {
        self.shared.streams.len()
    }

    fn next_stream_id(&self) -> u32 {
        self.shared.next_stream_id.fetch_add(2, Ordering::Relaxed)
    }

    fn ensure_live(&self) -> Result<(), TransportError> {
        if self.is_live() {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    fn submit(&self, command: Command) -> Result<(), TransportError> {
        self.shared
            .commands
            .send(command)
            .map_err(|_| TransportError::NotConnected)
    }

    fn enqueue(&self, frame: Frame) -> Result<(), TransportError> {
        self.submit(Command::Send {
            frame,
            written: None,
        })
    }

    /// Send a frame and wait until the transport has written it.
    async fn write(&self, frame: Frame) -> Result<(), TransportError> {
        self.ensure_live()?;
        let (tx, rx) = oneshot::channel();
        self.submit(Command::Send {
            frame,
            written: Some(tx),
        })?;
        rx.await.map_err(|_| TransportError::Closed)?
    }

    fn open_stream(&self) -> (u32, UnboundedReceiverStream<Inbound>) {
        let stream_id = self.next_stream_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.streams.insert(stream_id, tx);
        (stream_id, UnboundedReceiverStream::new(rx))
    }

    /// Open a stream, enqueue its first frame and wrap the inbound side.
    fn request(
        &self,
        frame: impl FnOnce(u32) -> Frame,
    ) -> Result<ResponseStream, TransportError> {
        self.ensure_live()?;
        let (stream_id, inbound) = self.open_stream();
        if let Err(e) = self.enqueue(frame(stream_id)) {
            self.shared.streams.remove(&stream_id);
            return Err(e);
        }
        Ok(ResponseStream::new(self.clone(), stream_id, inbound))
    }

    /// Push connection-level metadata. Completes once the frame is written.
    pub async fn metadata_push(&self, metadata: Bytes) -> Result<(), TransportError> {
        self.write(Frame::metadata_push(metadata)).await
    }

    /// Send a request that expects no response. Completes once the frame is written.
    pub async fn fire_and_forget(&self, payload: Payload) -> Result<(), TransportError> {
        let stream_id = self.next_stream_id();
        self.write(Frame::request_fnf(stream_id, payload)).await
    }

    pub fn request_response(&self, payload: Payload) -> Result<PendingResponse, TransportError> {
        self.request(|id| Frame::request_response(id, payload))
            .map(PendingResponse)
    }

    pub fn request_stream(&self, payload: Payload) -> Result<ResponseStream, TransportError> {
        self.request(|id| Frame::request_stream(id, payload))
    }

    /// Open a bidirectional channel fed by `requests`.
    ///
    /// The first request travels in the channel-opening frame, later ones as payload frames,
    /// followed by a completion once `requests` ends. Emission runs in its own task and is
    /// aborted if the returned stream is dropped before the server completes.
    pub fn request_channel<S>(&self, requests: S) -> Result<ResponseStream, TransportError>
    where
        S: Stream<Item = Payload> + Send + 'static,
    {
        self.ensure_live()?;
        let (stream_id, inbound) = self.open_stream();

        let connection = self.clone();
        let emitter = tokio::spawn(async move {
            let mut requests = std::pin::pin!(requests);
            let mut emitted = 0usize;

            let opening = match requests.next().await {
                Some(first) => Frame::request_channel(stream_id, first, false),
                None => Frame::request_channel(stream_id, Payload::empty(), true),
            };
            let open_complete = opening.complete;
            if connection.enqueue(opening).is_err() {
                return;
            }
            if open_complete {
                return;
            }
            emitted += 1;

            while let Some(payload) = requests.next().await {
                if connection.enqueue(Frame::next(stream_id, payload, false)).is_err() {
                    debug!(stream_id, emitted, "Connection gone, stopping channel emission");
                    return;
                }
                emitted += 1;
            }

            let _ = connection.enqueue(Frame::complete(stream_id));
            debug!(stream_id, emitted, "Channel requests complete");
        });

        let mut stream = ResponseStream::new(self.clone(), stream_id, inbound);
        stream.emitter = Some(emitter.abort_handle());
        Ok(stream)
    }

    /// Close the session and wait for the driver to stop.
    pub async fn close(&self) {
        if self.submit(Command::Close).is_err() {
            return;
        }
        let mut state = self.shared.state.clone();
        let _ = state
            .wait_for(|state| *state == ConnectionState::Disconnected)
            .await;
    }
}

/// Responses of a stream or channel interaction.
///
/// Yields payloads until the server completes the stream. A remote error is yielded once and
/// ends the stream. Dropping the stream before it ends cancels the interaction.
pub struct ResponseStream {
    connection: Connection,
    stream_id: u32,
    inbound: UnboundedReceiverStream<Inbound>,
    emitter: Option<AbortHandle>,
    done: bool,
}

impl ResponseStream {
    fn new(
        connection: Connection,
        stream_id: u32,
        inbound: UnboundedReceiverStream<Inbound>,
    ) -> Self {
        Self {
            connection,
            stream_id,
            inbound,
            emitter: None,
            done: false,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }
}

impl Stream for ResponseStream {
    type Item = Result<Payload, InteractionError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        let item = match ready!(self.inbound.poll_next_unpin(cx)) {
            Some(Inbound::Next { payload, complete }) => {
                self.done = complete;
                Some(Ok(payload))
            }
            Some(Inbound::Complete) => {
                self.done = true;
                None
            }
            Some(Inbound::Error(e)) => {
                self.done = true;
                Some(Err(e))
            }
            None => {
                self.done = true;
                Some(Err(InteractionError::ConnectionClosed))
            }
        };
        Poll::Ready(item)
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        self.connection.shared.streams.remove(&self.stream_id);
        if !self.done {
            if let Some(emitter) = self.emitter.take() {
                emitter.abort();
            }
            trace!(stream_id = self.stream_id, "Cancelling unfinished stream");
            let _ = self.connection.enqueue(Frame::cancel(self.stream_id));
        }
    }
}

/// The single response of a request-response interaction.
pub struct PendingResponse(ResponseStream);

impl PendingResponse {
    pub fn stream_id(&self) -> u32 {
        self.0.stream_id
    }

    pub async fn response(mut self) -> Result<Payload, InteractionError> {
        match self.0.next().await {
            Some(result) => {
                // A single payload finishes the exchange.
                self.0.done = true;
                result
            }
            None => Err(InteractionError::Empty),
        }
    }
}

fn keepalive_interval(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn tick(keepalive: &mut Option<Interval>) {
    match keepalive {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

enum Fault {
    /// The transport broke. The session may be resumed.
    Lost(TransportError),
    /// The server refused to keep the session.
    Rejected(String),
    /// The server closed the connection.
    Fatal { code: u32, message: String },
}

struct Driver {
    supervisor: Supervisor,
    io: FrameTransport,
    commands: mpsc::UnboundedReceiver<Command>,
    streams: Arc<StreamRegistry>,
    keepalive: Option<Interval>,
}

impl Driver {
    async fn run(mut self) {
        let token = self.supervisor.token();
        debug!(token = %token, "Connection driver started");

        loop {
            let fault = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Send { frame, written }) => self.write(frame, written).await,
                    Some(Command::Close) | None => {
                        self.shutdown().await;
                        return;
                    }
                },
                frame = self.io.next() => match frame {
                    Some(Ok(frame)) => self.route(frame).await,
                    Some(Err(e)) => Some(Fault::Lost(e)),
                    None => Some(Fault::Lost(TransportError::Closed)),
                },
                _ = tick(&mut self.keepalive) => {
                    trace!("Sending keepalive");
                    self.io.send(Frame::keepalive(true)).await.err().map(Fault::Lost)
                }
            };

            if let Some(fault) = fault {
                if !self.recover(fault).await {
                    self.finish();
                    return;
                }
            }
        }
    }

    async fn write(
        &mut self,
        frame: Frame,
        written: Option<oneshot::Sender<Result<(), TransportError>>>,
    ) -> Option<Fault> {
        let result = self.io.send(frame).await;
        let (reply, fault) = match result {
            Ok(()) => (Ok(()), None),
            Err(e) => (Err(TransportError::Closed), Some(Fault::Lost(e))),
        };
        if let Some(written) = written {
            let _ = written.send(reply);
        }
        fault
    }

    fn deliver(&self, stream_id: u32, item: Inbound, terminal: bool) {
        let sender = if terminal {
            self.streams.remove(&stream_id).map(|(_, tx)| tx)
        } else {
            self.streams.get(&stream_id).map(|entry| entry.value().clone())
        };

        match sender {
            Some(tx) => {
                let _ = tx.send(item);
            }
            None => trace!(stream_id, "Dropping frame for unknown stream"),
        }
    }

    async fn route(&mut self, frame: Frame) -> Option<Fault> {
        let stream_id = frame.stream_id;
        match frame.kind() {
            FrameType::Payload => {
                let item = if frame.next {
                    Inbound::Next {
                        payload: frame.payload(),
                        complete: frame.complete,
                    }
                } else {
                    Inbound::Complete
                };
                self.deliver(stream_id, item, frame.complete);
                None
            }
            FrameType::Error if stream_id == CONNECTION_STREAM => {
                let message = frame.error_message();
                if frame.error_code == error_code::REJECTED_RESUME {
                    Some(Fault::Rejected(message))
                } else {
                    Some(Fault::Fatal {
                        code: frame.error_code,
                        message,
                    })
                }
            }
            FrameType::Error => {
                let error = InteractionError::Remote {
                    code: frame.error_code,
                    message: frame.error_message(),
                };
                self.deliver(stream_id, Inbound::Error(error), true);
                None
            }
            FrameType::Keepalive => {
                if frame.respond {
                    return self.io.send(Frame::keepalive(false)).await.err().map(Fault::Lost);
                }
                None
            }
            FrameType::RequestFnf => None,
            FrameType::RequestResponse | FrameType::RequestStream | FrameType::RequestChannel => {
                debug!(stream_id, "Refusing server-initiated request");
                let reply =
                    Frame::error(stream_id, error_code::REJECTED, "client accepts no requests");
                self.io.send(reply).await.err().map(Fault::Lost)
            }
            FrameType::MetadataPush => {
                trace!(len = frame.metadata.as_ref().map(Bytes::len), "Metadata push from server");
                None
            }
            FrameType::Cancel => {
                debug!(stream_id, "Server cancelled stream");
                self.deliver(stream_id, Inbound::Complete, true);
                None
            }
            FrameType::RequestN => None,
            other => {
                warn!(frame_type = ?other, stream_id, "Unexpected frame on established session");
                None
            }
        }
    }

    /// Handle a fault. Returns false once the session is over.
    async fn recover(&mut self, fault: Fault) -> bool {
        let token = self.supervisor.token();
        // Streams opened from here on are queued for the next session.
        let stale: Vec<u32> = self.streams.iter().map(|entry| *entry.key()).collect();

        match fault {
            Fault::Lost(e) => {
                warn!(token = %token, error = %e, "Transport lost, resuming session");
                self.supervisor.emit(ConnectionEvent::TransportLost { token });
                self.supervisor.feed(LifecycleInput::TransportLost);
            }
            Fault::Rejected(message) => {
                self.supervisor.feed(LifecycleInput::ResumptionRejected);
                warn!(
                    token = %token,
                    reason = %message,
                    "Server dropped the session, starting a fresh one"
                );
                self.supervisor.emit(ConnectionEvent::ResumptionRejected {
                    token,
                    attempt: self.supervisor.rejections(),
                });
            }
            Fault::Fatal { code, message } => {
                error!(token = %token, code, reason = %message, "Server closed the connection");
                self.supervisor.feed(LifecycleInput::Fatal);
                self.supervisor.drain();
                return false;
            }
        }

        let resume_timeout = self.supervisor.config().resume_timeout;
        match tokio::time::timeout(resume_timeout, self.supervisor.establish()).await {
            Ok(Ok((io, resumed))) => {
                self.io = io;
                if !resumed {
                    self.fail_streams(&stale);
                }
                true
            }
            Ok(Err(e)) => {
                error!(error = %e, "Failed to re-establish session");
                false
            }
            Err(_) => {
                self.supervisor.feed(LifecycleInput::ResumeWindowElapsed);
                self.supervisor.drain();
                error!(
                    token = %self.supervisor.token(),
                    timeout_ms = resume_timeout.as_millis() as u64,
                    "Session could not be resumed in time"
                );
                false
            }
        }
    }

    /// `stale` streams belong to a session the server no longer knows.
    fn fail_streams(&self, stale: &[u32]) {
        let failed = stale
            .iter()
            .filter(|stream_id| self.streams.remove(*stream_id).is_some())
            .count();
        if failed > 0 {
            debug!(failed, "Failing streams of the previous session");
        }
    }

    async fn shutdown(&mut self) {
        info!(token = %self.supervisor.token(), "Closing connection");
        let _ = self
            .io
            .send(Frame::error(
                CONNECTION_STREAM,
                error_code::CONNECTION_CLOSE,
                "client closing",
            ))
            .await;
        let _ = self.io.close().await;
        self.supervisor.feed(LifecycleInput::Shutdown);
        self.finish();
    }

    fn finish(&mut self) {
        self.streams.clear();
        self.commands.close();
        self.supervisor.emit(ConnectionEvent::Disconnected);
        debug!(token = %self.supervisor.token(), "Connection driver stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hello::{HelloRequest, HelloRequests, HelloResponse};
    use crate::rsocket_lite::client::{
        ConnectionEvent, ConnectionManager, RetryPolicy, SessionConfig,
    };
    use crate::rsocket_lite::payload::{JsonCodec, PayloadCodec};
    use crate::rsocket_lite::testing::{MockServer, eventually};
    use tokio::sync::broadcast;

    fn session() -> SessionConfig {
        SessionConfig::builder()
            .resume_timeout(Duration::from_millis(500))
            .keepalive_interval(Duration::from_millis(20))
            .handshake_timeout(Duration::from_secs(1))
            .retry(
                RetryPolicy::builder()
                    .initial_backoff(Duration::from_millis(5))
                    .max_backoff(Duration::from_millis(20))
                    .build(),
            )
            .build()
    }

    async fn connect(server: &MockServer) -> (ConnectionManager, Connection) {
        let mut manager = ConnectionManager::new();
        let connection = manager
            .connect_with(server.connector(), session())
            .await
            .unwrap();
        (manager, connection)
    }

    async fn next_event(events: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no event in time")
            .expect("event channel closed")
    }

    async fn greet(connection: &Connection, id: &str) -> HelloResponse {
        let codec = JsonCodec;
        let payload = codec.encode(&HelloRequest::new(id)).unwrap();
        let response = connection
            .request_response(payload)
            .unwrap()
            .response()
            .await
            .unwrap();
        codec.decode(&response).unwrap()
    }

    #[tokio::test]
    async fn test_stream_ids_are_odd_and_increasing() {
        let server = MockServer::new();
        let (_manager, connection) = connect(&server).await;

        let ids: Vec<_> = (0..3)
            .map(|_| {
                connection
                    .request_stream(Payload::from_data(r#"{"ids":[]}"#))
                    .unwrap()
                    .stream_id()
            })
            .collect();
        assert_eq!(ids, vec![1, 3, 5]);
    }

    #[tokio::test]
    async fn test_request_stream_ends_on_server_completion() {
        let server = MockServer::new();
        let (_manager, connection) = connect(&server).await;

        let request = JsonCodec
            .encode(&HelloRequests::new(vec!["0".into(), "1".into()]))
            .unwrap();
        let responses: Vec<_> = connection
            .request_stream(request)
            .unwrap()
            .collect()
            .await;

        assert_eq!(responses.len(), 2);
        assert!(responses.iter().all(Result::is_ok));
        eventually(|| connection.open_streams() == 0).await;
    }

    #[tokio::test]
    async fn test_remote_error_ends_stream() {
        let server = MockServer::new();
        let (_manager, connection) = connect(&server).await;

        let payload = JsonCodec
            .encode(&HelloRequest::new(MockServer::ERROR_ID))
            .unwrap();
        let result = connection.request_response(payload).unwrap().response().await;
        assert!(matches!(
            result,
            Err(InteractionError::Remote {
                code: error_code::APPLICATION_ERROR,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_transport_loss_resumes_same_session() {
        let server = MockServer::new();
        let (manager, connection) = connect(&server).await;
        let mut events = manager.subscribe();
        let token = connection.token();

        server.drop_connections();

        assert_eq!(
            next_event(&mut events).await,
            ConnectionEvent::TransportLost {
                token: token.clone()
            }
        );
        assert_eq!(
            next_event(&mut events).await,
            ConnectionEvent::Connected {
                token: token.clone(),
                resumed: true
            }
        );
        assert_eq!(connection.token(), token);
        assert_eq!(greet(&connection, "2").await.value, "Hola");
    }

    #[tokio::test]
    async fn test_rejected_resume_starts_fresh_session() {
        let server = MockServer::new();
        let (manager, connection) = connect(&server).await;
        let mut events = manager.subscribe();
        let token = connection.token();

        server.forget_sessions();
        server.drop_connections();

        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::TransportLost { .. }
        ));
        assert_eq!(
            next_event(&mut events).await,
            ConnectionEvent::ResumptionRejected {
                token: token.clone(),
                attempt: 1
            }
        );
        match next_event(&mut events).await {
            ConnectionEvent::Connected { token: fresh, resumed } => {
                assert!(!resumed);
                assert_ne!(fresh, token);
                assert_eq!(connection.token(), fresh);
            }
            other => panic!("expected Connected, got {other:?}"),
        }
        assert_eq!(greet(&connection, "1").await.id, "1");
    }

    #[tokio::test]
    async fn test_rejection_while_connected_starts_fresh_session() {
        let server = MockServer::new();
        let (manager, connection) = connect(&server).await;
        let mut events = manager.subscribe();
        let token = connection.token();

        server.reject_sessions();

        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::ResumptionRejected { .. }
        ));
        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::Connected { resumed: false, .. }
        ));
        assert_ne!(connection.token(), token);
        assert!(connection.is_live());
    }

    #[tokio::test]
    async fn test_request_during_fresh_session_reconnect_succeeds() {
        let server = MockServer::new();
        let mut manager = ConnectionManager::new();
        let slow_redial = SessionConfig::builder()
            .resume_timeout(Duration::from_secs(5))
            .keepalive_interval(Duration::ZERO)
            .retry(
                RetryPolicy::builder()
                    .initial_backoff(Duration::from_millis(200))
                    .max_backoff(Duration::from_millis(200))
                    .build(),
            )
            .build();
        let connection = manager
            .connect_with(server.connector(), slow_redial)
            .await
            .unwrap();
        let mut events = manager.subscribe();

        // Open before the rejection, so it belongs to the old session.
        let mut stale = connection
            .request_channel(futures::stream::pending::<Payload>())
            .unwrap();

        server.reject_sessions();
        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::ResumptionRejected { .. }
        ));
        assert_eq!(connection.state(), ConnectionState::Connecting);

        assert_eq!(greet(&connection, "2").await.value, "Hola");
        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::Connected { resumed: false, .. }
        ));
        assert!(matches!(
            stale.next().await,
            Some(Err(InteractionError::ConnectionClosed))
        ));
    }

    #[tokio::test]
    async fn test_refused_resume_handshake_is_not_retried() {
        let server = MockServer::new();
        let mut manager = ConnectionManager::new();
        let long_window = SessionConfig::builder()
            .resume_timeout(Duration::from_secs(60))
            .keepalive_interval(Duration::ZERO)
            .build();
        let connection = manager
            .connect_with(server.connector(), long_window)
            .await
            .unwrap();
        let mut events = manager.subscribe();

        server.refuse_handshakes(error_code::REJECTED_SETUP);
        server.drop_connections();

        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::TransportLost { .. }
        ));
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Disconnected);
        assert_eq!(server.dials(), 2);
        assert!(!connection.is_live());
    }

    #[tokio::test]
    async fn test_connection_error_disconnects() {
        let server = MockServer::new();
        let (manager, connection) = connect(&server).await;
        let mut events = manager.subscribe();

        server.fail_sessions();

        assert_eq!(next_event(&mut events).await, ConnectionEvent::Disconnected);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(matches!(
            connection.request_stream(Payload::empty()),
            Err(TransportError::NotConnected)
        ));
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn test_resume_window_elapses() {
        let server = MockServer::new();
        let (manager, connection) = connect(&server).await;
        let mut events = manager.subscribe();

        server.refuse_connections(true);
        server.drop_connections();

        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::TransportLost { .. }
        ));
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Disconnected);
        assert!(!connection.is_live());
        assert!(server.dials() > 2);
    }

    #[tokio::test]
    async fn test_keepalives_keep_session_up() {
        let server = MockServer::new();
        let (_manager, connection) = connect(&server).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(connection.state(), ConnectionState::Connected);
        assert_eq!(greet(&connection, "4").await.value, "Ciao");
    }

    #[tokio::test]
    async fn test_dropping_unfinished_channel_cancels_it() {
        let server = MockServer::new();
        let (_manager, connection) = connect(&server).await;

        let requests = futures::stream::pending::<Payload>();
        let responses = connection.request_channel(requests).unwrap();
        assert_eq!(connection.open_streams(), 1);

        drop(responses);
        assert_eq!(connection.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_close_stops_driver() {
        let server = MockServer::new();
        let (_manager, connection) = connect(&server).await;

        connection.close().await;
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(matches!(
            connection.metadata_push(Bytes::from_static(b"late")).await,
            Err(TransportError::NotConnected)
        ));
    }
}
