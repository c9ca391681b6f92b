//! In-process server used by the client tests.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use crate::hello::{HelloRequest, HelloRequests, HelloResponse};
use crate::rsocket_lite::error::TransportError;
use crate::rsocket_lite::frame::{CONNECTION_STREAM, Frame, FrameType, error_code};
use crate::rsocket_lite::payload::{JsonCodec, Payload, PayloadCodec};
use crate::rsocket_lite::transport::{Connector, FrameTransport, framed, websocket_frames};

const GREETINGS: [&str; 5] = ["Hello", "Bonjour", "Hola", "こんにちは", "Ciao"];

/// What live sessions should do when the control value changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Run,
    /// Close the transport without a word.
    Drop,
    /// Tell the client its session is gone.
    RejectSession,
    /// Close with a connection error.
    Fail,
}

#[derive(Debug)]
struct MockState {
    dials: AtomicUsize,
    refuse: AtomicBool,
    reject_setups: AtomicUsize,
    handshake_error: AtomicU32,
    sessions: Mutex<HashSet<String>>,
    control: watch::Sender<(u64, Control)>,
    metadata: Mutex<Vec<Bytes>>,
    fnf: Mutex<Vec<HelloRequest>>,
    batches: Mutex<Vec<Vec<String>>>,
}

/// A hello server speaking the session protocol over any frame transport.
///
/// Each id in a request is answered with a [`HelloResponse`]. The id
/// [`ERROR_ID`](Self::ERROR_ID) is answered with an application error instead.
#[derive(Debug, Clone)]
pub(crate) struct MockServer {
    state: Arc<MockState>,
}

impl MockServer {
    pub(crate) const ERROR_ID: &'static str = "error";

    pub(crate) fn new() -> Self {
        let (control, _) = watch::channel((0, Control::Run));
        Self {
            state: Arc::new(MockState {
                dials: AtomicUsize::new(0),
                refuse: AtomicBool::new(false),
                reject_setups: AtomicUsize::new(0),
                handshake_error: AtomicU32::new(0),
                sessions: Mutex::new(HashSet::new()),
                control,
                metadata: Mutex::new(Vec::new()),
                fnf: Mutex::new(Vec::new()),
                batches: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn connector(&self) -> MockConnector {
        MockConnector {
            server: self.clone(),
        }
    }

    /// Number of transports opened through [`MockConnector`].
    pub(crate) fn dials(&self) -> usize {
        self.state.dials.load(Ordering::SeqCst)
    }

    pub(crate) fn refuse_connections(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Answer the next `count` setup frames with a resumption rejection.
    pub(crate) fn reject_next_setups(&self, count: usize) {
        self.state.reject_setups.store(count, Ordering::SeqCst);
    }

    /// Answer every later setup or resume frame with a connection-level error `code`.
    pub(crate) fn refuse_handshakes(&self, code: u32) {
        self.state.handshake_error.store(code, Ordering::SeqCst);
    }

    /// Forget every session so that resume attempts are rejected.
    pub(crate) fn forget_sessions(&self) {
        self.state.sessions.lock().unwrap().clear();
    }

    fn signal(&self, control: Control) {
        self.state
            .control
            .send_modify(|(generation, current)| {
                *generation += 1;
                *current = control;
            });
    }

    /// Break every live transport.
    pub(crate) fn drop_connections(&self) {
        self.signal(Control::Drop);
    }

    /// Tell every live session that the server no longer knows it.
    pub(crate) fn reject_sessions(&self) {
        self.signal(Control::RejectSession);
    }

    /// Close every live session with a connection error.
    pub(crate) fn fail_sessions(&self) {
        self.signal(Control::Fail);
    }

    pub(crate) fn metadata_pushes(&self) -> Vec<Bytes> {
        self.state.metadata.lock().unwrap().clone()
    }

    pub(crate) fn fire_and_forgets(&self) -> Vec<HelloRequest> {
        self.state.fnf.lock().unwrap().clone()
    }

    /// Channel request batches in arrival order.
    pub(crate) fn channel_batches(&self) -> Vec<Vec<String>> {
        self.state.batches.lock().unwrap().clone()
    }

    /// Serve length-prefixed frames on a local TCP port.
    pub(crate) async fn listen_tcp(&self) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = self.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(server.clone().serve(framed(stream)));
            }
        });
        port
    }

    /// Serve websocket frames on a local TCP port.
    pub(crate) async fn listen_websocket(&self) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = self.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let server = server.clone();
                tokio::spawn(async move {
                    if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                        server.serve(websocket_frames(ws)).await;
                    }
                });
            }
        });
        port
    }

    /// Serve length-prefixed frames over TLS on a local TCP port.
    ///
    /// The certificate is issued for `localhost` and `127.0.0.1` by [`test_ca`].
    pub(crate) async fn listen_tls(&self) -> u16 {
        let cert_chain = CertificateDer::pem_file_iter(fixture("server.pem"))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        let private_key = PrivateKeyDer::from_pem_file(fixture("server.key")).unwrap();
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)
            .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = self.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let server = server.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    if let Ok(stream) = acceptor.accept(stream).await {
                        server.serve(framed(stream)).await;
                    }
                });
            }
        });
        port
    }

    fn take_setup_rejection(&self) -> bool {
        self.state
            .reject_setups
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Answer the handshake. Returns false if the session was refused.
    async fn handshake(&self, io: &mut FrameTransport) -> bool {
        let Some(Ok(hello)) = io.next().await else {
            return false;
        };
        let token = hello.resume_token.clone();

        let refusal = self.state.handshake_error.load(Ordering::SeqCst);
        if refusal != 0 {
            let _ = io
                .send(Frame::error(CONNECTION_STREAM, refusal, "handshake refused"))
                .await;
            return false;
        }

        let reply = match hello.kind() {
            FrameType::Setup if self.take_setup_rejection() => None,
            FrameType::Setup => {
                self.state.sessions.lock().unwrap().insert(token);
                Some(Frame::setup_ok())
            }
            FrameType::Resume if self.state.sessions.lock().unwrap().contains(&token) => {
                Some(Frame::resume_ok())
            }
            _ => None,
        };

        match reply {
            Some(ok) => io.send(ok).await.is_ok(),
            None => {
                let rejection = Frame::error(
                    CONNECTION_STREAM,
                    error_code::REJECTED_RESUME,
                    "unknown session",
                );
                let _ = io.send(rejection).await;
                false
            }
        }
    }

    pub(crate) async fn serve(self, mut io: FrameTransport) {
        let mut control = self.state.control.subscribe();
        control.mark_unchanged();

        if !self.handshake(&mut io).await {
            return;
        }

        loop {
            tokio::select! {
                changed = control.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let (_, action) = *control.borrow_and_update();
                    let farewell = match action {
                        Control::Run => continue,
                        Control::Drop => None,
                        Control::RejectSession => Some(Frame::error(
                            CONNECTION_STREAM,
                            error_code::REJECTED_RESUME,
                            "session expired",
                        )),
                        Control::Fail => Some(Frame::error(
                            CONNECTION_STREAM,
                            error_code::CONNECTION_ERROR,
                            "server failure",
                        )),
                    };
                    if let Some(frame) = farewell {
                        let _ = io.send(frame).await;
                    }
                    return;
                }
                frame = io.next() => {
                    let Some(Ok(frame)) = frame else {
                        return;
                    };
                    for reply in self.handle(frame) {
                        if io.send(reply).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    fn handle(&self, frame: Frame) -> Vec<Frame> {
        let stream_id = frame.stream_id;
        let codec = JsonCodec;

        match frame.kind() {
            FrameType::MetadataPush => {
                if let Some(metadata) = frame.metadata {
                    self.state.metadata.lock().unwrap().push(metadata);
                }
                Vec::new()
            }
            FrameType::RequestFnf => {
                if let Ok(request) = codec.decode::<HelloRequest>(&frame.payload()) {
                    self.state.fnf.lock().unwrap().push(request);
                }
                Vec::new()
            }
            FrameType::RequestResponse => match codec.decode::<HelloRequest>(&frame.payload()) {
                Ok(request) => {
                    let mut replies = respond(stream_id, &[request.id]);
                    if let Some(last) = replies.last_mut() {
                        last.complete = true;
                    }
                    replies
                }
                Err(e) => vec![Frame::error(stream_id, error_code::INVALID, e.to_string())],
            },
            FrameType::RequestStream => match codec.decode::<HelloRequests>(&frame.payload()) {
                Ok(requests) => {
                    let mut replies = respond(stream_id, &requests.ids);
                    if replies.last().is_none_or(|f| f.kind() != FrameType::Error) {
                        replies.push(Frame::complete(stream_id));
                    }
                    replies
                }
                Err(e) => vec![Frame::error(stream_id, error_code::INVALID, e.to_string())],
            },
            FrameType::RequestChannel | FrameType::Payload => {
                let mut replies = Vec::new();
                if frame.kind() == FrameType::RequestChannel || frame.next {
                    match codec.decode::<HelloRequests>(&frame.payload()) {
                        Ok(requests) => {
                            self.state.batches.lock().unwrap().push(requests.ids.clone());
                            replies = respond(stream_id, &requests.ids);
                        }
                        Err(_) if frame.data.is_empty() => {}
                        Err(e) => {
                            let error = Frame::error(stream_id, error_code::INVALID, e.to_string());
                            return vec![error];
                        }
                    }
                }
                if frame.complete {
                    replies.push(Frame::complete(stream_id));
                }
                replies
            }
            FrameType::Keepalive if frame.respond => vec![Frame::keepalive(false)],
            _ => Vec::new(),
        }
    }
}

fn greeting(id: &str) -> &'static str {
    id.parse::<usize>()
        .ok()
        .and_then(|index| GREETINGS.get(index))
        .copied()
        .unwrap_or(GREETINGS[0])
}

/// One payload frame per id, stopping at the first error id.
fn respond(stream_id: u32, ids: &[String]) -> Vec<Frame> {
    let codec = JsonCodec;
    let mut replies = Vec::with_capacity(ids.len());

    for id in ids {
        if id == MockServer::ERROR_ID {
            replies.push(Frame::error(
                stream_id,
                error_code::APPLICATION_ERROR,
                format!("cannot greet id '{id}'"),
            ));
            break;
        }
        let response = HelloResponse {
            id: id.clone(),
            value: greeting(id).to_string(),
        };
        let payload: Payload = codec.encode(&response).unwrap();
        replies.push(Frame::next(stream_id, payload, false));
    }

    replies
}

/// Connects to a [`MockServer`] over an in-memory duplex pipe.
#[derive(Debug, Clone)]
pub(crate) struct MockConnector {
    server: MockServer,
}

impl Connector for MockConnector {
    fn connect(&self) -> BoxFuture<'_, Result<FrameTransport, TransportError>> {
        Box::pin(async move {
            self.server.state.dials.fetch_add(1, Ordering::SeqCst);
            if self.server.state.refuse.load(Ordering::SeqCst) {
                return Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "mock server refused the connection",
                )));
            }

            let (client, server) = tokio::io::duplex(64 * 1024);
            tokio::spawn(self.server.clone().serve(framed(server)));
            Ok(framed(client))
        })
    }
}

/// Path of a TLS fixture under `transport/testdata`.
pub(crate) fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("src/rsocket_lite/transport/testdata")
        .join(name)
}

/// The certificate authority that issued the [`MockServer::listen_tls`] certificate.
pub(crate) fn test_ca() -> Vec<CertificateDer<'static>> {
    CertificateDer::pem_file_iter(fixture("ca.pem"))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

/// Wait until `check` holds, failing the test after a few seconds.
pub(crate) async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
