//! The five interaction models over a live [`Connection`].
//!
//! Operations that produce responses return as soon as the request is queued. Responses are
//! delivered to a caller-supplied sink from a background task, and every terminal event is
//! recorded on a [`CompletionTracker`] the caller can wait on.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::rsocket_lite::client::connection::{Connection, PendingResponse, ResponseStream};
use crate::rsocket_lite::error::{DispatchError, TransportError};
use crate::rsocket_lite::payload::{CodecError, JsonCodec, Payload, PayloadCodec};
use crate::rsocket_lite::tracker::CompletionTracker;

/// What a failed interaction does to its [`CompletionTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// The error takes one slot, as a response would.
    #[default]
    CountAsResponse,
    /// The error releases the tracker at once, reporting how many signals were outstanding.
    ReleaseAll,
    /// The error is only logged. The tracker still waits for its remaining signals.
    AwaitRemaining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InteractionKind {
    MetadataPush,
    FireAndForget,
    RequestResponse,
    RequestStream,
    RequestChannel,
}

impl fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InteractionKind::MetadataPush => "metadata-push",
            InteractionKind::FireAndForget => "fire-and-forget",
            InteractionKind::RequestResponse => "request-response",
            InteractionKind::RequestStream => "request-stream",
            InteractionKind::RequestChannel => "request-channel",
        };
        f.write_str(name)
    }
}

/// A raw interaction, fully describing the exchange.
#[derive(Debug, Clone)]
pub enum InteractionRequest {
    MetadataPush(Bytes),
    FireAndForget(Payload),
    RequestResponse(Payload),
    RequestStream(Payload),
    /// Requests are emitted in order, sleeping `pacing` before each one.
    RequestChannel {
        requests: Vec<Payload>,
        pacing: Duration,
    },
}

impl InteractionRequest {
    pub fn kind(&self) -> InteractionKind {
        match self {
            InteractionRequest::MetadataPush(_) => InteractionKind::MetadataPush,
            InteractionRequest::FireAndForget(_) => InteractionKind::FireAndForget,
            InteractionRequest::RequestResponse(_) => InteractionKind::RequestResponse,
            InteractionRequest::RequestStream(_) => InteractionKind::RequestStream,
            InteractionRequest::RequestChannel { .. } => InteractionKind::RequestChannel,
        }
    }
}

/// Issues interactions on a connection, encoding requests and decoding responses with `C`.
#[derive(Debug, Clone)]
pub struct InteractionDispatcher<C = JsonCodec> {
    connection: Connection,
    codec: C,
    error_policy: ErrorPolicy,
}

impl InteractionDispatcher<JsonCodec> {
    pub fn new(connection: Connection) -> Self {
        Self::with_codec(connection, JsonCodec)
    }
}

impl<C: PayloadCodec> InteractionDispatcher<C> {
    pub fn with_codec(connection: Connection, codec: C) -> Self {
        Self {
            connection,
            codec,
            error_policy: ErrorPolicy::default(),
        }
    }

    pub fn with_error_policy(mut self, error_policy: ErrorPolicy) -> Self {
        self.error_policy = error_policy;
        self
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn error_policy(&self) -> ErrorPolicy {
        self.error_policy
    }

    /// Run a raw interaction, handing response payloads to `sink` undecoded.
    ///
    /// Metadata push and fire-and-forget complete once written and return `None`. The other
    /// variants return the handle of the task delivering responses.
    pub async fn execute<F>(
        &self,
        request: InteractionRequest,
        tracker: &CompletionTracker,
        mut sink: F,
    ) -> Result<Option<JoinHandle<()>>, TransportError>
    where
        F: FnMut(Payload) + Send + 'static,
    {
        let kind = request.kind();
        let deliver = move |payload: Payload| -> Result<(), CodecError> {
            sink(payload);
            Ok(())
        };

        let handle = match request {
            InteractionRequest::MetadataPush(metadata) => {
                self.connection.metadata_push(metadata).await?;
                None
            }
            InteractionRequest::FireAndForget(payload) => {
                self.connection.fire_and_forget(payload).await?;
                None
            }
            InteractionRequest::RequestResponse(payload) => {
                let pending = self.connection.request_response(payload)?;
                Some(self.spawn_single(pending, tracker.clone(), deliver))
            }
            InteractionRequest::RequestStream(payload) => {
                let responses = self.connection.request_stream(payload)?;
                Some(self.spawn_stream(kind, responses, tracker.clone(), deliver))
            }
            InteractionRequest::RequestChannel { requests, pacing } => {
                let responses = self.connection.request_channel(paced(requests, pacing))?;
                Some(self.spawn_stream(kind, responses, tracker.clone(), deliver))
            }
        };

        debug!(interaction = %kind, "Interaction dispatched");
        Ok(handle)
    }

    /// Push connection-level metadata. Returns once written; no reply is expected.
    pub async fn metadata_push(&self, metadata: impl Into<Bytes>) -> Result<(), TransportError> {
        self.connection.metadata_push(metadata.into()).await
    }

    /// Send `request` without expecting a reply. Returns once written.
    pub async fn fire_and_forget<Req: Serialize>(
        &self,
        request: &Req,
    ) -> Result<(), DispatchError> {
        let payload = self.codec.encode(request)?;
        self.connection.fire_and_forget(payload).await?;
        Ok(())
    }

    /// Send `request` and deliver its single decoded response to `sink`.
    ///
    /// `tracker` receives one terminal event: the response, or the error.
    pub fn request_response<Req, Resp, F>(
        &self,
        request: &Req,
        tracker: &CompletionTracker,
        sink: F,
    ) -> Result<JoinHandle<()>, DispatchError>
    where
        Req: Serialize,
        Resp: DeserializeOwned + 'static,
        F: FnMut(Resp) + Send + 'static,
    {
        let payload = self.codec.encode(request)?;
        let pending = self.connection.request_response(payload)?;
        Ok(self.spawn_single(
            pending,
            tracker.clone(),
            decoding(self.codec.clone(), sink),
        ))
    }

    /// Send `request` and deliver every decoded response to `sink`.
    ///
    /// The server decides how many responses to send. `tracker` is signalled once per response,
    /// so the caller sizes it to the count it expects.
    pub fn request_stream<Req, Resp, F>(
        &self,
        request: &Req,
        tracker: &CompletionTracker,
        sink: F,
    ) -> Result<JoinHandle<()>, DispatchError>
    where
        Req: Serialize,
        Resp: DeserializeOwned + 'static,
        F: FnMut(Resp) + Send + 'static,
    {
        let payload = self.codec.encode(request)?;
        let responses = self.connection.request_stream(payload)?;
        Ok(self.spawn_stream(
            InteractionKind::RequestStream,
            responses,
            tracker.clone(),
            decoding(self.codec.clone(), sink),
        ))
    }

    /// Emit `requests` in order, sleeping `pacing` before each, while delivering responses to
    /// `sink` as they arrive.
    ///
    /// Response order is not tied to request order. Completion is observed through `tracker`.
    pub fn request_channel<I, Resp, F>(
        &self,
        requests: I,
        pacing: Duration,
        tracker: &CompletionTracker,
        sink: F,
    ) -> Result<JoinHandle<()>, DispatchError>
    where
        I: IntoIterator,
        I::Item: Serialize,
        Resp: DeserializeOwned + 'static,
        F: FnMut(Resp) + Send + 'static,
    {
        let payloads = requests
            .into_iter()
            .map(|request| self.codec.encode(&request))
            .collect::<Result<Vec<_>, _>>()?;
        let responses = self.connection.request_channel(paced(payloads, pacing))?;
        Ok(self.spawn_stream(
            InteractionKind::RequestChannel,
            responses,
            tracker.clone(),
            decoding(self.codec.clone(), sink),
        ))
    }

    fn spawn_single<D>(
        &self,
        pending: PendingResponse,
        tracker: CompletionTracker,
        mut deliver: D,
    ) -> JoinHandle<()>
    where
        D: FnMut(Payload) -> Result<(), CodecError> + Send + 'static,
    {
        let policy = self.error_policy;
        let kind = InteractionKind::RequestResponse;

        tokio::spawn(async move {
            let stream_id = pending.stream_id();
            let outcome = match pending.response().await {
                Ok(payload) => deliver(payload).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };

            match outcome {
                Ok(()) => tracker.signal(),
                Err(reason) => on_error(kind, stream_id, &reason, &tracker, policy),
            }
        })
    }

    fn spawn_stream<D>(
        &self,
        kind: InteractionKind,
        mut responses: ResponseStream,
        tracker: CompletionTracker,
        mut deliver: D,
    ) -> JoinHandle<()>
    where
        D: FnMut(Payload) -> Result<(), CodecError> + Send + 'static,
    {
        let policy = self.error_policy;

        tokio::spawn(async move {
            let stream_id = responses.stream_id();
            let mut received = 0usize;

            while let Some(result) = responses.next().await {
                match result {
                    Ok(payload) => {
                        received += 1;
                        match deliver(payload) {
                            Ok(()) => tracker.signal(),
                            Err(e) => on_error(kind, stream_id, &e, &tracker, policy),
                        }
                    }
                    Err(e) => on_error(kind, stream_id, &e, &tracker, policy),
                }
            }

            debug!(interaction = %kind, stream_id, received, "Interaction finished");
        })
    }
}

fn on_error(
    kind: InteractionKind,
    stream_id: u32,
    error: &dyn fmt::Display,
    tracker: &CompletionTracker,
    policy: ErrorPolicy,
) {
    error!(
        interaction = %kind,
        stream_id,
        policy = ?policy,
        error = %error,
        "Interaction failed"
    );
    match policy {
        ErrorPolicy::CountAsResponse => tracker.fail(),
        ErrorPolicy::ReleaseAll => tracker.release(),
        ErrorPolicy::AwaitRemaining => {}
    }
}

/// Wrap a typed sink so it receives decoded responses.
fn decoding<C, Resp, F>(
    codec: C,
    mut sink: F,
) -> impl FnMut(Payload) -> Result<(), CodecError> + Send + 'static
where
    C: PayloadCodec,
    Resp: DeserializeOwned + 'static,
    F: FnMut(Resp) + Send + 'static,
{
    move |payload| {
        sink(codec.decode(&payload)?);
        Ok(())
    }
}

/// Yield `items` in order, sleeping `pacing` before each one.
fn paced<I>(items: I, pacing: Duration) -> impl Stream<Item = I::Item> + Send + 'static
where
    I: IntoIterator,
    I::IntoIter: Send + 'static,
    I::Item: Send + 'static,
{
    let items = items.into_iter();
    async_stream::stream! {
        for item in items {
            if !pacing.is_zero() {
                tokio::time::sleep(pacing).await;
            }
            yield item;
        }
    }
}
