//! Wire frames and the stream codec carrying them.
//!
//! Frames are protobuf messages. Over byte streams (TCP, TLS) each frame is prefixed with a
//! 24-bit big-endian length; over websockets every binary message holds exactly one frame.

use bytes::{Bytes, BytesMut};
use prost::Message;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::rsocket_lite::error::TransportError;
use crate::rsocket_lite::payload::Payload;
use crate::rsocket_lite::session::SessionToken;

/// Stream id reserved for connection-level frames.
pub const CONNECTION_STREAM: u32 = 0;

/// Largest frame the 24-bit length prefix can describe.
pub const MAX_FRAME_LENGTH: usize = 0xFF_FFFF;

/// Request-n value meaning "no flow control".
pub const UNBOUNDED_REQUEST_N: u32 = u32::MAX;

/// Error codes carried by [`FrameType::Error`] frames.
pub mod error_code {
    pub const INVALID_SETUP: u32 = 0x001;
    pub const UNSUPPORTED_SETUP: u32 = 0x002;
    pub const REJECTED_SETUP: u32 = 0x003;
    pub const REJECTED_RESUME: u32 = 0x004;
    pub const CONNECTION_ERROR: u32 = 0x101;
    pub const CONNECTION_CLOSE: u32 = 0x102;
    pub const APPLICATION_ERROR: u32 = 0x201;
    pub const REJECTED: u32 = 0x202;
    pub const CANCELED: u32 = 0x203;
    pub const INVALID: u32 = 0x204;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum FrameType {
    Reserved = 0,
    Setup = 1,
    SetupOk = 2,
    Resume = 3,
    ResumeOk = 4,
    Keepalive = 5,
    Error = 6,
    MetadataPush = 7,
    RequestFnf = 8,
    RequestResponse = 9,
    RequestStream = 10,
    RequestChannel = 11,
    RequestN = 12,
    Payload = 13,
    Cancel = 14,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Frame {
    #[prost(uint32, tag = "1")]
    pub stream_id: u32,
    #[prost(enumeration = "FrameType", tag = "2")]
    pub frame_type: i32,
    /// Payload frames: the frame carries data for the consumer.
    #[prost(bool, tag = "3")]
    pub next: bool,
    /// Payload and request frames: the sender's side of the stream is finished.
    #[prost(bool, tag = "4")]
    pub complete: bool,
    /// Keepalive frames: the receiver should echo a keepalive back.
    #[prost(bool, tag = "5")]
    pub respond: bool,
    #[prost(bytes = "bytes", tag = "6")]
    pub data: Bytes,
    #[prost(bytes = "bytes", optional, tag = "7")]
    pub metadata: Option<Bytes>,
    #[prost(uint32, tag = "8")]
    pub error_code: u32,
    #[prost(string, tag = "9")]
    pub resume_token: String,
    #[prost(uint64, tag = "10")]
    pub resume_timeout_ms: u64,
    #[prost(uint64, tag = "11")]
    pub keepalive_ms: u64,
    #[prost(uint32, tag = "12")]
    pub request_n: u32,
}

impl Frame {
    fn of(stream_id: u32, kind: FrameType) -> Self {
        Self {
            stream_id,
            frame_type: kind as i32,
            ..Default::default()
        }
    }

    fn with_payload(mut self, payload: Payload) -> Self {
        let (data, metadata) = payload.into_parts();
        self.data = data;
        self.metadata = metadata;
        self
    }

    pub fn setup(token: &SessionToken, resume_timeout_ms: u64, keepalive_ms: u64) -> Self {
        Self {
            resume_token: token.to_string(),
            resume_timeout_ms,
            keepalive_ms,
            ..Self::of(CONNECTION_STREAM, FrameType::Setup)
        }
    }

    pub fn setup_ok() -> Self {
        Self::of(CONNECTION_STREAM, FrameType::SetupOk)
    }

    pub fn resume(token: &SessionToken) -> Self {
        Self {
            resume_token: token.to_string(),
            ..Self::of(CONNECTION_STREAM, FrameType::Resume)
        }
    }

    pub fn resume_ok() -> Self {
        Self::of(CONNECTION_STREAM, FrameType::ResumeOk)
    }

    pub fn keepalive(respond: bool) -> Self {
        Self {
            respond,
            ..Self::of(CONNECTION_STREAM, FrameType::Keepalive)
        }
    }

    pub fn error(stream_id: u32, code: u32, message: impl Into<String>) -> Self {
        Self {
            error_code: code,
            data: Bytes::from(message.into()),
            ..Self::of(stream_id, FrameType::Error)
        }
    }

    pub fn metadata_push(metadata: Bytes) -> Self {
        Self {
            metadata: Some(metadata),
            ..Self::of(CONNECTION_STREAM, FrameType::MetadataPush)
        }
    }

    pub fn request_fnf(stream_id: u32, payload: Payload) -> Self {
        Self::of(stream_id, FrameType::RequestFnf).with_payload(payload)
    }

    pub fn request_response(stream_id: u32, payload: Payload) -> Self {
        Self::of(stream_id, FrameType::RequestResponse).with_payload(payload)
    }

    pub fn request_stream(stream_id: u32, payload: Payload) -> Self {
        Self {
            request_n: UNBOUNDED_REQUEST_N,
            ..Self::of(stream_id, FrameType::RequestStream).with_payload(payload)
        }
    }

    pub fn request_channel(stream_id: u32, payload: Payload, complete: bool) -> Self {
        Self {
            request_n: UNBOUNDED_REQUEST_N,
            complete,
            ..Self::of(stream_id, FrameType::RequestChannel).with_payload(payload)
        }
    }

    /// A payload frame carrying data, optionally finishing the sender's side.
    pub fn next(stream_id: u32, payload: Payload, complete: bool) -> Self {
        Self {
            next: true,
            complete,
            ..Self::of(stream_id, FrameType::Payload).with_payload(payload)
        }
    }

    /// A payload frame finishing the sender's side without data.
    pub fn complete(stream_id: u32) -> Self {
        Self {
            complete: true,
            ..Self::of(stream_id, FrameType::Payload)
        }
    }

    pub fn cancel(stream_id: u32) -> Self {
        Self::of(stream_id, FrameType::Cancel)
    }

    /// The decoded frame type; unknown values map to [`FrameType::Reserved`].
    pub fn kind(&self) -> FrameType {
        FrameType::try_from(self.frame_type).unwrap_or(FrameType::Reserved)
    }

    pub fn payload(&self) -> Payload {
        Payload::new(self.data.clone(), self.metadata.clone())
    }

    pub fn token(&self) -> SessionToken {
        SessionToken::from(self.resume_token.as_str())
    }

    /// Error text of an error frame.
    pub fn error_message(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Length-prefixed frame codec for byte stream transports.
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(3)
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, TransportError> {
        match self.inner.decode(src)? {
            Some(buf) => Ok(Some(Frame::decode(buf.freeze())?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), TransportError> {
        self.inner.encode(Bytes::from(frame.encode_to_vec()), dst)?;
        Ok(())
    }
}
