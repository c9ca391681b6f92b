//! Payloads and pluggable payload serialization.
//!
//! A [`Payload`] is the unit every interaction carries: opaque data plus optional metadata. The
//! [`PayloadCodec`] trait turns typed request/response objects into payloads and back, with
//! [`JsonCodec`] as the default text encoding.

use std::fmt;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Immutable `(data, metadata)` pair exchanged on a stream.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Payload {
    data: Bytes,
    metadata: Option<Bytes>,
}

impl Payload {
    pub fn new(data: impl Into<Bytes>, metadata: Option<Bytes>) -> Self {
        Self {
            data: data.into(),
            metadata,
        }
    }

    pub fn from_data(data: impl Into<Bytes>) -> Self {
        Self::new(data, None)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn metadata(&self) -> Option<&Bytes> {
        self.metadata.as_ref()
    }

    /// Data interpreted as UTF-8, with invalid sequences replaced.
    pub fn data_utf8(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    pub fn into_parts(self) -> (Bytes, Option<Bytes>) {
        (self.data, self.metadata)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("data_len", &self.data.len())
            .field("metadata_len", &self.metadata.as_ref().map(Bytes::len))
            .finish()
    }
}

/// Error type for codec operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Failed to encode a value into a payload.
    #[error("failed to encode payload")]
    Encode(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Failed to decode a payload into a value.
    #[error("failed to decode payload")]
    Decode(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Pluggable payload serialization format.
///
/// Codecs are cloned into every delivery task, so they should be cheap to clone.
pub trait PayloadCodec: Clone + Send + Sync + 'static {
    /// Encode a request object into a payload.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Payload, CodecError>;

    /// Decode a response object from a payload's data.
    fn decode<T: DeserializeOwned>(&self, payload: &Payload) -> Result<T, CodecError>;
}

/// JSON codec using serde_json. Produces payloads without metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Payload, CodecError> {
        let data = serde_json::to_vec(value).map_err(|e| CodecError::Encode(Box::new(e)))?;
        Ok(Payload::from_data(data))
    }

    fn decode<T: DeserializeOwned>(&self, payload: &Payload) -> Result<T, CodecError> {
        serde_json::from_slice(payload.data()).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}
