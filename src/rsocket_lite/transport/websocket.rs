use std::future::ready;

use futures::{SinkExt, StreamExt};
use prost::Message as _;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

use crate::rsocket_lite::error::TransportError;
use crate::rsocket_lite::frame::Frame;
use crate::rsocket_lite::transport::FrameTransport;

/// Carry frames over a websocket, one binary message per frame.
///
/// Text, ping and pong messages are skipped. The stream ends when the peer closes.
pub fn frames<S>(ws: WebSocketStream<S>) -> FrameTransport
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let io = ws
        .with(|frame: Frame| {
            ready(Ok::<_, TransportError>(Message::Binary(
                frame.encode_to_vec().into(),
            )))
        })
        .filter_map(|message| {
            ready(match message {
                Ok(Message::Binary(data)) => {
                    Some(Frame::decode(data).map_err(TransportError::from))
                }
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::from(e))),
            })
        });

    Box::new(io)
}
