//! Adapters from the axum WebSocket halves to the broker's transport
//! traits.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};

use courier_stream::{Frame, FrameSink, FrameStream, TransportError};

pub struct WsFrameStream {
    inner: SplitStream<WebSocket>,
}

pub struct WsFrameSink {
    inner: SplitSink<WebSocket, Message>,
}

/// Split an upgraded socket into the broker's reader/writer halves.
pub fn split(socket: WebSocket) -> (WsFrameStream, WsFrameSink) {
    let (sink, stream) = socket.split();
    (WsFrameStream { inner: stream }, WsFrameSink { inner: sink })
}

#[async_trait]
impl FrameStream for WsFrameStream {
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        let frame = match self.inner.next().await? {
            Ok(Message::Binary(payload)) => Ok(Frame::Message(payload)),
            Ok(Message::Text(text)) => Ok(Frame::Message(Bytes::copy_from_slice(text.as_bytes()))),
            // axum answers inbound pings at the protocol level; both
            // directions still count as liveness for the heartbeat.
            Ok(Message::Ping(_)) => Ok(Frame::Ping),
            Ok(Message::Pong(_)) => Ok(Frame::Pong),
            Ok(Message::Close(_)) => Ok(Frame::Close),
            Err(e) => Err(TransportError::Io(e.to_string())),
        };
        Some(frame)
    }
}

#[async_trait]
impl FrameSink for WsFrameSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let message = match frame {
            Frame::Message(payload) => Message::Binary(payload),
            Frame::Ping => Message::Ping(Bytes::new()),
            Frame::Pong => Message::Pong(Bytes::new()),
            Frame::Close => Message::Close(None),
        };
        self.inner
            .send(message)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}
