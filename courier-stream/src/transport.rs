//! Transport seam between the broker and the underlying byte stream.
//!
//! The broker never touches a socket directly: the HTTP layer adapts
//! its WebSocket halves to [`FrameSink`] / [`FrameStream`], and tests
//! use the in-memory pair from [`crate::testing`].

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// One frame on the wire, reduced to what the broker cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Application payload
    Message(Bytes),
    /// Heartbeat probe
    Ping,
    /// Heartbeat answer (any inbound traffic also counts as liveness)
    Pong,
    /// Close frame; outbound it ends the connection cleanly
    Close,
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer violated the framing protocol; the connection is
    /// closed without recovery.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Read/write failure on the underlying stream (broken pipe,
    /// reset, ...); the client is expected to reconnect.
    #[error("transport failure: {0}")]
    Io(String),
}

/// Outbound half of a connection's transport
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;
}

/// Inbound half of a connection's transport
#[async_trait]
pub trait FrameStream: Send {
    /// Next inbound frame; `None` once the stream has ended.
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>>;
}
