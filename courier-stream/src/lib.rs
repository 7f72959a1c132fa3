//! Real-time delivery broker for the Courier push-notification server.
//!
//! Clients hold long-lived connections identified by an opaque token;
//! inbound messages are fanned out to every live connection matching
//! their recipient. A per-connection heartbeat evicts dead peers, a
//! periodic reconciler reports connected tokens to a persistence
//! collaborator, and the [`Broker`] facade owns the lifecycle of it
//! all — one reader task, one writer task, and one heartbeat task per
//! connection, with explicit cancellation instead of ambient state.

pub mod broker;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod heartbeat;
pub mod reconciler;
pub mod registry;
pub mod testing;
pub mod transport;

pub use broker::{Broker, BrokerOptions};
pub use connection::{CloseReason, Connection, ConnectionId, ConnectionState};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use error::{Error, Result};
pub use reconciler::LastUsedSink;
pub use registry::Registry;
pub use transport::{Frame, FrameSink, FrameStream, TransportError};
