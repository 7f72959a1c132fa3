//! Fanout dispatcher: matches an inbound message to every live
//! connection of its recipient and enqueues without ever blocking.

use std::sync::Arc;

use courier_core::models::{OutboundMessage, Recipient};
use tracing::{debug, warn};

use crate::connection::{CloseReason, EnqueueError};
use crate::registry::Registry;

/// Result of one dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Connections whose queue accepted the message
    pub delivered: usize,
    /// Connections evicted as slow consumers (message dropped for them)
    pub dropped_slow: usize,
    /// Connections skipped because they were already tearing down
    pub skipped: usize,
}

/// Delivers messages into per-connection queues via the registry.
///
/// Delivery is at-most-once and best-effort: a connection whose queue
/// is full loses the message and is evicted, without affecting
/// delivery to any other connection.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Fan one message out to every matching live connection.
    pub fn dispatch(&self, message: &OutboundMessage) -> DispatchOutcome {
        let targets = match &message.recipient {
            Recipient::Client(token) => self.registry.lookup(token),
            Recipient::Broadcast => self.registry.open_connections(),
        };

        let mut outcome = DispatchOutcome::default();
        for connection in targets {
            match connection.try_enqueue(message.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(EnqueueError::Full) => {
                    warn!(
                        connection_id = %connection.id(),
                        token = %connection.token(),
                        "Outbound queue full, evicting slow consumer"
                    );
                    connection.begin_close(CloseReason::SlowConsumer);
                    outcome.dropped_slow += 1;
                }
                Err(EnqueueError::NotOpen) => {
                    // Raced with teardown; that connection's own tasks
                    // handle the cleanup.
                    debug!(connection_id = %connection.id(), "Skipping closing connection");
                    outcome.skipped += 1;
                }
            }
        }
        outcome
    }
}
