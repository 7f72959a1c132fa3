//! Heartbeat monitor: one independent ping/pong cycle per connection.
//!
//! Runs detached from the dispatcher so an unresponsive peer can never
//! stall delivery to anyone else. Config validation guarantees the
//! write-wait window is shorter than the ping period, so cycles never
//! overlap.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::debug;

use crate::connection::{CloseReason, Connection};
use crate::transport::Frame;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Heartbeat {
    /// Interval between pings (P)
    pub ping_period: Duration,
    /// Deadline for a pong, or any traffic, after a ping (W), W < P
    pub write_wait: Duration,
}

impl Heartbeat {
    /// Drive the ping cycle until the connection is cancelled or found
    /// dead. Pings travel on the control queue so a full message queue
    /// cannot suppress them.
    pub(crate) async fn run(self, connection: Arc<Connection>) {
        loop {
            tokio::select! {
                () = connection.cancelled() => return,
                () = sleep(self.ping_period) => {}
            }

            let ping_sent = Instant::now();
            if connection.send_control(Frame::Ping).is_err() {
                // Control queue full or writer gone: the connection is
                // not consuming even its own heartbeat.
                connection.begin_close(CloseReason::HeartbeatTimeout);
                return;
            }

            tokio::select! {
                () = connection.cancelled() => return,
                () = sleep(self.write_wait) => {}
            }

            if connection.last_seen() < ping_sent {
                debug!(
                    connection_id = %connection.id(),
                    token = %connection.token(),
                    "No pong within the write-wait window"
                );
                connection.begin_close(CloseReason::HeartbeatTimeout);
                return;
            }
        }
    }
}
