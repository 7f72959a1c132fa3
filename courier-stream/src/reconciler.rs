//! Liveness reconciler: periodically reports which client tokens are
//! connected so the persistence collaborator can mark them "last used".
//!
//! This is coarse bookkeeping, not a liveness check, so it runs on a
//! much longer period than the heartbeat. The registry snapshot is
//! taken first and the lock released before anything awaits.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::models::ClientToken;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::registry::Registry;

/// Persistence collaborator for "last used" bookkeeping.
///
/// Fire-and-forget from the broker's perspective: implementations log
/// their own failures and never surface them here.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LastUsedSink: Send + Sync {
    async fn update_last_used(&self, tokens: Vec<ClientToken>, timestamp: DateTime<Utc>);
}

/// Run the reconciliation loop until the broker shuts down.
pub(crate) async fn run(
    registry: Arc<Registry>,
    sink: Arc<dyn LastUsedSink>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so reports start one
    // full period after boot.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let tokens = registry.snapshot();
        if tokens.is_empty() {
            debug!("No connected clients, skipping last-used report");
            continue;
        }
        debug!(clients = tokens.len(), "Reporting connected client tokens");
        sink.update_last_used(tokens, Utc::now()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use mockall::predicate;

    #[tokio::test]
    async fn test_reports_snapshot_each_period() {
        let registry = Arc::new(Registry::new());
        let (conn, _queues) =
            Connection::new(ClientToken::from("seen"), 8, CancellationToken::new());
        registry.register(&conn).expect("registry open");

        let mut sink = MockLastUsedSink::new();
        sink.expect_update_last_used()
            .with(
                predicate::eq(vec![ClientToken::from("seen")]),
                predicate::always(),
            )
            .times(1..)
            .returning(|_, _| ());

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            Arc::clone(&registry),
            Arc::new(sink),
            Duration::from_millis(30),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        task.await.expect("reconciler task");
    }

    #[tokio::test]
    async fn test_empty_snapshot_is_not_reported() {
        let registry = Arc::new(Registry::new());

        let mut sink = MockLastUsedSink::new();
        sink.expect_update_last_used().times(0);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            registry,
            Arc::new(sink),
            Duration::from_millis(20),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(70)).await;
        cancel.cancel();
        task.await.expect("reconciler task");
    }
}
