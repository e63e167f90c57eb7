//! Keepalive probing for terminal channels.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::websocket::Outbound;

/// Sends a ping every `interval` until cancelled or the writer goes away.
pub fn spawn_keepalive(
    tx: mpsc::Sender<Outbound>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if tx.send(Outbound::Ping).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("keepalive stopped");
    })
}
