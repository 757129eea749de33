//! Liveness watchdog.
//!
//! Every keep-alive interval each participant's counter goes up by one;
//! a keep-alive resets it. Participants that reach the threshold are queued
//! for the control loop, which does the actual removal on its next tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;

use ubus_core::poll::ConnId;

use crate::registry::Registry;

pub async fn watchdog_loop(
    registry: Arc<Registry>,
    period: Duration,
    threshold: u32,
    dead_tx: mpsc::UnboundedSender<(String, ConnId)>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("watchdog shutting down");
                return;
            }

            _ = interval.tick() => {
                for (name, conn) in registry.tick_watchdogs(threshold) {
                    tracing::warn!(%name, conn, threshold, "keep-alive watchdog expired");
                    if dead_tx.send((name, conn)).is_err() {
                        return;
                    }
                }
            }
        }
    }
}
