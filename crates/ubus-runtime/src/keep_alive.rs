//! Keep-alive sender: one KEEP_ALIVE per interval on the control connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use crate::control::ControlChannel;

pub(crate) async fn keep_alive_loop(
    control: Arc<ControlChannel>,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => return,

            _ = interval.tick() => {
                if let Err(e) = control.keep_alive().await {
                    tracing::error!(error = %e, "keep-alive failed, master connection lost");
                    return;
                }
            }
        }
    }
}
