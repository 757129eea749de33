//! Control loop — owns every joined participant's control connection.
//!
//! Each tick reconciles membership in a fixed order: participants the
//! watchdog declared dead are reaped first, then newly joined connections
//! are added to the poller. Between ticks the loop answers control frames
//! as they arrive.
//!
//! The loop never writes to a socket itself. Replies go through a bounded
//! queue to a writer task per connection, so a participant that stops
//! reading its replies cannot hold up anyone else's keep-alives. When that
//! queue is full, or its writer gave up, the connection is dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use ubus_core::poll::{ConnId, FramePoller, Readiness};
use ubus_core::wire::{write_frame, Frame};

use crate::accept::Joined;
use crate::dispatch::dispatch;
use crate::registry::Registry;

/// Replies that may wait on one connection before it counts as stalled.
pub const REPLY_QUEUE_DEPTH: usize = 64;

struct Conn {
    name: String,
    replies: mpsc::Sender<Frame>,
    writer: JoinHandle<()>,
}

pub struct ControlLoop {
    registry: Arc<Registry>,
    joined_rx: mpsc::Receiver<Joined>,
    dead_rx: mpsc::UnboundedReceiver<(String, ConnId)>,
    stalled_tx: mpsc::UnboundedSender<ConnId>,
    stalled_rx: mpsc::UnboundedReceiver<ConnId>,
    poller: FramePoller,
    conns: HashMap<ConnId, Conn>,
    tick: Duration,
    write_timeout: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl ControlLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<Registry>,
        joined_rx: mpsc::Receiver<Joined>,
        dead_rx: mpsc::UnboundedReceiver<(String, ConnId)>,
        tick: Duration,
        frame_timeout: Duration,
        max_frame: usize,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let (stalled_tx, stalled_rx) = mpsc::unbounded_channel();
        Self {
            registry,
            joined_rx,
            dead_rx,
            stalled_tx,
            stalled_rx,
            poller: FramePoller::new(max_frame, Some(frame_timeout)),
            conns: HashMap::new(),
            tick,
            write_timeout: frame_timeout,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!(connections = self.conns.len(), "control loop shutting down");
                    for (_, c) in self.conns.drain() {
                        c.writer.abort();
                    }
                    return Ok(());
                }

                _ = interval.tick() => {
                    self.reap_dead();
                    self.admit_joined();
                }

                readiness = self.poller.next() => self.handle(readiness),

                Some(conn) = self.stalled_rx.recv() => {
                    self.disconnect(conn, "reply write failed");
                }
            }
        }
    }

    fn reap_dead(&mut self) {
        while let Ok((name, conn)) = self.dead_rx.try_recv() {
            if self.registry.remove_participant(&name, conn) {
                tracing::info!(%name, conn, "participant missed keep-alives, reaped");
            }
            self.drop_conn(conn);
        }
    }

    fn admit_joined(&mut self) {
        while let Ok(joined) = self.joined_rx.try_recv() {
            // The watchdog may have reaped it while it sat in the queue.
            if self.registry.participant_by_conn(joined.conn).is_none() {
                tracing::debug!(name = %joined.name, "joined connection already reaped");
                continue;
            }
            let (replies, rx) = mpsc::channel(REPLY_QUEUE_DEPTH);
            let writer = tokio::spawn(reply_writer(
                joined.conn,
                joined.writer,
                rx,
                self.write_timeout,
                self.stalled_tx.clone(),
            ));
            self.poller.insert(joined.conn, joined.reader);
            self.conns.insert(
                joined.conn,
                Conn {
                    name: joined.name,
                    replies,
                    writer,
                },
            );
        }
    }

    fn handle(&mut self, readiness: Readiness) {
        let conn = readiness.conn();
        if !self.poller.contains(conn) {
            return;
        }

        let frame = match readiness {
            Readiness::Frame(_, frame) => frame,
            Readiness::Closed(_) => {
                self.disconnect(conn, "peer closed");
                return;
            }
            Readiness::Failed(_, e) => {
                tracing::warn!(conn, error = %e, "control connection failed");
                self.disconnect(conn, "read failed");
                return;
            }
        };

        tracing::debug!(conn, frame_type = ?frame.frame_type, len = frame.payload.len(), "control frame");
        let Some(reply) = dispatch(&self.registry, conn, &frame) else {
            return;
        };
        let Some(c) = self.conns.get(&conn) else {
            return;
        };
        match c.replies.try_send(reply) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(conn, name = %c.name, "participant is not reading replies");
                self.disconnect(conn, "reply queue full");
            }
            Err(TrySendError::Closed(_)) => self.disconnect(conn, "reply writer stopped"),
        }
    }

    /// Drop the connection and reap its participant right away.
    fn disconnect(&mut self, conn: ConnId, reason: &str) {
        if let Some(name) = self.registry.remove_by_conn(conn) {
            tracing::info!(%name, conn, reason, "participant left");
        }
        self.drop_conn(conn);
    }

    fn drop_conn(&mut self, conn: ConnId) {
        self.poller.remove(conn);
        if let Some(c) = self.conns.remove(&conn) {
            c.writer.abort();
            tracing::debug!(name = %c.name, conn, "control connection closed");
        }
    }
}

/// Write queued replies to one participant, each bounded by `timeout`.
/// A failed write reports the connection as stalled and stops.
async fn reply_writer(
    conn: ConnId,
    mut writer: OwnedWriteHalf,
    mut replies: mpsc::Receiver<Frame>,
    timeout: Duration,
    stalled: mpsc::UnboundedSender<ConnId>,
) {
    while let Some(frame) = replies.recv().await {
        match tokio::time::timeout(timeout, write_frame(&mut writer, &frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(conn, error = %e, "failed to write control reply");
                let _ = stalled.send(conn);
                return;
            }
            Err(_) => {
                tracing::warn!(conn, "control reply write timed out");
                let _ = stalled.send(conn);
                return;
            }
        }
    }
}
