//! Event loop — reads EVENT frames from every subscription socket and hands
//! each payload to the subscription's handler.
//!
//! New subscriptions and cancellations arrive over a command queue and are
//! applied on the next tick, removals first. A subscription whose publisher
//! closes the socket is reaped from the poller and the subscription table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;

use ubus_core::poll::{ConnId, FramePoller, Readiness};
use ubus_core::wire::FrameType;

use crate::state::Tables;

pub(crate) enum EventLoopCmd {
    Add {
        conn: ConnId,
        topic: String,
        reader: OwnedReadHalf,
    },
    Remove {
        conn: ConnId,
    },
}

pub(crate) struct EventLoop {
    tables: Arc<Tables>,
    cmd_rx: mpsc::UnboundedReceiver<EventLoopCmd>,
    poller: FramePoller,
    topics: HashMap<ConnId, String>,
    tick: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl EventLoop {
    pub fn new(
        tables: Arc<Tables>,
        cmd_rx: mpsc::UnboundedReceiver<EventLoopCmd>,
        tick: Duration,
        max_frame: usize,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            tables,
            cmd_rx,
            poller: FramePoller::new(max_frame, None),
            topics: HashMap::new(),
            tick,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::debug!(subscriptions = self.topics.len(), "event loop shutting down");
                    return;
                }

                _ = interval.tick() => self.reconcile(),

                readiness = self.poller.next() => self.handle(readiness),
            }
        }
    }

    fn reconcile(&mut self) {
        let mut adds = Vec::new();
        let mut removes = Vec::new();
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                EventLoopCmd::Remove { conn } => removes.push(conn),
                EventLoopCmd::Add {
                    conn,
                    topic,
                    reader,
                } => adds.push((conn, topic, reader)),
            }
        }
        for conn in &removes {
            self.forget(*conn);
        }
        for (conn, topic, reader) in adds {
            if removes.contains(&conn) {
                continue;
            }
            self.poller.insert(conn, reader);
            self.topics.insert(conn, topic);
        }
    }

    fn handle(&mut self, readiness: Readiness) {
        let conn = readiness.conn();
        if !self.poller.contains(conn) {
            return;
        }
        let Some(topic) = self.topics.get(&conn).cloned() else {
            return;
        };

        match readiness {
            Readiness::Frame(_, frame) if frame.frame_type == FrameType::Event => {
                let handler = match self.tables.subscriptions.get(&topic) {
                    Some(sub) if sub.conn == conn => sub.handler.clone(),
                    _ => return,
                };
                tracing::trace!(%topic, len = frame.payload.len(), "event");
                handler.on_event(&frame.payload);
            }
            Readiness::Frame(_, frame) => {
                tracing::warn!(%topic, frame_type = ?frame.frame_type, "unexpected frame on subscription");
            }
            Readiness::Closed(_) => {
                tracing::info!(%topic, "publisher closed subscription");
                self.reap(conn, &topic);
            }
            Readiness::Failed(_, e) => {
                tracing::warn!(%topic, error = %e, "subscription failed");
                self.reap(conn, &topic);
            }
        }
    }

    fn reap(&mut self, conn: ConnId, topic: &str) {
        self.forget(conn);
        self.tables.drop_subscription(topic, conn);
    }

    fn forget(&mut self, conn: ConnId) {
        self.poller.remove(conn);
        self.topics.remove(&conn);
    }
}
