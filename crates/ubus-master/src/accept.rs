//! Control port acceptor and join handshake.
//!
//! A new connection is AWAITING_INITIATION until it sends an INITIATION the
//! registry accepts. Every refused attempt is answered with its code and the
//! connection may try again; it is only handed to the control loop once it
//! has been answered `OK`. The whole handshake must finish within the frame
//! timeout.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::Instant;

use ubus_core::control::{ControlDoc, Initiation, ResponseCode};
use ubus_core::poll::{next_conn_id, ConnId};
use ubus_core::wire::{read_frame, write_frame, Frame, FrameType};

use crate::registry::Registry;

/// A connection that has just been promoted to ACTIVE.
#[derive(Debug)]
pub struct Joined {
    pub conn: ConnId,
    pub name: String,
    pub reader: OwnedReadHalf,
    pub writer: OwnedWriteHalf,
}

pub struct Acceptor {
    listener: TcpListener,
    registry: Arc<Registry>,
    joined_tx: mpsc::Sender<Joined>,
    frame_timeout: Duration,
    max_frame: usize,
    shutdown: broadcast::Receiver<()>,
}

impl Acceptor {
    pub fn new(
        listener: TcpListener,
        registry: Arc<Registry>,
        joined_tx: mpsc::Sender<Joined>,
        frame_timeout: Duration,
        max_frame: usize,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            listener,
            registry,
            joined_tx,
            frame_timeout,
            max_frame,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut handshakes = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("acceptor shutting down");
                    handshakes.abort_all();
                    return Ok(());
                }

                Some(_) = handshakes.join_next(), if !handshakes.is_empty() => {}

                result = self.listener.accept() => {
                    let (stream, peer) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    tracing::debug!(%peer, "control connection accepted");
                    let _ = stream.set_nodelay(true);

                    let registry = self.registry.clone();
                    let joined_tx = self.joined_tx.clone();
                    let frame_timeout = self.frame_timeout;
                    let max_frame = self.max_frame;
                    handshakes.spawn(async move {
                        let joined =
                            match handshake(stream, peer, &registry, frame_timeout, max_frame).await {
                                Some(j) => j,
                                None => return,
                            };
                        let (name, conn) = (joined.name.clone(), joined.conn);
                        if joined_tx.send(joined).await.is_err() {
                            tracing::warn!(%name, "control loop gone, dropping participant");
                            registry.remove_participant(&name, conn);
                        }
                    });
                }
            }
        }
    }
}

/// Run the join handshake on a fresh connection. `None` if the peer left,
/// stalled, or the connection failed before a successful join.
pub async fn handshake(
    stream: TcpStream,
    peer: SocketAddr,
    registry: &Registry,
    frame_timeout: Duration,
    max_frame: usize,
) -> Option<Joined> {
    let conn = next_conn_id();
    let (mut reader, mut writer) = stream.into_split();
    let deadline = Instant::now() + frame_timeout;

    loop {
        let frame =
            match tokio::time::timeout_at(deadline, read_frame(&mut reader, max_frame)).await {
                Ok(Ok(f)) => f,
                Ok(Err(e)) => {
                    tracing::debug!(%peer, error = %e, "connection ended before joining");
                    return None;
                }
                Err(_) => {
                    tracing::warn!(%peer, "join handshake timed out");
                    return None;
                }
            };

        let (code, joined_name) = evaluate(registry, conn, peer, &frame);
        let reply = Frame::control(frame.frame_type, &ControlDoc::response(code));

        if let Err(e) = write_frame(&mut writer, &reply).await {
            tracing::warn!(%peer, error = %e, "failed to answer INITIATION");
            if let Some(name) = joined_name {
                registry.remove_participant(&name, conn);
            }
            return None;
        }

        if let Some(name) = joined_name {
            tracing::info!(%peer, %name, conn, "participant joined");
            return Some(Joined {
                conn,
                name,
                reader,
                writer,
            });
        }
        tracing::info!(%peer, %code, "join refused");
    }
}

fn evaluate(
    registry: &Registry,
    conn: ConnId,
    peer: SocketAddr,
    frame: &Frame,
) -> (ResponseCode, Option<String>) {
    if frame.frame_type != FrameType::Initiation {
        tracing::warn!(%peer, frame_type = ?frame.frame_type, "expected INITIATION");
        return (ResponseCode::Invalid, None);
    }
    let init: Initiation = match frame.doc().and_then(|d| d.decode()) {
        Ok(i) => i,
        Err(e) => {
            tracing::warn!(%peer, error = %e, "malformed INITIATION");
            return (ResponseCode::Invalid, None);
        }
    };
    match registry.join(&init, peer, conn) {
        Ok(info) => (ResponseCode::Ok, Some(info.name.clone())),
        Err(e) => {
            tracing::debug!(%peer, error = %e, "join rejected");
            (e.code(), None)
        }
    }
}
