//! Peer server — the runtime's private listening socket.
//!
//! Other runtimes connect here for two things. A subscriber sends one
//! EVENT_SUBSCRIBE and then keeps the socket open for EVENT pushes. A caller
//! sends one METHOD_CALL, reads one METHOD_RESPONSE, and hangs up. Anything
//! else is logged and the connection dropped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};

use ubus_core::control::{ControlDoc, MethodCall, PeerSubscribe, ResponseCode};
use ubus_core::poll::next_conn_id;
use ubus_core::wire::{read_frame, write_frame, Frame, FrameType};

use crate::state::{SubscriberConn, Tables};

pub(crate) struct PeerServer {
    listener: TcpListener,
    tables: Arc<Tables>,
    request_timeout: Duration,
    max_frame: usize,
    shutdown: broadcast::Receiver<()>,
}

impl PeerServer {
    pub fn new(
        listener: TcpListener,
        tables: Arc<Tables>,
        request_timeout: Duration,
        max_frame: usize,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            listener,
            tables,
            request_timeout,
            max_frame,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::debug!("peer server shutting down");
                    return;
                }

                result = self.listener.accept() => {
                    let (stream, peer) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "peer accept failed");
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);
                    tokio::spawn(serve_peer(
                        stream,
                        peer,
                        self.tables.clone(),
                        self.request_timeout,
                        self.max_frame,
                        self.shutdown.resubscribe(),
                    ));
                }
            }
        }
    }
}

async fn serve_peer(
    stream: TcpStream,
    peer: SocketAddr,
    tables: Arc<Tables>,
    request_timeout: Duration,
    max_frame: usize,
    shutdown: broadcast::Receiver<()>,
) {
    let (mut reader, writer) = stream.into_split();
    let frame = match tokio::time::timeout(request_timeout, read_frame(&mut reader, max_frame)).await
    {
        Ok(Ok(f)) => f,
        Ok(Err(e)) => {
            tracing::debug!(%peer, error = %e, "peer left before sending a request");
            return;
        }
        Err(_) => {
            tracing::warn!(%peer, "peer sent no request in time");
            return;
        }
    };

    match frame.frame_type {
        FrameType::EventSubscribe => {
            accept_subscriber(frame, peer, reader, writer, tables, request_timeout, shutdown).await
        }
        FrameType::MethodCall => serve_call(frame, peer, writer, tables, request_timeout).await,
        other => tracing::warn!(%peer, frame_type = ?other, "unexpected peer frame, dropping"),
    }
}

async fn accept_subscriber(
    frame: Frame,
    peer: SocketAddr,
    mut reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    tables: Arc<Tables>,
    write_timeout: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let writer = Arc::new(Mutex::new(writer));
    let req: PeerSubscribe = match frame.doc().and_then(|d| d.decode()) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(%peer, error = %e, "malformed peer subscribe");
            let mut w = writer.lock().await;
            let reply = Frame::control(FrameType::EventSubscribe, &ControlDoc::response(ResponseCode::Invalid));
            let _ = tokio::time::timeout(write_timeout, write_frame(&mut *w, &reply)).await;
            return;
        }
    };

    let conn = next_conn_id();
    // Held until OK is written, so no EVENT can overtake it.
    let mut held = writer.clone().lock_owned().await;

    let code = match tables.pub_events.get_mut(&req.topic) {
        None => ResponseCode::Invalid,
        Some(mut info) => {
            if info.type_id != req.type_id {
                tracing::warn!(
                    %peer,
                    topic = %req.topic,
                    expected = info.type_id,
                    got = req.type_id,
                    "subscriber type mismatch"
                );
                ResponseCode::Invalid
            } else if info.subscribers.contains_key(&req.name) {
                ResponseCode::Duplicate
            } else {
                info.subscribers.insert(
                    req.name.clone(),
                    SubscriberConn {
                        conn,
                        writer: writer.clone(),
                    },
                );
                ResponseCode::Ok
            }
        }
    };

    let reply = Frame::control(FrameType::EventSubscribe, &ControlDoc::response(code));
    let written = matches!(
        tokio::time::timeout(write_timeout, write_frame(&mut *held, &reply)).await,
        Ok(Ok(()))
    );
    drop(held);

    if code != ResponseCode::Ok {
        tracing::info!(%peer, topic = %req.topic, name = %req.name, %code, "peer subscribe refused");
        return;
    }
    if !written {
        tracing::warn!(%peer, topic = %req.topic, "failed to confirm subscription");
        tables.prune_subscriber(&req.topic, &req.name, conn);
        return;
    }
    tracing::info!(topic = %req.topic, subscriber = %req.name, "subscriber attached");

    // Subscribers never send after the handshake; EOF means they are gone.
    let mut buf = [0u8; 256];
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            r = reader.read(&mut buf) => match r {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            },
        }
    }
    if tables.prune_subscriber(&req.topic, &req.name, conn) {
        tracing::info!(topic = %req.topic, subscriber = %req.name, "subscriber detached");
    }
}

async fn serve_call(
    frame: Frame,
    peer: SocketAddr,
    mut writer: OwnedWriteHalf,
    tables: Arc<Tables>,
    write_timeout: Duration,
) {
    let reply = match invoke(&frame, peer, &tables).await {
        Some(data) => {
            let mut doc = ControlDoc::response(ResponseCode::Ok);
            doc.set_str("response_data", data);
            doc
        }
        None => ControlDoc::response(ResponseCode::Invalid),
    };
    let frame = Frame::control(FrameType::MethodResponse, &reply);
    match tokio::time::timeout(write_timeout, write_frame(&mut writer, &frame)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(%peer, error = %e, "failed to send method response"),
        Err(_) => tracing::warn!(%peer, "method response write timed out"),
    }
}

/// Run the handler for a METHOD_CALL. `None` answers INVALID.
async fn invoke(frame: &Frame, peer: SocketAddr, tables: &Tables) -> Option<String> {
    let call: MethodCall = match frame.doc().and_then(|d| d.decode()) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(%peer, error = %e, "malformed method call");
            return None;
        }
    };

    let handler = match tables.methods.get(&call.method) {
        Some(reg)
            if reg.request_type_id == call.request_type_id
                && reg.response_type_id == call.response_type_id =>
        {
            reg.handler.clone()
        }
        Some(reg) => {
            tracing::warn!(
                method = %call.method,
                caller = %call.name,
                expected = ?(reg.request_type_id, reg.response_type_id),
                got = ?(call.request_type_id, call.response_type_id),
                "method type mismatch"
            );
            return None;
        }
        None => {
            tracing::warn!(method = %call.method, caller = %call.name, "unknown method");
            return None;
        }
    };

    let request = call.request_data.into_bytes();
    let result = tokio::task::spawn_blocking(move || handler.call(&request)).await;
    match result {
        Ok(Ok(response)) => match String::from_utf8(response) {
            Ok(text) => Some(text),
            Err(_) => {
                tracing::warn!(method = %call.method, "handler returned non-UTF-8 response");
                None
            }
        },
        Ok(Err(e)) => {
            tracing::warn!(method = %call.method, error = %e, "handler rejected request");
            None
        }
        Err(e) => {
            tracing::error!(method = %call.method, error = %e, "handler panicked");
            None
        }
    }
}
