//! Readiness polling over a changing set of connections.
//!
//! Each registered read half gets a small reader task that decodes frames and
//! forwards them, tagged with the connection id, into one channel. The owning
//! loop awaits [`FramePoller::next`] alongside its tick and shutdown arms and
//! never blocks on any single socket.
//!
//! Removing a connection aborts its reader. Readiness already queued for a
//! removed connection can still be delivered; callers drop it by checking
//! [`FramePoller::contains`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::wire::{read_frame, read_frame_timed, Frame, WireError};

/// Process-unique connection identifier.
pub type ConnId = u64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_conn_id() -> ConnId {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// What a reader task reports.
#[derive(Debug)]
pub enum Readiness {
    Frame(ConnId, Frame),
    /// Orderly close. The reader has exited.
    Closed(ConnId),
    /// Read failure (truncation, oversized frame, timeout, socket error).
    /// The reader has exited.
    Failed(ConnId, WireError),
}

impl Readiness {
    pub fn conn(&self) -> ConnId {
        match self {
            Readiness::Frame(id, _) | Readiness::Closed(id) | Readiness::Failed(id, _) => *id,
        }
    }
}

const CHANNEL_DEPTH: usize = 1024;

pub struct FramePoller {
    max_frame: usize,
    frame_timeout: Option<Duration>,
    readers: HashMap<ConnId, JoinHandle<()>>,
    tx: mpsc::Sender<Readiness>,
    rx: mpsc::Receiver<Readiness>,
}

impl FramePoller {
    pub fn new(max_frame: usize, frame_timeout: Option<Duration>) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        Self {
            max_frame,
            frame_timeout,
            readers: HashMap::new(),
            tx,
            rx,
        }
    }

    /// Start watching `reader`. Replaces any reader already registered under `id`.
    pub fn insert<R>(&mut self, id: ConnId, mut reader: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let tx = self.tx.clone();
        let max_frame = self.max_frame;
        let frame_timeout = self.frame_timeout;

        let handle = tokio::spawn(async move {
            loop {
                let result = match frame_timeout {
                    Some(t) => read_frame_timed(&mut reader, max_frame, t).await,
                    None => read_frame(&mut reader, max_frame).await,
                };
                let (event, done) = match result {
                    Ok(frame) => (Readiness::Frame(id, frame), false),
                    Err(WireError::Closed) => (Readiness::Closed(id), true),
                    Err(e) => (Readiness::Failed(id, e), true),
                };
                if tx.send(event).await.is_err() || done {
                    break;
                }
            }
            trace!(conn = id, "reader exited");
        });

        if let Some(old) = self.readers.insert(id, handle) {
            old.abort();
        }
    }

    /// Stop watching `id`. Returns false if it was not registered.
    pub fn remove(&mut self, id: ConnId) -> bool {
        match self.readers.remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.readers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.readers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }

    /// Wait for the next readiness report from any connection.
    /// Pends forever while nothing is registered.
    pub async fn next(&mut self) -> Readiness {
        match self.rx.recv().await {
            Some(r) => r,
            // The poller holds a sender, so the channel cannot close.
            None => std::future::pending().await,
        }
    }
}

impl Drop for FramePoller {
    fn drop(&mut self) {
        for (_, handle) in self.readers.drain() {
            handle.abort();
        }
    }
}
