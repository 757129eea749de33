//! The runtime's control connection to the master.
//!
//! One request is in flight at a time: the writer is held for the whole
//! write-then-wait exchange, and keep-alives queue behind it. A reader task
//! owns the receiving half and forwards every frame to the waiting request.
//! The master never sends unsolicited frames, so the next frame is always
//! the reply.
//!
//! The channel closes for good on the first failure: a failed write, a
//! reply that times out (the stream is then out of step), or the master
//! closing its end, which is how a reaped participant finds out. Closing
//! fires the `lost` signal so the session's other loops stop too.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use ubus_core::control::ControlDoc;
use ubus_core::error::BusError;
use ubus_core::wire::{read_frame, write_frame, Frame, FrameType};

struct Io {
    writer: Option<OwnedWriteHalf>,
    replies: mpsc::Receiver<Frame>,
}

pub(crate) struct ControlChannel {
    io: Mutex<Io>,
    open: Arc<AtomicBool>,
    lost: broadcast::Sender<()>,
    reader: JoinHandle<()>,
    timeout: Duration,
}

impl ControlChannel {
    pub fn new(
        stream: TcpStream,
        timeout: Duration,
        max_frame: usize,
        lost: broadcast::Sender<()>,
    ) -> Self {
        let (reader, writer) = stream.into_split();
        let (replies_tx, replies) = mpsc::channel(4);
        let open = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_replies(
            reader,
            max_frame,
            replies_tx,
            open.clone(),
            lost.clone(),
        ));
        Self {
            io: Mutex::new(Io {
                writer: Some(writer),
                replies,
            }),
            open,
            lost,
            reader,
            timeout,
        }
    }

    /// Send `doc` as a `frame_type` frame and return the reply document.
    /// The reply must carry the same frame type. Once the channel has closed
    /// every request fails with `NotInitialized`.
    pub async fn request(
        &self,
        frame_type: FrameType,
        doc: &ControlDoc,
    ) -> Result<ControlDoc, BusError> {
        let mut guard = self.io.lock().await;
        if !self.is_open() {
            self.fail(&mut guard);
            return Err(BusError::NotInitialized);
        }
        let Io { writer, replies } = &mut *guard;
        let Some(stream) = writer.as_mut() else {
            return Err(BusError::NotInitialized);
        };

        let exchange = async {
            write_frame(stream, &Frame::control(frame_type, doc)).await?;
            Ok::<_, BusError>(replies.recv().await)
        };
        let outcome = tokio::time::timeout(self.timeout, exchange).await;
        let reply = match outcome {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => {
                tracing::warn!(?frame_type, "master closed the control connection");
                self.fail(&mut guard);
                return Err(BusError::NotInitialized);
            }
            Ok(Err(e)) => {
                self.fail(&mut guard);
                return Err(e);
            }
            Err(_) => {
                tracing::warn!(?frame_type, "control request timed out, closing connection");
                self.fail(&mut guard);
                return Err(BusError::Timeout("control request", self.timeout));
            }
        };
        drop(guard);

        if reply.frame_type != frame_type {
            return Err(BusError::Protocol(format!(
                "expected {frame_type:?} reply, got {:?}",
                reply.frame_type
            )));
        }
        Ok(reply.doc()?)
    }

    pub async fn keep_alive(&self) -> Result<(), BusError> {
        let mut guard = self.io.lock().await;
        if !self.is_open() {
            self.fail(&mut guard);
            return Err(BusError::NotInitialized);
        }
        let Some(stream) = guard.writer.as_mut() else {
            return Err(BusError::NotInitialized);
        };
        let frame = Frame::empty(FrameType::KeepAlive);
        match tokio::time::timeout(self.timeout, write_frame(stream, &frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.fail(&mut guard);
                Err(e.into())
            }
            Err(_) => {
                self.fail(&mut guard);
                Err(BusError::Timeout("keep-alive", self.timeout))
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Close the connection. The master reaps this participant at once.
    pub async fn close(&self) {
        let mut guard = self.io.lock().await;
        self.open.store(false, Ordering::Release);
        guard.writer.take();
        self.reader.abort();
    }

    fn fail(&self, io: &mut Io) {
        self.open.store(false, Ordering::Release);
        if io.writer.take().is_some() {
            let _ = self.lost.send(());
        }
        self.reader.abort();
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_replies(
    mut reader: OwnedReadHalf,
    max_frame: usize,
    replies: mpsc::Sender<Frame>,
    open: Arc<AtomicBool>,
    lost: broadcast::Sender<()>,
) {
    loop {
        match read_frame(&mut reader, max_frame).await {
            Ok(frame) => {
                if replies.send(frame).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                if e.is_disconnect() {
                    tracing::warn!("master closed the control connection");
                } else {
                    tracing::warn!(error = %e, "control connection failed");
                }
                open.store(false, Ordering::Release);
                let _ = lost.send(());
                return;
            }
        }
    }
}
