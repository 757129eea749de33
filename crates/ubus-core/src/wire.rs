//! ubus wire format — the frame header and the framing discipline.
//!
//! Every byte exchanged on a control channel or a peer connection belongs to
//! a frame: a fixed 5-byte header followed by `data_length` payload bytes.
//! The header carries no checksum and no protocol version; versioning lives
//! only in the INITIATION control payload.
//!
//! The header is `#[repr(C)]` with unaligned fields and zerocopy derives, so
//! encoding and decoding it is a plain byte copy. `data_length` is always in
//! network byte order.

use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use static_assertions::assert_eq_size;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zerocopy::byteorder::{NetworkEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::control::{ControlDoc, ControlError};

// ── Frame Type ───────────────────────────────────────────────────────────────

/// Discriminator carried in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Unknown = 0,
    Initiation = 1,
    EventSubscribe = 2,
    EventRegister = 3,
    Event = 4,
    KeepAlive = 5,
    MethodProvide = 6,
    MethodQuery = 7,
    MethodCall = 8,
    MethodResponse = 9,
    Debug = 10,
    EventUnsubscribe = 11,
}

impl From<u8> for FrameType {
    /// Unrecognized bytes decode to `Unknown`. The payload is still consumed,
    /// so the stream stays in sync and the receiver can answer INVALID.
    fn from(value: u8) -> Self {
        match value {
            1 => FrameType::Initiation,
            2 => FrameType::EventSubscribe,
            3 => FrameType::EventRegister,
            4 => FrameType::Event,
            5 => FrameType::KeepAlive,
            6 => FrameType::MethodProvide,
            7 => FrameType::MethodQuery,
            8 => FrameType::MethodCall,
            9 => FrameType::MethodResponse,
            10 => FrameType::Debug,
            11 => FrameType::EventUnsubscribe,
            _ => FrameType::Unknown,
        }
    }
}

impl From<FrameType> for u8 {
    fn from(t: FrameType) -> u8 {
        t as u8
    }
}

// ── Frame Header ─────────────────────────────────────────────────────────────

/// Fixed-size prefix of every frame.
///
/// Wire size: 5 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct FrameHeader {
    /// `FrameType` as a raw byte.
    pub message_type: u8,
    /// Payload length in bytes, not including this header.
    pub data_length: U32<NetworkEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(FrameHeader, [u8; 5]);

/// Header length in bytes.
pub const HEADER_LEN: usize = std::mem::size_of::<FrameHeader>();

impl FrameHeader {
    pub fn new(frame_type: FrameType, data_length: u32) -> Self {
        Self {
            message_type: frame_type.into(),
            data_length: U32::new(data_length),
        }
    }

    pub fn frame_type(&self) -> FrameType {
        FrameType::from(self.message_type)
    }

    pub fn len(&self) -> usize {
        self.data_length.get() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Frame ────────────────────────────────────────────────────────────────────

/// A decoded frame: type plus owned payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type,
            payload: payload.into(),
        }
    }

    /// A frame with no payload (KEEP_ALIVE).
    pub fn empty(frame_type: FrameType) -> Self {
        Self {
            frame_type,
            payload: Bytes::new(),
        }
    }

    /// A control frame carrying a serialized document.
    pub fn control(frame_type: FrameType, doc: &ControlDoc) -> Self {
        Self::new(frame_type, doc.to_bytes())
    }

    /// Parse the payload as a control document.
    pub fn doc(&self) -> Result<ControlDoc, ControlError> {
        ControlDoc::parse(&self.payload)
    }

    /// Header and payload in one contiguous buffer.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let len = u32::try_from(self.payload.len())
            .map_err(|_| WireError::TooLarge(self.payload.len(), u32::MAX as usize))?;
        let header = FrameHeader::new(self.frame_type, len);
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf.freeze())
    }
}

// ── Constants ────────────────────────────────────────────────────────────────

/// Protocol version sent in INITIATION. The master rejects any other value.
pub const API_VERSION: &str = "1.0";

/// Default master control port.
pub const DEFAULT_MASTER_PORT: u16 = 5101;

/// Default upper bound on `data_length` (16 MiB).
/// A peer announcing more than this is dropped before any allocation.
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors that can arise while moving frames over a byte stream.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Orderly close: EOF before the first header byte.
    #[error("peer closed the connection")]
    Closed,

    #[error("connection closed mid-frame: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("frame length {0} exceeds maximum {1}")]
    TooLarge(usize, usize),

    #[error("frame payload not received within {0:?}")]
    Timeout(Duration),

    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

impl WireError {
    /// True when the peer is gone and the connection should be dropped.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, WireError::Closed | WireError::Truncated { .. })
    }
}

// ── Framing ──────────────────────────────────────────────────────────────────

/// Write a whole frame. Either every byte is written or an error is returned.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = frame.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly one frame.
///
/// Returns `WireError::Closed` if the peer closed before sending any header
/// byte, and `WireError::TooLarge` without allocating if the announced
/// length exceeds `max_payload`.
pub async fn read_frame<R>(reader: &mut R, max_payload: usize) -> Result<Frame, WireError>
where
    R: AsyncRead + Unpin,
{
    let header = read_header(reader).await?;
    read_payload(reader, header, max_payload).await
}

/// Like [`read_frame`], but once a header has arrived the payload must follow
/// within `timeout`. Waiting for the header itself is unbounded: an idle
/// connection is not an error.
pub async fn read_frame_timed<R>(
    reader: &mut R,
    max_payload: usize,
    timeout: Duration,
) -> Result<Frame, WireError>
where
    R: AsyncRead + Unpin,
{
    let header = read_header(reader).await?;
    match tokio::time::timeout(timeout, read_payload(reader, header, max_payload)).await {
        Ok(result) => result,
        Err(_) => Err(WireError::Timeout(timeout)),
    }
}

async fn read_header<R>(reader: &mut R) -> Result<FrameHeader, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) if filled == 0 => return Err(WireError::Closed),
            Ok(0) => {
                return Err(WireError::Truncated {
                    expected: HEADER_LEN,
                    got: filled,
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    FrameHeader::read_from(&buf[..]).ok_or(WireError::Truncated {
        expected: HEADER_LEN,
        got: filled,
    })
}

async fn read_payload<R>(
    reader: &mut R,
    header: FrameHeader,
    max_payload: usize,
) -> Result<Frame, WireError>
where
    R: AsyncRead + Unpin,
{
    let len = header.len();
    if len > max_payload {
        return Err(WireError::TooLarge(len, max_payload));
    }

    let mut payload = BytesMut::zeroed(len);
    if len > 0 {
        reader.read_exact(&mut payload).await.map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                WireError::Truncated {
                    expected: len,
                    got: 0,
                }
            } else {
                WireError::Io(e)
            }
        })?;
    }

    Ok(Frame {
        frame_type: header.frame_type(),
        payload: payload.freeze(),
    })
}

// ── Tests ────────────────────────────────────────────────────────────────────
