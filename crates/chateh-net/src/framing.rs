//! Tag/length framing for TCP streams.
//!
//! Every unit on the wire is a frame:
//!
//! ```text
//! +----------------+-------------------+--------------------+
//! | tag (2 bytes)  | length (2 bytes)  |   payload          |
//! | u16 LE         | u16 LE            |   (length bytes)   |
//! +----------------+-------------------+--------------------+
//! ```
//!
//! The length does **not** include the 4 header bytes. Control frames
//! (Connected, Disconnected, Ping, Pong) carry a length of 0.
//!
//! Reads loop until the declared number of payload bytes has arrived, so a
//! payload split across several TCP segments is never truncated.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the frame header (tag + length).
pub const HEADER_LEN: usize = 4;

/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Known frame tags. Values are part of the wire format and never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Tag {
    /// Peer announces itself after opening the socket.
    Connected = 0,
    /// Peer is about to close the socket.
    Disconnected = 1,
    /// Liveness check.
    Ping = 2,
    /// Reply to a [`Tag::Ping`].
    Pong = 3,
    /// Chat text, payload is a serialized [`ChatMessage`](crate::ChatMessage).
    Message = 4,
}

impl Tag {
    /// Map a raw wire value to a known tag.
    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(Tag::Connected),
            1 => Some(Tag::Disconnected),
            2 => Some(Tag::Ping),
            3 => Some(Tag::Pong),
            4 => Some(Tag::Message),
            _ => None,
        }
    }

    /// Raw wire value.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Whether this tag is a payload-less control frame.
    pub fn is_control(self) -> bool {
        !matches!(self, Tag::Message)
    }
}

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload does not fit into a 16-bit length field.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The actual payload size.
        size: usize,
        /// The wire maximum.
        max: usize,
    },

    /// The stream ended inside a frame.
    #[error("bad frame: expected {expected} bytes, stream ended after {received}")]
    BadFrame {
        /// Bytes the frame declared (header or payload).
        expected: usize,
        /// Bytes that actually arrived.
        received: usize,
    },

    /// The peer closed the connection cleanly between frames.
    #[error("connection closed")]
    ConnectionClosed,

    /// No complete frame arrived within the read deadline.
    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Whether this error is an ordinary end of a connection rather than a
    /// protocol violation.
    pub fn is_disconnect(&self) -> bool {
        match self {
            FrameError::ConnectionClosed | FrameError::Timeout(_) => true,
            FrameError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            FrameError::PayloadTooLarge { .. } | FrameError::BadFrame { .. } => false,
        }
    }
}

/// A decoded frame. The payload length always fits the 16-bit length field.
///
/// The raw tag is kept as-is so frames with tags this build does not know
/// can be logged and skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    tag: u16,
    payload: Vec<u8>,
}

impl Frame {
    /// Build a frame with a known tag.
    pub fn new(tag: Tag, payload: Vec<u8>) -> Result<Self, FrameError> {
        Self::from_raw(tag.as_u16(), payload)
    }

    /// Build a frame with an arbitrary raw tag.
    pub fn from_raw(tag: u16, payload: Vec<u8>) -> Result<Self, FrameError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }
        Ok(Self { tag, payload })
    }

    /// A [`Tag::Message`] frame around an already bounded payload.
    pub(crate) fn message(payload: Vec<u8>) -> Self {
        debug_assert!(payload.len() <= MAX_PAYLOAD_LEN);
        Self {
            tag: Tag::Message.as_u16(),
            payload,
        }
    }

    /// A payload-less frame.
    pub fn control(tag: Tag) -> Self {
        Self {
            tag: tag.as_u16(),
            payload: Vec::new(),
        }
    }

    /// The known tag, or `None` for tags from a newer protocol revision.
    pub fn tag(&self) -> Option<Tag> {
        Tag::from_u16(self.tag)
    }

    /// The tag exactly as it appeared on the wire.
    pub fn raw_tag(&self) -> u16 {
        self.tag
    }

    /// Declared payload length. Always equals `payload().len()`.
    pub fn length(&self) -> u16 {
        self.payload.len() as u16
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consume the frame and return its payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Encode header and payload into a fresh buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        put_header(&mut buf, self.tag, self.length());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

fn put_header(buf: &mut Vec<u8>, tag: u16, length: u16) {
    buf.extend_from_slice(&tag.to_le_bytes());
    buf.extend_from_slice(&length.to_le_bytes());
}

/// Encode a frame into `dst`.
///
/// Fails with [`FrameError::PayloadTooLarge`] if the payload exceeds
/// [`MAX_PAYLOAD_LEN`]; nothing is written in that case.
pub fn encode(tag: Tag, payload: &[u8], dst: &mut Vec<u8>) -> Result<(), FrameError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }
    dst.reserve(HEADER_LEN + payload.len());
    put_header(dst, tag.as_u16(), payload.len() as u16);
    dst.extend_from_slice(payload);
    Ok(())
}

/// Fill `buf` from `reader`, looping over short reads.
///
/// Returns the number of bytes read, which is less than `buf.len()` only if
/// the stream reached end-of-file first.
async fn read_full<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Read a single frame from the stream.
///
/// Returns [`FrameError::ConnectionClosed`] if the stream ends cleanly before
/// the first header byte, and [`FrameError::BadFrame`] if it ends anywhere
/// inside a frame. A partial payload is never returned.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut header = [0u8; HEADER_LEN];
    let got = read_full(reader, &mut header).await?;
    if got == 0 {
        return Err(FrameError::ConnectionClosed);
    }
    if got < HEADER_LEN {
        return Err(FrameError::BadFrame {
            expected: HEADER_LEN,
            received: got,
        });
    }

    let tag = u16::from_le_bytes([header[0], header[1]]);
    let length = u16::from_le_bytes([header[2], header[3]]) as usize;

    let mut payload = vec![0u8; length];
    if length > 0 {
        let got = read_full(reader, &mut payload).await?;
        if got < length {
            return Err(FrameError::BadFrame {
                expected: length,
                received: got,
            });
        }
    }

    Ok(Frame { tag, payload })
}

/// [`read_frame`] bounded by a deadline.
pub async fn read_frame_timeout<R: AsyncRead + Unpin>(
    reader: &mut R,
    timeout: Duration,
) -> Result<Frame, FrameError> {
    tokio::time::timeout(timeout, read_frame(reader))
        .await
        .map_err(|_| FrameError::Timeout(timeout))?
}

/// Write a single frame to the stream and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    writer.write_all(&frame.to_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
