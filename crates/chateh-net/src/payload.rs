//! Chat message payload carried inside a [`Tag::Message`](crate::framing::Tag::Message) frame.
//!
//! ```text
//! +-----------------+---------------+---------------+-------------+
//! | sender_len u16  | sender (UTF-8)| text_len u16  | text (UTF-8)|
//! +-----------------+---------------+---------------+-------------+
//! ```
//!
//! Both length fields are little-endian. The layout is explicit so any
//! implementation can produce and consume it byte for byte.

use std::fmt;

use crate::framing::{Frame, MAX_PAYLOAD_LEN};

/// Longest sender identifier accepted on the wire.
pub const MAX_SENDER_LEN: usize = 255;

/// Longest chat text accepted on the wire.
pub const MAX_TEXT_LEN: usize = 4096;

const _: () = assert!(4 + MAX_SENDER_LEN + MAX_TEXT_LEN <= MAX_PAYLOAD_LEN);

/// Field names used in [`PayloadError`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// The sender identifier.
    Sender,
    /// The chat text.
    Text,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Sender => f.write_str("sender"),
            Field::Text => f.write_str("text"),
        }
    }
}

/// A Message payload that does not follow the schema.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    /// The payload ended inside a length prefix or field.
    #[error("malformed payload: {field} truncated, needed {needed} bytes, {available} available")]
    Truncated {
        /// Field being read.
        field: Field,
        /// Bytes the field required.
        needed: usize,
        /// Bytes left in the payload.
        available: usize,
    },

    /// A field exceeded its bound.
    #[error("malformed payload: {field} is {len} bytes, maximum is {max}")]
    FieldTooLong {
        /// Offending field.
        field: Field,
        /// Its length.
        len: usize,
        /// The bound.
        max: usize,
    },

    /// A field was not valid UTF-8.
    #[error("malformed payload: {field} is not valid UTF-8")]
    InvalidUtf8 {
        /// Offending field.
        field: Field,
    },

    /// Bytes remained after the text field.
    #[error("malformed payload: {0} trailing bytes")]
    TrailingBytes(usize),
}

/// A single chat line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChatMessage {
    /// Session identifier of the author. Clients leave it empty; the server
    /// stamps it before rebroadcasting.
    pub sender: String,
    /// Message body.
    pub text: String,
}

impl ChatMessage {
    /// Create a message.
    pub fn new(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            text: text.into(),
        }
    }

    /// Serialize into the payload schema.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PayloadError> {
        check_len(Field::Sender, self.sender.len(), MAX_SENDER_LEN)?;
        check_len(Field::Text, self.text.len(), MAX_TEXT_LEN)?;

        let mut buf = Vec::with_capacity(4 + self.sender.len() + self.text.len());
        buf.extend_from_slice(&(self.sender.len() as u16).to_le_bytes());
        buf.extend_from_slice(self.sender.as_bytes());
        buf.extend_from_slice(&(self.text.len() as u16).to_le_bytes());
        buf.extend_from_slice(self.text.as_bytes());
        Ok(buf)
    }

    /// Deserialize from the payload schema.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PayloadError> {
        let mut cursor = Cursor { bytes, pos: 0 };
        let sender = cursor.string(Field::Sender, MAX_SENDER_LEN)?;
        let text = cursor.string(Field::Text, MAX_TEXT_LEN)?;

        let trailing = bytes.len() - cursor.pos;
        if trailing > 0 {
            return Err(PayloadError::TrailingBytes(trailing));
        }
        Ok(Self { sender, text })
    }

    /// Wrap the serialized message into a [`Tag::Message`](crate::framing::Tag::Message) frame.
    ///
    /// The field bounds keep every valid payload well under the frame limit.
    pub fn to_frame(&self) -> Result<Frame, PayloadError> {
        self.to_bytes().map(Frame::message)
    }
}

impl fmt::Display for ChatMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.sender, self.text)
    }
}

fn check_len(field: Field, len: usize, max: usize) -> Result<(), PayloadError> {
    if len > max {
        return Err(PayloadError::FieldTooLong { field, len, max });
    }
    Ok(())
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, field: Field, n: usize) -> Result<&'a [u8], PayloadError> {
        let available = self.bytes.len() - self.pos;
        if available < n {
            return Err(PayloadError::Truncated {
                field,
                needed: n,
                available,
            });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn string(&mut self, field: Field, max: usize) -> Result<String, PayloadError> {
        let prefix = self.take(field, 2)?;
        let len = u16::from_le_bytes([prefix[0], prefix[1]]) as usize;
        check_len(field, len, max)?;
        let raw = self.take(field, len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| PayloadError::InvalidUtf8 { field })
    }
}
