//! Wire codec for the debug protocol
//!
//! Every message travels as one frame:
//! ```text
//! [u32 little-endian payload length][payload]
//! ```
//! The payload starts with a one byte variant tag followed by the variant's
//! fields in declaration order. Integers are fixed width little-endian,
//! strings and sequences carry a `u32` length prefix.
//!
//! The codec does no I/O. [`Codec::decode`] works on a borrowed slice and
//! reports how many bytes it consumed, so it can be retried with a longer
//! buffer when a frame is still incomplete.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the frame length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default maximum payload size (10 MB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Errors produced while encoding or decoding frames
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// An outbound payload exceeds the configured maximum.
    #[error("message size {size} exceeds maximum allowed {max}")]
    MessageTooLarge { size: usize, max: usize },

    /// An inbound frame declares a payload above the configured maximum.
    #[error("frame declares {size} payload bytes, maximum is {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// The payload ended before all fields of its variant were read.
    #[error("payload truncated")]
    Truncated,

    /// Bytes were left over after the variant was fully decoded.
    #[error("{0} unexpected trailing bytes in payload")]
    TrailingBytes(usize),

    /// A string field was not valid UTF-8.
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,

    /// A boolean field held something other than 0 or 1.
    #[error("invalid boolean value {0}")]
    InvalidBool(u8),

    /// A command frame carried a tag this side does not know.
    #[error("unknown command tag {0}")]
    UnknownCommand(u8),
}

/// A value that can be carried as the payload of one frame.
pub trait WireMessage: Sized {
    /// Append the tagged payload to `dst`.
    fn encode_payload(&self, dst: &mut BytesMut);

    /// Decode the tagged payload from the front of `src`, advancing it.
    fn decode_payload(src: &mut &[u8]) -> Result<Self, CodecError>;
}

/// Length-prefixed frame codec
#[derive(Debug, Clone)]
pub struct Codec {
    /// Maximum allowed payload size in bytes.
    max_message_size: usize,
}

impl Codec {
    /// Create a new codec with default settings.
    pub fn new() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Create a new codec with a custom maximum payload size.
    ///
    /// The limit is clamped to what the `u32` length prefix can express.
    pub fn with_max_size(max_message_size: usize) -> Self {
        Self {
            max_message_size: max_message_size.min(u32::MAX as usize),
        }
    }

    /// Maximum payload size accepted in either direction.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Encode a message into a complete frame.
    ///
    /// The returned buffer is exactly `4 + payload length` bytes long.
    pub fn encode<M: WireMessage>(&self, msg: &M) -> Result<Bytes, CodecError> {
        let mut dst = BytesMut::with_capacity(64);
        dst.put_u32_le(0);
        msg.encode_payload(&mut dst);

        let size = dst.len() - LENGTH_PREFIX_SIZE;
        if size > self.max_message_size {
            return Err(CodecError::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }

        dst[..LENGTH_PREFIX_SIZE].copy_from_slice(&(size as u32).to_le_bytes());
        Ok(dst.freeze())
    }

    /// Decode one frame from the front of `src`.
    ///
    /// Returns `Ok(None)` if `src` does not yet hold a complete frame, or the
    /// message together with the number of bytes it occupied.
    pub fn decode<M: WireMessage>(&self, src: &[u8]) -> Result<Option<(M, usize)>, CodecError> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let size = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if size > self.max_message_size {
            return Err(CodecError::FrameTooLarge {
                size,
                max: self.max_message_size,
            });
        }

        let total = LENGTH_PREFIX_SIZE + size;
        if src.len() < total {
            return Ok(None);
        }

        let mut payload = &src[LENGTH_PREFIX_SIZE..total];
        let msg = M::decode_payload(&mut payload)?;
        if !payload.is_empty() {
            return Err(CodecError::TrailingBytes(payload.len()));
        }

        Ok(Some((msg, total)))
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

// Field helpers shared by the message types. Each checks the remaining length
// first because the `Buf` getters panic on short input.

pub(crate) fn get_u8(src: &mut &[u8]) -> Result<u8, CodecError> {
    if src.remaining() < 1 {
        return Err(CodecError::Truncated);
    }
    Ok(src.get_u8())
}

pub(crate) fn get_u32(src: &mut &[u8]) -> Result<u32, CodecError> {
    if src.remaining() < 4 {
        return Err(CodecError::Truncated);
    }
    Ok(src.get_u32_le())
}

pub(crate) fn get_i32(src: &mut &[u8]) -> Result<i32, CodecError> {
    if src.remaining() < 4 {
        return Err(CodecError::Truncated);
    }
    Ok(src.get_i32_le())
}

pub(crate) fn get_bool(src: &mut &[u8]) -> Result<bool, CodecError> {
    match get_u8(src)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(CodecError::InvalidBool(other)),
    }
}

pub(crate) fn get_string(src: &mut &[u8]) -> Result<String, CodecError> {
    let len = get_u32(src)? as usize;
    if src.remaining() < len {
        return Err(CodecError::Truncated);
    }
    let (bytes, rest) = src.split_at(len);
    let s = std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)?;
    *src = rest;
    Ok(s.to_string())
}

pub(crate) fn put_string(dst: &mut BytesMut, s: &str) {
    dst.put_u32_le(s.len() as u32);
    dst.put_slice(s.as_bytes());
}
