//! Message framing for network transport
//!
//! Provides length-prefixed framing with a leading verb byte, so every
//! record on the wire is self-describing.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame size (1 MB)
const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// A framed message
#[derive(Clone, Debug)]
pub struct Frame {
    /// Protocol verb
    pub verb: Verb,
    /// Payload bytes
    pub payload: Vec<u8>,
}

/// Protocol verbs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Verb {
    /// Full peer table exchange
    List = 1,
    /// Interest probe carrying a (key, version) pair
    Gossip = 2,
    /// Declaration of interest in a (key, version) pair
    Request = 3,
    /// Value delivery for a requested key
    Response = 4,
    /// Election record exchange
    Votes = 5,
}

impl TryFrom<u8> for Verb {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::List),
            2 => Ok(Self::Gossip),
            3 => Ok(Self::Request),
            4 => Ok(Self::Response),
            5 => Ok(Self::Votes),
            _ => Err(FrameError::Serialization(format!(
                "Unknown verb: {}",
                value
            ))),
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Verb::List => "list",
            Verb::Gossip => "gossip",
            Verb::Request => "request",
            Verb::Response => "response",
            Verb::Votes => "votes",
        };
        write!(f, "{name}")
    }
}

/// Codec for length-prefixed frames
///
/// Wire format:
/// - 4 bytes: length (big-endian, includes verb byte)
/// - 1 byte: verb
/// - N bytes: payload
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least 5 bytes (4 length + 1 verb)
        if src.len() < 5 {
            return Ok(None);
        }

        // Peek at length
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length == 0 || length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }

        // Need full frame
        if src.len() < 4 + length {
            return Ok(None);
        }

        // Consume length prefix
        src.advance(4);

        // Read verb
        let verb = Verb::try_from(src[0])?;
        src.advance(1);

        // Read payload
        let payload = src.split_to(length - 1).to_vec();

        Ok(Some(Frame { verb, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = 1 + item.payload.len();
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }

        dst.put_u32(length as u32);
        dst.put_u8(item.verb as u8);
        dst.put_slice(&item.payload);

        Ok(())
    }
}

impl Frame {
    /// Create a new frame
    pub fn new(verb: Verb, payload: Vec<u8>) -> Self {
        Self { verb, payload }
    }
}
