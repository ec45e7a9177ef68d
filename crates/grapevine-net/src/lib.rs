//! Networking primitives for the grapevine protocol
//!
//! This crate provides:
//! - Length-prefixed message framing
//! - The tagged protocol message schema
//! - Connection plumbing (one short conversation per TCP connection)

pub mod framing;
pub mod message;
pub mod transport;

pub use framing::{Frame, FrameCodec, FrameError, Verb};
pub use message::Message;
pub use transport::{accept, dial, Conn};
