//! Protocol messages and their frame encoding
//!
//! One variant per verb. A frame that fails to decode into a variant is
//! malformed and gets dropped by the receiver without a reply.

use crate::framing::{Frame, FrameError, Verb};
use grapevine_core::{ElectionRecord, Peer, PeerId, Version, VersionedValue};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;

/// A protocol message: `meta.type` is the verb, `data` the variant payload.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Full peer table of the sender
    List(HashMap<PeerId, Peer>),
    /// One (key, version) pair drawn from the sender's store
    Gossip { key: String, version: Version },
    /// The receiver of a gossip declares interest
    Request { key: String, version: Version },
    /// Value delivery; `None` when the key has vanished in the meantime
    Response {
        key: String,
        value: Option<VersionedValue>,
    },
    /// Election record for merge-and-forward
    Votes(ElectionRecord),
}

impl Message {
    /// Verb carried in the frame header for this message.
    pub fn verb(&self) -> Verb {
        match self {
            Message::List(_) => Verb::List,
            Message::Gossip { .. } => Verb::Gossip,
            Message::Request { .. } => Verb::Request,
            Message::Response { .. } => Verb::Response,
            Message::Votes(_) => Verb::Votes,
        }
    }

    /// Encode to a wire frame.
    pub fn to_frame(&self) -> Result<Frame, FrameError> {
        let payload = match self {
            Message::List(peers) => encode(peers)?,
            Message::Gossip { key, version } => encode(&(key, version))?,
            Message::Request { key, version } => encode(&(key, version))?,
            Message::Response { key, value } => encode(&(key, value))?,
            Message::Votes(record) => encode(record)?,
        };
        Ok(Frame::new(self.verb(), payload))
    }

    /// Decode from a wire frame.
    pub fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
        match frame.verb {
            Verb::List => Ok(Message::List(decode(&frame.payload)?)),
            Verb::Gossip => {
                let (key, version) = decode(&frame.payload)?;
                Ok(Message::Gossip { key, version })
            }
            Verb::Request => {
                let (key, version) = decode(&frame.payload)?;
                Ok(Message::Request { key, version })
            }
            Verb::Response => {
                let (key, value) = decode(&frame.payload)?;
                Ok(Message::Response { key, value })
            }
            Verb::Votes => Ok(Message::Votes(decode(&frame.payload)?)),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, FrameError> {
    postcard::to_allocvec(value).map_err(|e| FrameError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, FrameError> {
    postcard::from_bytes(bytes).map_err(|e| FrameError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use grapevine_core::{Ballot, Quorum};

    fn roundtrip(msg: Message) {
        let frame = msg.to_frame().unwrap();
        let back = Message::from_frame(&frame).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_list_roundtrip() {
        let id = PeerId::generate();
        let mut peers = HashMap::new();
        peers.insert(id, Peer::new(id, "127.0.0.1:9001".parse().unwrap()));
        roundtrip(Message::List(peers));
    }

    #[test]
    fn test_gossip_roundtrip() {
        roundtrip(Message::Gossip {
            key: "x".into(),
            version: Version::first(b"42"),
        });
    }

    #[test]
    fn test_response_roundtrip() {
        roundtrip(Message::Response {
            key: "x".into(),
            value: Some(VersionedValue {
                bytes: vec![1, 2, 3],
                version: Version::first(&[1, 2, 3]),
            }),
        });
        roundtrip(Message::Response {
            key: "gone".into(),
            value: None,
        });
    }

    #[test]
    fn test_votes_roundtrip() {
        let voter = PeerId::generate();
        let mut votes = HashMap::new();
        votes.insert(
            voter,
            Ballot {
                value: "a".into(),
                lifetime: 3,
            },
        );
        roundtrip(Message::Votes(ElectionRecord {
            topic: "leader".into(),
            origin: voter,
            votes,
            quorum: Quorum::Count(2),
            expires: Some(1234),
            closed: false,
            expired: false,
            results: None,
        }));
    }

    #[test]
    fn test_malformed_payload_rejected() {
        let frame = Frame::new(Verb::Votes, vec![0xff, 0xff, 0xff]);
        assert!(Message::from_frame(&frame).is_err());
    }
}
