//! Typed event stream
//!
//! Observers subscribe through [`crate::Node::subscribe`] and receive every
//! event over a broadcast channel. Delivery is lossy for lagging
//! subscribers, matching the fire-and-forget nature of the protocol.

use grapevine_core::{ElectionRecord, Peer, PeerId, Version};
use grapevine_net::{Message, Verb};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;

/// Everything a node surfaces to observers.
#[derive(Clone, Debug)]
pub enum Event {
    /// Every well-formed incoming message, before dispatch.
    Data { from: SocketAddr, message: Message },
    /// A peer list was merged.
    List {
        from: SocketAddr,
        peers: HashMap<PeerId, Peer>,
    },
    /// A gossip probe arrived.
    Gossip {
        from: SocketAddr,
        key: String,
        version: Version,
    },
    /// A peer declared interest in one of our keys.
    Request {
        from: SocketAddr,
        key: String,
        version: Version,
    },
    /// A value delivery arrived.
    Response { from: SocketAddr, key: String },
    /// An election record was merged.
    Votes { from: SocketAddr, topic: String },
    /// About to transmit on a fresh connection.
    Send { to: SocketAddr, verb: Verb },
    /// Transmitted successfully.
    Sent { to: SocketAddr, verb: Verb },
    /// An election closed by quorum.
    Quorum {
        topic: String,
        election: ElectionRecord,
        results: BTreeMap<String, u32>,
    },
    /// An election closed by deadline.
    Deadline {
        topic: String,
        election: ElectionRecord,
    },
}
