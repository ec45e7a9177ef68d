//! grapevine - gossip-based membership, dissemination, and voting
//!
//! Each [`Node`] participates in three concurrent, eventually-consistent
//! flows:
//! - membership: discovering live peers and detecting failures
//! - dissemination: replicating a key/value store via interest-driven
//!   anti-entropy (the gossip -> request -> response dance)
//! - voting: decentralized elections that close on quorum or deadline
//!
//! State converges by repeated pairwise exchange; there is no coordinator
//! and no persistence. A node that restarts rejoins afresh via
//! [`Node::join`].
//!
//! ```no_run
//! use grapevine::{Config, Node};
//!
//! # async fn run() -> Result<(), grapevine::EngineError> {
//! let node = Node::new(Config::default())?;
//! node.listen().await?;
//! node.set("greeting", &"hello")?;
//! # Ok(())
//! # }
//! ```

pub mod ballot;
pub mod config;
pub mod engine;
pub mod events;
pub mod peers;
pub mod store;
pub mod timers;

pub use ballot::{BallotBox, ElectionOpts, VoteStatus};
pub use config::Config;
pub use engine::{EngineError, Node, NodeStats};
pub use events::Event;
pub use peers::PeerTable;
pub use store::Store;
pub use timers::{TimerKey, TimerRegistry};

pub use grapevine_core::{
    Ballot, ElectionRecord, Peer, PeerId, Quorum, Version, VersionedValue,
};
pub use grapevine_net::{Message, Verb};
