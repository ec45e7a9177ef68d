//! Core protocol types for grapevine
//!
//! All types here are designed for deterministic serialization via postcard.
//! Field order matters for the wire contract.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// 32-byte fixed-size array used for content digests.
pub type Bytes32 = [u8; 32];

/// Milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// =============================================================================
// PEER IDENTITY
// =============================================================================

/// Stable 128-bit node identifier carried in every peer descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub Uuid);

impl PeerId {
    /// Generate a fresh random identity.
    ///
    /// Hosts that manage identities themselves can construct a `PeerId`
    /// from any [`Uuid`] instead.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0.as_bytes()[..4]))
    }
}

/// Descriptor for a participating node, exchanged in `list` messages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    /// Peer identifier
    pub id: PeerId,
    /// Network location
    pub addr: SocketAddr,
    /// Liveness flag maintained by the failure detector
    pub alive: bool,
    /// Logical clock: bumped on every heartbeat tick and outgoing send,
    /// never decreased except by a strictly greater remote value.
    pub lifetime: u64,
    /// Failure-detection window peers should apply to this node
    /// (0 means "use your local default").
    #[serde(default)]
    pub timeout_ms: u64,
    /// Heartbeat tick period advertised by this node
    #[serde(default)]
    pub heartbeat_ms: u64,
    /// Peer-list gossip period advertised by this node
    #[serde(default)]
    pub list_ms: u64,
    /// Data gossip period advertised by this node
    #[serde(default)]
    pub hash_ms: u64,
}

impl Peer {
    /// Create a descriptor with zeroed counters and default windows.
    pub fn new(id: PeerId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            alive: true,
            lifetime: 0,
            timeout_ms: 0,
            heartbeat_ms: 0,
            list_ms: 0,
            hash_ms: 0,
        }
    }
}

// =============================================================================
// STORE VERSIONS
// =============================================================================

/// Version of a store entry: a monotonic counter plus a content digest.
///
/// Ordered by counter first, digest second, so two replicas that write the
/// same counter independently still agree on which value wins. The digest is
/// BLAKE3 over the value bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    pub counter: u64,
    pub digest: Bytes32,
}

impl Version {
    /// Version for the first write of a key.
    pub fn first(bytes: &[u8]) -> Self {
        Self {
            counter: 1,
            digest: *blake3::hash(bytes).as_bytes(),
        }
    }

    /// Version for an overwrite of an entry currently at `self`.
    pub fn next(&self, bytes: &[u8]) -> Self {
        Self {
            counter: self.counter + 1,
            digest: *blake3::hash(bytes).as_bytes(),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.counter, hex::encode(&self.digest[..4]))
    }
}

/// A stored value together with the version that produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue {
    /// Opaque postcard-encoded value bytes
    pub bytes: Vec<u8>,
    pub version: Version,
}

// =============================================================================
// ELECTIONS
// =============================================================================

/// A single voter's ballot: the chosen value and the voter's lifetime at the
/// time of the vote. On merge the ballot with the higher lifetime wins.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ballot {
    pub value: String,
    pub lifetime: u64,
}

/// Quorum predicate over collected ballots.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Quorum {
    /// Close once this many ballots have been collected.
    Count(u32),
    /// Close once this fraction of known peers have voted.
    Fraction(f64),
}

impl Quorum {
    /// Evaluate the predicate against the collected ballots.
    pub fn satisfied(&self, ballots: usize, known_peers: usize) -> bool {
        match *self {
            Quorum::Count(n) => ballots >= n as usize,
            Quorum::Fraction(f) => known_peers > 0 && ballots as f64 >= f * known_peers as f64,
        }
    }
}

/// Per-topic election record, exchanged whole in `votes` messages.
///
/// A topic is identified across peers solely by its `topic` field; the
/// record converges by pairwise merge (see the ballot box for the rules).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElectionRecord {
    pub topic: String,
    /// Creator of the election
    pub origin: PeerId,
    pub votes: HashMap<PeerId, Ballot>,
    pub quorum: Quorum,
    /// Unix-millis deadline; `None` means the election only closes on quorum.
    pub expires: Option<u64>,
    /// Terminal flag; a closed election accepts no further votes.
    pub closed: bool,
    /// Distinguishes deadline-close from quorum-close.
    pub expired: bool,
    /// Tally computed at close.
    pub results: Option<BTreeMap<String, u32>>,
}

impl ElectionRecord {
    /// Count ballots by value.
    pub fn tally(&self) -> BTreeMap<String, u32> {
        let mut counts = BTreeMap::new();
        for ballot in self.votes.values() {
            *counts.entry(ballot.value.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Winning value under the deterministic rule: highest count, ties broken
    /// by lexicographically least value. Every peer deciding independently
    /// over the same ballots reaches the same result.
    pub fn winner(&self) -> Option<(String, u32)> {
        let counts = match &self.results {
            Some(r) => r.clone(),
            None => self.tally(),
        };
        let mut best: Option<(String, u32)> = None;
        for (value, count) in counts {
            match &best {
                Some((_, c)) if count <= *c => {}
                _ => best = Some((value, count)),
            }
        }
        best
    }

    /// Whether the deadline (if any) has passed at `now`.
    pub fn past_deadline(&self, now: u64) -> bool {
        self.expires.map(|e| now >= e).unwrap_or(false)
    }
}
