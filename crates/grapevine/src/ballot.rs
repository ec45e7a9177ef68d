//! Ballot box: per-topic elections with merge, quorum, and deadline rules
//!
//! Elections converge like everything else in the protocol: records travel
//! whole in `votes` messages and merge pairwise. The merge is monotone
//! (per voter, the ballot with the highest vote-lifetime is retained) and
//! closure is terminal, so repeated exchange cannot reopen or diverge.

use grapevine_core::{now_ms, Ballot, ElectionRecord, PeerId, Quorum};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Options for registering a new election.
#[derive(Clone, Debug)]
pub struct ElectionOpts {
    pub topic: String,
    pub quorum: Quorum,
    /// Deadline relative to registration; `None` closes on quorum only.
    pub expires_in: Option<Duration>,
    /// Initial ballot cast by the origin.
    pub value: Option<String>,
}

impl ElectionOpts {
    pub fn new(topic: impl Into<String>, quorum: Quorum) -> Self {
        Self {
            topic: topic.into(),
            quorum,
            expires_in: None,
            value: None,
        }
    }

    /// Set a deadline for the election.
    pub fn with_expiry(mut self, expires_in: Duration) -> Self {
        self.expires_in = Some(expires_in);
        self
    }

    /// Cast an initial ballot for the origin.
    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }
}

/// Result of a `vote` call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VoteStatus {
    pub closed: bool,
    pub expired: bool,
    /// Whether this call itself closed the election (deadline discovered
    /// at vote time). Callers emit the terminal event exactly once.
    pub newly_closed: bool,
}

/// Result of merging an incoming election record.
#[derive(Clone, Copy, Debug, Default)]
pub struct MergeOutcome {
    /// The topic was previously unknown and the record was adopted whole.
    pub inserted: bool,
    /// This merge transitioned the local record from open to closed.
    pub newly_closed: bool,
    pub closed: bool,
    pub expired: bool,
}

/// Election registry for one node.
pub struct BallotBox {
    elections: RwLock<HashMap<String, ElectionRecord>>,
}

impl BallotBox {
    pub fn new() -> Self {
        Self {
            elections: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new election. Returns false if the topic already exists.
    pub fn register(&self, origin: PeerId, lifetime: u64, opts: &ElectionOpts) -> bool {
        let mut elections = self.elections.write();
        if elections.contains_key(&opts.topic) {
            return false;
        }

        let mut votes = HashMap::new();
        if let Some(value) = &opts.value {
            votes.insert(
                origin,
                Ballot {
                    value: value.clone(),
                    lifetime,
                },
            );
        }

        elections.insert(
            opts.topic.clone(),
            ElectionRecord {
                topic: opts.topic.clone(),
                origin,
                votes,
                quorum: opts.quorum,
                expires: opts.expires_in.map(|d| now_ms() + d.as_millis() as u64),
                closed: false,
                expired: false,
                results: None,
            },
        );
        true
    }

    /// Record the caller's ballot.
    ///
    /// Voting on a nonexistent or closed election is a no-op that reports
    /// the current status. A vote that arrives past the deadline closes the
    /// election as expired instead of being counted.
    pub fn vote(&self, voter: PeerId, topic: &str, value: &str, lifetime: u64) -> VoteStatus {
        let mut elections = self.elections.write();
        let record = match elections.get_mut(topic) {
            Some(record) => record,
            None => return VoteStatus::default(),
        };

        if record.closed {
            return VoteStatus {
                closed: true,
                expired: record.expired,
                newly_closed: false,
            };
        }

        if record.past_deadline(now_ms()) {
            close(record, true);
            return VoteStatus {
                closed: true,
                expired: true,
                newly_closed: true,
            };
        }

        record.votes.insert(
            voter,
            Ballot {
                value: value.to_string(),
                lifetime,
            },
        );
        VoteStatus::default()
    }

    /// Integrate an incoming election record into the local one.
    ///
    /// Per voter the ballot with the higher vote-lifetime is retained, ties
    /// broken by the lexicographically greater value. An incoming closed
    /// record closes the local one (quorum and deadline propagate).
    pub fn merge(&self, incoming: ElectionRecord) -> MergeOutcome {
        let mut elections = self.elections.write();

        let record = match elections.get_mut(&incoming.topic) {
            Some(record) => record,
            None => {
                let outcome = MergeOutcome {
                    inserted: true,
                    newly_closed: incoming.closed,
                    closed: incoming.closed,
                    expired: incoming.expired,
                };
                debug!(topic = %incoming.topic, "adopted unknown election");
                elections.insert(incoming.topic.clone(), incoming);
                return outcome;
            }
        };

        if record.closed {
            return MergeOutcome {
                inserted: false,
                newly_closed: false,
                closed: true,
                expired: record.expired,
            };
        }

        for (voter, ballot) in incoming.votes {
            match record.votes.get(&voter) {
                Some(existing)
                    if (existing.lifetime, &existing.value) >= (ballot.lifetime, &ballot.value) => {}
                _ => {
                    record.votes.insert(voter, ballot);
                }
            }
        }

        let mut newly_closed = false;
        if incoming.closed {
            record.closed = true;
            record.expired = incoming.expired;
            record.results = incoming.results.or_else(|| Some(record.tally()));
            newly_closed = true;
        }

        MergeOutcome {
            inserted: false,
            newly_closed,
            closed: record.closed,
            expired: record.expired,
        }
    }

    /// Evaluate the quorum predicate; on success close the election and
    /// compute results. Returns whether this call closed it.
    pub fn decide(&self, topic: &str, known_peers: usize) -> bool {
        let mut elections = self.elections.write();
        let record = match elections.get_mut(topic) {
            Some(record) if !record.closed => record,
            _ => return false,
        };

        if !record.quorum.satisfied(record.votes.len(), known_peers) {
            return false;
        }

        close(record, false);
        debug!(topic, ballots = record.votes.len(), "election closed by quorum");
        true
    }

    /// Close an election whose deadline has been reached. Returns whether
    /// this call closed it.
    pub fn expire(&self, topic: &str) -> bool {
        let mut elections = self.elections.write();
        let record = match elections.get_mut(topic) {
            Some(record) if !record.closed => record,
            _ => return false,
        };

        close(record, true);
        debug!(topic, "election closed by deadline");
        true
    }

    /// Snapshot of the record for a topic.
    pub fn record(&self, topic: &str) -> Option<ElectionRecord> {
        self.elections.read().get(topic).cloned()
    }

    pub fn len(&self) -> usize {
        self.elections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.elections.read().is_empty()
    }

    pub fn open_count(&self) -> usize {
        self.elections.read().values().filter(|e| !e.closed).count()
    }
}

impl Default for BallotBox {
    fn default() -> Self {
        Self::new()
    }
}

fn close(record: &mut ElectionRecord, expired: bool) {
    record.closed = true;
    record.expired = expired;
    record.results = Some(record.tally());
}
