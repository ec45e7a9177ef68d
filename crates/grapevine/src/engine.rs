//! Gossip engine
//!
//! A [`Node`] owns the peer table, the versioned store, the ballot box, and
//! the timer registry, and drives the three periodic emitters (heartbeat,
//! list sync, data gossip). Incoming and outgoing connections run the same
//! message loop: each frame is dispatched to a handler that may reply on
//! the same connection, so one connection covers the whole
//! gossip -> request -> response exchange.
//!
//! Mutations of each shared structure are serialized behind its own lock
//! and handlers never hold a lock across a suspension point, so message
//! application is atomic per the protocol's concurrency model.

use crate::ballot::{BallotBox, ElectionOpts, VoteStatus};
use crate::config::Config;
use crate::events::Event;
use crate::peers::{MergeOutcome, PeerTable};
use crate::store::Store;
use crate::timers::{TimerKey, TimerRegistry};
use futures::{SinkExt, StreamExt};
use grapevine_core::{codec, now_ms, ElectionRecord, Peer, PeerId, Version};
use grapevine_net::{accept, dial, Conn, FrameError, Message};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] grapevine_core::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Counters exposed for observability and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeStats {
    pub peers: usize,
    pub alive_peers: usize,
    pub keys: usize,
    pub elections: usize,
    pub open_elections: usize,
}

/// What a handler wants done with the connection after a message.
enum Flow {
    /// Write a reply and keep reading.
    Reply(Message),
    /// Stop reading and drop the connection.
    Close,
}

struct Shared {
    config: Config,
    peers: PeerTable,
    store: Store,
    ballots: BallotBox,
    timers: TimerRegistry,
    events: broadcast::Sender<Event>,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// One logical gossip participant.
///
/// Cheap to clone; all clones share the same state. Spin up several in one
/// process for multi-node tests.
#[derive(Clone)]
pub struct Node {
    shared: Arc<Shared>,
}

impl Node {
    /// Create a node. No sockets are opened until [`Node::listen`].
    pub fn new(config: Config) -> Result<Self, EngineError> {
        config.validate()?;

        let id = config.id.unwrap_or_else(PeerId::generate);
        let mut local = Peer::new(id, config.addr);
        local.timeout_ms = config.timeout.as_millis() as u64;
        local.heartbeat_ms = config.heartbeat_interval.as_millis() as u64;
        local.list_ms = config.list_interval.as_millis() as u64;
        local.hash_ms = config.hash_interval.as_millis() as u64;

        let peers = PeerTable::new(local);
        for peer in config.peers.values() {
            peers.add_or_merge(peer.clone());
        }

        let (events, _) = broadcast::channel(config.event_capacity);
        let (shutdown, _) = broadcast::channel(1);

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                peers,
                store: Store::new(),
                ballots: BallotBox::new(),
                timers: TimerRegistry::new(),
                events,
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn local_id(&self) -> PeerId {
        self.shared.peers.local_id()
    }

    /// Current advertised address (the bound address after `listen`).
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.peers.local().addr
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    /// Snapshot of the peer table, local entry included.
    pub fn peers(&self) -> HashMap<PeerId, Peer> {
        self.shared.peers.snapshot()
    }

    pub fn stats(&self) -> NodeStats {
        NodeStats {
            peers: self.shared.peers.len(),
            alive_peers: self.shared.peers.alive_count(),
            keys: self.shared.store.len(),
            elections: self.shared.ballots.len(),
            open_elections: self.shared.ballots.open_count(),
        }
    }

    // -------------------------------------------------------------------------
    // Public API: store
    // -------------------------------------------------------------------------

    /// Write a value locally. It spreads to interested peers on the next
    /// gossip rounds.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<Version, EngineError> {
        let bytes = codec::to_bytes(value)?;
        Ok(self.shared.store.set(key, bytes))
    }

    /// Read a value, or `None` if the key is unknown here yet.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, EngineError> {
        match self.shared.store.get(key) {
            Some(stored) => Ok(Some(codec::from_bytes(&stored.bytes)?)),
            None => Ok(None),
        }
    }

    // -------------------------------------------------------------------------
    // Public API: elections
    // -------------------------------------------------------------------------

    /// Register an election with this node as origin. Returns false if the
    /// topic already exists.
    ///
    /// Must be called from within a tokio runtime when a deadline is set.
    pub fn election(&self, opts: ElectionOpts) -> bool {
        let registered =
            self.shared
                .ballots
                .register(self.local_id(), self.shared.peers.local_lifetime(), &opts);
        if registered {
            if let Some(expires_in) = opts.expires_in {
                self.arm_deadline(opts.topic.clone(), expires_in);
            }
        }
        registered
    }

    /// Cast this node's ballot.
    ///
    /// On a close triggered by this call the terminal event is emitted and
    /// the same status returned; otherwise the updated record is sent to a
    /// random live peer. Voting on an unknown or closed topic is a no-op
    /// that reports the current status.
    pub async fn vote(&self, topic: &str, value: &str) -> VoteStatus {
        let status = self.shared.ballots.vote(
            self.local_id(),
            topic,
            value,
            self.shared.peers.local_lifetime(),
        );

        if status.newly_closed {
            // The vote itself discovered the deadline.
            self.shared.timers.cancel(&TimerKey::Election(topic.to_string()));
            self.emit_terminal(topic, true);
            return status;
        }
        if status.closed {
            return status;
        }

        if self.shared.ballots.decide(topic, self.shared.peers.len()) {
            self.shared.timers.cancel(&TimerKey::Election(topic.to_string()));
            self.emit_terminal(topic, false);
            return VoteStatus {
                closed: true,
                expired: false,
                newly_closed: true,
            };
        }

        if let Some(record) = self.shared.ballots.record(topic) {
            self.send_to_random(Message::Votes(record)).await;
        }
        status
    }

    /// Snapshot of an election record.
    pub fn election_record(&self, topic: &str) -> Option<ElectionRecord> {
        self.shared.ballots.record(topic)
    }

    // -------------------------------------------------------------------------
    // Public API: lifecycle
    // -------------------------------------------------------------------------

    /// Bind the listener, start the periodic emitters, and return the bound
    /// address. The local descriptor adopts the actual bound port, so
    /// configuring port 0 yields an ephemeral address.
    pub async fn listen(&self) -> Result<SocketAddr, EngineError> {
        let listener = TcpListener::bind(self.shared.config.addr).await?;
        let addr = listener.local_addr()?;
        self.shared.peers.set_local_addr(addr);
        info!(id = %self.local_id(), %addr, "listening");

        // Seeded peers start their failure windows now.
        for peer in self.shared.peers.snapshot().into_values() {
            if peer.id != self.local_id() && peer.alive {
                self.arm_failure_timer(&peer);
            }
        }

        let mut tasks = self.shared.tasks.lock();
        tasks.push(self.spawn_accept_loop(listener));
        tasks.push(self.spawn_heartbeat());
        tasks.push(self.spawn_list_gossip());
        tasks.push(self.spawn_data_gossip());

        Ok(addr)
    }

    /// Introduce this node to an existing member. The seed merges our table
    /// and its periodic emitters spread the word.
    pub async fn join(&self, seed: SocketAddr) {
        let snapshot = self.shared.peers.snapshot();
        self.send_to(seed, Message::List(snapshot)).await;
    }

    /// Stop periodic emitters, cancel every pending timer, and stop
    /// listening. In-flight connections drain on their own.
    pub fn close(&self) {
        let _ = self.shared.shutdown.send(());
        for task in self.shared.tasks.lock().drain(..) {
            task.abort();
        }
        self.shared.timers.clear();
        info!(id = %self.local_id(), "node closed");
    }

    // -------------------------------------------------------------------------
    // Periodic emitters
    // -------------------------------------------------------------------------

    fn spawn_accept_loop(&self, listener: TcpListener) -> JoinHandle<()> {
        let node = self.clone();
        let mut shutdown = self.shared.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => match result {
                        Ok((stream, addr)) => {
                            debug!(%addr, "accepted connection");
                            let node = node.clone();
                            tokio::spawn(async move {
                                node.drive(accept(stream), addr).await;
                            });
                        }
                        Err(e) => warn!("accept error: {e}"),
                    },
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let node = self.clone();
        let mut shutdown = self.shared.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(node.shared.config.heartbeat_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        node.shared.peers.bump_local();
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    fn spawn_list_gossip(&self) -> JoinHandle<()> {
        let node = self.clone();
        let mut shutdown = self.shared.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(node.shared.config.list_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Some(peer) = node.shared.peers.random_alive_peer() {
                            let snapshot = node.shared.peers.snapshot();
                            let node = node.clone();
                            tokio::spawn(async move {
                                node.send_to(peer.addr, Message::List(snapshot)).await;
                            });
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    fn spawn_data_gossip(&self) -> JoinHandle<()> {
        let node = self.clone();
        let mut shutdown = self.shared.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(node.shared.config.hash_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Some((key, version)) = node.shared.store.random_pair() {
                            let node = node.clone();
                            tokio::spawn(async move {
                                node.send_to_random(Message::Gossip { key, version }).await;
                            });
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    /// Open a fresh connection, write one message, then keep the
    /// conversation going until the other side closes.
    ///
    /// Connection errors are swallowed: dead peers refuse connections and
    /// the failure detector handles them independently.
    async fn send_to(&self, addr: SocketAddr, message: Message) {
        // The logical clock ticks for every send attempt, success or not;
        // outgoing traffic doubles as a heartbeat signal.
        self.shared.peers.bump_local();

        let verb = message.verb();
        self.emit(Event::Send { to: addr, verb });

        let frame = match message.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                debug!(%verb, "encode failed: {e}");
                return;
            }
        };
        let mut conn = match dial(addr).await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(%addr, %verb, "connect failed: {e}");
                return;
            }
        };
        if let Err(e) = conn.send(frame).await {
            debug!(%addr, %verb, "send failed: {e}");
            return;
        }
        self.emit(Event::Sent { to: addr, verb });

        self.drive(conn, addr).await;
    }

    /// Send to one random live peer; silently drop the send when none is
    /// available this round.
    async fn send_to_random(&self, message: Message) {
        match self.shared.peers.random_alive_peer() {
            Some(peer) => self.send_to(peer.addr, message).await,
            None => debug!(verb = %message.verb(), "no live peer, dropping send"),
        }
    }

    /// Read frames until the conversation ends. Undecodable input drops the
    /// connection without a reply.
    async fn drive(&self, mut conn: Conn, from: SocketAddr) {
        while let Some(result) = conn.next().await {
            let frame = match result {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(%from, "dropping connection: {e}");
                    break;
                }
            };
            let message = match Message::from_frame(&frame) {
                Ok(message) => message,
                Err(e) => {
                    debug!(%from, "malformed message: {e}");
                    break;
                }
            };

            self.emit(Event::Data {
                from,
                message: message.clone(),
            });

            match self.dispatch(message, from) {
                Flow::Reply(reply) => {
                    let frame = match reply.to_frame() {
                        Ok(frame) => frame,
                        Err(e) => {
                            debug!("encode failed: {e}");
                            break;
                        }
                    };
                    if conn.send(frame).await.is_err() {
                        break;
                    }
                }
                Flow::Close => break,
            }
        }
    }

    // -------------------------------------------------------------------------
    // Message handlers
    // -------------------------------------------------------------------------

    fn dispatch(&self, message: Message, from: SocketAddr) -> Flow {
        match message {
            Message::List(map) => {
                for peer in map.values() {
                    self.apply_peer(peer.clone());
                }
                self.emit(Event::List { from, peers: map });
                Flow::Close
            }
            Message::Gossip { key, version } => {
                let interested = self.shared.store.interest(&key, &version);
                self.emit(Event::Gossip {
                    from,
                    key: key.clone(),
                    version,
                });
                if interested {
                    Flow::Reply(Message::Request { key, version })
                } else {
                    Flow::Close
                }
            }
            Message::Request { key, version } => {
                let value = self.shared.store.get(&key);
                self.emit(Event::Request {
                    from,
                    key: key.clone(),
                    version,
                });
                Flow::Reply(Message::Response { key, value })
            }
            Message::Response { key, value } => {
                if let Some(value) = value {
                    if self.shared.store.set_unique(&key, value) {
                        debug!(%from, %key, "accepted value");
                    }
                }
                self.emit(Event::Response { from, key });
                Flow::Close
            }
            Message::Votes(record) => match self.handle_votes(record, from) {
                Some(reply) => Flow::Reply(reply),
                None => Flow::Close,
            },
        }
    }

    fn apply_peer(&self, remote: Peer) {
        match self.shared.peers.add_or_merge(remote.clone()) {
            MergeOutcome::Inserted | MergeOutcome::Updated { .. } => {
                self.arm_failure_timer(&remote);
            }
            MergeOutcome::Ignored | MergeOutcome::SelfEntry => {}
        }
    }

    fn handle_votes(&self, record: ElectionRecord, from: SocketAddr) -> Option<Message> {
        let topic = record.topic.clone();
        let expires = record.expires;
        let incoming_closed = record.closed;
        let outcome = self.shared.ballots.merge(record);

        if outcome.inserted && !outcome.closed {
            // Newly learned live election: adopt its deadline.
            if let Some(expires) = expires {
                let delay = Duration::from_millis(expires.saturating_sub(now_ms()));
                self.arm_deadline(topic.clone(), delay);
            }
        }

        let mut closed = outcome.closed;
        if outcome.newly_closed {
            self.shared.timers.cancel(&TimerKey::Election(topic.clone()));
            self.emit_terminal(&topic, outcome.expired);
        } else if !outcome.closed {
            if self.shared.ballots.decide(&topic, self.shared.peers.len()) {
                closed = true;
                self.shared.timers.cancel(&TimerKey::Election(topic.clone()));
                self.emit_terminal(&topic, false);
            } else if let Some(merged) = self.shared.ballots.record(&topic) {
                // Still open: pass the merged record along.
                let node = self.clone();
                tokio::spawn(async move {
                    node.send_to_random(Message::Votes(merged)).await;
                });
            }
        }

        self.emit(Event::Votes {
            from,
            topic: topic.clone(),
        });

        // A sender still gossiping an open record after closure has not
        // seen the outcome yet; hand the closed record back on the same
        // connection so the result reaches it without another round.
        if closed && !incoming_closed {
            return self.shared.ballots.record(&topic).map(Message::Votes);
        }
        None
    }

    // -------------------------------------------------------------------------
    // Timers and events
    // -------------------------------------------------------------------------

    fn arm_failure_timer(&self, peer: &Peer) {
        let timeout = if peer.timeout_ms > 0 {
            Duration::from_millis(peer.timeout_ms)
        } else {
            self.shared.config.timeout
        };
        let node = self.clone();
        let id = peer.id;
        self.shared.timers.arm(TimerKey::Peer(id), timeout, async move {
            if node.shared.peers.mark_dead(&id) {
                warn!(peer = %id, "failure window elapsed, marking dead");
            }
        });
    }

    fn arm_deadline(&self, topic: String, delay: Duration) {
        let node = self.clone();
        let key = TimerKey::Election(topic.clone());
        self.shared.timers.arm(key, delay, async move {
            if node.shared.ballots.expire(&topic) {
                node.emit_terminal(&topic, true);
            }
        });
    }

    fn emit_terminal(&self, topic: &str, expired: bool) {
        let record = match self.shared.ballots.record(topic) {
            Some(record) => record,
            None => return,
        };
        if expired {
            info!(topic, "election closed by deadline");
            self.emit(Event::Deadline {
                topic: topic.to_string(),
                election: record,
            });
        } else {
            info!(topic, "election closed by quorum");
            let results = record.results.clone().unwrap_or_default();
            self.emit(Event::Quorum {
                topic: topic.to_string(),
                election: record,
                results,
            });
        }
    }

    fn emit(&self, event: Event) {
        // Nobody listening is fine.
        let _ = self.shared.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grapevine_core::Quorum;

    fn node() -> Node {
        Node::new(Config {
            addr: "127.0.0.1:0".parse().unwrap(),
            ..Config::default()
        })
        .unwrap()
    }

    #[test]
    fn test_set_get_roundtrip() {
        let node = node();
        node.set("x", &42u32).unwrap();
        assert_eq!(node.get::<u32>("x").unwrap(), Some(42));
        assert_eq!(node.get::<u32>("missing").unwrap(), None);
    }

    #[tokio::test]
    async fn test_vote_unknown_topic_is_noop() {
        let node = node();
        let status = node.vote("nope", "a").await;
        assert!(!status.closed && !status.expired);
    }

    #[tokio::test]
    async fn test_single_node_quorum_of_one() {
        let node = node();
        let mut events = node.subscribe();

        assert!(node.election(ElectionOpts::new("leader", Quorum::Count(1))));
        assert!(!node.election(ElectionOpts::new("leader", Quorum::Count(1))));

        let status = node.vote("leader", "me").await;
        assert!(status.closed && !status.expired);

        match events.try_recv() {
            Ok(Event::Quorum { topic, results, .. }) => {
                assert_eq!(topic, "leader");
                assert_eq!(results.get("me"), Some(&1));
            }
            other => panic!("expected quorum event, got {other:?}"),
        }

        // Terminal: further votes are no-ops.
        let status = node.vote("leader", "someone-else").await;
        assert!(status.closed && !status.newly_closed);
    }

    #[test]
    fn test_stats() {
        let node = node();
        node.set("x", &1u8).unwrap();
        let stats = node.stats();
        assert_eq!(stats.peers, 1);
        assert_eq!(stats.alive_peers, 1);
        assert_eq!(stats.keys, 1);
        assert_eq!(stats.elections, 0);
    }
}
