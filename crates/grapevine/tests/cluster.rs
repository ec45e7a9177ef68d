//! Multi-node cluster scenarios
//!
//! Every test spins up in-process nodes on ephemeral ports and polls for
//! convergence with a deadline instead of sleeping for fixed intervals.

use grapevine::{Config, ElectionOpts, Event, Node, PeerId, Quorum};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn fast_config() -> Config {
    Config {
        addr: "127.0.0.1:0".parse().unwrap(),
        timeout: Duration::from_millis(500),
        heartbeat_interval: Duration::from_millis(20),
        list_interval: Duration::from_millis(50),
        hash_interval: Duration::from_millis(50),
        ..Config::default()
    }
}

async fn start_node(config: Config) -> (Node, SocketAddr) {
    let node = Node::new(config).unwrap();
    let addr = node.listen().await.unwrap();
    (node, addr)
}

/// Poll `check` every 20 ms until it passes or `timeout` elapses.
async fn wait_for<F: Fn() -> bool>(what: &str, timeout: Duration, check: F) {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Collect terminal election events from a node's stream in the background.
fn collect_terminal(node: &Node) -> Arc<Mutex<Vec<Event>>> {
    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink = collected.clone();
    let mut events = node.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event @ (Event::Quorum { .. } | Event::Deadline { .. })) => {
                    sink.lock().unwrap().push(event);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });
    collected
}

async fn mesh(count: usize) -> Vec<(Node, SocketAddr)> {
    let mut nodes = Vec::new();
    for _ in 0..count {
        nodes.push(start_node(fast_config()).await);
    }
    let seed = nodes[0].1;
    for (node, _) in &nodes[1..] {
        node.join(seed).await;
    }
    let check_nodes: Vec<Node> = nodes.iter().map(|(n, _)| n.clone()).collect();
    wait_for("full mesh", Duration::from_secs(10), || {
        check_nodes
            .iter()
            .all(|n| n.peers().len() == count && n.peers().values().all(|p| p.alive))
    })
    .await;
    nodes
}

#[tokio::test(flavor = "multi_thread")]
async fn two_node_join() {
    init_tracing();
    let (a, a_addr) = start_node(fast_config()).await;
    let (b, _) = start_node(fast_config()).await;

    b.join(a_addr).await;

    wait_for("mutual discovery", Duration::from_secs(5), || {
        a.peers().contains_key(&b.local_id()) && b.peers().contains_key(&a.local_id())
    })
    .await;

    // Lifetimes only ever advance.
    let seen = a.peers()[&b.local_id()].lifetime;
    wait_for("lifetime advances", Duration::from_secs(5), || {
        a.peers()[&b.local_id()].lifetime > seen
    })
    .await;

    a.close();
    b.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn data_dissemination() {
    init_tracing();
    let nodes = mesh(3).await;
    let (a, _) = &nodes[0];
    let (b, _) = &nodes[1];
    let (c, _) = &nodes[2];

    a.set("x", &42u32).unwrap();

    wait_for("value reaches all nodes", Duration::from_secs(10), || {
        b.get::<u32>("x").unwrap() == Some(42) && c.get::<u32>("x").unwrap() == Some(42)
    })
    .await;

    // A later write from another node wins everywhere.
    b.set("x", &43u32).unwrap();
    wait_for("overwrite reaches all nodes", Duration::from_secs(10), || {
        a.get::<u32>("x").unwrap() == Some(43) && c.get::<u32>("x").unwrap() == Some(43)
    })
    .await;

    for (node, _) in &nodes {
        node.close();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn failure_detection() {
    init_tracing();
    let (a, a_addr) = start_node(fast_config()).await;
    let (b, _) = start_node(fast_config()).await;
    b.join(a_addr).await;

    let b_id = b.local_id();
    wait_for("discovery", Duration::from_secs(5), || {
        a.peers().get(&b_id).map(|p| p.alive).unwrap_or(false)
    })
    .await;

    // Kill B: no more heartbeat traffic.
    b.close();

    wait_for("B marked dead", Duration::from_secs(5), || {
        a.peers().get(&b_id).map(|p| !p.alive).unwrap_or(false)
    })
    .await;

    // The descriptor is retained for a later revival.
    assert!(a.peers().contains_key(&b_id));
    a.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn revival_after_restart() {
    init_tracing();
    let id = PeerId::generate();
    let (a, a_addr) = start_node(fast_config()).await;
    let (b, _) = start_node(Config {
        id: Some(id),
        ..fast_config()
    })
    .await;
    b.join(a_addr).await;

    wait_for("discovery", Duration::from_secs(5), || {
        a.peers().get(&id).map(|p| p.alive).unwrap_or(false)
    })
    .await;

    b.close();
    wait_for("B marked dead", Duration::from_secs(5), || {
        a.peers().get(&id).map(|p| !p.alive).unwrap_or(false)
    })
    .await;

    // Restart under the same identity. The fresh node's logical clock must
    // first overtake the cluster's memory of it, so keep announcing while
    // the heartbeat catches up.
    let (b2, _) = start_node(Config {
        id: Some(id),
        heartbeat_interval: Duration::from_millis(5),
        ..fast_config()
    })
    .await;

    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        b2.join(a_addr).await;
        if a.peers().get(&id).map(|p| p.alive).unwrap_or(false) {
            break;
        }
        assert!(Instant::now() < deadline, "timed out waiting for revival");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    a.close();
    b2.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn election_by_quorum() {
    init_tracing();
    let nodes = mesh(3).await;
    let collectors: Vec<_> = nodes.iter().map(|(n, _)| collect_terminal(n)).collect();
    let (a, _) = &nodes[0];
    let (b, _) = &nodes[1];
    let (c, _) = &nodes[2];

    for (node, _) in &nodes {
        assert!(node.election(ElectionOpts::new("leader", Quorum::Count(3))));
    }

    a.vote("leader", "a").await;
    b.vote("leader", "a").await;
    c.vote("leader", "b").await;

    // Keep records circulating until every node has closed; re-casting the
    // same ballot is idempotent.
    let votes = [(a, "a"), (b, "a"), (c, "b")];
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let all_closed = nodes.iter().all(|(n, _)| {
            n.election_record("leader").map(|r| r.closed).unwrap_or(false)
        });
        if all_closed {
            break;
        }
        assert!(Instant::now() < deadline, "timed out waiting for quorum");
        for (node, value) in &votes {
            node.vote("leader", value).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let expected: BTreeMap<String, u32> =
        [("a".to_string(), 2), ("b".to_string(), 1)].into_iter().collect();
    for (node, _) in &nodes {
        let record = node.election_record("leader").unwrap();
        assert!(record.closed && !record.expired);
        assert_eq!(record.results.as_ref(), Some(&expected));
        assert_eq!(record.winner().unwrap(), ("a".to_string(), 2));
    }

    wait_for("quorum events", Duration::from_secs(5), || {
        collectors.iter().all(|collected| {
            collected.lock().unwrap().iter().any(|event| {
                matches!(event, Event::Quorum { topic, results, .. }
                    if topic == "leader" && *results == expected)
            })
        })
    })
    .await;

    for (node, _) in &nodes {
        node.close();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn election_by_deadline() {
    init_tracing();
    let nodes = mesh(3).await;
    let collectors: Vec<_> = nodes.iter().map(|(n, _)| collect_terminal(n)).collect();
    let (a, _) = &nodes[0];
    let (b, _) = &nodes[1];
    let (c, _) = &nodes[2];

    for (node, _) in &nodes {
        assert!(node.election(
            ElectionOpts::new("term", Quorum::Count(5)).with_expiry(Duration::from_millis(400))
        ));
    }

    // Not enough ballots for quorum; the deadline closes it everywhere.
    a.vote("term", "a").await;
    b.vote("term", "b").await;

    wait_for("deadline close", Duration::from_secs(5), || {
        nodes.iter().all(|(n, _)| {
            n.election_record("term")
                .map(|r| r.closed && r.expired)
                .unwrap_or(false)
        })
    })
    .await;

    // Terminal: late ballots are no-ops.
    let status = c.vote("term", "late").await;
    assert!(status.closed && status.expired);
    assert!(!c
        .election_record("term")
        .unwrap()
        .votes
        .contains_key(&c.local_id()));

    wait_for("deadline events", Duration::from_secs(5), || {
        collectors.iter().all(|collected| {
            collected
                .lock()
                .unwrap()
                .iter()
                .any(|event| matches!(event, Event::Deadline { topic, .. } if topic == "term"))
        })
    })
    .await;

    for (node, _) in &nodes {
        node.close();
    }
}
