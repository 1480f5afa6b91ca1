//! Counter exchange end-to-end tests
//!
//! Spins up real nodes on localhost TCP (mDNS disabled so LAN discovery
//! cannot interfere) and verifies:
//! - a manual dial leads to counters flowing in both directions
//! - dial failures are reported back to the caller
//! - a dead peer produces a close event and exactly one failed reconnect

use std::time::Duration;

use libp2p::{identity, Multiaddr, PeerId};
use tokio::sync::mpsc;
use tokio::time::timeout;

use pulse_node::{start, Config, ExchangeError, NodeEvent};

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Localhost-only config with a fast tick so tests finish quickly.
fn test_config() -> Config {
    let mut config = Config::default();
    config.p2p.listen_addrs = vec!["/ip4/127.0.0.1/tcp/0".to_string()];
    config.p2p.mdns_enabled = false;
    config.counter.tick_interval_ms = 50;
    config
}

/// Collect `count` counter values received from `peer`, ignoring other events.
async fn wait_for_counters(
    events: &mut mpsc::Receiver<NodeEvent>,
    peer: PeerId,
    count: usize,
) -> Vec<u64> {
    let mut values = Vec::new();
    timeout(EXCHANGE_TIMEOUT, async {
        while values.len() < count {
            match events.recv().await {
                Some(NodeEvent::CounterReceived { peer_id, value, .. }) if peer_id == peer => {
                    values.push(value);
                }
                Some(_) => {}
                None => panic!("event channel closed while waiting for counters"),
            }
        }
    })
    .await
    .expect("timed out waiting for counter values");
    values
}

async fn wait_for_session_closed(events: &mut mpsc::Receiver<NodeEvent>, peer: PeerId) {
    timeout(EXCHANGE_TIMEOUT, async {
        loop {
            match events.recv().await {
                Some(NodeEvent::SessionClosed { peer_id, .. }) if peer_id == peer => break,
                Some(_) => {}
                None => panic!("event channel closed before the session did"),
            }
        }
    })
    .await
    .expect("timed out waiting for session close");
}

// =============================================================================
// Node Startup
// =============================================================================

#[tokio::test]
async fn test_listen_addrs_include_peer_id() {
    let (node, _events) = start(test_config()).await.unwrap();

    assert!(!node.listen_addrs().is_empty(), "Node should be listening");
    for addr in node.listen_addrs() {
        let addr_str = addr.to_string();
        assert!(
            addr_str.ends_with(&format!("/p2p/{}", node.peer_id())),
            "Listen addr should be directly dialable, got: {}",
            addr_str
        );
    }

    node.shutdown();
}

#[tokio::test]
async fn test_wildcard_listen_publishes_all_interfaces() {
    let mut config = test_config();
    config.p2p.listen_addrs = vec!["/ip4/0.0.0.0/tcp/0".to_string()];
    let (node, _events) = start(config).await.unwrap();

    // On a host with more than one interface the wildcard bind expands to
    // one address per interface. Relaying only the loopback one would leave
    // other hosts nothing to dial.
    let addrs = node.listen_addrs();
    assert!(
        addrs.iter().any(|a| a.to_string().contains("127.0.0.1")),
        "Loopback expansion should be published, got: {:?}",
        addrs
    );
    assert!(
        addrs.iter().any(|a| !a.to_string().contains("127.0.0.1")),
        "Non-loopback expansions should be published too, got: {:?}",
        addrs
    );
    for addr in addrs {
        assert!(
            addr.to_string().ends_with(&format!("/p2p/{}", node.peer_id())),
            "Every expansion should be directly dialable, got: {}",
            addr
        );
    }

    node.shutdown();
}

#[tokio::test]
async fn test_two_nodes_get_distinct_identities() {
    let (node_a, _events_a) = start(test_config()).await.unwrap();
    let (node_b, _events_b) = start(test_config()).await.unwrap();

    assert_ne!(node_a.peer_id(), node_b.peer_id());

    node_a.shutdown();
    node_b.shutdown();
}

// =============================================================================
// Manual Dial & Counter Exchange
// =============================================================================

#[tokio::test]
async fn test_manual_dial_exchanges_counters_both_ways() {
    let (node_a, mut events_a) = start(test_config()).await.unwrap();
    let (node_b, mut events_b) = start(test_config()).await.unwrap();

    let addr = node_b.listen_addrs()[0].clone();
    node_a.connect(addr).await.expect("dial should succeed");

    let from_b = wait_for_counters(&mut events_a, node_b.peer_id(), 3).await;
    let from_a = wait_for_counters(&mut events_b, node_a.peer_id(), 3).await;

    assert_eq!(
        from_b,
        vec![1, 2, 3],
        "Counters from B should start at 1 and increment"
    );
    assert_eq!(
        from_a,
        vec![1, 2, 3],
        "Counters from A should start at 1 and increment"
    );

    node_a.shutdown();
    node_b.shutdown();
}

#[tokio::test]
async fn test_both_sides_report_session_opened() {
    let (node_a, mut events_a) = start(test_config()).await.unwrap();
    let (node_b, mut events_b) = start(test_config()).await.unwrap();

    let addr = node_b.listen_addrs()[0].clone();
    node_a.connect(addr).await.expect("dial should succeed");

    let opened_on_a = timeout(EXCHANGE_TIMEOUT, async {
        loop {
            match events_a.recv().await {
                Some(NodeEvent::SessionOpened { peer_id, .. }) => break peer_id,
                Some(_) => {}
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("dialer should report an open session");

    let opened_on_b = timeout(EXCHANGE_TIMEOUT, async {
        loop {
            match events_b.recv().await {
                Some(NodeEvent::SessionOpened { peer_id, .. }) => break peer_id,
                Some(_) => {}
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("listener should report an open session");

    assert_eq!(opened_on_a, node_b.peer_id());
    assert_eq!(opened_on_b, node_a.peer_id());

    node_a.shutdown();
    node_b.shutdown();
}

// =============================================================================
// Dial Failures
// =============================================================================

#[tokio::test]
async fn test_connect_to_unreachable_peer_returns_error() {
    let (node, _events) = start(test_config()).await.unwrap();

    // Nothing listens on port 1; the dial is refused immediately.
    let ghost = PeerId::from(identity::Keypair::generate_ed25519().public());
    let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/1/p2p/{}", ghost)
        .parse()
        .unwrap();

    let result = timeout(EXCHANGE_TIMEOUT, node.connect(addr))
        .await
        .expect("dial should resolve, not hang");
    assert!(
        matches!(result, Err(ExchangeError::Dial(_))),
        "Dialing a closed port should report a dial error"
    );

    node.shutdown();
}

#[tokio::test]
async fn test_connect_without_peer_id_component_fails() {
    let (node, _events) = start(test_config()).await.unwrap();

    let addr: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
    let result = node.connect(addr).await;

    assert!(
        matches!(result, Err(ExchangeError::InvalidAddress(_))),
        "Address without a /p2p/ component should be rejected before dialing"
    );

    node.shutdown();
}

#[tokio::test]
async fn test_dial_with_wrong_peer_id_fails() {
    let (node_a, _events_a) = start(test_config()).await.unwrap();
    let (node_b, _events_b) = start(test_config()).await.unwrap();

    // B's real transport address, but claiming a different identity. The
    // encryption handshake authenticates the remote key, so this must fail.
    let impostor = PeerId::from(identity::Keypair::generate_ed25519().public());
    let addr_str = node_b.listen_addrs()[0]
        .to_string()
        .replace(&node_b.peer_id().to_string(), &impostor.to_string());
    let addr: Multiaddr = addr_str.parse().unwrap();

    let result = timeout(EXCHANGE_TIMEOUT, node_a.connect(addr))
        .await
        .expect("dial should resolve, not hang");
    assert!(
        matches!(result, Err(ExchangeError::Dial(_))),
        "A peer id mismatch should fail the dial"
    );

    node_a.shutdown();
    node_b.shutdown();
}

// =============================================================================
// Peer Death & Reconnect
// =============================================================================

#[tokio::test]
async fn test_peer_shutdown_causes_single_failed_reconnect() {
    let (node_a, mut events_a) = start(test_config()).await.unwrap();
    let (node_b, mut events_b) = start(test_config()).await.unwrap();

    let addr = node_b.listen_addrs()[0].clone();
    node_a.connect(addr).await.expect("dial should succeed");

    // Let the exchange get going before killing B.
    wait_for_counters(&mut events_a, node_b.peer_id(), 2).await;

    node_b.shutdown();
    drop(events_b);

    // A's next write hits the dead connection and the session is torn down.
    wait_for_session_closed(&mut events_a, node_b.peer_id()).await;

    // The reconnect attempt is actually made, runs against a gone listener,
    // and reports its failure.
    timeout(EXCHANGE_TIMEOUT, async {
        loop {
            match events_a.recv().await {
                Some(NodeEvent::ReconnectFailed { peer_id }) if peer_id == node_b.peer_id() => {
                    break;
                }
                Some(NodeEvent::SessionOpened { peer_id, .. })
                    if peer_id == node_b.peer_id() =>
                {
                    panic!("Reconnect must not succeed after the peer shut down");
                }
                Some(_) => {}
                None => panic!("event channel closed before the reconnect resolved"),
            }
        }
    })
    .await
    .expect("the one reconnect attempt should be made and fail");

    // And it stays at one: no second attempt, no new session.
    let drain = tokio::time::sleep(Duration::from_secs(2));
    tokio::pin!(drain);
    loop {
        tokio::select! {
            _ = &mut drain => break,
            event = events_a.recv() => match event {
                Some(NodeEvent::SessionOpened { peer_id, .. })
                    if peer_id == node_b.peer_id() =>
                {
                    panic!("Reconnect must not succeed after the peer shut down");
                }
                Some(NodeEvent::ReconnectFailed { peer_id })
                    if peer_id == node_b.peer_id() =>
                {
                    panic!("Only one reconnect attempt may be made");
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    node_a.shutdown();
}
