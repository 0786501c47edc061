//! Multi-peer cluster scenarios.
//!
//! Runs several peers against one shared in-memory broker and exercises
//! membership, position, delta broadcast, full-state reconciliation,
//! settle and shutdown end to end. Time-dependent scenarios run on the
//! paused tokio clock.

use alertmesh::{
    Broker, InMemoryBroker, MessageType, Peer, PeerConfig, SetState, HEARTBEAT_INTERVAL,
    PEER_KEY_TTL,
};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn named_config(name: &str) -> PeerConfig {
    PeerConfig::builder()
        .name(name)
        .prefix("am")
        .push_pull_interval(Duration::from_secs(60))
        .build()
        .unwrap()
}

/// Writes a live heartbeat key directly, standing in for a peer process
/// that is not part of the test.
async fn seed_peer(broker: &InMemoryBroker, key: &str) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs();
    broker
        .set_with_ttl(key, &now.to_string(), PEER_KEY_TTL)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_solo_startup() {
    let broker = InMemoryBroker::new();
    let config = PeerConfig::builder()
        .prefix("am")
        .push_pull_interval(Duration::from_secs(60))
        .build()
        .unwrap();
    let peer = Peer::with_broker(config, Arc::new(broker)).await.unwrap();

    // The first heartbeat lands within one interval.
    tokio::time::sleep(HEARTBEAT_INTERVAL + Duration::from_millis(100)).await;

    let expected = format!("am:{}", peer.name());
    assert_eq!(peer.members().await, vec![expected]);
    assert_eq!(peer.position().await, 0);
    assert_eq!(peer.health_score().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_two_peer_delta_convergence() {
    let broker = InMemoryBroker::new();

    let a = Peer::with_broker(named_config("peer-a"), Arc::new(broker.handle()))
        .await
        .unwrap();
    let state_a = Arc::new(SetState::new());
    let channel_a = a.add_state("nfl", state_a.clone()).await.unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;

    let b = Peer::with_broker(named_config("peer-b"), Arc::new(broker.handle()))
        .await
        .unwrap();
    let state_b = Arc::new(SetState::new());
    let _channel_b = b.add_state("nfl", state_b.clone()).await.unwrap();

    let delta = state_a.insert(b"X".to_vec()).unwrap();
    channel_a.broadcast(delta).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(state_b.contains(b"X"));
    assert_eq!(state_b.len(), 1);
    assert_eq!(a.metrics().messages_sent(MessageType::Update), 1);
    assert_eq!(b.metrics().messages_received(MessageType::Update), 1);
}

#[tokio::test(start_paused = true)]
async fn test_positions_form_a_permutation() {
    let broker = InMemoryBroker::new();
    let names = ["peer-a", "peer-b", "peer-c", "peer-d", "peer-e"];

    let mut peers = Vec::new();
    for name in names {
        let peer = Peer::with_broker(named_config(name), Arc::new(broker.handle()))
            .await
            .unwrap();
        peers.push(peer);
    }

    tokio::time::sleep(HEARTBEAT_INTERVAL + Duration::from_millis(100)).await;

    for (i, peer) in peers.iter().enumerate() {
        assert_eq!(peer.members().await.len(), names.len());
        assert_eq!(peer.position().await, i);
    }

    // Positions hold through steady state.
    tokio::time::sleep(Duration::from_secs(10)).await;
    for (i, peer) in peers.iter().enumerate() {
        assert_eq!(peer.position().await, i);
    }
}

#[tokio::test(start_paused = true)]
async fn test_settle_triggers_one_full_state_per_peer() {
    let broker = InMemoryBroker::new();

    let a = Peer::with_broker(named_config("peer-a"), Arc::new(broker.handle()))
        .await
        .unwrap();
    let state_a = Arc::new(SetState::new());
    a.add_state("nfl", state_a.clone()).await.unwrap();

    let b = Peer::with_broker(named_config("peer-b"), Arc::new(broker.handle()))
        .await
        .unwrap();
    let state_b = Arc::new(SetState::new());
    state_b.insert(b"from-b".to_vec()).unwrap();
    b.add_state("nfl", state_b.clone()).await.unwrap();

    a.settle(Duration::from_secs(1), std::future::pending::<()>())
        .await;
    a.wait_ready().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The request fanned out once; b answered exactly once, a ignored its
    // own request.
    assert_eq!(b.metrics().messages_sent(MessageType::FullState), 1);
    assert_eq!(a.metrics().messages_sent(MessageType::FullState), 0);
    assert_eq!(a.metrics().messages_received(MessageType::FullState), 1);
    assert!(state_a.contains(b"from-b"));
}

#[tokio::test(start_paused = true)]
async fn test_settle_waits_for_quiet_membership() {
    let broker = InMemoryBroker::new();
    let a = Peer::with_broker(named_config("peer-a"), Arc::new(broker.handle()))
        .await
        .unwrap();

    let settling = tokio::spawn({
        let a = a.clone();
        async move {
            a.settle(Duration::from_secs(1), std::future::pending::<()>())
                .await;
        }
    });

    // Membership keeps changing for the first polls.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    seed_peer(&broker, "am:peer-b").await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    seed_peer(&broker, "am:peer-c").await;

    assert!(
        tokio::time::timeout(Duration::from_millis(10), a.wait_ready())
            .await
            .is_err(),
        "gate must stay closed while membership is changing"
    );

    // Three quiet polls later the gate opens.
    tokio::time::timeout(Duration::from_secs(10), a.wait_ready())
        .await
        .expect("settle never finished")
        .unwrap();
    settling.await.unwrap();
}

#[tokio::test]
async fn test_settle_cancellation_opens_gate() {
    let broker = InMemoryBroker::new();
    let peer = Peer::with_broker(named_config("peer-a"), Arc::new(broker))
        .await
        .unwrap();

    // The cancel future is already complete; settle gives up immediately
    // but still opens the gate.
    peer.settle(Duration::from_secs(1), async {}).await;
    peer.wait_ready().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_outage_keeps_position_and_recovers() {
    let broker = InMemoryBroker::new();
    let handle_c = broker.handle();

    let a = Peer::with_broker(named_config("peer-a"), Arc::new(broker.handle()))
        .await
        .unwrap();
    let _b = Peer::with_broker(named_config("peer-b"), Arc::new(broker.handle()))
        .await
        .unwrap();
    let c = Peer::with_broker(named_config("peer-c"), Arc::new(handle_c.clone()))
        .await
        .unwrap();

    tokio::time::sleep(HEARTBEAT_INTERVAL + Duration::from_millis(100)).await;
    assert_eq!(c.position().await, 2);

    // C loses broker access for 30 seconds.
    handle_c.set_down(true);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(c.position().await, 2, "position must stick during the outage");

    handle_c.set_down(false);
    tokio::time::sleep(HEARTBEAT_INTERVAL + Duration::from_millis(100)).await;

    assert_eq!(c.members().await.len(), 3);
    assert_eq!(a.members().await.len(), 3);
    assert_eq!(c.position().await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_late_joiner_receives_full_state() {
    let broker = InMemoryBroker::new();

    let a = Peer::with_broker(named_config("peer-a"), Arc::new(broker.handle()))
        .await
        .unwrap();
    let state_a = Arc::new(SetState::new());
    state_a.insert(b"n1".to_vec()).unwrap();
    a.add_state("nfl", state_a.clone()).await.unwrap();

    let b = Peer::with_broker(named_config("peer-b"), Arc::new(broker.handle()))
        .await
        .unwrap();
    let state_b = Arc::new(SetState::new());
    state_b.insert(b"n2".to_vec()).unwrap();
    b.add_state("nfl", state_b.clone()).await.unwrap();

    tokio::time::sleep(HEARTBEAT_INTERVAL + Duration::from_millis(100)).await;

    let d = Peer::with_broker(named_config("peer-d"), Arc::new(broker.handle()))
        .await
        .unwrap();
    let state_d = Arc::new(SetState::new());
    d.add_state("nfl", state_d.clone()).await.unwrap();

    d.settle(Duration::from_secs(1), std::future::pending::<()>())
        .await;
    d.wait_ready().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(d.metrics().messages_received(MessageType::FullState) >= 1);
    assert!(state_d.contains(b"n1"));
    assert!(state_d.contains(b"n2"));
}

#[tokio::test(start_paused = true)]
async fn test_periodic_full_state_sync_converges() {
    let broker = InMemoryBroker::new();
    let config = |name: &str| {
        PeerConfig::builder()
            .name(name)
            .prefix("am")
            .push_pull_interval(Duration::from_secs(3))
            .build()
            .unwrap()
    };

    let a = Peer::with_broker(config("peer-a"), Arc::new(broker.handle()))
        .await
        .unwrap();
    let state_a = Arc::new(SetState::new());
    state_a.insert(b"n1".to_vec()).unwrap();
    a.add_state("nfl", state_a.clone()).await.unwrap();

    let b = Peer::with_broker(config("peer-b"), Arc::new(broker.handle()))
        .await
        .unwrap();
    let state_b = Arc::new(SetState::new());
    b.add_state("nfl", state_b.clone()).await.unwrap();

    // No broadcast anywhere; the periodic push/pull alone reconciles.
    tokio::time::sleep(Duration::from_secs(3) + Duration::from_millis(100)).await;

    assert!(state_b.contains(b"n1"));
    assert!(a.metrics().messages_sent(MessageType::FullState) >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_state_keys_are_skipped() {
    let broker = InMemoryBroker::new();

    let a = Peer::with_broker(named_config("peer-a"), Arc::new(broker.handle()))
        .await
        .unwrap();
    let state_a = Arc::new(SetState::new());
    state_a.insert(b"n1".to_vec()).unwrap();
    a.add_state("nfl", state_a.clone()).await.unwrap();

    // B never registered "nfl", only "sil".
    let b = Peer::with_broker(named_config("peer-b"), Arc::new(broker.handle()))
        .await
        .unwrap();
    let state_b = Arc::new(SetState::new());
    b.add_state("sil", state_b.clone()).await.unwrap();

    // B's settle request makes A publish a full state whose only part
    // carries a key B does not know.
    b.settle(Duration::from_secs(1), std::future::pending::<()>())
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The message arrived, the unknown part was skipped, nothing crashed.
    assert_eq!(b.metrics().messages_received(MessageType::FullState), 1);
    assert!(state_b.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_clean_shutdown() {
    let broker = InMemoryBroker::new();

    let a = Peer::with_broker(named_config("peer-a"), Arc::new(broker.handle()))
        .await
        .unwrap();
    let state_a = Arc::new(SetState::new());
    a.add_state("nfl", state_a.clone()).await.unwrap();

    let b = Peer::with_broker(named_config("peer-b"), Arc::new(broker.handle()))
        .await
        .unwrap();
    let state_b = Arc::new(SetState::new());
    state_b.insert(b"parting".to_vec()).unwrap();
    b.add_state("nfl", state_b.clone()).await.unwrap();

    tokio::time::sleep(HEARTBEAT_INTERVAL + Duration::from_millis(100)).await;
    assert_eq!(a.cluster_size().await, 2);

    b.shutdown().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The self key is deleted immediately and the final full state made it
    // out to the survivor.
    assert_eq!(a.cluster_size().await, 1);
    assert!(a.metrics().messages_received(MessageType::FullState) >= 1);
    assert!(state_a.contains(b"parting"));
}
