//! Cluster peer over a shared broker.
//!
//! Substitutes for a peer-to-peer memberlist layer: each instance
//! advertises liveness through a TTL key, discovers the other live
//! instances by scanning the key space, derives its deterministic position
//! among them, and reconciles shared state through per-state delta
//! channels plus a periodic full-state exchange. Everything runs over one
//! broker connection and survives transient broker outages without
//! renumbering the cluster.

use crate::broker::{Broker, BrokerError, BrokerMessage, RedisBroker, Subscription};
use crate::config::PeerConfig;
use crate::metrics::{ClusterMetrics, MessageType};
use crate::protocol::{FullState, Part};
use crate::state::State;
use prost::Message;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, RwLock};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Key pattern appended to the prefix when scanning for peers.
const PEER_PATTERN: &str = "*";
/// Channel carrying periodic whole-snapshot publications.
const FULL_STATE_CHANNEL: &str = "full_state";
/// Channel carrying on-demand full-state requests.
const FULL_STATE_REQUEST_CHANNEL: &str = "full_state:request";
/// Hint to the broker for how many keys a peer scan may return.
const SCAN_COUNT_HINT: usize = 100;
/// Consecutive unchanged membership polls required before settling.
const NUM_OKAY_REQUIRED: usize = 3;

/// Interval between heartbeat writes.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// Peers whose last heartbeat is older than this are not members.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);
/// TTL on the self key; bounds how long a crashed peer stays visible.
pub const PEER_KEY_TTL: Duration = Duration::from_secs(300);
/// How long the cached position outlives an empty membership view.
pub const POSITION_VALID_FOR: Duration = Duration::from_secs(60);
/// Backoff applied after a network error inside a receive loop.
pub const NETWORK_RETRY_INTERVAL: Duration = Duration::from_secs(10);

// ============================================================================
// ERRORS
// ============================================================================

/// Error type for peer construction and lifecycle operations.
#[derive(thiserror::Error, Debug)]
pub enum PeerError {
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("peer is shutting down")]
    Shutdown,
}

// ============================================================================
// PEER
// ============================================================================

/// A cluster peer.
///
/// Created once per process, optionally given states to replicate, settled
/// and eventually shut down. All methods take `&self`; the peer is shared
/// with its background loops through an [`Arc`].
pub struct Peer {
    name: String,
    prefix: String,
    broker: Arc<dyn Broker>,
    states: RwLock<HashMap<String, Arc<dyn State>>>,
    metrics: ClusterMetrics,

    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    position_valid_for: Duration,
    push_pull_interval: Duration,

    /// Last known cluster position.
    position: AtomicUsize,
    /// When the position was last computed successfully, as nanoseconds
    /// since the epoch. Zero means never.
    position_fetched_at: AtomicI64,

    ready_tx: watch::Sender<bool>,
    shutdown_tx: watch::Sender<bool>,
    shut_down: AtomicBool,
}

impl Peer {
    /// Connects to the broker described by `config` and starts the peer.
    ///
    /// # Errors
    ///
    /// Fails when the configuration is invalid or the initial ping does
    /// not come back; no loops are started in that case.
    pub async fn connect(config: PeerConfig) -> Result<Arc<Self>, PeerError> {
        config.validate().map_err(PeerError::Config)?;
        let broker = RedisBroker::connect(&config).await?;
        Self::with_broker(config, Arc::new(broker)).await
    }

    /// Starts a peer on an existing broker handle.
    ///
    /// This is the seam tests use with [`crate::InMemoryBroker`]; `connect`
    /// goes through here after dialing Redis.
    pub async fn with_broker(
        config: PeerConfig,
        broker: Arc<dyn Broker>,
    ) -> Result<Arc<Self>, PeerError> {
        broker.ping().await?;

        let name = match config.name {
            Some(ref name) if !name.is_empty() => name.clone(),
            _ => format!("peer-{}", uuid::Uuid::new_v4()),
        };
        // The prefix delimits with a colon.
        let prefix = match config.prefix {
            Some(ref prefix) if !prefix.is_empty() => {
                if prefix.ends_with(':') {
                    prefix.clone()
                } else {
                    format!("{}:", prefix)
                }
            }
            _ => String::new(),
        };

        let (ready_tx, _) = watch::channel(false);
        let (shutdown_tx, _) = watch::channel(false);

        let peer = Arc::new(Peer {
            name,
            prefix,
            broker,
            states: RwLock::new(HashMap::new()),
            metrics: ClusterMetrics::new(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
            position_valid_for: POSITION_VALID_FOR,
            push_pull_interval: config.push_pull_interval,
            position: AtomicUsize::new(0),
            position_fetched_at: AtomicI64::new(0),
            ready_tx,
            shutdown_tx,
            shut_down: AtomicBool::new(false),
        });

        let full_state_sub = peer
            .broker
            .subscribe(&peer.with_prefix(FULL_STATE_CHANNEL))
            .await?;
        let request_sub = peer
            .broker
            .subscribe(&peer.with_prefix(FULL_STATE_REQUEST_CHANNEL))
            .await?;

        tokio::spawn(Arc::clone(&peer).heartbeat_loop());
        tokio::spawn(Arc::clone(&peer).full_state_publish_loop());
        tokio::spawn(Arc::clone(&peer).full_state_receive_loop(full_state_sub));
        tokio::spawn(Arc::clone(&peer).full_state_request_loop(request_sub));

        Ok(peer)
    }

    /// The peer's unique name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Metrics handle shared with the background loops.
    pub fn metrics(&self) -> &ClusterMetrics {
        &self.metrics
    }

    fn with_prefix(&self, suffix: &str) -> String {
        format!("{}{}", self.prefix, suffix)
    }

    /// The broker key advertising this peer's liveness.
    fn self_key(&self) -> String {
        self.with_prefix(&self.name)
    }

    // ========================================================================
    // MEMBERSHIP
    // ========================================================================

    /// Returns the sorted names of peers with a live heartbeat.
    ///
    /// Names are the scanned broker keys, prefix included. A peer appears
    /// here only while its key exists and its stored heartbeat is within
    /// the heartbeat timeout.
    pub async fn members(&self) -> Vec<String> {
        let pattern = self.with_prefix(PEER_PATTERN);
        let keys = match self.broker.scan(&pattern, SCAN_COUNT_HINT).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::error!(error = %e, pattern = %pattern, "error getting keys from broker");
                return Vec::new();
            }
        };
        // Expected at startup, before the first heartbeat landed.
        if keys.is_empty() {
            return Vec::new();
        }
        let values = match self.broker.mget(&keys).await {
            Ok(values) => values,
            Err(e) => {
                tracing::error!(error = %e, keys = ?keys, "error getting values from broker");
                return Vec::new();
            }
        };

        let now = unix_seconds();
        let mut peers = Vec::new();
        for (key, value) in keys.iter().zip(values.iter()) {
            let Some(value) = value else {
                continue;
            };
            let heartbeat: u64 = match value.parse() {
                Ok(heartbeat) => heartbeat,
                Err(_) => {
                    // A corrupt heartbeat value must not take down every
                    // peer that scans it; skip the key loudly instead.
                    tracing::error!(key = %key, value = %value, "malformed heartbeat timestamp");
                    continue;
                }
            };
            if heartbeat + self.heartbeat_timeout.as_secs() < now {
                continue;
            }
            peers.push(key.clone());
        }
        peers.sort();
        peers.dedup();
        peers
    }

    /// The index of this peer in the sorted membership.
    ///
    /// Callers shard responsibility on this, so an empty view with a
    /// recently computed position is treated as a broker outage: the last
    /// known position is returned for up to [`POSITION_VALID_FOR`] to
    /// avoid a renumbering storm, and only then does the peer fail over
    /// to position zero.
    pub async fn position(&self) -> usize {
        let members = self.members().await;
        if members.is_empty() && self.position_is_fresh() {
            let last_known = self.position.load(Ordering::Relaxed);
            tracing::warn!(
                last_known = last_known,
                "failed to fetch position from broker, falling back to last known position"
            );
            return last_known;
        }
        let self_key = self.self_key();
        for (i, peer) in members.iter().enumerate() {
            if *peer == self_key {
                tracing::debug!(name = %self.name, position = i, "cluster position found");
                self.position.store(i, Ordering::Relaxed);
                self.position_fetched_at
                    .store(unix_nanos(), Ordering::Relaxed);
                return i;
            }
        }

        0
    }

    fn position_is_fresh(&self) -> bool {
        let fetched_at = self.position_fetched_at.load(Ordering::Relaxed);
        if fetched_at == 0 {
            return false;
        }
        let age = unix_nanos().saturating_sub(fetched_at);
        age < self.position_valid_for.as_nanos() as i64
    }

    /// The known size of the cluster, dead-but-not-expired peers included.
    pub async fn cluster_size(&self) -> usize {
        let pattern = self.with_prefix(PEER_PATTERN);
        match self.broker.scan(&pattern, SCAN_COUNT_HINT).await {
            Ok(keys) => keys.len(),
            Err(e) => {
                tracing::error!(error = %e, pattern = %pattern, "error getting keys from broker");
                0
            }
        }
    }

    /// Zero when every advertised peer still heartbeats; otherwise the
    /// number of peers whose TTL outlives their heartbeat window.
    pub async fn health_score(&self) -> usize {
        let size = self.cluster_size().await;
        let members = self.members().await.len();
        size.saturating_sub(members)
    }

    // ========================================================================
    // STATE REGISTRATION
    // ========================================================================

    /// Registers a named state and returns the broadcast handle for its
    /// delta channel. The state starts receiving remote deltas right away;
    /// states are never unregistered for the lifetime of the peer.
    pub async fn add_state(
        self: &Arc<Self>,
        key: &str,
        state: Arc<dyn State>,
    ) -> Result<UpdateChannel, PeerError> {
        let channel = self.with_prefix(key);
        // We also want this state from other peers, so subscribe to its key.
        let sub = self.broker.subscribe(&channel).await?;
        {
            let mut states = self.states.write().await;
            states.insert(key.to_string(), state);
        }
        tokio::spawn(Arc::clone(self).update_receive_loop(key.to_string(), sub));
        Ok(UpdateChannel {
            broker: Arc::clone(&self.broker),
            metrics: self.metrics.clone(),
            key: key.to_string(),
            channel,
        })
    }

    /// Serializes every registered state into one full-state envelope.
    pub async fn local_state(&self) -> Vec<u8> {
        let states = self.states.read().await;
        let mut all = FullState {
            parts: Vec::with_capacity(states.len()),
        };
        for (key, state) in states.iter() {
            let data = match state.marshal() {
                Ok(data) => data,
                Err(e) => {
                    // Best effort; the next cycle retries this state.
                    tracing::warn!(error = %e, key = %key, "error encoding the local state");
                    continue;
                }
            };
            all.parts.push(Part {
                key: key.clone(),
                data,
            });
        }
        let bytes = all.encode_to_vec();
        self.metrics
            .record_sent(MessageType::FullState, bytes.len());
        bytes
    }

    // ========================================================================
    // BACKGROUND LOOPS
    // ========================================================================

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        // Catch a signal latched before this task was first polled;
        // changed() only reports versions newer than the subscription.
        if *shutdown.borrow() {
            return;
        }
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.heartbeat_interval) => {}
                _ = shutdown.changed() => return,
            }
            let start = tokio::time::Instant::now();
            let now = unix_seconds();
            if let Err(e) = self
                .broker
                .set_with_ttl(&self.self_key(), &now.to_string(), PEER_KEY_TTL)
                .await
            {
                tracing::error!(error = %e, peer = %self.self_key(), "error setting the heartbeat key");
                continue;
            }
            self.metrics.observe_ping(start.elapsed());
        }
    }

    /// Waits for the next message on `sub`, applying the shared receive
    /// policy: network errors back off [`NETWORK_RETRY_INTERVAL`], other
    /// errors retry immediately, shutdown ends the loop (`None`).
    async fn next_message(
        &self,
        sub: &mut Box<dyn Subscription>,
        channel: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<BrokerMessage> {
        loop {
            let msg = tokio::select! {
                msg = sub.next_message() => msg,
                _ = shutdown.changed() => return None,
            };
            match msg {
                Ok(msg) => return Some(msg),
                Err(e) if e.is_network() => {
                    tracing::error!(error = %e, channel = %channel, "network error, waiting 10 seconds before retry");
                    tokio::select! {
                        _ = tokio::time::sleep(NETWORK_RETRY_INTERVAL) => {}
                        _ = shutdown.changed() => return None,
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, channel = %channel, "error receiving message from broker");
                }
            }
        }
    }

    async fn update_receive_loop(self: Arc<Self>, key: String, mut sub: Box<dyn Subscription>) {
        let channel = self.with_prefix(&key);
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow() {
            return;
        }
        while let Some(msg) = self.next_message(&mut sub, &channel, &mut shutdown).await {
            self.metrics
                .record_received(MessageType::Update, msg.payload.len());
            let part = match Part::decode(msg.payload.as_slice()) {
                Ok(part) => part,
                Err(e) => {
                    tracing::warn!(error = %e, "error decoding the received broadcast message");
                    continue;
                }
            };

            // Routing happens on the envelope key, not the channel name.
            let state = {
                let states = self.states.read().await;
                states.get(&part.key).cloned()
            };
            let Some(state) = state else {
                continue;
            };
            if let Err(e) = state.merge(&part.data) {
                tracing::warn!(error = %e, key = %part.key, "error merging the received broadcast message");
            }
        }
    }

    async fn full_state_receive_loop(self: Arc<Self>, mut sub: Box<dyn Subscription>) {
        let channel = self.with_prefix(FULL_STATE_CHANNEL);
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow() {
            return;
        }
        while let Some(msg) = self.next_message(&mut sub, &channel, &mut shutdown).await {
            self.metrics
                .record_received(MessageType::FullState, msg.payload.len());
            let full = match FullState::decode(msg.payload.as_slice()) {
                Ok(full) => full,
                Err(e) => {
                    tracing::warn!(error = %e, "error decoding the received remote state");
                    continue;
                }
            };

            let states = self.states.read().await;
            for part in &full.parts {
                let Some(state) = states.get(&part.key) else {
                    tracing::warn!(key = %part.key, len = msg.payload.len(), "received unknown state key");
                    continue;
                };
                if let Err(e) = state.merge(&part.data) {
                    // A failed part aborts the rest of this message;
                    // later messages are unaffected.
                    tracing::warn!(error = %e, key = %part.key, "error merging the received remote state");
                    break;
                }
            }
        }
    }

    async fn full_state_request_loop(self: Arc<Self>, mut sub: Box<dyn Subscription>) {
        let channel = self.with_prefix(FULL_STATE_REQUEST_CHANNEL);
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow() {
            return;
        }
        while let Some(msg) = self.next_message(&mut sub, &channel, &mut shutdown).await {
            // The payload is the requesting peer's name. Pub/sub fans out
            // to every client, the publisher included, so our own request
            // comes back around and must not trigger a publish.
            if msg.payload == self.name.as_bytes() {
                continue;
            }
            self.full_state_sync_publish().await;
        }
    }

    async fn full_state_publish_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow() {
            return;
        }
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.push_pull_interval) => {}
                _ = shutdown.changed() => return,
            }
            self.full_state_sync_publish().await;
        }
    }

    async fn full_state_sync_publish(&self) {
        let channel = self.with_prefix(FULL_STATE_CHANNEL);
        let payload = self.local_state().await;
        if let Err(e) = self.broker.publish(&channel, payload).await {
            tracing::error!(error = %e, channel = %channel, "error publishing a message to broker");
        }
    }

    async fn request_full_state(&self) {
        let channel = self.with_prefix(FULL_STATE_REQUEST_CHANNEL);
        let payload = self.name.clone().into_bytes();
        if let Err(e) = self.broker.publish(&channel, payload).await {
            tracing::error!(error = %e, channel = %channel, "error publishing a message to broker");
        }
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Waits for membership to stop changing, then requests a full state
    /// and opens the readiness gate.
    ///
    /// Polls `members()` every `interval` until the count is unchanged for
    /// three consecutive polls. When `cancel` completes first the gate
    /// opens anyway: the peer is usable but may have missed initial state.
    pub async fn settle<F>(&self, interval: Duration, cancel: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(cancel);
        tracing::info!(interval = ?interval, "waiting for cluster membership to settle");
        let start = tokio::time::Instant::now();
        let mut n_peers = 0usize;
        let mut n_okay = 0usize;
        let mut total_polls = 0usize;
        loop {
            tokio::select! {
                _ = &mut cancel => {
                    tracing::info!(polls = total_polls, elapsed = ?start.elapsed(), "membership not settled but continuing anyway");
                    self.open_ready_gate();
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
            let elapsed = start.elapsed();
            let n = self.members().await.len();
            if n_okay >= NUM_OKAY_REQUIRED {
                tracing::info!(elapsed = ?elapsed, "membership settled; proceeding");
                break;
            }
            if n == n_peers {
                n_okay += 1;
                tracing::debug!(elapsed = ?elapsed, "membership looks settled");
            } else {
                n_okay = 0;
                tracing::info!(polls = total_polls, before = n_peers, now = n, elapsed = ?elapsed, "membership not settled");
            }
            n_peers = n;
            total_polls += 1;
        }
        self.request_full_state().await;
        self.open_ready_gate();
    }

    fn open_ready_gate(&self) {
        // send_replace: the gate value must stick even when nobody has
        // subscribed yet; wait_ready may come along only afterwards.
        self.ready_tx.send_replace(true);
    }

    /// Blocks until the settle gate opens.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Shutdown`] when the peer stops before ever
    /// becoming ready. Callers bound the wait with their own timeout.
    pub async fn wait_ready(&self) -> Result<(), PeerError> {
        let mut ready = self.ready_tx.subscribe();
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow() {
            return Err(PeerError::Shutdown);
        }
        tokio::select! {
            res = ready.wait_for(|ready| *ready) => match res {
                Ok(_) => Ok(()),
                Err(_) => Err(PeerError::Shutdown),
            },
            _ = shutdown.changed() => Err(PeerError::Shutdown),
        }
    }

    /// Stops the background loops, publishes one final full state so the
    /// survivors converge on our departure, and deletes the self key.
    ///
    /// Terminal: a shut-down peer is not reusable. A second call is a
    /// warned no-op. Loops are signalled, not awaited; each observes the
    /// signal at its next suspension point.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            tracing::warn!(name = %self.name, "shutdown requested twice");
            return;
        }
        tracing::info!(name = %self.name, "stopping cluster peer");
        // send_replace: loops subscribe lazily, and wait_ready must see the
        // signal through the stored value even with no receiver live yet.
        self.shutdown_tx.send_replace(true);
        self.full_state_sync_publish().await;
        let key = self.self_key();
        if let Err(e) = self.broker.delete(&key).await {
            tracing::error!(error = %e, key = %key, "error deleting the peer key on shutdown");
        }
    }

    /// Renders the peer's metrics in Prometheus text format, sampling the
    /// membership gauges live.
    pub async fn export_metrics(&self) -> String {
        let cluster_size = self.cluster_size().await;
        let position = self.position().await;
        let health_score = self.health_score().await;
        self.metrics
            .to_prometheus_text(cluster_size, position, health_score)
    }
}

// ============================================================================
// UPDATE CHANNEL
// ============================================================================

/// Broadcast handle for one registered state's delta channel.
///
/// Carries the broker and metrics handles it needs instead of a reference
/// back to the peer.
pub struct UpdateChannel {
    broker: Arc<dyn Broker>,
    metrics: ClusterMetrics,
    /// Registry key, reused as the envelope key so receivers can route.
    key: String,
    /// Prefixed channel the envelope is published on.
    channel: String,
}

impl UpdateChannel {
    /// Publishes one delta for this channel's state.
    ///
    /// A publish failure is logged and dropped; the periodic full-state
    /// sync reconciles whatever the delta would have carried.
    pub async fn broadcast(&self, data: Vec<u8>) {
        let part = Part {
            key: self.key.clone(),
            data,
        };
        let payload = part.encode_to_vec();
        let size = payload.len();
        if let Err(e) = self.broker.publish(&self.channel, payload).await {
            tracing::error!(error = %e, channel = %self.channel, "error publishing a message to broker");
            return;
        }
        self.metrics.record_sent(MessageType::Update, size);
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

// ============================================================================
// TESTS
// ============================================================================
