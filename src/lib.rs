//! Redis-backed cluster peer for alert-notification services.
//!
//! Lets multiple instances of a notification service share state without a
//! dedicated gossip/membership protocol: each peer advertises liveness
//! through a TTL key, discovers the other live peers by scanning the key
//! space, computes its deterministic position among them, broadcasts delta
//! updates per named state, and periodically exchanges full snapshots so
//! newcomers and stale peers converge.
//!
//! # Example
//!
//! ```ignore
//! use alertmesh::{Peer, PeerConfig, SetState};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PeerConfig::builder()
//!         .addr("127.0.0.1:6379")
//!         .prefix("am")
//!         .push_pull_interval(Duration::from_secs(60))
//!         .build()?;
//!
//!     let peer = Peer::connect(config).await?;
//!     let log = Arc::new(SetState::new());
//!     let channel = peer.add_state("nfl", log.clone()).await?;
//!
//!     peer.settle(Duration::from_secs(1), std::future::pending()).await;
//!     peer.wait_ready().await?;
//!
//!     let delta = log.insert(b"notification".to_vec())?;
//!     channel.broadcast(delta).await;
//!
//!     peer.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod metrics;
pub mod peer;
pub mod protocol;
pub mod state;

pub use broker::{Broker, BrokerError, BrokerMessage, InMemoryBroker, RedisBroker, Subscription};
pub use config::{PeerConfig, PeerConfigBuilder};
pub use metrics::{ClusterMetrics, MessageType, PING_BUCKETS};
pub use peer::{
    Peer, PeerError, UpdateChannel, HEARTBEAT_INTERVAL, HEARTBEAT_TIMEOUT, NETWORK_RETRY_INTERVAL,
    PEER_KEY_TTL, POSITION_VALID_FOR,
};
pub use protocol::{FullState, Part};
pub use state::{SetState, State, StateError};
