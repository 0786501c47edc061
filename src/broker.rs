//! Broker transport for the cluster peer.
//!
//! A thin contract over the external key/value + pub/sub broker: TTL key
//! writes, best-effort key scans, and channel subscriptions. Network
//! failures are surfaced distinctly from broker responses so receive loops
//! can apply their fixed backoff to the former only.

use crate::config::PeerConfig;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// A message delivered on a subscribed channel.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// Error type for broker operations.
#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    /// The broker could not be reached or the connection dropped.
    #[error("network error: {0}")]
    Network(String),
    /// The broker answered, but with an error.
    #[error("broker response error: {0}")]
    Response(String),
    /// A configuration value could not be interpreted.
    #[error("parse error: {0}")]
    Parse(String),
}

impl BrokerError {
    /// True when the failure came from the transport rather than from the
    /// broker itself. Callers back off ten seconds on these.
    pub fn is_network(&self) -> bool {
        matches!(self, BrokerError::Network(_))
    }
}

impl From<redis::RedisError> for BrokerError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error()
            || e.is_timeout()
            || e.is_connection_dropped()
            || e.is_connection_refusal()
        {
            BrokerError::Network(e.to_string())
        } else {
            BrokerError::Response(e.to_string())
        }
    }
}

/// A long-lived subscription to one broker channel.
#[async_trait]
pub trait Subscription: Send {
    /// Waits for the next message on the channel.
    async fn next_message(&mut self) -> Result<BrokerMessage, BrokerError>;
}

/// Capabilities the peer consumes from the broker.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn ping(&self) -> Result<(), BrokerError>;

    /// `SET key value EX ttl`.
    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), BrokerError>;

    async fn delete(&self, key: &str) -> Result<(), BrokerError>;

    /// A single `SCAN 0 MATCH pattern COUNT hint` call. Best-effort: the
    /// broker may return only a prefix of the matching keys, and callers
    /// must not rely on one scan being complete.
    async fn scan(&self, pattern: &str, count_hint: usize) -> Result<Vec<String>, BrokerError>;

    /// Values for `keys`, position-aligned; `None` for absent keys.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, BrokerError>;

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, BrokerError>;
}

// ============================================================================
// REDIS BROKER
// ============================================================================

/// Redis-backed [`Broker`] implementation.
///
/// Commands go through a [`ConnectionManager`], which reconnects on its
/// own. Each subscription holds a dedicated pub/sub connection, rebuilt on
/// the next receive after a drop.
pub struct RedisBroker {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisBroker {
    /// Connects to the broker described by `config`.
    pub async fn connect(config: &PeerConfig) -> Result<Self, BrokerError> {
        let (host, port) = split_addr(&config.addr)?;
        let info = redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(host, port),
            redis: redis::RedisConnectionInfo {
                db: config.db,
                username: config.username.clone(),
                password: config.password.clone(),
                ..Default::default()
            },
        };
        let client = redis::Client::open(info)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, conn })
    }
}

fn split_addr(addr: &str) -> Result<(String, u16), BrokerError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| BrokerError::Parse(format!("addr '{}' is not host:port", addr)))?;
    let port = port
        .parse::<u16>()
        .map_err(|e| BrokerError::Parse(format!("invalid port in '{}': {}", addr, e)))?;
    Ok((host.to_string(), port))
}

#[async_trait]
impl Broker for RedisBroker {
    async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl.as_secs()).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn scan(&self, pattern: &str, count_hint: usize) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.conn.clone();
        let (_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(0)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count_hint)
            .query_async(&mut conn)
            .await?;
        Ok(keys)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, BrokerError> {
        // MGET with no keys is a protocol error.
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = conn.mget(keys).await?;
        Ok(values)
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        let mut sub = RedisSubscription {
            client: self.client.clone(),
            channel: channel.to_string(),
            stream: None,
        };
        sub.establish().await?;
        Ok(Box::new(sub))
    }
}

struct RedisSubscription {
    client: redis::Client,
    channel: String,
    stream: Option<Pin<Box<dyn Stream<Item = redis::Msg> + Send>>>,
}

impl RedisSubscription {
    async fn establish(&mut self) -> Result<(), BrokerError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;
        self.stream = Some(Box::pin(pubsub.into_on_message()));
        Ok(())
    }
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next_message(&mut self) -> Result<BrokerMessage, BrokerError> {
        if self.stream.is_none() {
            self.establish().await?;
        }
        let next = match self.stream.as_mut() {
            Some(stream) => stream.next().await,
            None => None,
        };
        match next {
            Some(msg) => Ok(BrokerMessage {
                channel: msg.get_channel_name().to_string(),
                payload: msg.get_payload_bytes().to_vec(),
            }),
            None => {
                // Pub/sub connection dropped; rebuild on the next call.
                self.stream = None;
                Err(BrokerError::Network(format!(
                    "subscription to '{}' lost",
                    self.channel
                )))
            }
        }
    }
}

// ============================================================================
// IN-MEMORY BROKER
// ============================================================================

/// In-memory [`Broker`] with Redis semantics, for tests.
///
/// Keys honor their TTL, `scan` understands trailing-`*` patterns, and
/// `publish` fans out to every subscriber, the publisher included. Each
/// handle created through [`InMemoryBroker::handle`] shares the store but
/// carries its own failure toggle, so one peer's broker can go down while
/// the rest of the cluster keeps working. A downed handle fails
/// request/response commands; established subscriptions keep draining
/// whatever was published before the outage.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<InMemoryInner>,
    down: Arc<AtomicBool>,
}

#[derive(Default)]
struct InMemoryInner {
    keys: Mutex<HashMap<String, StoredValue>>,
    channels: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<BrokerMessage>>>>,
}

struct StoredValue {
    value: String,
    expires_at: tokio::time::Instant,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a handle onto the same store with an independent failure
    /// toggle.
    pub fn handle(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Makes this handle fail every command with a network error.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check_up(&self) -> Result<(), BrokerError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(BrokerError::Network("broker unreachable".to_string()));
        }
        Ok(())
    }

    fn lock_keys(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredValue>> {
        self.inner.keys.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_channels(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, Vec<mpsc::UnboundedSender<BrokerMessage>>>>
    {
        self.inner
            .channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

fn pattern_matches(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn ping(&self) -> Result<(), BrokerError> {
        self.check_up()
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), BrokerError> {
        self.check_up()?;
        self.lock_keys().insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: tokio::time::Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BrokerError> {
        self.check_up()?;
        self.lock_keys().remove(key);
        Ok(())
    }

    async fn scan(&self, pattern: &str, _count_hint: usize) -> Result<Vec<String>, BrokerError> {
        self.check_up()?;
        let now = tokio::time::Instant::now();
        let keys = self
            .lock_keys()
            .iter()
            .filter(|(key, stored)| stored.expires_at > now && pattern_matches(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();
        Ok(keys)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, BrokerError> {
        self.check_up()?;
        let now = tokio::time::Instant::now();
        let store = self.lock_keys();
        let values = keys
            .iter()
            .map(|key| {
                store
                    .get(key)
                    .filter(|stored| stored.expires_at > now)
                    .map(|stored| stored.value.clone())
            })
            .collect();
        Ok(values)
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.check_up()?;
        let mut channels = self.lock_channels();
        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.retain(|tx| {
                tx.send(BrokerMessage {
                    channel: channel.to_string(),
                    payload: payload.clone(),
                })
                .is_ok()
            });
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        self.check_up()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock_channels()
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(Box::new(InMemorySubscription { rx }))
    }
}

struct InMemorySubscription {
    rx: mpsc::UnboundedReceiver<BrokerMessage>,
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn next_message(&mut self) -> Result<BrokerMessage, BrokerError> {
        match self.rx.recv().await {
            Some(msg) => Ok(msg),
            None => Err(BrokerError::Network("subscription closed".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_addr() {
        assert_eq!(
            split_addr("localhost:6379").unwrap(),
            ("localhost".to_string(), 6379)
        );
        assert!(split_addr("no-port").is_err());
        assert!(split_addr("host:99999").is_err());
    }

    #[test]
    fn test_pattern_matches() {
        assert!(pattern_matches("am:*", "am:peer-1"));
        assert!(pattern_matches("*", "anything"));
        assert!(!pattern_matches("am:*", "other:peer-1"));
        assert!(pattern_matches("exact", "exact"));
        assert!(!pattern_matches("exact", "exact-not"));
    }

    #[tokio::test]
    async fn test_in_memory_keys_expire() {
        tokio::time::pause();
        let broker = InMemoryBroker::new();

        broker
            .set_with_ttl("am:a", "1", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(broker.scan("am:*", 100).await.unwrap().len(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;

        assert!(broker.scan("am:*", 100).await.unwrap().is_empty());
        assert_eq!(
            broker.mget(&["am:a".to_string()]).await.unwrap(),
            vec![None]
        );
    }

    #[tokio::test]
    async fn test_in_memory_pubsub_includes_publisher() {
        let broker = InMemoryBroker::new();
        let mut sub = broker.subscribe("chan").await.unwrap();

        broker.publish("chan", b"hello".to_vec()).await.unwrap();

        let msg = sub.next_message().await.unwrap();
        assert_eq!(msg.channel, "chan");
        assert_eq!(msg.payload, b"hello");
    }

    #[tokio::test]
    async fn test_in_memory_down_handle_is_isolated() {
        let broker = InMemoryBroker::new();
        let other = broker.handle();
        other.set_down(true);

        assert!(other.ping().await.unwrap_err().is_network());
        // The original handle still works against the shared store.
        broker
            .set_with_ttl("k", "v", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(broker.scan("*", 100).await.unwrap().len(), 1);
    }
}
