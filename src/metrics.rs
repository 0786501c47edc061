//! Cluster peer metrics.
//!
//! The counter set matches the upstream memberlist-based cluster
//! implementations so dashboards carry over; counters that only make sense
//! for a gossip transport (pruned, queued, node-alive) have no equivalent
//! here. Counters are plain atomics shared behind an `Arc`; the membership
//! gauges are sampled live at export time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Histogram buckets for broker ping latency, in seconds.
pub const PING_BUCKETS: [f64; 7] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5];

/// Label on ping latency observations.
const BROKER_PING_LABEL: &str = "redis-server";

/// The two categories of cluster traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// A whole-snapshot publication.
    FullState,
    /// A single-state delta broadcast.
    Update,
}

impl MessageType {
    /// Returns the `msg_type` label value.
    pub fn as_label(&self) -> &'static str {
        match self {
            MessageType::FullState => "full_state",
            MessageType::Update => "update",
        }
    }

    fn index(&self) -> usize {
        match self {
            MessageType::FullState => 0,
            MessageType::Update => 1,
        }
    }
}

/// Metrics for a cluster peer.
///
/// Cheap to clone; all clones share the same counters. Both `msg_type`
/// label values exist (at zero) from construction.
#[derive(Debug, Clone, Default)]
pub struct ClusterMetrics {
    inner: Arc<ClusterMetricsInner>,
}

#[derive(Debug, Default)]
struct ClusterMetricsInner {
    // Indexed by MessageType::index.
    received: [AtomicU64; 2],
    received_size: [AtomicU64; 2],
    sent: [AtomicU64; 2],
    sent_size: [AtomicU64; 2],

    // Ping latency histogram. Buckets hold per-bucket counts and are
    // accumulated at export time; observations above the last bucket only
    // land in count and sum.
    ping_buckets: [AtomicU64; PING_BUCKETS.len()],
    ping_count: AtomicU64,
    ping_sum_micros: AtomicU64,
}

impl ClusterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one received message of `size` bytes.
    pub fn record_received(&self, msg_type: MessageType, size: usize) {
        let i = msg_type.index();
        self.inner.received[i].fetch_add(1, Ordering::Relaxed);
        self.inner.received_size[i].fetch_add(size as u64, Ordering::Relaxed);
    }

    /// Records one sent message of `size` bytes.
    pub fn record_sent(&self, msg_type: MessageType, size: usize) {
        let i = msg_type.index();
        self.inner.sent[i].fetch_add(1, Ordering::Relaxed);
        self.inner.sent_size[i].fetch_add(size as u64, Ordering::Relaxed);
    }

    /// Observes one broker ping round-trip.
    pub fn observe_ping(&self, duration: Duration) {
        let seconds = duration.as_secs_f64();
        for (i, bound) in PING_BUCKETS.iter().enumerate() {
            if seconds <= *bound {
                self.inner.ping_buckets[i].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
        self.inner.ping_count.fetch_add(1, Ordering::Relaxed);
        self.inner
            .ping_sum_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn messages_received(&self, msg_type: MessageType) -> u64 {
        self.inner.received[msg_type.index()].load(Ordering::Relaxed)
    }

    pub fn messages_received_size(&self, msg_type: MessageType) -> u64 {
        self.inner.received_size[msg_type.index()].load(Ordering::Relaxed)
    }

    pub fn messages_sent(&self, msg_type: MessageType) -> u64 {
        self.inner.sent[msg_type.index()].load(Ordering::Relaxed)
    }

    pub fn messages_sent_size(&self, msg_type: MessageType) -> u64 {
        self.inner.sent_size[msg_type.index()].load(Ordering::Relaxed)
    }

    pub fn ping_count(&self) -> u64 {
        self.inner.ping_count.load(Ordering::Relaxed)
    }

    /// Exports everything in Prometheus text format. The gauge arguments
    /// are sampled by the caller, which owns the broker connection.
    pub fn to_prometheus_text(
        &self,
        cluster_size: usize,
        position: usize,
        health_score: usize,
    ) -> String {
        let mut output = String::new();

        macro_rules! counter_vec {
            ($name:expr, $help:expr, $full_state:expr, $update:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} counter\n{}{{msg_type=\"full_state\"}} {}\n{}{{msg_type=\"update\"}} {}\n",
                    $name, $help, $name, $name, $full_state, $name, $update
                ));
            };
        }

        macro_rules! gauge {
            ($name:expr, $help:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} gauge\n{} {}\n",
                    $name, $help, $name, $name, $value
                ));
            };
        }

        counter_vec!(
            "messages_received_total",
            "Total number of cluster messages received.",
            self.messages_received(MessageType::FullState),
            self.messages_received(MessageType::Update)
        );
        counter_vec!(
            "messages_received_size_total",
            "Total size of cluster messages received.",
            self.messages_received_size(MessageType::FullState),
            self.messages_received_size(MessageType::Update)
        );
        counter_vec!(
            "messages_sent_total",
            "Total number of cluster messages sent.",
            self.messages_sent(MessageType::FullState),
            self.messages_sent(MessageType::Update)
        );
        counter_vec!(
            "messages_sent_size_total",
            "Total size of cluster messages sent.",
            self.messages_sent_size(MessageType::FullState),
            self.messages_sent_size(MessageType::Update)
        );

        gauge!(
            "cluster_members",
            "Number indicating current number of members in cluster.",
            cluster_size
        );
        gauge!(
            "peer_position",
            "Position the peer believes it is in. The position determines a peer's behavior in the cluster.",
            position
        );
        gauge!(
            "cluster_health_score",
            "Health score of the cluster. Lower values are better and zero means 'totally healthy'.",
            health_score
        );

        output.push_str(
            "# HELP pings_seconds Histogram of latencies for ping messages.\n# TYPE pings_seconds histogram\n",
        );
        let mut cumulative = 0u64;
        for (i, bound) in PING_BUCKETS.iter().enumerate() {
            cumulative += self.inner.ping_buckets[i].load(Ordering::Relaxed);
            output.push_str(&format!(
                "pings_seconds_bucket{{peer=\"{}\",le=\"{}\"}} {}\n",
                BROKER_PING_LABEL, bound, cumulative
            ));
        }
        let count = self.ping_count();
        output.push_str(&format!(
            "pings_seconds_bucket{{peer=\"{}\",le=\"+Inf\"}} {}\n",
            BROKER_PING_LABEL, count
        ));
        output.push_str(&format!(
            "pings_seconds_sum{{peer=\"{}\"}} {}\n",
            BROKER_PING_LABEL,
            self.inner.ping_sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
        ));
        output.push_str(&format!(
            "pings_seconds_count{{peer=\"{}\"}} {}\n",
            BROKER_PING_LABEL, count
        ));

        output
    }
}
