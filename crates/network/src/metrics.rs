use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tradenet_types::now_millis;

/// Per-connection traffic counters.
#[derive(Debug)]
pub struct ConnectionMetrics {
    created: u64,
    last_activity: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    handshake_rtt_ms: AtomicU64,
}

impl ConnectionMetrics {
    pub fn new() -> Self {
        let created = now_millis();
        Self {
            created,
            last_activity: AtomicU64::new(created),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            handshake_rtt_ms: AtomicU64::new(0),
        }
    }

    /// Creation time in milliseconds since the unix epoch.
    pub fn created(&self) -> u64 {
        self.created
    }

    pub fn record_message_sent(&self, frame_len: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(frame_len as u64, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_message_received(&self, frame_len: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(frame_len as u64, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_handshake_rtt(&self, rtt: Duration) {
        self.handshake_rtt_ms
            .store(rtt.as_millis() as u64, Ordering::Relaxed);
    }

    fn touch(&self) {
        self.last_activity.fetch_max(now_millis(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectionMetricsSnapshot {
        let now = now_millis();
        ConnectionMetricsSnapshot {
            created: self.created,
            age_ms: now.saturating_sub(self.created),
            idle_ms: now.saturating_sub(self.last_activity.load(Ordering::Relaxed)),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            handshake_rtt_ms: self.handshake_rtt_ms.load(Ordering::Relaxed),
        }
    }
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of a connection's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionMetricsSnapshot {
    pub created: u64,
    pub age_ms: u64,
    /// Time since the last frame in either direction.
    pub idle_ms: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub handshake_rtt_ms: u64,
}

impl ConnectionMetricsSnapshot {
    pub fn total_messages(&self) -> u64 {
        self.messages_sent + self.messages_received
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_sent + self.bytes_received
    }
}
