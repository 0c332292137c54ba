//! Observability counters
//!
//! Each listener or dialer owns an `Arc<Metrics>` that it shares with every
//! protocol engine it spawns. Counters are plain atomics; read them through
//! [`Metrics::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Engine-wide counters
#[derive(Debug)]
pub struct Metrics {
    /// Connections accepted or established
    pub connections_total: AtomicU64,
    /// Currently active connections
    pub connections_active: AtomicU64,
    /// Datagrams received by listeners
    pub datagrams_received: AtomicU64,
    /// Completed engine cycles (terminations)
    pub cycles_total: AtomicU64,
    /// Cycles that ended in an error
    pub cycles_failed: AtomicU64,
    /// Units turned away by the admission gate
    pub admissions_rejected: AtomicU64,
    /// Messages sent
    pub messages_sent: AtomicU64,
    /// Messages received
    pub messages_received: AtomicU64,
    /// Payload bytes sent
    pub bytes_sent: AtomicU64,
    /// Payload bytes received
    pub bytes_received: AtomicU64,
    /// ACK or size-indicator reads that had to be retried
    pub protocol_retries: AtomicU64,
    /// Failed TLS handshakes
    pub tls_failures: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            datagrams_received: AtomicU64::new(0),
            cycles_total: AtomicU64::new(0),
            cycles_failed: AtomicU64::new(0),
            admissions_rejected: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            protocol_retries: AtomicU64::new(0),
            tls_failures: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a new connection
    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection closed
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record an inbound datagram
    pub fn datagram_received(&self) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished cycle
    pub fn cycle_completed(&self, failed: bool) {
        self.cycles_total.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.cycles_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a unit rejected by the admission gate
    pub fn admission_rejected(&self) {
        self.admissions_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a message sent
    pub fn message_sent(&self, byte_count: u64) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a message received
    pub fn message_received(&self, byte_count: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a retried ACK or size-indicator read
    pub fn protocol_retry(&self) {
        self.protocol_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed TLS handshake
    pub fn tls_failure(&self) {
        self.tls_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            cycles_total: self.cycles_total.load(Ordering::Relaxed),
            cycles_failed: self.cycles_failed.load(Ordering::Relaxed),
            admissions_rejected: self.admissions_rejected.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            protocol_retries: self.protocol_retries.load(Ordering::Relaxed),
            tls_failures: self.tls_failures.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log the current snapshot at info level
    pub fn log_snapshot(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            datagrams_received = snapshot.datagrams_received,
            cycles_total = snapshot.cycles_total,
            cycles_failed = snapshot.cycles_failed,
            admissions_rejected = snapshot.admissions_rejected,
            messages_sent = snapshot.messages_sent,
            messages_received = snapshot.messages_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            protocol_retries = snapshot.protocol_retries,
            tls_failures = snapshot.tls_failures,
            uptime_seconds = snapshot.uptime_seconds,
            "Engine metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub datagrams_received: u64,
    pub cycles_total: u64,
    pub cycles_failed: u64,
    pub admissions_rejected: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub protocol_retries: u64,
    pub tls_failures: u64,
    pub uptime_seconds: u64,
}
