//! Server statistics

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters updated by connection handlers
#[derive(Debug, Default)]
pub struct ServerCounters {
    accepted: AtomicU64,
    refused: AtomicU64,
    failed: AtomicU64,
    completed: AtomicU64,
    bytes_sent: AtomicU64,
}

impl ServerCounters {
    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refused(&self) {
        self.refused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServerStats {
        ServerStats {
            connections_accepted: self.accepted.load(Ordering::Relaxed),
            connections_refused: self.refused.load(Ordering::Relaxed),
            connections_failed: self.failed.load(Ordering::Relaxed),
            connections_completed: self.completed.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`ServerCounters`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStats {
    /// Connections that completed the handshake
    pub connections_accepted: u64,

    /// Connections turned away at the connection limit
    pub connections_refused: u64,

    /// Handlers that ended with an error
    pub connections_failed: u64,

    /// Handlers that streamed until end of input
    pub connections_completed: u64,

    /// Total payload bytes written to streams
    pub bytes_sent: u64,
}

impl ServerStats {
    /// Connections whose handler is still running
    pub fn active_connections(&self) -> u64 {
        self.connections_accepted
            .saturating_sub(self.connections_failed + self.connections_completed)
    }

    /// Calculates throughput in kbps based on delta
    pub fn calculate_bitrate_kbps(&self, previous: &Self, elapsed_secs: f64) -> f64 {
        if elapsed_secs == 0.0 {
            return 0.0;
        }

        let bytes_delta = self.bytes_sent.saturating_sub(previous.bytes_sent);
        (bytes_delta as f64 * 8.0) / elapsed_secs / 1000.0
    }
}
