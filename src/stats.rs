//! Receive loop statistics.
//!
//! Counters are updated lock-free from the receive loop and read as a
//! consistent-enough [`StatsSnapshot`] from any thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Live counters shared between the receive loop and the server handle.
#[derive(Debug, Default)]
pub struct ServerStats {
    datagrams_received: AtomicU64,
    frames_too_short: AtomicU64,
    decode_failures: AtomicU64,
    unrouted: AtomicU64,
    routed: AtomicU64,
    subscriber_failures: AtomicU64,
    socket_errors: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Every datagram read from the socket, including dropped ones
    pub datagrams_received: u64,
    /// Frames at or below the minimum frame length
    pub frames_too_short: u64,
    /// Frames the codec rejected
    pub decode_failures: u64,
    /// Decoded frames with no channel for their routing key
    pub unrouted: u64,
    /// Decoded frames delivered to a channel
    pub routed: u64,
    /// Subscriber callbacks that returned an error or panicked
    pub subscriber_failures: u64,
    /// Socket receive errors other than timeouts
    pub socket_errors: u64,
    /// Seconds since UNIX EPOCH when the snapshot was taken
    pub timestamp: u64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_datagram(&self) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_too_short(&self) {
        self.frames_too_short.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unrouted(&self) {
        self.unrouted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_routed(&self, subscriber_failures: usize) {
        self.routed.fetch_add(1, Ordering::Relaxed);
        if subscriber_failures > 0 {
            self.subscriber_failures
                .fetch_add(subscriber_failures as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_socket_error(&self) {
        self.socket_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            frames_too_short: self.frames_too_short.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            unrouted: self.unrouted.load(Ordering::Relaxed),
            routed: self.routed.load(Ordering::Relaxed),
            subscriber_failures: self.subscriber_failures.load(Ordering::Relaxed),
            socket_errors: self.socket_errors.load(Ordering::Relaxed),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }
}

impl StatsSnapshot {
    /// Frames that reached the codec.
    pub fn decode_attempts(&self) -> u64 {
        self.decode_failures + self.unrouted + self.routed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = ServerStats::new();
        for _ in 0..4 {
            stats.record_datagram();
        }
        stats.record_too_short();
        stats.record_decode_failure();
        stats.record_unrouted();
        stats.record_routed(0);
        stats.record_routed(2);
        stats.record_socket_error();

        let snap = stats.snapshot();
        assert_eq!(snap.datagrams_received, 4);
        assert_eq!(snap.frames_too_short, 1);
        assert_eq!(snap.decode_failures, 1);
        assert_eq!(snap.unrouted, 1);
        assert_eq!(snap.routed, 2);
        assert_eq!(snap.subscriber_failures, 2);
        assert_eq!(snap.socket_errors, 1);
        assert_eq!(snap.decode_attempts(), 4);
        assert!(snap.timestamp > 0);
    }

    #[test]
    fn test_concurrent_updates_are_counted() {
        let stats = std::sync::Arc::new(ServerStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record_datagram();
                    }
                })
            })
            .collect();
        for h in handles {
            assert!(h.join().is_ok());
        }
        assert_eq!(stats.snapshot().datagrams_received, 8000);
    }
}
