//! In-process counters exposed as `GET /metrics` in Prometheus text format,
//! sharing the broker's TCP listener the way the teacher shares one port
//! for its WebSocket and health endpoints.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Counters shared across every connection task and the accept loop.
#[derive(Debug)]
pub struct BrokerMetrics {
    pub connections_accepted: AtomicU64,
    pub handshake_failures: AtomicU64,
    pub active_connections: AtomicU64,
    pub frames_decoded: AtomicU64,
    pub frames_encoded: AtomicU64,
    pub multicast_fanouts: AtomicU64,
    pub fanout_write_failures: AtomicU64,
    started_at: Instant,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self {
            connections_accepted: AtomicU64::new(0),
            handshake_failures: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            frames_decoded: AtomicU64::new(0),
            frames_encoded: AtomicU64::new(0),
            multicast_fanouts: AtomicU64::new(0),
            fanout_write_failures: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn inc_connections_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_handshake_failures(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_frames_decoded(&self) {
        self.frames_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_frames_encoded(&self) {
        self.frames_encoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_multicast_fanouts(&self) {
        self.multicast_fanouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_fanout_write_failures(&self) {
        self.fanout_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Render counters in Prometheus text format.
    pub fn render_prometheus(&self) -> String {
        let uptime = self.uptime_secs();
        let connections_accepted = self.connections_accepted.load(Ordering::Relaxed);
        let handshake_failures = self.handshake_failures.load(Ordering::Relaxed);
        let active_connections = self.active_connections();
        let frames_decoded = self.frames_decoded.load(Ordering::Relaxed);
        let frames_encoded = self.frames_encoded.load(Ordering::Relaxed);
        let multicast_fanouts = self.multicast_fanouts.load(Ordering::Relaxed);
        let fanout_write_failures = self.fanout_write_failures.load(Ordering::Relaxed);

        format!(
            "# HELP lim_broker_uptime_seconds Broker uptime in seconds.\n\
             # TYPE lim_broker_uptime_seconds gauge\n\
             lim_broker_uptime_seconds {uptime}\n\
             # HELP lim_broker_active_connections Current number of open connections.\n\
             # TYPE lim_broker_active_connections gauge\n\
             lim_broker_active_connections {active_connections}\n\
             # HELP lim_broker_connections_accepted_total Total connections accepted since start.\n\
             # TYPE lim_broker_connections_accepted_total counter\n\
             lim_broker_connections_accepted_total {connections_accepted}\n\
             # HELP lim_broker_handshake_failures_total Total failed handshakes since start.\n\
             # TYPE lim_broker_handshake_failures_total counter\n\
             lim_broker_handshake_failures_total {handshake_failures}\n\
             # HELP lim_broker_frames_decoded_total Total frames decoded since start.\n\
             # TYPE lim_broker_frames_decoded_total counter\n\
             lim_broker_frames_decoded_total {frames_decoded}\n\
             # HELP lim_broker_frames_encoded_total Total frames encoded since start.\n\
             # TYPE lim_broker_frames_encoded_total counter\n\
             lim_broker_frames_encoded_total {frames_encoded}\n\
             # HELP lim_broker_multicast_fanouts_total Total multicast publications fanned out since start.\n\
             # TYPE lim_broker_multicast_fanouts_total counter\n\
             lim_broker_multicast_fanouts_total {multicast_fanouts}\n\
             # HELP lim_broker_fanout_write_failures_total Total per-recipient fanout write failures since start.\n\
             # TYPE lim_broker_fanout_write_failures_total counter\n\
             lim_broker_fanout_write_failures_total {fanout_write_failures}\n"
        )
    }
}

impl Default for BrokerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle — cheaply clonable.
pub type SharedMetrics = Arc<BrokerMetrics>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let m = BrokerMetrics::new();
        assert_eq!(m.active_connections(), 0);
    }

    #[test]
    fn accept_and_close_track_active_connections() {
        let m = BrokerMetrics::new();
        m.inc_connections_accepted();
        m.inc_connections_accepted();
        assert_eq!(m.active_connections(), 2);
        m.inc_connection_closed();
        assert_eq!(m.active_connections(), 1);
    }

    #[test]
    fn render_prometheus_includes_all_counters() {
        let m = BrokerMetrics::new();
        m.inc_connections_accepted();
        m.inc_multicast_fanouts();
        let rendered = m.render_prometheus();
        assert!(rendered.contains("lim_broker_connections_accepted_total 1"));
        assert!(rendered.contains("lim_broker_multicast_fanouts_total 1"));
    }
}
