//! Server metrics for observability
//!
//! Counters are plain atomics bumped from session actors and relays.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Connection metrics
    /// Currently attached WebSocket clients
    pub active_connections: AtomicU64,
    /// Total client connections since server start
    pub total_connections: AtomicU64,
    /// Open `/api/events` subscribers
    pub event_subscribers: AtomicU64,

    // Session metrics
    /// Successful process spawns
    pub sessions_started: AtomicU64,
    /// Processes that could not be spawned
    pub spawn_errors: AtomicU64,

    // Message metrics
    /// Input messages forwarded to a process
    pub input_messages: AtomicU64,
    /// Malformed or rejected client messages
    pub protocol_errors: AtomicU64,
    /// Output events a slow client's full queue could not take
    pub output_dropped: AtomicU64,
    /// Clients dropped for falling too far behind
    pub clients_evicted: AtomicU64,

    /// Server start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn events_opened(&self) {
        self.event_subscribers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_closed(&self) {
        self.event_subscribers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn spawn_error(&self) {
        self.spawn_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn input_message(&self) {
        self.input_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn output_dropped(&self) {
        self.output_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_evicted(&self) {
        self.clients_evicted.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
                event_subscribers: self.event_subscribers.load(Ordering::Relaxed),
            },
            sessions: SessionMetrics {
                started: self.sessions_started.load(Ordering::Relaxed),
                spawn_errors: self.spawn_errors.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                input: self.input_messages.load(Ordering::Relaxed),
                protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
                output_dropped: self.output_dropped.load(Ordering::Relaxed),
                clients_evicted: self.clients_evicted.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub sessions: SessionMetrics,
    pub messages: MessageMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
    pub event_subscribers: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub started: u64,
    pub spawn_errors: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub input: u64,
    pub protocol_errors: u64,
    pub output_dropped: u64,
    pub clients_evicted: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub sessions: SessionHealth,
    pub connections: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHealth {
    pub total: u64,
    pub live: u64,
    pub by_status: BTreeMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_tracking() {
        let metrics = ServerMetrics::new();

        metrics.connection_opened();
        metrics.connection_opened();
        assert_eq!(metrics.active_connections.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.total_connections.load(Ordering::Relaxed), 2);

        metrics.connection_closed();
        assert_eq!(metrics.active_connections.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.total_connections.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_event_subscribers_are_not_attached_clients() {
        let metrics = ServerMetrics::new();
        metrics.events_opened();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections.event_subscribers, 1);
        assert_eq!(snapshot.connections.active, 0);
        assert_eq!(snapshot.connections.total, 0);

        metrics.events_closed();
        assert_eq!(metrics.snapshot().connections.event_subscribers, 0);
    }

    #[test]
    fn test_snapshot() {
        let metrics = ServerMetrics::new();
        metrics.connection_opened();
        metrics.session_started();
        metrics.spawn_error();
        metrics.output_dropped();
        metrics.output_dropped();
        metrics.client_evicted();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections.active, 1);
        assert_eq!(snapshot.sessions.started, 1);
        assert_eq!(snapshot.sessions.spawn_errors, 1);
        assert_eq!(snapshot.messages.output_dropped, 2);
        assert_eq!(snapshot.messages.clients_evicted, 1);
    }
}
