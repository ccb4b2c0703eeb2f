// ABOUTME: Global metrics counters for the Prometheus endpoint
// ABOUTME: Atomic counters incremented by the coordination layer and rendered by the server binary

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics counters accessible from any crate
pub struct Metrics {
    // === Presence ===
    /// Usernames accepted by the cluster-wide uniqueness check
    pub registrations_accepted: AtomicU64,
    /// Usernames rejected (taken, invalid, or store unreachable)
    pub registrations_rejected: AtomicU64,
    /// Sessions currently live on this instance
    pub live_sessions: AtomicU64,

    // === Routing ===
    /// Chat messages published to the shared bus
    pub messages_published: AtomicU64,
    /// Chat messages (main and private) handed to local connections
    pub messages_delivered: AtomicU64,
    /// Server events dropped because a connection's queue was full
    pub events_dropped: AtomicU64,
    /// Client or bus payloads dropped as malformed
    pub malformed_messages: AtomicU64,

    // === Liveness ===
    /// Dead instances evicted by this observer
    pub instances_evicted: AtomicU64,
    /// Users removed from presence by those evictions
    pub users_evicted: AtomicU64,
    /// Failed shared-store operations
    pub store_errors: AtomicU64,
}

impl Metrics {
    const fn new() -> Self {
        Self {
            registrations_accepted: AtomicU64::new(0),
            registrations_rejected: AtomicU64::new(0),
            live_sessions: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            messages_delivered: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            malformed_messages: AtomicU64::new(0),
            instances_evicted: AtomicU64::new(0),
            users_evicted: AtomicU64::new(0),
            store_errors: AtomicU64::new(0),
        }
    }

    pub fn inc_registration_accepted(&self) {
        self.registrations_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_registration_rejected(&self) {
        self.registrations_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_live_sessions(&self, count: u64) {
        self.live_sessions.store(count, Ordering::Relaxed);
    }

    pub fn inc_message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_message_delivered(&self) {
        self.messages_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_malformed(&self) {
        self.malformed_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_instances_evicted(&self) {
        self.instances_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_users_evicted(&self, count: u64) {
        self.users_evicted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Format all metrics as Prometheus text
    pub fn to_prometheus(&self) -> String {
        let entries: [(&str, &str, &str, &AtomicU64); 10] = [
            (
                "chat_registrations_accepted_total",
                "counter",
                "Usernames accepted by the cluster-wide uniqueness check",
                &self.registrations_accepted,
            ),
            (
                "chat_registrations_rejected_total",
                "counter",
                "Usernames rejected (taken, invalid, or store unreachable)",
                &self.registrations_rejected,
            ),
            (
                "chat_live_sessions",
                "gauge",
                "Sessions currently live on this instance",
                &self.live_sessions,
            ),
            (
                "chat_messages_published_total",
                "counter",
                "Chat messages published to the shared bus",
                &self.messages_published,
            ),
            (
                "chat_messages_delivered_total",
                "counter",
                "Chat messages handed to local connections",
                &self.messages_delivered,
            ),
            (
                "chat_events_dropped_total",
                "counter",
                "Server events dropped because a connection queue was full",
                &self.events_dropped,
            ),
            (
                "chat_malformed_messages_total",
                "counter",
                "Client or bus payloads dropped as malformed",
                &self.malformed_messages,
            ),
            (
                "chat_instances_evicted_total",
                "counter",
                "Dead instances evicted by this observer",
                &self.instances_evicted,
            ),
            (
                "chat_users_evicted_total",
                "counter",
                "Users removed from presence by evictions",
                &self.users_evicted,
            ),
            (
                "chat_store_errors_total",
                "counter",
                "Failed shared store operations",
                &self.store_errors,
            ),
        ];

        let mut output = String::new();
        for (name, kind, help, value) in entries {
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} {}\n", name, kind));
            output.push_str(&format!("{} {}\n", name, value.load(Ordering::Relaxed)));
        }
        output
    }
}

/// Global metrics instance
pub static METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);
