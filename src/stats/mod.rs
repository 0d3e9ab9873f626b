//! Broker statistics
//!
//! Counter and gauge registry read by the `$SYS` publisher. Counters are
//! bumped inline on the hot paths; gauges are refreshed from the core state
//! on each publish tick.

use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// All broker statistics in one place
#[derive(Clone)]
pub struct Stats {
    pub registry: Registry,

    /// Total client connections since startup
    pub connections_total: IntCounter,
    /// Currently attached clients
    pub connections_current: IntGauge,
    /// Sessions in the registry (attached + detached)
    pub sessions_current: IntGauge,

    /// Publishes accepted from clients
    pub messages_received: IntCounter,
    /// Publishes enqueued to subscribers
    pub messages_sent: IntCounter,
    /// Deliveries dropped by queue/backlog overflow
    pub messages_dropped: IntCounter,

    /// Active subscriptions across all sessions
    pub subscriptions_current: IntGauge,
    /// Retained messages held
    pub retained_current: IntGauge,
}

impl Stats {
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_total = IntCounter::with_opts(Opts::new(
            "nimbusmq_connections_total",
            "Total number of client connections since startup",
        ))
        .unwrap();

        let connections_current = IntGauge::with_opts(Opts::new(
            "nimbusmq_connections_current",
            "Current number of connected clients",
        ))
        .unwrap();

        let sessions_current = IntGauge::with_opts(Opts::new(
            "nimbusmq_sessions_current",
            "Current number of sessions, attached or detached",
        ))
        .unwrap();

        let messages_received = IntCounter::with_opts(Opts::new(
            "nimbusmq_messages_received_total",
            "Total publishes accepted from clients",
        ))
        .unwrap();

        let messages_sent = IntCounter::with_opts(Opts::new(
            "nimbusmq_messages_sent_total",
            "Total publishes enqueued to subscribers",
        ))
        .unwrap();

        let messages_dropped = IntCounter::with_opts(Opts::new(
            "nimbusmq_messages_dropped_total",
            "Total deliveries dropped by queue overflow",
        ))
        .unwrap();

        let subscriptions_current = IntGauge::with_opts(Opts::new(
            "nimbusmq_subscriptions_current",
            "Current number of active subscriptions",
        ))
        .unwrap();

        let retained_current = IntGauge::with_opts(Opts::new(
            "nimbusmq_retained_messages_current",
            "Current number of retained messages",
        ))
        .unwrap();

        for collector in [&connections_total, &messages_received, &messages_sent, &messages_dropped]
        {
            registry.register(Box::new(collector.clone())).unwrap();
        }
        for gauge in [
            &connections_current,
            &sessions_current,
            &subscriptions_current,
            &retained_current,
        ] {
            registry.register(Box::new(gauge.clone())).unwrap();
        }

        Self {
            registry,
            connections_total,
            connections_current,
            sessions_current,
            messages_received,
            messages_sent,
            messages_dropped,
            subscriptions_current,
            retained_current,
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_accumulate() {
        let stats = Stats::new();
        assert_eq!(stats.messages_sent.get(), 0);
        stats.messages_sent.inc();
        stats.messages_sent.inc();
        assert_eq!(stats.messages_sent.get(), 2);
    }

    #[test]
    fn gauges_track_set_values() {
        let stats = Stats::new();
        stats.sessions_current.set(5);
        assert_eq!(stats.sessions_current.get(), 5);
        stats.connections_current.inc();
        stats.connections_current.dec();
        assert_eq!(stats.connections_current.get(), 0);
    }
}
