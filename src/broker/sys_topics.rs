//! `$SYS` topics publisher
//!
//! Publishes broker statistics as retained QoS 2 messages under `$SYS/#` on
//! a fixed tick. Every value carries a 60 second Message-Expiry-Interval,
//! so stale entries age out of the retained store between restarts.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::debug;

use super::Broker;
use crate::protocol::{Properties, Publish, QoS};

/// Version string for `$SYS/broker/version`
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Retained `$SYS` values expire after this many seconds
const SYS_MESSAGE_EXPIRY: u32 = 60;

/// Spawn the periodic publisher task
pub(crate) fn spawn(
    broker: Arc<Broker>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    publish_sys_topics(&broker);
                }
                result = shutdown.recv() => {
                    match result {
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        _ => {
                            debug!("$SYS publisher shutting down");
                            break;
                        }
                    }
                }
            }
        }
    });
}

/// Publish the full `$SYS` tree once
pub(crate) fn publish_sys_topics(broker: &Broker) {
    let stats = broker.stats();

    // Refresh gauges from the authoritative state first
    stats.sessions_current.set(broker.session_count() as i64);
    stats
        .subscriptions_current
        .set(broker.subscription_count() as i64);
    stats.retained_current.set(broker.retained_count() as i64);

    publish(broker, "$SYS/broker/version", VERSION);
    publish(broker, "$SYS/broker/uptime", &broker.uptime_secs().to_string());
    publish(
        broker,
        "$SYS/broker/clients/total",
        &broker.session_count().to_string(),
    );
    publish(
        broker,
        "$SYS/broker/clients/connected",
        &broker.connected_count().to_string(),
    );
    publish(
        broker,
        "$SYS/broker/retained messages/count",
        &broker.retained_count().to_string(),
    );
    publish(
        broker,
        "$SYS/broker/subscriptions/count",
        &broker.subscription_count().to_string(),
    );
    publish(
        broker,
        "$SYS/broker/messages/received",
        &stats.messages_received.get().to_string(),
    );
    publish(
        broker,
        "$SYS/broker/messages/sent",
        &stats.messages_sent.get().to_string(),
    );
    publish(
        broker,
        "$SYS/broker/messages/dropped",
        &stats.messages_dropped.get().to_string(),
    );
}

fn publish(broker: &Broker, topic: &str, value: &str) {
    let publish = Publish {
        dup: false,
        qos: QoS::ExactlyOnce,
        retain: true,
        topic: Arc::from(topic),
        packet_id: None,
        payload: Bytes::from(value.to_string()),
        properties: Properties::with_message_expiry(SYS_MESSAGE_EXPIRY),
    };
    broker.broadcast(None, publish);
}
