//! Retained message store
//!
//! Keeps the last retained publish per topic. Entries disappear when
//! overwritten, when an empty-payload retained publish arrives, or when
//! their Message-Expiry-Interval elapses (driven by a [`QueueRunner`]).
//! Every mutation is mirrored to the persistence facade.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::persistence::{
    system_time_to_unix_secs, unix_secs_to_system_time, PersistenceHandle, PersistenceOp,
    StoredRetainedMessage,
};
use crate::protocol::Publish;
use crate::schedule::QueueRunner;
use crate::topic::topic_matches_filter;

/// One retained entry
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub publish: Publish,
    pub stored_at: SystemTime,
    pub expires_at: Option<SystemTime>,
}

/// Last-retained-message-per-topic store
pub struct RetainedStore {
    entries: DashMap<String, RetainedMessage>,
    timers: QueueRunner<String>,
    persist: PersistenceHandle,
}

impl RetainedStore {
    pub fn new(persist: PersistenceHandle) -> Self {
        Self {
            entries: DashMap::new(),
            timers: QueueRunner::new(),
            persist,
        }
    }

    /// Apply the retain side of a publish. No-op unless the retain flag is
    /// set; an empty payload deletes the entry.
    pub fn retain(&self, publish: &Publish) {
        if !publish.retain {
            return;
        }
        let topic = publish.topic.to_string();

        if publish.payload.is_empty() {
            if self.entries.remove(&topic).is_some() {
                trace!(topic = %topic, "retained entry cleared");
                self.persist.store(PersistenceOp::DeleteRetained { topic });
            }
            return;
        }

        let now = SystemTime::now();
        let expires_at = publish
            .properties
            .message_expiry_interval
            .map(|secs| now + Duration::from_secs(u64::from(secs)));

        // Store the publish stripped of delivery-scoped fields
        let mut stored = publish.clone();
        stored.packet_id = None;
        stored.dup = false;
        stored.properties.topic_alias = None;

        let message = RetainedMessage {
            publish: stored,
            stored_at: now,
            expires_at,
        };

        self.persist.store(PersistenceOp::SetRetained {
            topic: topic.clone(),
            message: (&message).into(),
        });
        if let Some(expiry) = expires_at {
            self.timers.enqueue(expiry, topic.clone());
        }
        self.entries.insert(topic, message);
    }

    /// All retained publishes whose topic matches the filter
    pub fn matching(&self, filter: &str) -> Vec<Publish> {
        self.entries
            .iter()
            .filter(|entry| topic_matches_filter(entry.key(), filter))
            .map(|entry| entry.publish.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Scheduler-driven eviction. The entry may have been refreshed since
    /// the timer was armed, so only a still-expired entry is removed.
    fn cleanup(&self, topic: &str) {
        let now = SystemTime::now();
        let expired = self
            .entries
            .get(topic)
            .map(|entry| matches!(entry.expires_at, Some(expiry) if expiry <= now))
            .unwrap_or(false);

        if expired {
            self.entries.remove(topic);
            debug!(topic = %topic, "retained entry expired");
            self.persist.store(PersistenceOp::DeleteRetained {
                topic: topic.to_string(),
            });
        }
    }

    /// Startup rehydration. Entries already past their expiry are dropped
    /// (and deleted from storage); live TTLs are re-armed.
    pub fn restore(&self, entries: Vec<StoredRetainedMessage>) {
        let now = SystemTime::now();
        let mut restored = 0usize;

        for stored in entries {
            let expires_at = stored.expires_at_secs.map(unix_secs_to_system_time);
            if matches!(expires_at, Some(expiry) if expiry <= now) {
                self.persist.store(PersistenceOp::DeleteRetained {
                    topic: stored.topic.clone(),
                });
                continue;
            }

            let topic = stored.topic.clone();
            let publish = Publish {
                dup: false,
                qos: crate::protocol::QoS::from_u8(stored.qos).unwrap_or_default(),
                retain: true,
                topic: Arc::from(stored.topic.as_str()),
                packet_id: None,
                payload: bytes::Bytes::from(stored.payload),
                properties: stored.properties.into_properties(),
            };

            if let Some(expiry) = expires_at {
                self.timers.enqueue(expiry, topic.clone());
            }
            self.entries.insert(
                topic,
                RetainedMessage {
                    publish,
                    stored_at: unix_secs_to_system_time(stored.stored_at_secs),
                    expires_at,
                },
            );
            restored += 1;
        }

        debug!(count = restored, "retained messages restored");
    }

    /// Drive TTL eviction until shutdown
    pub async fn run_expiry(&self, shutdown: broadcast::Receiver<()>) {
        self.timers.run(|topic| self.cleanup(&topic), shutdown).await;
    }
}

impl From<&RetainedMessage> for StoredRetainedMessage {
    fn from(message: &RetainedMessage) -> Self {
        Self {
            topic: message.publish.topic.to_string(),
            payload: message.publish.payload.to_vec(),
            qos: message.publish.qos as u8,
            properties: (&message.publish.properties).into(),
            stored_at_secs: system_time_to_unix_secs(message.stored_at),
            expires_at_secs: message.expires_at.map(system_time_to_unix_secs),
        }
    }
}
