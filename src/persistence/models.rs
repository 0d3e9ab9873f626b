//! Serializable models for persistence
//!
//! Storage-friendly mirrors of the runtime types, encoded with bincode.
//! Wall-clock fields are Unix seconds so they survive a broker restart.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bincode::{Decode, Encode};
use bytes::Bytes;

use crate::protocol::{Properties, Publish, QoS, RetainHandling, SubscriptionOptions, Will};
use crate::session::Session;

/// Stored retained message
#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredRetainedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub properties: StoredProperties,
    /// Unix seconds when the message was retained
    pub stored_at_secs: u64,
    /// Unix seconds when the entry expires, from Message-Expiry-Interval
    pub expires_at_secs: Option<u64>,
}

/// Stored session
#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredSession {
    pub session_id: String,
    pub receive_maximum: u16,
    pub subscriptions: Vec<StoredSubscription>,
    /// Unacked QoS 1/2 state, keyed by packet id
    pub qos_pending: Vec<(u16, StoredPublish)>,
    pub will: Option<StoredWill>,
    /// Unix seconds when a detached session becomes reapable
    pub expires_at_secs: Option<u64>,
}

/// Stored subscription entry
#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredSubscription {
    pub filter: String,
    pub qos: u8,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: u8,
}

/// Stored publish message
#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub dup: bool,
    pub packet_id: Option<u16>,
    pub properties: StoredProperties,
}

/// Stored will message
#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub properties: StoredProperties,
}

/// Stored properties (the subset that must survive a restart)
#[derive(Debug, Clone, Default, Encode, Decode)]
pub struct StoredProperties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    pub user_properties: Vec<(String, String)>,
}

/// Everything a backend hands back at startup
#[derive(Debug, Default)]
pub struct LoadedData {
    pub sessions: Vec<StoredSession>,
    pub retained: Vec<StoredRetainedMessage>,
}

// ============================================================================
// Conversions
// ============================================================================

pub(crate) fn system_time_to_unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

pub(crate) fn unix_secs_to_system_time(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

impl From<&Properties> for StoredProperties {
    fn from(props: &Properties) -> Self {
        Self {
            payload_format_indicator: props.payload_format_indicator,
            message_expiry_interval: props.message_expiry_interval,
            content_type: props.content_type.clone(),
            response_topic: props.response_topic.clone(),
            correlation_data: props.correlation_data.as_ref().map(|b| b.to_vec()),
            user_properties: props.user_properties.clone(),
        }
    }
}

impl StoredProperties {
    pub fn into_properties(self) -> Properties {
        Properties {
            payload_format_indicator: self.payload_format_indicator,
            message_expiry_interval: self.message_expiry_interval,
            content_type: self.content_type,
            response_topic: self.response_topic,
            correlation_data: self.correlation_data.map(Bytes::from),
            user_properties: self.user_properties,
            ..Properties::default()
        }
    }
}

impl From<&Publish> for StoredPublish {
    fn from(publish: &Publish) -> Self {
        Self {
            topic: publish.topic.to_string(),
            payload: publish.payload.to_vec(),
            qos: publish.qos as u8,
            retain: publish.retain,
            dup: publish.dup,
            packet_id: publish.packet_id,
            properties: (&publish.properties).into(),
        }
    }
}

impl StoredPublish {
    pub fn into_publish(self) -> Publish {
        Publish {
            dup: self.dup,
            qos: QoS::from_u8(self.qos).unwrap_or_default(),
            retain: self.retain,
            topic: Arc::from(self.topic.as_str()),
            packet_id: self.packet_id,
            payload: Bytes::from(self.payload),
            properties: self.properties.into_properties(),
        }
    }
}

impl From<&Will> for StoredWill {
    fn from(will: &Will) -> Self {
        Self {
            topic: will.topic.clone(),
            payload: will.payload.to_vec(),
            qos: will.qos as u8,
            retain: will.retain,
            properties: (&will.properties).into(),
        }
    }
}

impl StoredWill {
    pub fn into_will(self) -> Will {
        Will {
            topic: self.topic,
            payload: Bytes::from(self.payload),
            qos: QoS::from_u8(self.qos).unwrap_or_default(),
            retain: self.retain,
            properties: self.properties.into_properties(),
        }
    }
}

impl From<(&str, &SubscriptionOptions)> for StoredSubscription {
    fn from((filter, opts): (&str, &SubscriptionOptions)) -> Self {
        Self {
            filter: filter.to_string(),
            qos: opts.qos as u8,
            no_local: opts.no_local,
            retain_as_published: opts.retain_as_published,
            retain_handling: opts.retain_handling as u8,
        }
    }
}

impl StoredSubscription {
    pub fn options(&self) -> SubscriptionOptions {
        SubscriptionOptions {
            qos: QoS::from_u8(self.qos).unwrap_or_default(),
            no_local: self.no_local,
            retain_as_published: self.retain_as_published,
            retain_handling: RetainHandling::from_u8(self.retain_handling).unwrap_or_default(),
        }
    }
}

impl From<&Session> for StoredSession {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.id.to_string(),
            receive_maximum: session.receive_maximum,
            subscriptions: session
                .subscriptions
                .iter()
                .map(|(filter, opts)| (filter.as_str(), opts).into())
                .collect(),
            qos_pending: session
                .qos_pending
                .iter()
                .map(|(id, publish)| (*id, publish.into()))
                .collect(),
            will: session.will.as_ref().map(Into::into),
            expires_at_secs: session.expires_at.map(system_time_to_unix_secs),
        }
    }
}
