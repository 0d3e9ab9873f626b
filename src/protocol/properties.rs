//! MQTT v5.0 properties
//!
//! Only the properties the broker core reads or forwards are modelled; the
//! codec is responsible for round-tripping anything else it cares about.

use bytes::Bytes;

/// Collection of MQTT v5.0 properties
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub payload_format_indicator: Option<u8>,
    /// Retained-message TTL in seconds (PUBLISH)
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    /// Detached-session grace window in seconds (CONNECT / DISCONNECT)
    pub session_expiry_interval: Option<u32>,
    /// Flow-control window advertised by the client (CONNECT)
    pub receive_maximum: Option<u16>,
    /// Highest outbound alias the client accepts (CONNECT)
    pub topic_alias_maximum: Option<u16>,
    /// Alias substituting the topic name (PUBLISH)
    pub topic_alias: Option<u16>,
    pub will_delay_interval: Option<u32>,
    pub reason_string: Option<String>,
    pub user_properties: Vec<(String, String)>,
}

impl Properties {
    /// Properties for a publish carrying only a message-expiry TTL
    pub fn with_message_expiry(seconds: u32) -> Self {
        Self {
            message_expiry_interval: Some(seconds),
            ..Self::default()
        }
    }
}
