//! Session state
//!
//! A [`Session`] is the broker-side durable state for one MQTT client id,
//! surviving disconnects within its expiry window. The connection-scoped
//! pieces (worker handle, outbound queue, alias tables) live in
//! [`ConnectedClient`] and are replaced wholesale on reconnect or takeover.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::SystemTime;

use ahash::AHashMap;
use tokio::sync::mpsc;

use crate::acl::AclRule;
use crate::protocol::{Connect, Packet, Publish, SubscriptionOptions, Will};

/// The MQTT client identifier, shared across maps without copying
pub type SessionId = Arc<str>;

/// Signal delivered to a connection worker by the core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSignal {
    /// Another connection registered with the same session id; the worker
    /// must close its socket and exit without detaching the session.
    TakenOver,
}

/// The core's way to reach a connection worker
#[derive(Debug)]
pub struct WorkerHandle {
    signal: mpsc::Sender<SessionSignal>,
}

impl WorkerHandle {
    /// Create a handle plus the receiver the worker selects on
    pub fn channel() -> (Self, mpsc::Receiver<SessionSignal>) {
        let (signal, rx) = mpsc::channel(1);
        (Self { signal }, rx)
    }

    pub(crate) fn notify_taken_over(&self) {
        let _ = self.signal.try_send(SessionSignal::TakenOver);
    }
}

/// Connection-scoped state attached to a session
#[derive(Debug)]
pub struct ConnectedClient {
    /// The Connect request, kept for property lookups at detach time
    pub connect: Connect,
    /// Monotonic connection id; distinguishes a stale worker from its
    /// successor after takeover
    pub uid: u64,
    pub(crate) worker: WorkerHandle,
    /// Outbound packet queue, drained by the connection writer
    pub(crate) outbound: mpsc::Sender<Packet>,
    /// Inbound alias table: alias -> topic, written by the client
    pub(crate) alias_in: AHashMap<u16, Arc<str>>,
    /// Outbound alias table: topic -> alias, allocated by the broker
    alias_out: AHashMap<Arc<str>, u16>,
    /// Outbound aliases still available, seeded from TopicAliasMaximum
    aliases_left: u16,
    next_alias: u16,
    /// Session-Expiry-Interval override from a v5 DISCONNECT
    pub(crate) expiry_override: Option<u32>,
}

/// Outcome of an outbound alias lookup
pub(crate) enum AliasLookup {
    /// Alias already mapped; send an empty topic
    Hit(u16),
    /// Alias freshly allocated; send topic and alias together
    Allocated(u16),
    /// Alias space exhausted (or the client advertised none)
    Unavailable,
}

impl ConnectedClient {
    pub(crate) fn new(
        connect: Connect,
        uid: u64,
        worker: WorkerHandle,
        outbound: mpsc::Sender<Packet>,
    ) -> Self {
        let aliases_left = connect.properties.topic_alias_maximum.unwrap_or(0);
        Self {
            connect,
            uid,
            worker,
            outbound,
            alias_in: AHashMap::new(),
            alias_out: AHashMap::new(),
            aliases_left,
            next_alias: 1,
            expiry_override: None,
        }
    }

    /// Resolve an inbound publish alias. A non-empty topic (re)binds the
    /// alias; an empty one reads the current binding, staying empty when the
    /// alias is unknown.
    pub(crate) fn resolve_alias(&mut self, alias: u16, topic: &Arc<str>) -> Arc<str> {
        if !topic.is_empty() {
            self.alias_in.insert(alias, topic.clone());
        }
        self.alias_in
            .get(&alias)
            .cloned()
            .unwrap_or_else(|| Arc::from(""))
    }

    /// Look up (or allocate) the outbound alias for a topic
    pub(crate) fn outbound_alias(&mut self, topic: &Arc<str>) -> AliasLookup {
        if let Some(&alias) = self.alias_out.get(topic) {
            return AliasLookup::Hit(alias);
        }
        if self.aliases_left == 0 {
            return AliasLookup::Unavailable;
        }
        self.aliases_left -= 1;
        let alias = self.next_alias;
        self.next_alias += 1;
        self.alias_out.insert(topic.clone(), alias);
        AliasLookup::Allocated(alias)
    }

    /// Outbound aliases currently mapped
    pub fn alias_count(&self) -> usize {
        self.alias_out.len()
    }
}

/// Broker-side session state
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    /// ACL snapshot taken from the authorizer at connect time
    pub(crate) acl: Vec<AclRule>,
    /// Attached connection, none while detached
    pub(crate) client: Option<ConnectedClient>,
    /// Remaining capacity for unacked QoS>0 deliveries
    pub(crate) in_flight_tokens: i32,
    /// The client-negotiated Receive-Maximum, caps `in_flight_tokens`
    pub(crate) receive_maximum: u16,
    /// Deliveries awaiting a free in-flight token
    pub(crate) backlog: VecDeque<Publish>,
    /// Unacked deliveries plus inbound QoS 2 publishes awaiting PUBREL
    pub(crate) qos_pending: AHashMap<u16, Publish>,
    /// filter -> options, mirrored in the broker's subscription index
    pub(crate) subscriptions: AHashMap<String, SubscriptionOptions>,
    /// When a detached session becomes reapable
    pub(crate) expires_at: Option<SystemTime>,
    /// Last-Will, published when the session dies without a clean Disconnect
    pub(crate) will: Option<Will>,
}

impl Session {
    /// Fresh session for a new connection
    pub(crate) fn new(id: SessionId, acl: Vec<AclRule>, client: ConnectedClient) -> Self {
        let receive_maximum = client.connect.properties.receive_maximum.unwrap_or(u16::MAX);
        let will = client.connect.will.clone();
        Self {
            id,
            acl,
            client: Some(client),
            in_flight_tokens: i32::from(receive_maximum),
            receive_maximum,
            backlog: VecDeque::new(),
            qos_pending: AHashMap::new(),
            subscriptions: AHashMap::new(),
            expires_at: None,
            will,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// True when any subscription keeps QoS>0 state worth preserving
    pub(crate) fn has_qos_subscriptions(&self) -> bool {
        self.subscriptions
            .values()
            .any(|opts| opts.qos > crate::protocol::QoS::AtMostOnce)
    }
}

/// Counters exposed for inspection and the `$SYS` publisher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub connected: bool,
    pub subscriptions: usize,
    pub qos_pending: usize,
    pub backlog: usize,
    pub in_flight_tokens: i32,
}

impl From<&Session> for SessionStats {
    fn from(session: &Session) -> Self {
        Self {
            connected: session.client.is_some(),
            subscriptions: session.subscriptions.len(),
            qos_pending: session.qos_pending.len(),
            backlog: session.backlog.len(),
            in_flight_tokens: session.in_flight_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Properties;

    fn client(topic_alias_maximum: Option<u16>) -> ConnectedClient {
        let connect = Connect {
            client_id: "c".to_string(),
            properties: Properties {
                topic_alias_maximum,
                ..Properties::default()
            },
            ..Connect::default()
        };
        let (worker, _rx) = WorkerHandle::channel();
        let (tx, _rx) = mpsc::channel(8);
        ConnectedClient::new(connect, 1, worker, tx)
    }

    #[test]
    fn inbound_alias_binds_and_resolves() {
        let mut c = client(None);
        let bound = c.resolve_alias(3, &Arc::from("a/b"));
        assert_eq!(bound.as_ref(), "a/b");

        let resolved = c.resolve_alias(3, &Arc::from(""));
        assert_eq!(resolved.as_ref(), "a/b");

        // Unknown alias keeps the empty topic
        let unknown = c.resolve_alias(9, &Arc::from(""));
        assert_eq!(unknown.as_ref(), "");
    }

    #[test]
    fn outbound_alias_allocation_is_bounded() {
        let mut c = client(Some(2));

        assert!(matches!(c.outbound_alias(&Arc::from("t/1")), AliasLookup::Allocated(1)));
        assert!(matches!(c.outbound_alias(&Arc::from("t/2")), AliasLookup::Allocated(2)));
        assert!(matches!(c.outbound_alias(&Arc::from("t/3")), AliasLookup::Unavailable));

        // Repeats hit the existing mapping and never allocate
        assert!(matches!(c.outbound_alias(&Arc::from("t/1")), AliasLookup::Hit(1)));
        assert_eq!(c.alias_count(), 2);
    }

    #[test]
    fn no_aliases_without_client_maximum() {
        let mut c = client(None);
        assert!(matches!(c.outbound_alias(&Arc::from("t")), AliasLookup::Unavailable));
    }
}
