//! Inbound packet handling
//!
//! One entry point, [`Broker::dispatch`], applies a packet from a connected
//! client to its session. Errors returned here are fatal for that session:
//! the worker closes the socket and detaches, and nothing leaks to other
//! sessions.

use std::fmt;

use ahash::AHashMap;
use tracing::debug;

use super::{alloc_packet_id, Broker};
use crate::acl::Authorizer;
use crate::persistence::{PersistenceOp, StoredSession};
use crate::protocol::{
    Disconnect, Packet, Properties, PubAck, PubComp, PubRec, PubRel, Publish, QoS, ReasonCode,
    RetainHandling, SubAck, Subscribe, UnsubAck, Unsubscribe,
};
use crate::topic::validate_topic_filter;

/// Fatal, session-scoped dispatch failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// The session vanished (expired or never registered)
    SessionNotFound,
    /// Malformed or inconsistent packet
    ProtocolViolation(&'static str),
    /// A packet type the broker never accepts on an open session
    UnexpectedPacket(u8),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionNotFound => write!(f, "session not found"),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            Self::UnexpectedPacket(t) => write!(f, "unexpected packet type {}", t),
        }
    }
}

impl std::error::Error for DispatchError {}

impl Broker {
    /// Apply an inbound packet to a session.
    ///
    /// An `Err` is a protocol failure for this session; the caller is
    /// expected to drop the connection and call `unregister_client`.
    pub fn dispatch(&self, session_id: &str, packet: Packet) -> Result<(), DispatchError> {
        match packet {
            Packet::PingReq => {
                let mut state = self.state.lock();
                let session = state
                    .sessions
                    .get_mut(session_id)
                    .ok_or(DispatchError::SessionNotFound)?;
                self.push_packet(session, Packet::PingResp);
                Ok(())
            }
            Packet::PubAck(ack) => {
                let mut state = self.state.lock();
                let session = state
                    .sessions
                    .get_mut(session_id)
                    .ok_or(DispatchError::SessionNotFound)?;
                session.qos_pending.remove(&ack.packet_id);
                self.release_flight_slot(session);
                Ok(())
            }
            Packet::PubRec(rec) => {
                // The flight slot stays occupied until PUBCOMP closes the
                // exchange
                let mut state = self.state.lock();
                let session = state
                    .sessions
                    .get_mut(session_id)
                    .ok_or(DispatchError::SessionNotFound)?;
                session.qos_pending.remove(&rec.packet_id);
                self.push_packet(session, Packet::PubRel(PubRel::new(rec.packet_id)));
                Ok(())
            }
            Packet::PubRel(rel) => self.handle_pubrel(session_id, rel),
            Packet::PubComp(_) => {
                let mut state = self.state.lock();
                let session = state
                    .sessions
                    .get_mut(session_id)
                    .ok_or(DispatchError::SessionNotFound)?;
                self.release_flight_slot(session);
                Ok(())
            }
            Packet::Publish(publish) => self.handle_publish(session_id, publish),
            Packet::Subscribe(subscribe) => self.handle_subscribe(session_id, subscribe),
            Packet::Unsubscribe(unsubscribe) => self.handle_unsubscribe(session_id, unsubscribe),
            Packet::Disconnect(disconnect) => self.handle_disconnect(session_id, disconnect),
            other => Err(DispatchError::UnexpectedPacket(other.packet_type())),
        }
    }

    /// QoS 2, publisher side: the client releases a publish we stored at
    /// PUBREC time. Only now does it reach the router.
    fn handle_pubrel(&self, session_id: &str, rel: PubRel) -> Result<(), DispatchError> {
        let released = {
            let mut state = self.state.lock();
            let session = state
                .sessions
                .get_mut(session_id)
                .ok_or(DispatchError::SessionNotFound)?;

            let released = session.qos_pending.remove(&rel.packet_id);
            let mut comp = PubComp::new(rel.packet_id);
            if released.is_none() {
                comp.reason_code = ReasonCode::PacketIdNotFound;
            }
            self.push_packet(session, Packet::PubComp(comp));
            released
        };

        if let Some(publish) = released {
            self.stats.messages_received.inc();
            self.broadcast(Some(session_id), publish);
        }
        Ok(())
    }

    fn handle_publish(&self, session_id: &str, mut publish: Publish) -> Result<(), DispatchError> {
        if publish.qos > QoS::AtMostOnce && publish.packet_id.is_none() {
            return Err(DispatchError::ProtocolViolation(
                "QoS > 0 publish without a packet identifier",
            ));
        }

        let to_route = {
            let mut state = self.state.lock();
            let session = state
                .sessions
                .get_mut(session_id)
                .ok_or(DispatchError::SessionNotFound)?;

            // Inbound alias resolution; the property never travels past
            // this point. An unknown alias leaves the topic empty, which
            // the ACL check below rejects.
            if let Some(alias) = publish.properties.topic_alias.take() {
                if let Some(client) = session.client.as_mut() {
                    publish.topic = client.resolve_alias(alias, &publish.topic);
                }
            }

            if !Authorizer::authorize(&publish.topic, &session.acl) {
                debug!(session = %session_id, topic = %publish.topic, "publish not authorized");
                match (publish.qos, publish.packet_id) {
                    (QoS::AtLeastOnce, Some(packet_id)) => {
                        let mut ack = PubAck::new(packet_id);
                        ack.reason_code = ReasonCode::NotAuthorized;
                        self.push_packet(session, Packet::PubAck(ack));
                    }
                    (QoS::ExactlyOnce, Some(packet_id)) => {
                        let mut rec = PubRec::new(packet_id);
                        rec.reason_code = ReasonCode::NotAuthorized;
                        self.push_packet(session, Packet::PubRec(rec));
                    }
                    _ => {}
                }
                None
            } else {
                match (publish.qos, publish.packet_id) {
                    (QoS::AtMostOnce, _) => Some(publish),
                    (QoS::AtLeastOnce, Some(packet_id)) => {
                        self.push_packet(session, Packet::PubAck(PubAck::new(packet_id)));
                        Some(publish)
                    }
                    (QoS::ExactlyOnce, Some(packet_id)) => {
                        // Held until PUBREL; counted and routed there
                        self.push_packet(session, Packet::PubRec(PubRec::new(packet_id)));
                        session.qos_pending.insert(packet_id, publish);
                        None
                    }
                    _ => None,
                }
            }
        };

        if let Some(publish) = to_route {
            self.stats.messages_received.inc();
            self.broadcast(Some(session_id), publish);
        }
        Ok(())
    }

    fn handle_subscribe(
        &self,
        session_id: &str,
        subscribe: Subscribe,
    ) -> Result<(), DispatchError> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or(DispatchError::SessionNotFound)?;

        let mut reason_codes = Vec::with_capacity(subscribe.subscriptions.len());
        let mut retained = Vec::new();

        for entry in &subscribe.subscriptions {
            if validate_topic_filter(&entry.filter).is_err() {
                reason_codes.push(ReasonCode::TopicFilterInvalid);
                continue;
            }
            if !Authorizer::authorize(&entry.filter, &session.acl) {
                debug!(session = %session_id, filter = %entry.filter, "subscribe not authorized");
                reason_codes.push(ReasonCode::NotAuthorized);
                continue;
            }

            let newly_added = session
                .subscriptions
                .insert(entry.filter.clone(), entry.options)
                .is_none();
            state
                .subscriptions
                .entry(&entry.filter, AHashMap::new)
                .insert(session.id.clone(), entry.options);
            reason_codes.push(ReasonCode::granted(entry.options.qos));

            if newly_added && entry.options.retain_handling != RetainHandling::DoNotSend {
                for stored in self.retained.matching(&entry.filter) {
                    let qos = stored.qos.min(entry.options.qos);
                    retained.push(Publish {
                        dup: false,
                        qos,
                        retain: if entry.options.retain_as_published {
                            stored.retain
                        } else {
                            false
                        },
                        topic: stored.topic.clone(),
                        packet_id: None,
                        payload: stored.payload.clone(),
                        properties: stored.properties.clone(),
                    });
                }
            }
        }

        self.push_packet(
            session,
            Packet::SubAck(SubAck {
                packet_id: subscribe.packet_id,
                reason_codes,
                properties: Properties::default(),
            }),
        );

        // Retained deliveries follow the SUBACK, each under a fresh id
        for mut delivery in retained {
            if delivery.qos > QoS::AtMostOnce {
                delivery.packet_id = Some(alloc_packet_id(&mut state.next_packet_id));
            }
            self.deliver(session, delivery);
        }

        let snapshot = StoredSession::from(&*session);
        self.persist
            .store(PersistenceOp::SetSession { session: snapshot });
        Ok(())
    }

    fn handle_unsubscribe(
        &self,
        session_id: &str,
        unsubscribe: Unsubscribe,
    ) -> Result<(), DispatchError> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or(DispatchError::SessionNotFound)?;

        let mut reason_codes = Vec::with_capacity(unsubscribe.filters.len());
        for filter in &unsubscribe.filters {
            if session.subscriptions.remove(filter).is_none() {
                reason_codes.push(ReasonCode::NoSubscriptionExisted);
                continue;
            }
            let now_empty = state
                .subscriptions
                .get_mut(filter)
                .map(|subscribers| {
                    subscribers.remove(&session.id);
                    subscribers.is_empty()
                })
                .unwrap_or(false);
            if now_empty {
                state.subscriptions.remove(filter);
            }
            reason_codes.push(ReasonCode::Success);
        }

        self.push_packet(
            session,
            Packet::UnsubAck(UnsubAck {
                packet_id: unsubscribe.packet_id,
                reason_codes,
                properties: Properties::default(),
            }),
        );

        let snapshot = StoredSession::from(&*session);
        self.persist
            .store(PersistenceOp::SetSession { session: snapshot });
        Ok(())
    }

    /// A clean Disconnect suppresses the will; DisconnectWithWill (and any
    /// error code) keeps it for the detach path. Either form may carry a
    /// Session-Expiry-Interval override for the upcoming grace window.
    fn handle_disconnect(
        &self,
        session_id: &str,
        disconnect: Disconnect,
    ) -> Result<(), DispatchError> {
        let mut state = self.state.lock();
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or(DispatchError::SessionNotFound)?;

        if disconnect.reason_code == ReasonCode::Success {
            session.will = None;
        }
        if let Some(seconds) = disconnect.properties.session_expiry_interval {
            if let Some(client) = session.client.as_mut() {
                client.expiry_override = Some(seconds);
            }
        }
        Ok(())
    }
}
