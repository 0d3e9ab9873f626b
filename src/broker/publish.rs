//! Publish routing and outbound delivery
//!
//! `broadcast` resolves a publish to its subscriber set and hands each
//! target a per-subscription copy; `deliver` runs the flight-control
//! machine that decides between sending now, backlogging, or recording
//! pending state for a detached session.

use std::sync::Arc;

use tracing::trace;

use super::Broker;
use crate::protocol::{Packet, Publish, QoS};
use crate::session::{AliasLookup, Session};

impl Broker {
    /// Fan a publish out to every matching subscription.
    ///
    /// `source` is the publishing session, used only for `no_local`
    /// filtering; server-originated publishes (wills, `$SYS`) pass `None`.
    /// One broker-wide packet id is allocated per broadcast and shared by
    /// all QoS>0 deliveries it produces. Deliveries to any one session
    /// keep the arrival order of publishes from a given source.
    pub(crate) fn broadcast(&self, source: Option<&str>, publish: Publish) {
        self.retained.retain(&publish);

        let mut state = self.state.lock();
        let state = &mut *state;

        let mut targets = Vec::new();
        state.subscriptions.matches(&publish.topic, |subscribers| {
            for (session_id, opts) in subscribers {
                targets.push((session_id.clone(), *opts));
            }
        });
        if targets.is_empty() {
            trace!(topic = %publish.topic, "no matching subscribers");
            return;
        }

        let packet_id = state.next_packet_id();
        for (session_id, opts) in targets {
            if opts.no_local && source == Some(session_id.as_ref()) {
                continue;
            }
            // Sessions reaped between match and here are skipped silently
            let Some(session) = state.sessions.get_mut(&session_id) else {
                continue;
            };

            let qos = publish.qos.min(opts.qos);
            let mut properties = publish.properties.clone();
            properties.topic_alias = None;
            let delivery = Publish {
                dup: false,
                qos,
                retain: publish.retain && opts.retain_as_published,
                topic: publish.topic.clone(),
                packet_id: (qos > QoS::AtMostOnce).then_some(packet_id),
                payload: publish.payload.clone(),
                properties,
            };
            self.deliver(session, delivery);
        }
    }

    /// Outbound delivery state machine.
    ///
    /// QoS 0 goes straight to the outbound queue. QoS>0 is recorded in
    /// `qos_pending` first, then either consumes a flight token and is
    /// sent, or waits in the backlog. Both queues drop silently when full;
    /// saturating one subscriber must not back-propagate to the publisher.
    pub(crate) fn deliver(&self, session: &mut Session, publish: Publish) {
        if publish.qos == QoS::AtMostOnce {
            self.send_publish(session, publish);
            return;
        }

        let Some(packet_id) = publish.packet_id else {
            return;
        };
        session.qos_pending.insert(packet_id, publish.clone());

        // Detached sessions keep pending state only; the queues belong to
        // whatever connection attaches next
        if session.client.is_none() {
            return;
        }

        if session.in_flight_tokens <= 0 {
            if session.backlog.len() >= self.options.backlog_bound {
                self.stats.messages_dropped.inc();
                trace!(session = %session.id, "backlog full, dropping delivery");
            } else {
                session.backlog.push_back(publish);
            }
            return;
        }

        session.in_flight_tokens -= 1;
        self.send_publish(session, publish);
    }

    /// Return one flight token and, when the backlog has a waiter, spend it
    /// again immediately. Keeps tokens + unacked deliveries at the
    /// negotiated Receive-Maximum.
    pub(crate) fn release_flight_slot(&self, session: &mut Session) {
        if session.in_flight_tokens < i32::from(session.receive_maximum) {
            session.in_flight_tokens += 1;
        }
        if session.in_flight_tokens > 0 {
            if let Some(next) = session.backlog.pop_front() {
                session.in_flight_tokens -= 1;
                self.send_publish(session, next);
            }
        }
    }

    /// Perform the actual send: outbound alias substitution, then a
    /// non-blocking push onto the session's outbound queue.
    fn send_publish(&self, session: &mut Session, mut publish: Publish) {
        let Some(client) = session.client.as_mut() else {
            return;
        };

        match client.outbound_alias(&publish.topic) {
            AliasLookup::Hit(alias) => {
                publish.topic = Arc::from("");
                publish.properties.topic_alias = Some(alias);
            }
            AliasLookup::Allocated(alias) => {
                publish.properties.topic_alias = Some(alias);
            }
            AliasLookup::Unavailable => {}
        }

        if client.outbound.try_send(Packet::Publish(publish)).is_ok() {
            self.stats.messages_sent.inc();
        } else {
            self.stats.messages_dropped.inc();
            trace!(session = %session.id, "outbound queue full, dropping publish");
        }
    }

    /// Push a control packet onto the session's outbound queue, dropping
    /// silently when the session is detached or the queue is full.
    pub(crate) fn push_packet(&self, session: &Session, packet: Packet) {
        let Some(client) = session.client.as_ref() else {
            return;
        };
        if client.outbound.try_send(packet).is_err() {
            self.stats.messages_dropped.inc();
            trace!(session = %session.id, "outbound queue full, dropping control packet");
        }
    }
}
