//! End-to-end tests driving the broker core through its public contract:
//! register, dispatch, outbound queues, unregister.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::time::timeout;

use nimbusmq::broker::{Broker, BrokerOptions};
use nimbusmq::config::AuthConfig;
use nimbusmq::protocol::{
    Connect, Disconnect, Packet, Properties, PubAck, PubRel, Publish, QoS, ReasonCode,
    RetainHandling, SubAck, Subscribe, Subscription, SubscriptionOptions, Unsubscribe, Will,
};
use nimbusmq::session::{SessionSignal, WorkerHandle};
use nimbusmq::{Authorizer, PersistenceHandle};

struct TestClient {
    id: String,
    uid: u64,
    session_present: bool,
    outbound: mpsc::Receiver<Packet>,
    signals: mpsc::Receiver<SessionSignal>,
}

impl TestClient {
    /// Next packet already sitting in the outbound queue
    fn next(&mut self) -> Option<Packet> {
        self.outbound.try_recv().ok()
    }

    fn expect_publish(&mut self) -> Publish {
        match self.next() {
            Some(Packet::Publish(p)) => p,
            other => panic!("expected a publish, got {:?}", other),
        }
    }

    fn expect_suback(&mut self) -> SubAck {
        match self.next() {
            Some(Packet::SubAck(s)) => s,
            other => panic!("expected a suback, got {:?}", other),
        }
    }

    fn assert_idle(&mut self) {
        if let Some(packet) = self.next() {
            panic!("expected an empty outbound queue, got {:?}", packet);
        }
    }
}

fn test_broker() -> Arc<Broker> {
    test_broker_with(BrokerOptions::default())
}

fn test_broker_with(options: BrokerOptions) -> Arc<Broker> {
    Arc::new(Broker::new(
        options,
        Authorizer::allow_all(),
        PersistenceHandle::disabled(),
    ))
}

fn connect_with(broker: &Broker, connect: Connect) -> TestClient {
    let id = connect.client_id.clone();
    let (worker, signals) = WorkerHandle::channel();
    let registration = broker.register_client(connect, worker).expect("register");
    TestClient {
        id,
        uid: registration.client_uid,
        session_present: registration.session_present,
        outbound: registration.outbound,
        signals,
    }
}

fn connect(broker: &Broker, id: &str) -> TestClient {
    connect_with(
        broker,
        Connect {
            client_id: id.to_string(),
            ..Connect::default()
        },
    )
}

fn subscribe(broker: &Broker, client: &mut TestClient, filter: &str, qos: QoS) {
    subscribe_opts(
        broker,
        client,
        filter,
        SubscriptionOptions {
            qos,
            ..SubscriptionOptions::default()
        },
    );
}

fn subscribe_opts(
    broker: &Broker,
    client: &mut TestClient,
    filter: &str,
    options: SubscriptionOptions,
) {
    broker
        .dispatch(
            &client.id,
            Packet::Subscribe(Subscribe {
                packet_id: 1,
                subscriptions: vec![Subscription {
                    filter: filter.to_string(),
                    options,
                }],
                properties: Properties::default(),
            }),
        )
        .expect("subscribe");
    let suback = client.expect_suback();
    assert!(
        !suback.reason_codes[0].is_error(),
        "subscribe rejected: {:?}",
        suback.reason_codes
    );
}

fn publish(topic: &str, qos: QoS, payload: &'static [u8]) -> Publish {
    Publish {
        qos,
        topic: Arc::from(topic),
        payload: Bytes::from_static(payload),
        packet_id: (qos > QoS::AtMostOnce).then_some(100),
        ..Publish::default()
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn qos0_fanout() {
    let broker = test_broker();
    let mut a = connect(&broker, "a");
    let mut b = connect(&broker, "b");
    subscribe(&broker, &mut b, "sensors/+/temp", QoS::AtMostOnce);

    broker
        .dispatch(&a.id, Packet::Publish(publish("sensors/1/temp", QoS::AtMostOnce, b"23")))
        .unwrap();

    let delivered = b.expect_publish();
    assert_eq!(delivered.topic.as_ref(), "sensors/1/temp");
    assert_eq!(delivered.qos, QoS::AtMostOnce);
    assert_eq!(delivered.payload.as_ref(), b"23");
    assert!(!delivered.dup);
    assert!(!delivered.retain);
    b.assert_idle();
    a.assert_idle();
}

#[test]
fn retained_delivery_on_subscribe() {
    let broker = test_broker();
    let mut a = connect(&broker, "a");

    let mut retained = publish("status/boiler", QoS::AtLeastOnce, b"on");
    retained.retain = true;
    broker.dispatch(&a.id, Packet::Publish(retained)).unwrap();
    assert!(matches!(a.next(), Some(Packet::PubAck(_))));

    let mut c = connect(&broker, "c");
    subscribe_opts(
        &broker,
        &mut c,
        "status/#",
        SubscriptionOptions {
            qos: QoS::ExactlyOnce,
            retain_as_published: true,
            retain_handling: RetainHandling::SendAtSubscribe,
            ..SubscriptionOptions::default()
        },
    );

    let delivered = c.expect_publish();
    assert_eq!(delivered.topic.as_ref(), "status/boiler");
    assert_eq!(delivered.qos, QoS::AtLeastOnce);
    assert!(delivered.retain);
    assert_eq!(delivered.payload.as_ref(), b"on");
    assert!(delivered.packet_id.is_some());
}

#[test]
fn session_takeover() {
    let broker = test_broker();
    let mut first = connect_with(
        &broker,
        Connect {
            client_id: "x".to_string(),
            clean_start: false,
            ..Connect::default()
        },
    );
    subscribe(&broker, &mut first, "t/#", QoS::AtMostOnce);

    let mut second = connect_with(
        &broker,
        Connect {
            client_id: "x".to_string(),
            clean_start: false,
            ..Connect::default()
        },
    );
    assert!(second.session_present);

    // The evicted worker hears about it exactly once
    assert_eq!(first.signals.try_recv(), Ok(SessionSignal::TakenOver));
    assert!(first.signals.try_recv().is_err());

    // The old worker's detach is a no-op against the new connection
    broker.unregister_client("x", first.uid);
    assert_eq!(broker.connected_count(), 1);

    let mut publisher = connect(&broker, "pub");
    broker
        .dispatch(&publisher.id, Packet::Publish(publish("t/1", QoS::AtMostOnce, b"hi")))
        .unwrap();

    let delivered = second.expect_publish();
    assert_eq!(delivered.topic.as_ref(), "t/1");
    first.assert_idle();
    publisher.assert_idle();
}

#[test]
fn qos2_publish_round_trip() {
    let broker = test_broker();
    let mut a = connect(&broker, "a");
    subscribe(&broker, &mut a, "q2/#", QoS::ExactlyOnce);
    let mut b = connect(&broker, "b");

    let mut incoming = publish("q2/a", QoS::ExactlyOnce, b"x");
    incoming.packet_id = Some(7);
    broker.dispatch(&b.id, Packet::Publish(incoming)).unwrap();

    match b.next() {
        Some(Packet::PubRec(rec)) => {
            assert_eq!(rec.packet_id, 7);
            assert_eq!(rec.reason_code, ReasonCode::Success);
        }
        other => panic!("expected pubrec, got {:?}", other),
    }
    // Not routed until released
    a.assert_idle();

    broker
        .dispatch(&b.id, Packet::PubRel(PubRel::new(7)))
        .unwrap();
    match b.next() {
        Some(Packet::PubComp(comp)) => {
            assert_eq!(comp.packet_id, 7);
            assert_eq!(comp.reason_code, ReasonCode::Success);
        }
        other => panic!("expected pubcomp, got {:?}", other),
    }

    let delivered = a.expect_publish();
    assert_eq!(delivered.topic.as_ref(), "q2/a");
    assert_eq!(delivered.qos, QoS::ExactlyOnce);
    a.assert_idle();

    // Releasing an unknown id NAKs without a duplicate delivery
    broker
        .dispatch(&b.id, Packet::PubRel(PubRel::new(7)))
        .unwrap();
    match b.next() {
        Some(Packet::PubComp(comp)) => {
            assert_eq!(comp.reason_code, ReasonCode::PacketIdNotFound);
        }
        other => panic!("expected pubcomp, got {:?}", other),
    }
    a.assert_idle();
}

#[test]
fn receive_maximum_backpressure() {
    let broker = test_broker();
    let mut a = connect_with(
        &broker,
        Connect {
            client_id: "a".to_string(),
            properties: Properties {
                receive_maximum: Some(1),
                ..Properties::default()
            },
            ..Connect::default()
        },
    );
    subscribe(&broker, &mut a, "load/#", QoS::AtLeastOnce);
    let mut b = connect(&broker, "b");

    for n in 0..3u8 {
        let mut p = publish("load/x", QoS::AtLeastOnce, b"m");
        p.packet_id = Some(10 + u16::from(n));
        broker.dispatch(&b.id, Packet::Publish(p)).unwrap();
        assert!(matches!(b.next(), Some(Packet::PubAck(_))));
    }

    // Exactly one delivery in flight, the rest parked
    let first = a.expect_publish();
    a.assert_idle();
    let stats = broker.session_stats("a").unwrap();
    assert_eq!(stats.in_flight_tokens, 0);
    assert_eq!(stats.qos_pending, 3);
    assert_eq!(stats.backlog, 2);

    // Each ack releases exactly one more
    broker
        .dispatch(&a.id, Packet::PubAck(PubAck::new(first.packet_id.unwrap())))
        .unwrap();
    let second = a.expect_publish();
    a.assert_idle();

    broker
        .dispatch(&a.id, Packet::PubAck(PubAck::new(second.packet_id.unwrap())))
        .unwrap();
    let third = a.expect_publish();
    a.assert_idle();

    broker
        .dispatch(&a.id, Packet::PubAck(PubAck::new(third.packet_id.unwrap())))
        .unwrap();
    let stats = broker.session_stats("a").unwrap();
    assert_eq!(stats.qos_pending, 0);
    assert_eq!(stats.backlog, 0);
    assert_eq!(stats.in_flight_tokens, 1);
}

#[tokio::test]
async fn will_published_on_ungraceful_disconnect() {
    let broker = test_broker();
    let (shutdown, _) = broadcast::channel(1);
    broker.start(&shutdown);

    let mut observer = connect(&broker, "observer");
    subscribe(&broker, &mut observer, "goodbye", QoS::AtMostOnce);

    let doomed = connect_with(
        &broker,
        Connect {
            client_id: "doomed".to_string(),
            clean_start: true,
            will: Some(Will {
                topic: "goodbye".to_string(),
                payload: Bytes::from_static(b"bye"),
                qos: QoS::AtMostOnce,
                retain: false,
                properties: Properties::default(),
            }),
            ..Connect::default()
        },
    );

    // Connection drops without a Disconnect packet
    broker.unregister_client(&doomed.id, doomed.uid);

    let packet = timeout(Duration::from_secs(2), observer.outbound.recv())
        .await
        .expect("will delivery timed out")
        .expect("outbound closed");
    match packet {
        Packet::Publish(p) => {
            assert_eq!(p.topic.as_ref(), "goodbye");
            assert_eq!(p.payload.as_ref(), b"bye");
        }
        other => panic!("expected the will publish, got {:?}", other),
    }

    // No QoS>0 subscriptions, so the session is reaped immediately
    assert_eq!(broker.session_count(), 1);
    let _ = shutdown.send(());
}

#[tokio::test]
async fn clean_disconnect_suppresses_will() {
    let broker = test_broker();
    let (shutdown, _) = broadcast::channel(1);
    broker.start(&shutdown);

    let mut observer = connect(&broker, "observer");
    subscribe(&broker, &mut observer, "goodbye", QoS::AtMostOnce);

    let polite = connect_with(
        &broker,
        Connect {
            client_id: "polite".to_string(),
            will: Some(Will {
                topic: "goodbye".to_string(),
                payload: Bytes::from_static(b"bye"),
                qos: QoS::AtMostOnce,
                retain: false,
                properties: Properties::default(),
            }),
            ..Connect::default()
        },
    );

    broker
        .dispatch(&polite.id, Packet::Disconnect(Disconnect::default()))
        .unwrap();
    broker.unregister_client(&polite.id, polite.uid);

    assert!(
        timeout(Duration::from_millis(300), observer.outbound.recv())
            .await
            .is_err(),
        "will must not fire after a clean disconnect"
    );
    let _ = shutdown.send(());
}

// ---------------------------------------------------------------------------
// Invariants
// ---------------------------------------------------------------------------

#[test]
fn subscription_index_follows_session_lifecycle() {
    let broker = test_broker();
    let mut a = connect(&broker, "a");
    subscribe(&broker, &mut a, "x/1", QoS::AtMostOnce);
    subscribe(&broker, &mut a, "x/2", QoS::AtMostOnce);
    assert_eq!(broker.subscription_count(), 2);
    assert_eq!(broker.session_stats("a").unwrap().subscriptions, 2);

    broker
        .dispatch(
            &a.id,
            Packet::Unsubscribe(Unsubscribe {
                packet_id: 2,
                filters: vec!["x/1".to_string(), "never-subscribed".to_string()],
                properties: Properties::default(),
            }),
        )
        .unwrap();
    match a.next() {
        Some(Packet::UnsubAck(unsuback)) => {
            assert_eq!(
                unsuback.reason_codes,
                vec![ReasonCode::Success, ReasonCode::NoSubscriptionExisted]
            );
        }
        other => panic!("expected unsuback, got {:?}", other),
    }
    assert_eq!(broker.subscription_count(), 1);
    assert_eq!(broker.session_stats("a").unwrap().subscriptions, 1);

    // A clean-start reconnect clears the prior session's index entries
    let _fresh = connect(&broker, "a");
    assert_eq!(broker.subscription_count(), 0);
}

#[test]
fn qos_downgrade_to_subscription_maximum() {
    let broker = test_broker();
    let mut low = connect(&broker, "low");
    subscribe(&broker, &mut low, "d/#", QoS::AtMostOnce);
    let mut high = connect(&broker, "high");
    subscribe(&broker, &mut high, "d/#", QoS::ExactlyOnce);
    let mut p = connect(&broker, "p");

    let mut msg = publish("d/t", QoS::AtLeastOnce, b"v");
    msg.packet_id = Some(9);
    broker.dispatch(&p.id, Packet::Publish(msg)).unwrap();
    assert!(matches!(p.next(), Some(Packet::PubAck(_))));

    assert_eq!(low.expect_publish().qos, QoS::AtMostOnce);
    assert_eq!(high.expect_publish().qos, QoS::AtLeastOnce);
}

#[test]
fn inbound_alias_resolution() {
    let broker = test_broker();
    let mut sub = connect(&broker, "sub");
    subscribe(&broker, &mut sub, "alias/t", QoS::AtMostOnce);
    let mut publisher = connect(&broker, "pub");

    // Bind alias 5 and publish through it
    let mut bind = publish("alias/t", QoS::AtMostOnce, b"1");
    bind.properties.topic_alias = Some(5);
    broker.dispatch(&publisher.id, Packet::Publish(bind)).unwrap();

    let delivered = sub.expect_publish();
    assert_eq!(delivered.topic.as_ref(), "alias/t");
    assert_eq!(delivered.properties.topic_alias, None);

    // Empty topic resolves through the table
    let mut aliased = publish("", QoS::AtMostOnce, b"2");
    aliased.properties.topic_alias = Some(5);
    broker
        .dispatch(&publisher.id, Packet::Publish(aliased))
        .unwrap();
    assert_eq!(sub.expect_publish().topic.as_ref(), "alias/t");

    // Unknown alias leaves an empty topic, which fails authorization
    let mut unknown = publish("", QoS::AtLeastOnce, b"3");
    unknown.packet_id = Some(44);
    unknown.properties.topic_alias = Some(99);
    broker
        .dispatch(&publisher.id, Packet::Publish(unknown))
        .unwrap();
    match publisher.next() {
        Some(Packet::PubAck(ack)) => assert_eq!(ack.reason_code, ReasonCode::NotAuthorized),
        other => panic!("expected a nak, got {:?}", other),
    }
    sub.assert_idle();
}

#[test]
fn outbound_alias_allocation_is_bounded() {
    let broker = test_broker();
    let mut a = connect_with(
        &broker,
        Connect {
            client_id: "a".to_string(),
            properties: Properties {
                topic_alias_maximum: Some(2),
                ..Properties::default()
            },
            ..Connect::default()
        },
    );
    subscribe(&broker, &mut a, "out/#", QoS::AtMostOnce);
    let mut p = connect(&broker, "p");

    for topic in ["out/1", "out/2", "out/3", "out/1"] {
        broker
            .dispatch(&p.id, Packet::Publish(publish(topic, QoS::AtMostOnce, b"v")))
            .unwrap();
    }

    let first = a.expect_publish();
    assert_eq!(first.topic.as_ref(), "out/1");
    assert_eq!(first.properties.topic_alias, Some(1));

    let second = a.expect_publish();
    assert_eq!(second.topic.as_ref(), "out/2");
    assert_eq!(second.properties.topic_alias, Some(2));

    // Alias space exhausted: sent unchanged
    let third = a.expect_publish();
    assert_eq!(third.topic.as_ref(), "out/3");
    assert_eq!(third.properties.topic_alias, None);

    // Repeat hits the mapping: empty topic plus alias
    let fourth = a.expect_publish();
    assert_eq!(fourth.topic.as_ref(), "");
    assert_eq!(fourth.properties.topic_alias, Some(1));
}

#[test]
fn acl_enforced_on_publish_and_subscribe() {
    let config = AuthConfig {
        allow_anonymous: true,
        users: vec![nimbusmq::config::UserConfig {
            name: "alice".to_string(),
            password: "secret".to_string(),
            acl: vec!["allow sensors/#".to_string(), "deny #".to_string()],
        }],
    };
    let broker = Arc::new(Broker::new(
        BrokerOptions::default(),
        Authorizer::from_config(&config).unwrap(),
        PersistenceHandle::disabled(),
    ));

    let mut alice = connect_with(
        &broker,
        Connect {
            client_id: "alice-1".to_string(),
            username: Some("alice".to_string()),
            password: Some(Bytes::from_static(b"secret")),
            ..Connect::default()
        },
    );
    let mut anon = connect(&broker, "anon");
    subscribe(&broker, &mut anon, "#", QoS::AtMostOnce);

    // Denied publish NAKs per QoS and routes nothing
    let mut denied = publish("other/t", QoS::AtLeastOnce, b"x");
    denied.packet_id = Some(5);
    broker.dispatch(&alice.id, Packet::Publish(denied)).unwrap();
    match alice.next() {
        Some(Packet::PubAck(ack)) => assert_eq!(ack.reason_code, ReasonCode::NotAuthorized),
        other => panic!("expected a nak, got {:?}", other),
    }
    anon.assert_idle();

    // Allowed publish routes
    broker
        .dispatch(&alice.id, Packet::Publish(publish("sensors/1", QoS::AtMostOnce, b"y")))
        .unwrap();
    assert_eq!(anon.expect_publish().topic.as_ref(), "sensors/1");

    // Subscribe outside the allowed tree is refused per filter
    broker
        .dispatch(
            &alice.id,
            Packet::Subscribe(Subscribe {
                packet_id: 3,
                subscriptions: vec![
                    Subscription {
                        filter: "other/#".to_string(),
                        options: SubscriptionOptions::default(),
                    },
                    Subscription {
                        filter: "sensors/+".to_string(),
                        options: SubscriptionOptions::default(),
                    },
                ],
                properties: Properties::default(),
            }),
        )
        .unwrap();
    let suback = alice.expect_suback();
    assert_eq!(
        suback.reason_codes,
        vec![ReasonCode::NotAuthorized, ReasonCode::Success]
    );

    // Bad credentials never reach a session
    let (worker, _signals) = WorkerHandle::channel();
    let refused = broker.register_client(
        Connect {
            client_id: "alice-2".to_string(),
            username: Some("alice".to_string()),
            password: Some(Bytes::from_static(b"wrong")),
            ..Connect::default()
        },
        worker,
    );
    assert!(refused.is_err());
}

#[test]
fn malformed_filter_rejected_per_entry() {
    let broker = test_broker();
    let mut a = connect(&broker, "a");

    broker
        .dispatch(
            &a.id,
            Packet::Subscribe(Subscribe {
                packet_id: 1,
                subscriptions: vec![
                    Subscription {
                        filter: "bad/#/deeper".to_string(),
                        options: SubscriptionOptions::default(),
                    },
                    Subscription {
                        filter: "good/#".to_string(),
                        options: SubscriptionOptions::default(),
                    },
                ],
                properties: Properties::default(),
            }),
        )
        .unwrap();

    let suback = a.expect_suback();
    assert_eq!(
        suback.reason_codes,
        vec![ReasonCode::TopicFilterInvalid, ReasonCode::Success]
    );
    assert_eq!(broker.subscription_count(), 1);
}

#[test]
fn backlog_overflow_drops_silently() {
    let broker = test_broker_with(BrokerOptions {
        backlog_bound: 2,
        ..BrokerOptions::default()
    });
    let mut a = connect_with(
        &broker,
        Connect {
            client_id: "a".to_string(),
            properties: Properties {
                receive_maximum: Some(1),
                ..Properties::default()
            },
            ..Connect::default()
        },
    );
    subscribe(&broker, &mut a, "flood/#", QoS::AtLeastOnce);
    let mut b = connect(&broker, "b");

    let dropped_before = broker.stats().messages_dropped.get();
    for n in 0..5u16 {
        let mut p = publish("flood/x", QoS::AtLeastOnce, b"m");
        p.packet_id = Some(20 + n);
        broker.dispatch(&b.id, Packet::Publish(p)).unwrap();
        // The publisher is acked regardless of the subscriber's queues
        assert!(matches!(b.next(), Some(Packet::PubAck(_))));
    }

    let stats = broker.session_stats("a").unwrap();
    assert_eq!(stats.backlog, 2, "backlog is bounded");
    assert_eq!(broker.stats().messages_dropped.get(), dropped_before + 2);

    // One in flight, nothing else delivered yet
    a.expect_publish();
    a.assert_idle();
}

#[test]
fn unexpected_packet_is_fatal() {
    let broker = test_broker();
    let a = connect(&broker, "a");
    let err = broker
        .dispatch(&a.id, Packet::PingResp)
        .expect_err("pingresp from a client is a protocol error");
    assert!(matches!(err, nimbusmq::DispatchError::UnexpectedPacket(13)));

    let err = broker
        .register_client(
            Connect {
                client_id: "z".to_string(),
                properties: Properties {
                    receive_maximum: Some(0),
                    ..Properties::default()
                },
                ..Connect::default()
            },
            WorkerHandle::channel().0,
        )
        .expect_err("receive-maximum zero is a protocol error");
    assert!(matches!(err, nimbusmq::ConnectError::ReceiveMaximumZero));
}

#[test]
fn no_local_suppresses_echo() {
    let broker = test_broker();
    let mut a = connect(&broker, "a");
    subscribe_opts(
        &broker,
        &mut a,
        "chat/#",
        SubscriptionOptions {
            no_local: true,
            ..SubscriptionOptions::default()
        },
    );
    let mut b = connect(&broker, "b");
    subscribe(&broker, &mut b, "chat/#", QoS::AtMostOnce);

    broker
        .dispatch(&a.id, Packet::Publish(publish("chat/room", QoS::AtMostOnce, b"hi")))
        .unwrap();

    b.expect_publish();
    a.assert_idle();
}

// ---------------------------------------------------------------------------
// Restore & $SYS
// ---------------------------------------------------------------------------

#[tokio::test]
async fn persistence_roundtrip_restores_sessions_and_retained() {
    use nimbusmq::persistence::PersistenceManager;
    use nimbusmq::MemoryBackend;

    let backend = Arc::new(MemoryBackend::new());
    let manager = PersistenceManager::new(backend.clone(), Duration::from_millis(10), 16);

    // First life: a durable session with a subscription, plus a retained
    // message
    {
        let broker = Arc::new(Broker::new(
            BrokerOptions::default(),
            Authorizer::allow_all(),
            manager.handle(),
        ));
        let mut c = connect_with(
            &broker,
            Connect {
                client_id: "durable".to_string(),
                clean_start: false,
                ..Connect::default()
            },
        );
        subscribe(&broker, &mut c, "news/#", QoS::AtLeastOnce);

        let mut p = connect(&broker, "pub");
        let mut retained = publish("news/latest", QoS::AtMostOnce, b"breaking");
        retained.retain = true;
        broker.dispatch(&p.id, Packet::Publish(retained)).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
    }

    // Second life: restore and verify both came back
    let broker = Arc::new(Broker::new(
        BrokerOptions::default(),
        Authorizer::allow_all(),
        manager.handle(),
    ));
    let data = manager.load_all().await.unwrap();
    assert!(!data.sessions.is_empty());
    broker.restore(data);

    assert_eq!(broker.retained_count(), 1);
    assert!(broker.session_stats("durable").is_some());

    let mut c = connect_with(
        &broker,
        Connect {
            client_id: "durable".to_string(),
            clean_start: false,
            ..Connect::default()
        },
    );
    assert!(c.session_present, "restored session must be resumable");

    let mut p = connect(&broker, "pub2");
    let mut msg = publish("news/tomorrow", QoS::AtLeastOnce, b"later");
    msg.packet_id = Some(3);
    broker.dispatch(&p.id, Packet::Publish(msg)).unwrap();
    let delivered = c.expect_publish();
    assert_eq!(delivered.topic.as_ref(), "news/tomorrow");
    assert_eq!(delivered.qos, QoS::AtLeastOnce);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn sys_topics_published_as_retained() {
    let broker = test_broker();
    let (shutdown, _) = broadcast::channel(1);

    let mut watcher = connect(&broker, "watcher");
    subscribe(&broker, &mut watcher, "$SYS/broker/clients/connected", QoS::AtMostOnce);
    // A bare '#' must never see $SYS traffic
    let mut greedy = connect(&broker, "greedy");
    subscribe(&broker, &mut greedy, "#", QoS::AtMostOnce);

    broker.start(&shutdown);

    let packet = timeout(Duration::from_secs(2), watcher.outbound.recv())
        .await
        .expect("$SYS publish timed out")
        .expect("outbound closed");
    match packet {
        Packet::Publish(p) => {
            assert_eq!(p.topic.as_ref(), "$SYS/broker/clients/connected");
            assert_eq!(p.payload.as_ref(), b"2");
            assert_eq!(p.properties.message_expiry_interval, Some(60));
        }
        other => panic!("expected a $SYS publish, got {:?}", other),
    }
    greedy.assert_idle();

    // The values are retained, so late subscribers catch up immediately
    let mut late = connect(&broker, "late");
    subscribe_opts(
        &broker,
        &mut late,
        "$SYS/broker/version",
        SubscriptionOptions {
            retain_as_published: true,
            ..SubscriptionOptions::default()
        },
    );
    let version = late.expect_publish();
    assert_eq!(version.topic.as_ref(), "$SYS/broker/version");
    assert!(version.retain);

    let _ = shutdown.send(());
}
