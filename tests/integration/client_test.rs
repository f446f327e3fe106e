//! Integration tests for both client variants against an in-process broker

#[path = "../common/mod.rs"]
mod common;

use std::net::TcpListener;
use std::thread;
use std::time::{Duration, Instant};

use common::{BrokerConfig, TestBroker};
use mqtt_sampler::client::{new_client, ClientKind, ConnectOptions, ConnectionState, MqttClientHandle};
use mqtt_sampler::error::{FailureCause, MqttSamplerError};
use rumqttc::{ConnectReturnCode, QoS};

const WAIT: Duration = Duration::from_secs(5);

fn options(broker: &TestBroker, id: &str) -> ConnectOptions {
    ConnectOptions::new(broker.url(), id).with_connect_timeout(Duration::from_secs(2))
}

/// Helper: poll `probe` until it holds or `WAIT` passes
fn wait_until(probe: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if probe() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    probe()
}

/// Helper: subscribe and wait until the broker has acknowledged it
fn subscribed(client: &MqttClientHandle, topic: &str, qos: QoS) {
    let before = client.stats().subscribed;
    client.subscribe(topic, qos).expect("subscribe");
    assert!(
        wait_until(|| client.stats().subscribed > before),
        "no SUBACK for {}",
        topic
    );
}

fn round_trip(kind: ClientKind, qos: QoS) {
    let broker = TestBroker::start();
    let tag = format!("{}-{}", kind, qos as u8);
    let subscriber = new_client(kind, options(&broker, &format!("sub-{}", tag))).unwrap();
    let publisher = new_client(kind, options(&broker, &format!("pub-{}", tag))).unwrap();

    let topic = format!("round/trip/{}", tag);
    subscribed(&subscriber, &topic, qos);
    publisher.publish(&topic, qos, b"hello", false).unwrap();

    let inbox = subscriber.inbox().expect("inbox after subscribe");
    let record = inbox.poll_timeout(WAIT).expect("message delivered");
    assert_eq!(record.topic(), topic);
    assert_eq!(record.payload(), b"hello");
    assert_eq!(record.qos(), qos);
    assert!(!record.is_retained());
    assert!(!record.is_duplicate());
    assert_eq!(inbox.received_count(), 1);

    // Exactly one record per publish.
    assert!(inbox.poll_timeout(Duration::from_millis(300)).is_none());

    publisher.disconnect().unwrap();
    subscriber.disconnect().unwrap();
}

#[test]
fn test_blocking_round_trip_each_qos() {
    for qos in [QoS::AtMostOnce, QoS::AtLeastOnce, QoS::ExactlyOnce] {
        round_trip(ClientKind::Blocking, qos);
    }
}

#[test]
fn test_async_round_trip_each_qos() {
    for qos in [QoS::AtMostOnce, QoS::AtLeastOnce, QoS::ExactlyOnce] {
        round_trip(ClientKind::Async, qos);
    }
}

#[test]
fn test_blocking_publish_waits_for_acknowledgement() {
    let broker = TestBroker::start();
    let client = new_client(ClientKind::Blocking, options(&broker, "acker")).unwrap();
    client.publish("acks/1", QoS::AtLeastOnce, b"a", false).unwrap();
    client.publish("acks/2", QoS::ExactlyOnce, b"b", false).unwrap();

    // Both acknowledgements have arrived by the time publish returns.
    let stats = client.stats();
    assert_eq!(stats.published, 2);
    assert_eq!(stats.acknowledged, 2);
    assert_eq!(broker.publishes(), 2);
    client.disconnect().unwrap();
}

#[test]
fn test_wildcard_subscription_keeps_arrival_order() {
    let broker = TestBroker::start();
    let client = new_client(ClientKind::Blocking, options(&broker, "wild")).unwrap();
    subscribed(&client, "sensors/#", QoS::AtLeastOnce);

    for n in 0..5 {
        broker.inject(&format!("sensors/{}", n), QoS::AtLeastOnce, &[n as u8]);
    }
    let inbox = client.inbox().unwrap();
    for n in 0..5u8 {
        let record = inbox.poll_timeout(WAIT).expect("message");
        assert_eq!(record.topic(), format!("sensors/{}", n));
        assert_eq!(record.payload(), &[n]);
    }
    client.disconnect().unwrap();
}

#[test]
fn test_connect_to_closed_port_fails() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let url = format!("tcp://127.0.0.1:{}", port);

    let err = new_client(
        ClientKind::Blocking,
        ConnectOptions::new(url.as_str(), "nobody").with_connect_timeout(Duration::from_secs(1)),
    )
    .unwrap_err();
    assert!(matches!(err, MqttSamplerError::Connection { .. }));

    let client = new_client(ClientKind::Async, ConnectOptions::new(url.as_str(), "nobody-async")).unwrap();
    assert!(wait_until(|| client.state() == ConnectionState::Failed));
    assert!(matches!(
        client.take_error(),
        Some(MqttSamplerError::Connection { .. })
    ));
    assert!(!client.is_connected());
    client.disconnect().unwrap();
}

#[test]
fn test_bad_credentials_are_refused() {
    let broker = TestBroker::with_config(BrokerConfig::default().with_credentials("admin", "admin"));

    let err = new_client(
        ClientKind::Blocking,
        options(&broker, "intruder").with_credentials("admin", "wrong"),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        MqttSamplerError::ConnectionRefused(ConnectReturnCode::BadUserNamePassword)
    ));
    assert!(err.is_security_failure());
    assert_eq!(broker.refused(), 1);

    let client = new_client(
        ClientKind::Blocking,
        options(&broker, "friend").with_credentials("admin", "admin"),
    )
    .unwrap();
    assert!(client.is_connected());
    client.disconnect().unwrap();
}

#[test]
fn test_disconnect_is_idempotent() {
    let broker = TestBroker::start();
    for kind in [ClientKind::Blocking, ClientKind::Async] {
        let client = new_client(kind, options(&broker, &format!("twice-{}", kind))).unwrap();
        assert!(wait_until(|| client.is_connected()));
        let before = broker.disconnects();

        client.disconnect().unwrap();
        client.disconnect().unwrap();
        assert!(!client.is_connected());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(broker.wait_for(WAIT, |b| b.disconnects() == before + 1));
    }
}

#[test]
fn test_denied_subscription_is_security_failure() {
    let broker = TestBroker::with_config(BrokerConfig::default().deny("secret/#"));

    let client = new_client(ClientKind::Blocking, options(&broker, "nosy")).unwrap();
    match client.subscribe("secret/#", QoS::AtMostOnce) {
        Err(MqttSamplerError::Subscribe { cause, topic, .. }) => {
            assert_eq!(cause, FailureCause::Security);
            assert_eq!(topic, "secret/#");
        }
        other => panic!("expected subscribe failure, got {:?}", other),
    }
    client.disconnect().unwrap();

    let client = new_client(ClientKind::Async, options(&broker, "nosy-async")).unwrap();
    assert_eq!(client.subscribe("secret/#", QoS::AtMostOnce).unwrap(), QoS::AtMostOnce);
    assert!(wait_until(|| client.stats().subscribed == 1));
    let err = client.take_error().expect("recorded rejection");
    assert!(err.is_security_failure());
    client.disconnect().unwrap();
}

#[test]
fn test_disconnect_closes_inbox() {
    let broker = TestBroker::start();
    let client = new_client(ClientKind::Blocking, options(&broker, "closer")).unwrap();
    subscribed(&client, "close/me", QoS::AtMostOnce);
    let inbox = client.inbox().unwrap();
    assert!(!inbox.buffer().is_closed());

    client.disconnect().unwrap();
    assert!(inbox.buffer().is_closed());
    assert!(client.poll_one().is_none());
}

#[test]
fn test_full_buffer_does_not_block_disconnect() {
    let broker = TestBroker::start();
    let client = new_client(
        ClientKind::Blocking,
        options(&broker, "slow-reader").with_buffer_capacity(1),
    )
    .unwrap();
    subscribed(&client, "flood", QoS::AtMostOnce);

    for n in 0..5u8 {
        broker.inject("flood", QoS::AtMostOnce, &[n]);
    }
    let inbox = client.inbox().unwrap();
    assert!(wait_until(|| inbox.buffer().len() == 1));

    let started = Instant::now();
    client.disconnect().unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(inbox.buffer().total_accepted(), 1);
}

#[test]
fn test_resubscribe_swaps_inbox() {
    let broker = TestBroker::start();
    let client = new_client(ClientKind::Blocking, options(&broker, "swapper")).unwrap();
    subscribed(&client, "first", QoS::AtMostOnce);
    let first = client.inbox().unwrap();

    subscribed(&client, "second", QoS::AtMostOnce);
    let second = client.inbox().unwrap();
    broker.inject("second", QoS::AtMostOnce, b"new");

    let record = second.poll_timeout(WAIT).expect("message on new inbox");
    assert_eq!(record.payload(), b"new");
    assert!(first.poll_one().is_none());
    client.disconnect().unwrap();
}
