//! Integration tests for the samplers and the load runner

#[path = "../common/mod.rs"]
mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{BrokerConfig, TestBroker};
use mqtt_sampler::client::{new_client, ClientKind, ConnectOptions};
use mqtt_sampler::config::{
    ConnectionConfig, LoadPlan, MessageSource, Mode, PublisherConfig, SubscriberConfig,
};
use mqtt_sampler::registry::ClientRegistry;
use mqtt_sampler::runner::LoadRunner;
use mqtt_sampler::sampler::{InterruptFlag, PublisherSampler, SubscriberSampler};
use rumqttc::QoS;

const WAIT: Duration = Duration::from_secs(5);

fn connection(broker: &TestBroker, kind: ClientKind) -> ConnectionConfig {
    ConnectionConfig {
        broker_url: broker.url(),
        username: None,
        password: None,
        client_type: kind,
        connect_timeout_secs: 2,
        ..ConnectionConfig::default()
    }
}

fn subscriber_config(topic: &str, timeout_secs: u64) -> SubscriberConfig {
    SubscriberConfig {
        topic: topic.to_string(),
        qos: QoS::AtLeastOnce,
        timeout_secs,
        poll_interval_ms: 20,
        ..SubscriberConfig::default()
    }
}

#[test]
fn test_subscriber_sample_receives_one_message() {
    for kind in [ClientKind::Blocking, ClientKind::Async] {
        let broker = TestBroker::start();
        let registry = Arc::new(ClientRegistry::new());
        let mut sampler = SubscriberSampler::new(
            connection(&broker, kind),
            subscriber_config("samples/in", 5),
            format!("sub-{}", kind),
            Arc::clone(&registry),
            InterruptFlag::new(),
        );
        sampler.thread_started().unwrap();

        let sampling = thread::spawn(move || {
            let result = sampler.sample();
            (sampler, result)
        });

        assert!(broker.wait_for(WAIT, |b| b.subscribes() == 1));
        // SUBACK may still be in flight; the filter is registered first.
        thread::sleep(Duration::from_millis(50));
        broker.inject("samples/in", QoS::AtLeastOnce, b"payload");

        let (mut sampler, result) = sampling.join().unwrap();
        assert!(result.success, "{}", result.response_message);
        assert_eq!(result.response_code, "OK");
        assert!(result.response_message.starts_with("Received 1 messages."));
        assert!(result.response_message.contains("Current message QOS : 1"));
        assert_eq!(result.response_data, b"payload");
        assert_eq!(registry.len(), 1);

        // The second sample reuses the subscribed client.
        broker.inject("samples/in", QoS::AtLeastOnce, b"again");
        let result = sampler.sample();
        assert!(result.success);
        assert!(result.response_message.starts_with("Received 2 messages."));
        assert_eq!(broker.connections(), 1);

        sampler.thread_finished();
        assert!(registry.is_empty());
        assert!(sampler.test_ended().is_empty());
    }
}

#[test]
fn test_subscriber_sample_times_out() {
    let broker = TestBroker::start();
    let registry = Arc::new(ClientRegistry::new());
    let mut sampler = SubscriberSampler::new(
        connection(&broker, ClientKind::Blocking),
        subscriber_config("samples/silent", 1),
        "sub-timeout",
        Arc::clone(&registry),
        InterruptFlag::new(),
    );
    sampler.thread_started().unwrap();

    let started = Instant::now();
    let result = sampler.sample();
    let elapsed = started.elapsed();
    assert!(!result.success);
    assert_eq!(result.response_code, "FAILED");
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(4));

    // The poll loop disconnected the client exactly once.
    assert!(broker.wait_for(WAIT, |b| b.disconnects() == 1));
    let client = sampler.client().expect("client kept until thread end");
    assert!(!client.is_connected());

    sampler.thread_finished();
    assert!(registry.is_empty());
    assert_eq!(broker.disconnects(), 1);
}

#[test]
fn test_subscriber_interrupt_ends_unbounded_sample() {
    let broker = TestBroker::start();
    let interrupt = InterruptFlag::new();
    let mut sampler = SubscriberSampler::new(
        connection(&broker, ClientKind::Blocking),
        subscriber_config("samples/forever", 0),
        "sub-interrupt",
        Arc::new(ClientRegistry::new()),
        interrupt.clone(),
    );
    sampler.thread_started().unwrap();

    let sampling = thread::spawn(move || {
        let result = sampler.sample();
        sampler.thread_finished();
        result
    });
    assert!(broker.wait_for(WAIT, |b| b.subscribes() == 1));
    assert!(interrupt.raise());

    let result = sampling.join().unwrap();
    assert!(!result.success);
    assert!(broker.wait_for(WAIT, |b| b.disconnects() == 1));
}

#[test]
fn test_subscriber_denied_topic_fails_every_sample_fast() {
    for kind in [ClientKind::Blocking, ClientKind::Async] {
        let broker = TestBroker::with_config(BrokerConfig::default().deny("private/#"));
        let registry = Arc::new(ClientRegistry::new());
        let mut sampler = SubscriberSampler::new(
            connection(&broker, kind),
            subscriber_config("private/#", 3),
            format!("sub-denied-{}", kind),
            Arc::clone(&registry),
            InterruptFlag::new(),
        );
        sampler.thread_started().unwrap();

        for attempt in 1..=2 {
            let started = Instant::now();
            let result = sampler.sample();
            assert!(!result.success, "{} sample {}", kind, attempt);
            assert!(
                result.response_message.starts_with("Client is not connected."),
                "{} sample {}: {}",
                kind,
                attempt,
                result.response_message
            );
            // Fails on the SUBACK, well before the receive timeout.
            assert!(started.elapsed() < Duration::from_secs(2));
            assert!(sampler.client().is_none());
            assert!(registry.is_empty());
        }
        // The rejected client was dropped, so the second sample subscribed again.
        assert_eq!(broker.subscribes(), 2);
        assert_eq!(broker.connections(), 2);

        sampler.thread_finished();
        assert!(registry.is_empty());
    }
}

#[test]
fn test_subscriber_background_returns_immediately() {
    let broker = TestBroker::start();
    let registry = Arc::new(ClientRegistry::new());
    let mut config = subscriber_config("samples/background", 1);
    config.background = true;
    let mut sampler = SubscriberSampler::new(
        connection(&broker, ClientKind::Blocking),
        config,
        "sub-background",
        Arc::clone(&registry),
        InterruptFlag::new(),
    );
    sampler.thread_started().unwrap();

    let started = Instant::now();
    let result = sampler.sample();
    assert!(result.success);
    assert!(result.response_message.starts_with("Subscriber started on another thread"));
    assert!(started.elapsed() < Duration::from_secs(1));

    broker.inject("samples/background", QoS::AtMostOnce, b"logged");
    // The side thread stops at its timeout and disconnects.
    assert!(broker.wait_for(WAIT, |b| b.disconnects() == 1));
    sampler.thread_finished();
    assert!(sampler.test_ended().is_empty());
}

#[test]
fn test_invalid_subscriber_settings_fail_thread_start() {
    let mut sampler = SubscriberSampler::new(
        ConnectionConfig::default(),
        subscriber_config("  ", 1),
        "sub-invalid",
        Arc::new(ClientRegistry::new()),
        InterruptFlag::new(),
    );
    assert!(sampler.thread_started().is_err());
}

#[test]
fn test_publisher_samples_reach_subscriber() {
    let broker = TestBroker::start();
    let listener = new_client(
        ClientKind::Blocking,
        ConnectOptions::new(broker.url(), "listener"),
    )
    .unwrap();
    listener.subscribe("samples/out", QoS::ExactlyOnce).unwrap();

    let registry = Arc::new(ClientRegistry::new());
    let config = PublisherConfig {
        topic: "samples/out".to_string(),
        qos: QoS::ExactlyOnce,
        retained: false,
        message: MessageSource::Text("reading=42".to_string()),
    };
    let mut sampler = PublisherSampler::new(
        connection(&broker, ClientKind::Blocking),
        config,
        "publisher",
        Arc::clone(&registry),
    );
    sampler.thread_started().unwrap();
    assert_eq!(registry.len(), 1);

    for n in 1..=3 {
        let result = sampler.sample();
        assert!(result.success, "{}", result.response_message);
        assert_eq!(result.response_message, format!("Sent {} messages total", n));
        assert_eq!(result.bytes, "reading=42".len());
    }
    assert_eq!(sampler.published(), 3);

    let inbox = listener.inbox().unwrap();
    for _ in 0..3 {
        let record = inbox.poll_timeout(WAIT).expect("published message");
        assert_eq!(record.payload(), b"reading=42");
        assert_eq!(record.qos(), QoS::ExactlyOnce);
    }

    sampler.thread_finished();
    assert!(registry.is_empty());
    listener.disconnect().unwrap();
}

#[test]
fn test_publisher_payload_from_file() {
    let broker = TestBroker::start();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("payload.bin");
    std::fs::write(&path, [0u8, 159, 146, 150]).unwrap();

    let config = PublisherConfig {
        message: MessageSource::File(path),
        ..PublisherConfig::default()
    };
    let mut sampler = PublisherSampler::new(
        connection(&broker, ClientKind::Async),
        config,
        "file-publisher",
        Arc::new(ClientRegistry::new()),
    );
    sampler.thread_started().unwrap();
    let result = sampler.sample();
    assert!(result.success, "{}", result.response_message);
    assert_eq!(result.bytes, 4);
    assert!(broker.wait_for(WAIT, |b| b.publishes() == 1));
    sampler.thread_finished();
}

#[test]
fn test_publisher_reconnects_after_connection_loss() {
    let broker = TestBroker::start();
    let registry = Arc::new(ClientRegistry::new());
    let mut sampler = PublisherSampler::new(
        connection(&broker, ClientKind::Blocking),
        PublisherConfig::default(),
        "phoenix",
        Arc::clone(&registry),
    );
    sampler.thread_started().unwrap();
    assert!(sampler.sample().success);

    broker.kick_all();
    let first = Arc::clone(sampler.client().unwrap());
    assert!(broker.wait_for(WAIT, |_| !first.is_open()));

    let result = sampler.sample();
    assert!(result.success, "{}", result.response_message);
    assert_eq!(broker.connections(), 2);
    assert_eq!(registry.len(), 1);
    sampler.thread_finished();
}

#[test]
fn test_runner_publish_plan() {
    let broker = TestBroker::start();
    let mut plan = LoadPlan {
        mode: Mode::Publish,
        threads: 3,
        iterations: 2,
        connection: connection(&broker, ClientKind::Blocking),
        ..LoadPlan::default()
    };
    plan.connection.client_id = "bench".to_string();
    plan.publisher.qos = QoS::AtLeastOnce;
    plan.publisher.message = MessageSource::Text("x".repeat(16));

    let runner = LoadRunner::new(plan).unwrap();
    let summary = runner.run().unwrap();
    assert!(summary.is_success(), "{:?}", summary);
    assert_eq!(summary.samples, 6);
    assert_eq!(summary.successes, 6);
    assert_eq!(summary.bytes, 6 * 16);
    assert_eq!(broker.publishes(), 6);
    assert!(runner.registry().is_empty());
    assert!(broker.wait_for(WAIT, |b| b.disconnects() == 3));
}

#[test]
fn test_runner_subscribe_plan_times_out_cleanly() {
    let broker = TestBroker::start();
    let plan = LoadPlan {
        mode: Mode::Subscribe,
        threads: 2,
        iterations: 1,
        connection: connection(&broker, ClientKind::Async),
        subscriber: subscriber_config("nobody/publishes", 1),
        ..LoadPlan::default()
    };

    let summary = LoadRunner::new(plan).unwrap().run().unwrap();
    assert_eq!(summary.samples, 2);
    assert_eq!(summary.failures, 2);
    assert!(summary.teardown_errors.is_empty());
    assert!(broker.wait_for(WAIT, |b| b.connected_clients().is_empty()));
}
