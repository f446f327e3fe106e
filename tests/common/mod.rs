//! In-process MQTT 3.1.1 broker for integration tests
//!
//! Frames packets with rumqttc's own codec over blocking std sockets, one
//! thread per connection. Supports just what the samplers exercise:
//! CONNECT with optional credentials, SUBSCRIBE with a deny list,
//! PUBLISH fan-out at QoS 0/1/2, UNSUBSCRIBE, PINGREQ and DISCONNECT.
//! There are no retained messages and no persistent sessions.

#![allow(dead_code)]

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::Mutex;
use rumqttc::mqttbytes::v4::{
    self, ConnAck, ConnectReturnCode, Packet, PingResp, PubAck, PubComp, PubRec,
    PubRel, Publish, SubAck, SubscribeReasonCode, UnsubAck,
};
use rumqttc::mqttbytes::{matches, Error as CodecError};
use rumqttc::QoS;

const MAX_PACKET_SIZE: usize = 1024 * 1024;
const READ_POLL: Duration = Duration::from_millis(50);

/// Broker behaviour knobs.
#[derive(Debug, Clone, Default)]
pub struct BrokerConfig {
    /// When set, CONNECT must carry exactly these credentials.
    pub credentials: Option<(String, String)>,
    /// Topic filters answered with a SUBACK failure.
    pub deny: Vec<String>,
}

impl BrokerConfig {
    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.to_string(), password.to_string()));
        self
    }

    pub fn deny(mut self, filter: &str) -> Self {
        self.deny.push(filter.to_string());
        self
    }
}

struct Peer {
    client_id: String,
    writer: Mutex<TcpStream>,
    filters: Mutex<Vec<(String, QoS)>>,
    next_pkid: AtomicU16,
}

impl Peer {
    fn send(&self, write: impl FnOnce(&mut BytesMut) -> Result<usize, CodecError>) {
        let mut buf = BytesMut::new();
        if write(&mut buf).is_err() {
            return;
        }
        let _ = self.writer.lock().write_all(&buf);
    }

    fn pkid(&self) -> u16 {
        loop {
            let pkid = self.next_pkid.fetch_add(1, Ordering::SeqCst);
            if pkid != 0 {
                return pkid;
            }
        }
    }

    fn granted(&self, topic: &str) -> Option<QoS> {
        self.filters
            .lock()
            .iter()
            .filter(|(filter, _)| matches(topic, filter))
            .map(|(_, qos)| *qos)
            .max_by_key(|qos| *qos as u8)
    }
}

#[derive(Default)]
struct Counters {
    connections: AtomicUsize,
    refused: AtomicUsize,
    disconnects: AtomicUsize,
    publishes: AtomicUsize,
    subscribes: AtomicUsize,
}

struct Shared {
    config: BrokerConfig,
    peers: Mutex<Vec<Arc<Peer>>>,
    streams: Mutex<Vec<TcpStream>>,
    stop: AtomicBool,
    counters: Counters,
}

/// A running test broker. Stops when dropped.
pub struct TestBroker {
    port: u16,
    shared: Arc<Shared>,
    accept: Option<JoinHandle<()>>,
}

impl TestBroker {
    /// Starts an open broker on an ephemeral port.
    pub fn start() -> Self {
        Self::with_config(BrokerConfig::default())
    }

    pub fn with_config(config: BrokerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test broker");
        let port = listener.local_addr().expect("local addr").port();
        let shared = Arc::new(Shared {
            config,
            peers: Mutex::new(Vec::new()),
            streams: Mutex::new(Vec::new()),
            stop: AtomicBool::new(false),
            counters: Counters::default(),
        });

        let accept_shared = Arc::clone(&shared);
        let accept = thread::Builder::new()
            .name("test-broker-accept".to_string())
            .spawn(move || accept_loop(listener, accept_shared))
            .expect("spawn accept thread");

        Self {
            port,
            shared,
            accept: Some(accept),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self) -> String {
        format!("tcp://127.0.0.1:{}", self.port)
    }

    /// Successful CONNECTs so far.
    pub fn connections(&self) -> usize {
        self.shared.counters.connections.load(Ordering::SeqCst)
    }

    /// CONNECTs answered with a refusal.
    pub fn refused(&self) -> usize {
        self.shared.counters.refused.load(Ordering::SeqCst)
    }

    /// DISCONNECT packets received.
    pub fn disconnects(&self) -> usize {
        self.shared.counters.disconnects.load(Ordering::SeqCst)
    }

    /// PUBLISH packets received from clients.
    pub fn publishes(&self) -> usize {
        self.shared.counters.publishes.load(Ordering::SeqCst)
    }

    /// SUBSCRIBE packets received.
    pub fn subscribes(&self) -> usize {
        self.shared.counters.subscribes.load(Ordering::SeqCst)
    }

    /// Clients currently connected.
    pub fn connected_clients(&self) -> Vec<String> {
        self.shared
            .peers
            .lock()
            .iter()
            .map(|peer| peer.client_id.clone())
            .collect()
    }

    /// Waits until `probe` holds or `timeout` passes.
    pub fn wait_for(&self, timeout: Duration, probe: impl Fn(&TestBroker) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if probe(self) {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        probe(self)
    }

    /// Publishes from the broker itself, as if another client had.
    pub fn inject(&self, topic: &str, qos: QoS, payload: &[u8]) {
        fan_out(&self.shared, &Publish::new(topic, qos, payload.to_vec()));
    }

    /// Drops every client connection without a DISCONNECT.
    pub fn kick_all(&self) {
        for stream in self.shared.streams.lock().drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        // Wake the blocking accept.
        let _ = TcpStream::connect(("127.0.0.1", self.port));
        self.kick_all();
        if let Some(accept) = self.accept.take() {
            let _ = accept.join();
        }
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    for stream in listener.incoming() {
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }
        let Ok(stream) = stream else { continue };
        if let Ok(clone) = stream.try_clone() {
            shared.streams.lock().push(clone);
        }
        let conn_shared = Arc::clone(&shared);
        let _ = thread::Builder::new()
            .name("test-broker-conn".to_string())
            .spawn(move || serve(stream, conn_shared));
    }
}

fn read_packet(stream: &mut TcpStream, buf: &mut BytesMut, shared: &Shared) -> Option<Packet> {
    let mut chunk = [0u8; 4096];
    loop {
        match v4::read(buf, MAX_PACKET_SIZE) {
            Ok(packet) => return Some(packet),
            Err(CodecError::InsufficientBytes(_)) => {}
            Err(_) => return None,
        }
        match stream.read(&mut chunk) {
            Ok(0) => return None,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                if shared.stop.load(Ordering::SeqCst) {
                    return None;
                }
            }
            Err(_) => return None,
        }
    }
}

fn serve(mut stream: TcpStream, shared: Arc<Shared>) {
    let _ = stream.set_read_timeout(Some(READ_POLL));
    let _ = stream.set_nodelay(true);
    let mut buf = BytesMut::with_capacity(4096);

    let Some(Packet::Connect(connect)) = read_packet(&mut stream, &mut buf, &shared) else {
        let _ = stream.shutdown(Shutdown::Both);
        return;
    };
    let Ok(writer) = stream.try_clone() else { return };
    let peer = Arc::new(Peer {
        client_id: connect.client_id.clone(),
        writer: Mutex::new(writer),
        filters: Mutex::new(Vec::new()),
        next_pkid: AtomicU16::new(1),
    });

    if let Some((username, password)) = &shared.config.credentials {
        let accepted = connect
            .login
            .as_ref()
            .is_some_and(|login| &login.username == username && &login.password == password);
        if !accepted {
            shared.counters.refused.fetch_add(1, Ordering::SeqCst);
            peer.send(|b| ConnAck::new(ConnectReturnCode::BadUserNamePassword, false).write(b));
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
    }

    {
        // A new CONNECT with a live client id takes over that session.
        let mut peers = shared.peers.lock();
        peers.retain(|other| {
            if other.client_id == peer.client_id {
                let _ = other.writer.lock().shutdown(Shutdown::Both);
                false
            } else {
                true
            }
        });
        peers.push(Arc::clone(&peer));
    }
    shared.counters.connections.fetch_add(1, Ordering::SeqCst);
    peer.send(|b| ConnAck::new(ConnectReturnCode::Success, false).write(b));

    while let Some(packet) = read_packet(&mut stream, &mut buf, &shared) {
        match packet {
            Packet::Subscribe(subscribe) => {
                shared.counters.subscribes.fetch_add(1, Ordering::SeqCst);
                let mut codes = Vec::with_capacity(subscribe.filters.len());
                for filter in subscribe.filters {
                    if shared.config.deny.iter().any(|d| d == &filter.path) {
                        codes.push(SubscribeReasonCode::Failure);
                    } else {
                        peer.filters.lock().push((filter.path, filter.qos));
                        codes.push(SubscribeReasonCode::Success(filter.qos));
                    }
                }
                peer.send(|b| SubAck::new(subscribe.pkid, codes).write(b));
            }
            Packet::Unsubscribe(unsubscribe) => {
                peer.filters
                    .lock()
                    .retain(|(filter, _)| !unsubscribe.topics.contains(filter));
                peer.send(|b| UnsubAck::new(unsubscribe.pkid).write(b));
            }
            Packet::Publish(publish) => {
                shared.counters.publishes.fetch_add(1, Ordering::SeqCst);
                match publish.qos {
                    QoS::AtMostOnce => {}
                    QoS::AtLeastOnce => peer.send(|b| PubAck::new(publish.pkid).write(b)),
                    QoS::ExactlyOnce => peer.send(|b| PubRec::new(publish.pkid).write(b)),
                }
                fan_out(&shared, &publish);
            }
            Packet::PubRel(pubrel) => peer.send(|b| PubComp::new(pubrel.pkid).write(b)),
            Packet::PubRec(pubrec) => peer.send(|b| PubRel::new(pubrec.pkid).write(b)),
            Packet::PubAck(_) | Packet::PubComp(_) => {}
            Packet::PingReq => peer.send(|b| PingResp.write(b)),
            Packet::Disconnect => {
                shared.counters.disconnects.fetch_add(1, Ordering::SeqCst);
                break;
            }
            _ => break,
        }
    }

    shared.peers.lock().retain(|other| !Arc::ptr_eq(other, &peer));
    let _ = stream.shutdown(Shutdown::Both);
}

fn fan_out(shared: &Shared, publish: &Publish) {
    let peers: Vec<Arc<Peer>> = shared.peers.lock().clone();
    for peer in peers {
        let Some(granted) = peer.granted(&publish.topic) else {
            continue;
        };
        let qos = if (granted as u8) < (publish.qos as u8) {
            granted
        } else {
            publish.qos
        };
        let mut outgoing = Publish::from_bytes(publish.topic.clone(), qos, publish.payload.clone());
        if outgoing.qos != QoS::AtMostOnce {
            outgoing.pkid = peer.pkid();
        }
        peer.send(|b| outgoing.write(b));
    }
}
