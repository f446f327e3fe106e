//! Session state shared between a client handle and its network thread
//!
//! The network thread feeds every `rumqttc` event into
//! [`Session::handle_event`]. That call is the message-arrival callback: it
//! turns inbound PUBLISH packets into [`MessageRecord`]s and pushes them into
//! the current [`Inbox`], and it records connection state and
//! acknowledgements so the driver thread can wait on them.
//!
//! Nothing raised on the network thread crosses back as a panic or a
//! returned error. Failures are logged and parked in an error side channel
//! that the driver drains with [`Session::take_error`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use rumqttc::{ConnectReturnCode, ConnectionError, Event, Outgoing, Packet, SubscribeReasonCode};
use tracing::{debug, info, warn};

use crate::buffer::Inbox;
use crate::error::{FailureCause, MqttSamplerError};
use crate::message::MessageRecord;
use crate::util::format_payload_preview;

/// Errors kept for [`Session::take_error`]; older ones are dropped first.
const MAX_PENDING_ERRORS: usize = 64;

/// Lifecycle of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Counters describing what a session has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// PUBLISH packets handed to the network.
    pub published: u64,
    /// QoS 1 and 2 publishes completed by PUBACK or PUBCOMP.
    pub acknowledged: u64,
    /// SUBACKs received.
    pub subscribed: u64,
    /// Inbound PUBLISH packets accepted into an inbox.
    pub received: u64,
    /// Inbound PUBLISH packets dropped because the inbox was closed or absent.
    pub dropped: u64,
}

struct SessionInner {
    state: ConnectionState,
    ever_connected: bool,
    link_up: bool,
    last_failure: Option<String>,
    refused: Option<ConnectReturnCode>,
    errors: VecDeque<MqttSamplerError>,

    publishes_sent: u64,
    last_publish_pkid: u16,
    completed_pkids: HashSet<u16>,
    acknowledged: u64,

    subscribes_sent: u64,
    last_subscribe_pkid: u16,
    pending_topics: VecDeque<String>,
    subscribe_topics: HashMap<u16, String>,
    subacks: HashMap<u16, Vec<SubscribeReasonCode>>,
    subscribed: u64,
    subscription_rejected: bool,
}

/// Connection state, acknowledgement bookkeeping and the current inbox for
/// one client.
pub struct Session {
    client_id: String,
    broker_url: String,
    buffer_capacity: usize,
    auto_reconnect: bool,
    inner: Mutex<SessionInner>,
    changed: Condvar,
    inbox: RwLock<Option<Arc<Inbox>>>,
    closing: AtomicBool,
    received: AtomicU64,
    dropped: AtomicU64,
}

impl Session {
    pub fn new(
        client_id: impl Into<String>,
        broker_url: impl Into<String>,
        buffer_capacity: usize,
        auto_reconnect: bool,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            broker_url: broker_url.into(),
            buffer_capacity,
            auto_reconnect,
            inner: Mutex::new(SessionInner {
                state: ConnectionState::Connecting,
                ever_connected: false,
                link_up: false,
                last_failure: None,
                refused: None,
                errors: VecDeque::new(),
                publishes_sent: 0,
                last_publish_pkid: 0,
                completed_pkids: HashSet::new(),
                acknowledged: 0,
                subscribes_sent: 0,
                last_subscribe_pkid: 0,
                pending_topics: VecDeque::new(),
                subscribe_topics: HashMap::new(),
                subacks: HashMap::new(),
                subscribed: 0,
                subscription_rejected: false,
            }),
            changed: Condvar::new(),
            inbox: RwLock::new(None),
            closing: AtomicBool::new(false),
            received: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn broker_url(&self) -> &str {
        &self.broker_url
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        !self.is_closing() && self.state() == ConnectionState::Connected
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Marks the session as shutting down and closes the current inbox.
    ///
    /// Closing the inbox wakes a network thread blocked on a full buffer.
    /// Returns `false` if the session was already closing.
    pub fn begin_close(&self) -> bool {
        if self.closing.swap(true, Ordering::AcqRel) {
            return false;
        }
        {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Connected
                || inner.state == ConnectionState::Connecting
            {
                inner.state = ConnectionState::Disconnecting;
            }
        }
        self.changed.notify_all();
        if let Some(inbox) = self.inbox.read().as_ref() {
            inbox.buffer().close();
        }
        true
    }

    /// Records the end of the network loop.
    pub fn mark_stopped(&self) {
        let mut inner = self.inner.lock();
        if inner.state != ConnectionState::Failed {
            inner.state = ConnectionState::Disconnected;
        }
        drop(inner);
        self.changed.notify_all();
    }

    /// True when the network loop should exit without polling again.
    ///
    /// A closing session with a live link keeps polling so the DISCONNECT
    /// request gets written.
    pub fn should_stop(&self) -> bool {
        self.is_closing() && !self.inner.lock().link_up
    }

    /// Swaps in a fresh inbox for a new subscription and returns it.
    ///
    /// A previous inbox is left open so a reader still holding it can drain it.
    pub fn attach_inbox(&self) -> Arc<Inbox> {
        self.inner.lock().subscription_rejected = false;
        let inbox = Arc::new(Inbox::new(self.buffer_capacity));
        *self.inbox.write() = Some(Arc::clone(&inbox));
        if self.is_closing() {
            inbox.buffer().close();
        }
        inbox
    }

    pub fn inbox(&self) -> Option<Arc<Inbox>> {
        self.inbox.read().clone()
    }

    /// True when the broker refused the latest subscription.
    pub fn subscription_rejected(&self) -> bool {
        self.inner.lock().subscription_rejected
    }

    /// Oldest error recorded on the network thread, if any.
    pub fn take_error(&self) -> Option<MqttSamplerError> {
        self.inner.lock().errors.pop_front()
    }

    pub fn stats(&self) -> SessionStats {
        let inner = self.inner.lock();
        SessionStats {
            published: inner.publishes_sent,
            acknowledged: inner.acknowledged,
            subscribed: inner.subscribed,
            received: self.received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Processes one event from the network layer.
    ///
    /// Returns `Break` once the session has sent DISCONNECT and the loop
    /// should end.
    pub fn handle_event(&self, event: Event) -> ControlFlow<()> {
        match event {
            Event::Incoming(Packet::ConnAck(connack)) => {
                let mut inner = self.inner.lock();
                if connack.code == ConnectReturnCode::Success {
                    inner.state = ConnectionState::Connected;
                    inner.ever_connected = true;
                    inner.link_up = true;
                    inner.last_failure = None;
                    drop(inner);
                    info!(
                        "Client {} connected to {} (session present: {})",
                        self.client_id, self.broker_url, connack.session_present
                    );
                } else {
                    inner.refused = Some(connack.code);
                    inner.state = ConnectionState::Failed;
                    self.push_error(&mut inner, MqttSamplerError::ConnectionRefused(connack.code));
                }
            }
            Event::Incoming(Packet::Publish(publish)) => {
                let record = MessageRecord::from_publish(&publish);
                debug!(
                    "Client {} received on {}: {}",
                    self.client_id,
                    record.topic(),
                    format_payload_preview(record.payload())
                );
                self.deliver(record);
                // No state change to announce.
                return ControlFlow::Continue(());
            }
            Event::Incoming(Packet::PubAck(ack)) => self.complete_publish(ack.pkid),
            Event::Incoming(Packet::PubComp(comp)) => self.complete_publish(comp.pkid),
            Event::Incoming(Packet::SubAck(suback)) => {
                let mut inner = self.inner.lock();
                inner.subscribed += 1;
                let topic = inner
                    .subscribe_topics
                    .remove(&suback.pkid)
                    .unwrap_or_default();
                if suback
                    .return_codes
                    .iter()
                    .any(|code| *code == SubscribeReasonCode::Failure)
                {
                    warn!(
                        "Client {}: broker rejected subscription to '{}'",
                        self.client_id, topic
                    );
                    self.push_error(
                        &mut inner,
                        MqttSamplerError::Subscribe {
                            topic,
                            cause: FailureCause::Security,
                            reason: "rejected by broker".to_string(),
                        },
                    );
                    inner.subscription_rejected = true;
                    // Nothing will arrive; wake whoever is polling the inbox.
                    if let Some(inbox) = self.inbox.read().as_ref() {
                        inbox.buffer().close();
                    }
                } else {
                    debug!("Client {} subscribed to '{}'", self.client_id, topic);
                }
                inner.subacks.insert(suback.pkid, suback.return_codes);
            }
            Event::Outgoing(Outgoing::Publish(pkid)) => {
                let mut inner = self.inner.lock();
                inner.publishes_sent += 1;
                inner.last_publish_pkid = pkid;
                inner.completed_pkids.remove(&pkid);
            }
            Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                let mut inner = self.inner.lock();
                inner.subscribes_sent += 1;
                inner.last_subscribe_pkid = pkid;
                inner.subacks.remove(&pkid);
                if let Some(topic) = inner.pending_topics.pop_front() {
                    inner.subscribe_topics.insert(pkid, topic);
                }
            }
            Event::Outgoing(Outgoing::Disconnect) => {
                {
                    let mut inner = self.inner.lock();
                    inner.state = ConnectionState::Disconnected;
                    inner.link_up = false;
                }
                self.changed.notify_all();
                info!("Client {} disconnected", self.client_id);
                return ControlFlow::Break(());
            }
            _ => return ControlFlow::Continue(()),
        }
        self.changed.notify_all();
        ControlFlow::Continue(())
    }

    /// Processes a connection error from the network layer.
    ///
    /// Errors before the first CONNACK are fatal. Later ones are fatal unless
    /// auto-reconnect is enabled. Returns `Break` when the loop should end.
    pub fn handle_connection_error(&self, error: &ConnectionError) -> ControlFlow<()> {
        let closing = self.is_closing();
        let mut inner = self.inner.lock();
        inner.link_up = false;

        if closing {
            debug!(
                "Client {} network loop ending during close: {}",
                self.client_id, error
            );
            inner.state = ConnectionState::Disconnected;
            drop(inner);
            self.changed.notify_all();
            return ControlFlow::Break(());
        }

        inner.last_failure = Some(error.to_string());
        let recorded = match error {
            ConnectionError::ConnectionRefused(code) => {
                inner.refused = Some(*code);
                MqttSamplerError::ConnectionRefused(*code)
            }
            other => MqttSamplerError::Connection {
                broker: self.broker_url.clone(),
                reason: other.to_string(),
            },
        };

        let flow = if inner.ever_connected && self.auto_reconnect {
            warn!(
                "Client {} lost connection to {}: {}; reconnecting",
                self.client_id, self.broker_url, error
            );
            inner.state = ConnectionState::Connecting;
            ControlFlow::Continue(())
        } else {
            warn!(
                "Client {} connection to {} failed: {}",
                self.client_id, self.broker_url, error
            );
            inner.state = ConnectionState::Failed;
            ControlFlow::Break(())
        };
        self.push_error(&mut inner, recorded);
        drop(inner);
        self.changed.notify_all();
        flow
    }

    /// Waits for the first CONNACK.
    ///
    /// # Errors
    ///
    /// - [`MqttSamplerError::ConnectionRefused`] if the broker refused the session
    /// - [`MqttSamplerError::Connection`] on transport failure or timeout
    pub fn wait_connected(&self, timeout: Duration) -> Result<(), MqttSamplerError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            match inner.state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting => {}
                _ => break,
            }
            if self.changed.wait_until(&mut inner, deadline).timed_out() {
                if inner.state == ConnectionState::Connected {
                    return Ok(());
                }
                return Err(MqttSamplerError::Connection {
                    broker: self.broker_url.clone(),
                    reason: format!("no CONNACK within {:?}", timeout),
                });
            }
        }
        if inner.state == ConnectionState::Failed {
            // The error is returned directly, not through the side channel.
            inner.errors.pop_back();
        }
        if let Some(code) = inner.refused {
            return Err(MqttSamplerError::ConnectionRefused(code));
        }
        Err(MqttSamplerError::Connection {
            broker: self.broker_url.clone(),
            reason: inner
                .last_failure
                .clone()
                .unwrap_or_else(|| format!("session {}", inner.state)),
        })
    }

    /// Number of PUBLISH packets the network layer has taken so far.
    ///
    /// Read this before sending a publish and pass it to
    /// [`wait_publish_sent`](Self::wait_publish_sent).
    pub fn publish_ticket(&self) -> u64 {
        self.inner.lock().publishes_sent
    }

    /// Waits until the publish issued after `ticket` is written and returns
    /// its packet id (zero for QoS 0).
    pub fn wait_publish_sent(
        &self,
        ticket: u64,
        topic: &str,
        deadline: Instant,
    ) -> Result<u16, MqttSamplerError> {
        let mut inner = self.inner.lock();
        while inner.publishes_sent <= ticket {
            self.check_live(&inner, || publish_error(topic, "connection lost before send"))?;
            if self.changed.wait_until(&mut inner, deadline).timed_out()
                && inner.publishes_sent <= ticket
            {
                return Err(publish_error(topic, "timed out waiting for send"));
            }
        }
        Ok(inner.last_publish_pkid)
    }

    /// Waits for the PUBACK or PUBCOMP that completes `pkid`.
    pub fn wait_publish_complete(
        &self,
        pkid: u16,
        topic: &str,
        deadline: Instant,
    ) -> Result<(), MqttSamplerError> {
        let mut inner = self.inner.lock();
        while !inner.completed_pkids.remove(&pkid) {
            self.check_live(&inner, || {
                publish_error(topic, "connection lost before acknowledgement")
            })?;
            if self.changed.wait_until(&mut inner, deadline).timed_out()
                && !inner.completed_pkids.contains(&pkid)
            {
                return Err(publish_error(topic, "timed out waiting for acknowledgement"));
            }
        }
        Ok(())
    }

    /// Queues `topic` so the next outgoing SUBSCRIBE can be matched to it.
    /// Returns a ticket for [`wait_suback`](Self::wait_suback).
    pub fn prepare_subscribe(&self, topic: &str) -> u64 {
        let mut inner = self.inner.lock();
        inner.pending_topics.push_back(topic.to_string());
        inner.subscribes_sent
    }

    /// Drops a topic queued by [`prepare_subscribe`](Self::prepare_subscribe)
    /// whose request never reached the network layer.
    pub fn cancel_subscribe(&self) {
        self.inner.lock().pending_topics.pop_back();
    }

    /// Waits for the SUBACK answering the subscribe issued after `ticket` and
    /// returns the granted QoS.
    pub fn wait_suback(
        &self,
        ticket: u64,
        topic: &str,
        deadline: Instant,
    ) -> Result<rumqttc::QoS, MqttSamplerError> {
        let mut inner = self.inner.lock();
        loop {
            if inner.subscribes_sent > ticket {
                let pkid = inner.last_subscribe_pkid;
                if let Some(codes) = inner.subacks.remove(&pkid) {
                    // The rejection is returned here, not through the side channel.
                    if let Some(pos) = inner.errors.iter().position(|e| {
                        matches!(e, MqttSamplerError::Subscribe { topic: t, .. } if t == topic)
                    }) {
                        inner.errors.remove(pos);
                    }
                    return match codes.first() {
                        Some(SubscribeReasonCode::Success(qos)) => Ok(*qos),
                        _ => Err(MqttSamplerError::Subscribe {
                            topic: topic.to_string(),
                            cause: FailureCause::Security,
                            reason: "rejected by broker".to_string(),
                        }),
                    };
                }
            }
            self.check_live(&inner, || {
                subscribe_transport_error(topic, "connection lost before SUBACK")
            })?;
            if self.changed.wait_until(&mut inner, deadline).timed_out() {
                let pkid = inner.last_subscribe_pkid;
                if inner.subscribes_sent > ticket && inner.subacks.contains_key(&pkid) {
                    continue;
                }
                return Err(subscribe_transport_error(topic, "timed out waiting for SUBACK"));
            }
        }
    }

    fn check_live(
        &self,
        inner: &SessionInner,
        error: impl FnOnce() -> MqttSamplerError,
    ) -> Result<(), MqttSamplerError> {
        match inner.state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Connecting if inner.ever_connected && !self.is_closing() => Ok(()),
            _ => Err(error()),
        }
    }

    fn complete_publish(&self, pkid: u16) {
        let mut inner = self.inner.lock();
        inner.completed_pkids.insert(pkid);
        inner.acknowledged += 1;
    }

    fn deliver(&self, record: MessageRecord) {
        // Clone the Arc so the lock is not held across a blocking push.
        let inbox = self.inbox.read().clone();
        let Some(inbox) = inbox else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Client {} dropped message on {}: no active subscription",
                self.client_id,
                record.topic()
            );
            return;
        };
        match inbox.buffer().push(record) {
            Ok(()) => {
                self.received.fetch_add(1, Ordering::Relaxed);
            }
            Err(closed) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Client {} dropped message: {}", self.client_id, closed);
            }
        }
    }

    fn push_error(&self, inner: &mut SessionInner, error: MqttSamplerError) {
        if inner.errors.len() >= MAX_PENDING_ERRORS {
            inner.errors.pop_front();
        }
        inner.errors.push_back(error);
    }
}

fn publish_error(topic: &str, reason: &str) -> MqttSamplerError {
    MqttSamplerError::Publish {
        topic: topic.to_string(),
        reason: reason.to_string(),
    }
}

fn subscribe_transport_error(topic: &str, reason: &str) -> MqttSamplerError {
    MqttSamplerError::Subscribe {
        topic: topic.to_string(),
        cause: FailureCause::Transport,
        reason: reason.to_string(),
    }
}
