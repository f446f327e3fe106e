//! Blocking client variant
//!
//! Wraps `rumqttc::Client`. A dedicated network thread iterates the
//! `rumqttc::Connection` and feeds every event into the shared [`Session`];
//! `publish` and `subscribe` block the caller until the broker acknowledges
//! them or the acknowledgement timeout passes.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rumqttc::{Client, Connection, QoS};
use tracing::{debug, info, warn};

use super::options::ConnectOptions;
use super::session::{ConnectionState, Session, SessionStats};
use crate::buffer::Inbox;
use crate::error::{FailureCause, MqttSamplerError};
use crate::message::MessageRecord;
use crate::util::DISCONNECT_TIMEOUT_SECS;

/// Pause before the event loop retries after a dropped connection.
pub(crate) const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Synchronous client: every operation completes before it returns.
pub struct BlockingClient {
    client: Mutex<Option<Client>>,
    session: Arc<Session>,
    network: Mutex<Option<JoinHandle<()>>>,
    publish_lock: Mutex<()>,
    ack_timeout: Duration,
}

impl BlockingClient {
    /// Opens a session and waits for the broker's CONNACK.
    ///
    /// # Errors
    ///
    /// - [`MqttSamplerError::InvalidClientId`] before any network activity
    /// - [`MqttSamplerError::ConnectionRefused`] when the broker refuses the
    ///   credentials or client id
    /// - [`MqttSamplerError::Connection`] on transport failure or when no
    ///   CONNACK arrives within `connect_timeout`
    pub fn connect(options: &ConnectOptions) -> Result<Self, MqttSamplerError> {
        let (mqtt_options, network_options) = options.to_mqtt_options()?;
        let (client, mut connection) = Client::new(mqtt_options, options.request_capacity.max(1));
        connection.eventloop.set_network_options(network_options);

        let session = Arc::new(Session::new(
            options.client_id.clone(),
            options.broker_url.clone(),
            options.buffer_capacity,
            options.auto_reconnect,
        ));

        let network = {
            let session = Arc::clone(&session);
            thread::Builder::new()
                .name(format!("mqtt-net-{}", options.client_id))
                .spawn(move || run_network(connection, session))?
        };

        let client = Self {
            client: Mutex::new(Some(client)),
            session,
            network: Mutex::new(Some(network)),
            publish_lock: Mutex::new(()),
            ack_timeout: options.ack_timeout,
        };

        // The network loop needs one extra poll to report a connect timeout.
        let wait = options.connect_timeout + Duration::from_millis(500);
        if let Err(e) = client.session.wait_connected(wait) {
            warn!(
                "Client {} failed to connect to {}: {}",
                options.client_id, options.broker_url, e
            );
            if let Err(close_error) = client.disconnect() {
                debug!("Cleanup after failed connect: {}", close_error);
            }
            return Err(e);
        }
        Ok(client)
    }

    /// Publishes one message and waits for it to complete at `qos`.
    ///
    /// QoS 0 completes once the packet is written, QoS 1 on PUBACK and QoS 2
    /// on PUBCOMP.
    pub fn publish(
        &self,
        topic: &str,
        qos: QoS,
        payload: &[u8],
        retained: bool,
    ) -> Result<(), MqttSamplerError> {
        let _serialized = self.publish_lock.lock();
        let deadline = Instant::now() + self.ack_timeout;
        let ticket = self.session.publish_ticket();

        self.with_client(|client| client.publish(topic, qos, retained, payload.to_vec()))
            .map_err(|e| MqttSamplerError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        let pkid = self.session.wait_publish_sent(ticket, topic, deadline)?;
        if qos != QoS::AtMostOnce {
            self.session.wait_publish_complete(pkid, topic, deadline)?;
        }
        Ok(())
    }

    /// Subscribes to `topic` and returns the QoS the broker granted.
    ///
    /// A fresh inbox is attached before the SUBSCRIBE goes out so no message
    /// sent in reply to it can be missed.
    pub fn subscribe(&self, topic: &str, qos: QoS) -> Result<QoS, MqttSamplerError> {
        let deadline = Instant::now() + self.ack_timeout;
        self.session.attach_inbox();
        let ticket = self.session.prepare_subscribe(topic);

        if let Err(e) = self.with_client(|client| client.subscribe(topic, qos)) {
            self.session.cancel_subscribe();
            return Err(MqttSamplerError::Subscribe {
                topic: topic.to_string(),
                cause: FailureCause::Transport,
                reason: e.to_string(),
            });
        }

        let granted = self.session.wait_suback(ticket, topic, deadline)?;
        info!(
            "Client {} subscribed to '{}' (granted {:?})",
            self.session.client_id(),
            topic,
            granted
        );
        Ok(granted)
    }

    pub fn poll_one(&self) -> Option<MessageRecord> {
        self.session.inbox().and_then(|inbox| inbox.poll_one())
    }

    pub fn inbox(&self) -> Option<Arc<Inbox>> {
        self.session.inbox()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn stats(&self) -> SessionStats {
        self.session.stats()
    }

    /// Ends the session. Safe to call repeatedly; later calls do nothing.
    ///
    /// The inbox is closed first so a network thread blocked on a full
    /// buffer can observe the DISCONNECT request.
    pub fn disconnect(&self) -> Result<(), MqttSamplerError> {
        if !self.session.begin_close() {
            return Ok(());
        }

        let client = self.client.lock().take();
        if let Some(client) = client {
            let deadline = Instant::now() + Duration::from_secs(DISCONNECT_TIMEOUT_SECS);
            queue_disconnect(&self.session, deadline, || client.try_disconnect());
        }

        let handle = self.network.lock().take();
        join_network(self.session.client_id(), handle)
    }

    fn with_client<T>(
        &self,
        f: impl FnOnce(&Client) -> Result<T, rumqttc::ClientError>,
    ) -> Result<T, MqttSamplerError> {
        // Clone so a blocking send does not hold the lock against disconnect.
        let client = self.client.lock().clone();
        match client {
            Some(client) => Ok(f(&client)?),
            None => Err(MqttSamplerError::InvalidArgument(format!(
                "client {} is disconnected",
                self.session.client_id()
            ))),
        }
    }
}

impl Drop for BlockingClient {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            warn!("Error dropping client {}: {}", self.session.client_id(), e);
        }
    }
}

fn run_network(mut connection: Connection, session: Arc<Session>) {
    for notification in connection.iter() {
        let flow = match notification {
            Ok(event) => session.handle_event(event),
            Err(e) => {
                let flow = session.handle_connection_error(&e);
                if flow.is_continue() {
                    thread::sleep(RECONNECT_DELAY);
                }
                flow
            }
        };
        if flow.is_break() || session.should_stop() {
            break;
        }
    }
    session.mark_stopped();
    debug!("Network loop for {} stopped", session.client_id());
}

/// Queues a DISCONNECT request, retrying while the request channel is full.
///
/// The event loop keeps its own sender, so dropping the client does not end
/// it; the request has to get through. Gives up at `deadline`, or as soon as
/// the link is down and the loop stops by itself. Returns whether the
/// request was queued.
pub(crate) fn queue_disconnect(
    session: &Session,
    deadline: Instant,
    mut send: impl FnMut() -> Result<(), rumqttc::ClientError>,
) -> bool {
    loop {
        let Err(e) = send() else {
            return true;
        };
        let stopped = session.should_stop()
            || matches!(
                session.state(),
                ConnectionState::Disconnected | ConnectionState::Failed
            );
        if stopped || Instant::now() >= deadline {
            debug!(
                "Client {} could not queue DISCONNECT: {}",
                session.client_id(),
                e
            );
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// Waits up to [`DISCONNECT_TIMEOUT_SECS`] for a network thread to finish.
pub(crate) fn join_network(
    client_id: &str,
    handle: Option<JoinHandle<()>>,
) -> Result<(), MqttSamplerError> {
    let Some(handle) = handle else {
        return Ok(());
    };
    let deadline = Instant::now() + Duration::from_secs(DISCONNECT_TIMEOUT_SECS);
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!(
                "Network thread for {} did not stop within {}s; detaching",
                client_id, DISCONNECT_TIMEOUT_SECS
            );
            return Err(MqttSamplerError::Close {
                client_id: client_id.to_string(),
                reason: format!(
                    "network thread still running after {}s",
                    DISCONNECT_TIMEOUT_SECS
                ),
            });
        }
        thread::sleep(Duration::from_millis(10));
    }
    handle.join().map_err(|_| MqttSamplerError::Close {
        client_id: client_id.to_string(),
        reason: "network thread panicked".to_string(),
    })
}
