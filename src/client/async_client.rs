//! Asynchronous client variant
//!
//! Wraps `rumqttc::AsyncClient`. The event loop is driven by a dedicated
//! thread running a current-thread tokio runtime, so the variant works the
//! same whether or not the caller is inside a runtime.
//!
//! Requests are queued with the non-blocking `try_*` calls and return at
//! once. Their outcome (CONNACK, SUBACK, acknowledgements, errors) arrives on
//! the network thread and is recorded in the [`Session`]; callers observe it
//! through [`AsyncClient::is_connected`], [`AsyncClient::stats`] and
//! [`AsyncClient::take_error`].

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rumqttc::{ConnectionError, EventLoop, QoS};
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, warn};

use super::blocking::{join_network, queue_disconnect, RECONNECT_DELAY};
use super::options::ConnectOptions;
use super::session::{Session, SessionStats};
use crate::buffer::Inbox;
use crate::error::{FailureCause, MqttSamplerError};
use crate::message::MessageRecord;
use crate::util::DISCONNECT_TIMEOUT_SECS;

/// Non-blocking client: operations are queued and complete in the background.
pub struct AsyncClient {
    client: rumqttc::AsyncClient,
    session: Arc<Session>,
    network: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncClient {
    /// Starts connecting in the background and returns immediately.
    ///
    /// # Errors
    ///
    /// Only configuration problems (client id, broker URL, TLS files) and a
    /// failure to start the network thread are reported here. Connection
    /// failures surface through [`take_error`](Self::take_error).
    pub fn connect(options: &ConnectOptions) -> Result<Self, MqttSamplerError> {
        let (mqtt_options, network_options) = options.to_mqtt_options()?;
        let (client, mut eventloop) =
            rumqttc::AsyncClient::new(mqtt_options, options.request_capacity.max(1));
        eventloop.set_network_options(network_options);

        let session = Arc::new(Session::new(
            options.client_id.clone(),
            options.broker_url.clone(),
            options.buffer_capacity,
            options.auto_reconnect,
        ));

        let runtime = Builder::new_current_thread().enable_all().build()?;
        let network = {
            let session = Arc::clone(&session);
            thread::Builder::new()
                .name(format!("mqtt-async-{}", options.client_id))
                .spawn(move || run_event_loop(runtime, eventloop, session))?
        };

        Ok(Self {
            client,
            session,
            network: Mutex::new(Some(network)),
        })
    }

    /// Queues a publish. Acknowledgements are counted in [`stats`](Self::stats).
    pub fn publish(
        &self,
        topic: &str,
        qos: QoS,
        payload: &[u8],
        retained: bool,
    ) -> Result<(), MqttSamplerError> {
        self.client
            .try_publish(topic, qos, retained, payload.to_vec())
            .map_err(|e| MqttSamplerError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    /// Attaches a fresh inbox and queues a SUBSCRIBE.
    ///
    /// Returns the requested QoS; a broker rejection is reported later
    /// through [`take_error`](Self::take_error).
    pub fn subscribe(&self, topic: &str, qos: QoS) -> Result<QoS, MqttSamplerError> {
        self.session.attach_inbox();
        self.session.prepare_subscribe(topic);
        if let Err(e) = self.client.try_subscribe(topic, qos) {
            self.session.cancel_subscribe();
            return Err(MqttSamplerError::Subscribe {
                topic: topic.to_string(),
                cause: FailureCause::Transport,
                reason: e.to_string(),
            });
        }
        Ok(qos)
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

    /// Oldest failure recorded by the background event loop.
    pub fn take_error(&self) -> Option<MqttSamplerError> {
        self.session.take_error()
    }

    /// Ends the session. Safe to call repeatedly; later calls do nothing.
    pub fn disconnect(&self) -> Result<(), MqttSamplerError> {
        if !self.session.begin_close() {
            return Ok(());
        }
        let deadline = Instant::now() + Duration::from_secs(DISCONNECT_TIMEOUT_SECS);
        queue_disconnect(&self.session, deadline, || self.client.try_disconnect());
        let handle = self.network.lock().take();
        join_network(self.session.client_id(), handle)
    }
}

impl Drop for AsyncClient {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            warn!("Error dropping client {}: {}", self.session.client_id(), e);
        }
    }
}

fn run_event_loop(runtime: Runtime, mut eventloop: EventLoop, session: Arc<Session>) {
    runtime.block_on(async {
        loop {
            if session.should_stop() {
                break;
            }
            let flow = match eventloop.poll().await {
                Ok(event) => session.handle_event(event),
                Err(ConnectionError::RequestsDone) => break,
                Err(e) => {
                    let flow = session.handle_connection_error(&e);
                    if flow.is_continue() {
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                    flow
                }
            };
            if flow.is_break() {
                break;
            }
        }
    });
    session.mark_stopped();
    debug!("Event loop for {} stopped", session.client_id());
}
