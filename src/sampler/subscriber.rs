//! Subscriber sampler
//!
//! Each sample makes sure the virtual user has a connected, subscribed
//! client, then either waits in the foreground for one message or hands
//! receiving over to a side thread that logs messages until its timeout.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use super::poll::{PollLoop, PollOutcome};
use super::{InterruptFlag, SampleResult};
use crate::client::MqttClientHandle;
use crate::config::{ConnectionConfig, SubscriberConfig};
use crate::error::MqttSamplerError;
use crate::registry::ClientRegistry;

/// Label reported on subscriber samples.
pub const SUBSCRIBER_LABEL: &str = "MQTT Subscriber";

const BACKGROUND_STARTED: &str =
    "Subscriber started on another thread check log for actual value.";
const RECEIVE_STOPPED: &str =
    "Client has been stopped or an error occurred while receiving messages.";

/// One virtual user's subscriber.
pub struct SubscriberSampler {
    connection: ConnectionConfig,
    config: SubscriberConfig,
    client_id: String,
    registry: Arc<ClientRegistry>,
    interrupt: InterruptFlag,
    client: Option<Arc<MqttClientHandle>>,
    background: Option<JoinHandle<u64>>,
}

impl SubscriberSampler {
    /// `client_id` is used for every connection this user opens.
    pub fn new(
        connection: ConnectionConfig,
        config: SubscriberConfig,
        client_id: impl Into<String>,
        registry: Arc<ClientRegistry>,
        interrupt: InterruptFlag,
    ) -> Self {
        Self {
            connection,
            config,
            client_id: client_id.into(),
            registry,
            interrupt,
            client: None,
            background: None,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The current client, if one is open.
    pub fn client(&self) -> Option<&Arc<MqttClientHandle>> {
        self.client.as_ref()
    }

    /// Validates the broker URL and topic. A user whose settings are invalid
    /// runs no samples.
    pub fn thread_started(&mut self) -> Result<(), MqttSamplerError> {
        debug!("Subscriber thread started for {}", self.client_id);
        let valid = self
            .connection
            .validate()
            .and_then(|_| self.config.validate());
        if let Err(e) = &valid {
            error!("{}", e);
        }
        valid
    }

    /// Runs one subscriber sample.
    pub fn sample(&mut self) -> SampleResult {
        let result = SampleResult::start(SUBSCRIBER_LABEL);

        let client = match self.ensure_subscribed() {
            Ok(client) => client,
            Err(e) => return not_connected(result, &e),
        };
        if let Some(e) = client.take_error() {
            self.close_current();
            return not_connected(result, &e);
        }

        if self.config.background && self.config.timeout().is_some() {
            self.start_background(client);
            return result.succeed(BACKGROUND_STARTED, Vec::new());
        }

        let poll = self.poll_loop();
        match poll.next_message(client.as_ref()) {
            PollOutcome::Message(record, received) => {
                let message = record.summary(received);
                result.succeed(message, record.into_payload())
            }
            PollOutcome::TimedOut => {
                let timeout = poll.timeout().unwrap_or_default();
                result.fail(
                    format!("{} {}", RECEIVE_STOPPED, MqttSamplerError::TimeoutExceeded(timeout)),
                    Vec::new(),
                )
            }
            PollOutcome::Detached => match client.take_error() {
                // A SUBACK failure that arrived while polling.
                Some(e) => {
                    self.close_current();
                    not_connected(result, &e)
                }
                None => result.fail(RECEIVE_STOPPED, Vec::new()),
            },
            PollOutcome::Interrupted => result.fail(RECEIVE_STOPPED, Vec::new()),
        }
    }

    /// Raises the interrupt flag. Returns `true` if it was not raised before.
    pub fn interrupt(&self) -> bool {
        self.interrupt.raise()
    }

    /// Closes this user's client and waits for its side thread, if any.
    pub fn thread_finished(&mut self) {
        debug!("Subscriber thread finished for {}", self.client_id);
        self.close_current();
        if let Some(handle) = self.background.take() {
            match handle.join() {
                Ok(received) => debug!(
                    "Background receiver for {} ended after {} message(s)",
                    self.client_id, received
                ),
                Err(_) => warn!("Background receiver for {} panicked", self.client_id),
            }
        }
    }

    /// Closes every client in the run's registry.
    pub fn test_ended(&self) -> Vec<MqttSamplerError> {
        self.registry.close_all()
    }

    fn poll_loop(&self) -> PollLoop {
        PollLoop::new(self.config.timeout(), self.interrupt.clone())
            .with_interval(self.config.poll_interval())
    }

    /// Reuses a connected client or opens, registers and subscribes a new one.
    fn ensure_subscribed(&mut self) -> Result<Arc<MqttClientHandle>, MqttSamplerError> {
        if let Some(client) = &self.client {
            let subscribed = client
                .inbox()
                .is_some_and(|inbox| !inbox.buffer().is_closed());
            if client.is_open() && subscribed && !client.subscription_rejected() {
                return Ok(Arc::clone(client));
            }
        }
        self.close_current();

        let options = self.connection.connect_options(&self.client_id);
        let client = Arc::new(MqttClientHandle::connect(
            self.connection.client_type,
            &options,
        )?);
        self.registry.register(client.clone());
        self.client = Some(Arc::clone(&client));

        if let Err(e) = client.subscribe(self.config.topic.trim(), self.config.qos) {
            self.close_current();
            return Err(e);
        }
        Ok(client)
    }

    fn close_current(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(e) = self.registry.close_client(client.client_id()) {
                warn!("Failed to close client {}: {}", client.client_id(), e);
            }
            // Not registered any more if the registry was already cleared.
            if let Err(e) = client.disconnect() {
                debug!("Disconnect of {}: {}", client.client_id(), e);
            }
        }
    }

    fn start_background(&mut self, client: Arc<MqttClientHandle>) {
        if let Some(handle) = &self.background {
            if !handle.is_finished() {
                debug!("Background receiver for {} already running", self.client_id);
                return;
            }
        }
        if let Some(handle) = self.background.take() {
            if handle.join().is_err() {
                warn!("Background receiver for {} panicked", self.client_id);
            }
        }

        let poll = self.poll_loop();
        let spawned = thread::Builder::new()
            .name(format!("mqtt-recv-{}", self.client_id))
            .spawn(move || {
                let (outcome, delivered) = poll.drain(client.as_ref(), |record, received| {
                    info!("{}", record.summary(received));
                    ControlFlow::Continue(())
                });
                match outcome {
                    PollOutcome::TimedOut => {
                        info!("Background receiver timed out after {} message(s)", delivered)
                    }
                    _ => error!("{}", RECEIVE_STOPPED),
                }
                delivered
            });
        match spawned {
            Ok(handle) => self.background = Some(handle),
            Err(e) => error!("Failed to start background receiver: {}", e),
        }
    }
}

fn not_connected(result: SampleResult, error: &MqttSamplerError) -> SampleResult {
    error!("Error while subscribing: {}", error);
    result.fail(
        format!("Client is not connected.\n{}", error),
        error.to_string().into_bytes(),
    )
}
