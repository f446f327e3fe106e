//! Publisher sampler
//!
//! Connects once per virtual user, then publishes the configured payload on
//! every sample, reconnecting first if the session has dropped.

use std::sync::Arc;

use tracing::{debug, error, warn};

use super::SampleResult;
use crate::client::MqttClientHandle;
use crate::config::{ConnectionConfig, PublisherConfig};
use crate::error::MqttSamplerError;
use crate::registry::ClientRegistry;

/// Label reported on publisher samples.
pub const PUBLISHER_LABEL: &str = "MQTT Publisher";

/// One virtual user's publisher.
pub struct PublisherSampler {
    connection: ConnectionConfig,
    config: PublisherConfig,
    client_id: String,
    registry: Arc<ClientRegistry>,
    client: Option<Arc<MqttClientHandle>>,
    payload: Vec<u8>,
    published: u64,
}

impl PublisherSampler {
    pub fn new(
        connection: ConnectionConfig,
        config: PublisherConfig,
        client_id: impl Into<String>,
        registry: Arc<ClientRegistry>,
    ) -> Self {
        Self {
            connection,
            config,
            client_id: client_id.into(),
            registry,
            client: None,
            payload: Vec::new(),
            published: 0,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Messages published successfully so far.
    pub fn published(&self) -> u64 {
        self.published
    }

    pub fn client(&self) -> Option<&Arc<MqttClientHandle>> {
        self.client.as_ref()
    }

    /// Loads the payload and opens the first connection.
    ///
    /// A connection failure here is logged but not fatal: the first sample
    /// retries and reports the failure.
    pub fn thread_started(&mut self) -> Result<(), MqttSamplerError> {
        debug!("Publisher thread started for {}", self.client_id);
        self.connection.validate()?;
        self.payload = self.config.message.load()?;
        if let Err(e) = self.ensure_connected() {
            error!("{}", e);
        }
        Ok(())
    }

    /// Publishes the payload once.
    pub fn sample(&mut self) -> SampleResult {
        let result = SampleResult::start(PUBLISHER_LABEL);
        match self.publish_once() {
            Ok(()) => {
                self.published += 1;
                result.succeed(
                    format!("Sent {} messages total", self.published),
                    self.payload.clone(),
                )
            }
            Err(e) => {
                warn!("Publish from {} failed: {}", self.client_id, e);
                result.fail(
                    format!("Unable publish messages.\nException: {}", e),
                    e.to_string().into_bytes(),
                )
            }
        }
    }

    /// Closes this user's client.
    pub fn thread_finished(&mut self) {
        debug!(
            "Publisher thread finished for {} after {} message(s)",
            self.client_id, self.published
        );
        self.close_current();
    }

    fn publish_once(&mut self) -> Result<(), MqttSamplerError> {
        let client = self.ensure_connected()?;
        if let Some(e) = client.take_error() {
            return Err(e);
        }
        client.publish(
            self.config.topic.trim(),
            self.config.qos,
            &self.payload,
            self.config.retained,
        )
    }

    fn ensure_connected(&mut self) -> Result<Arc<MqttClientHandle>, MqttSamplerError> {
        if let Some(client) = &self.client {
            if client.is_open() {
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
        Ok(client)
    }

    fn close_current(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(e) = self.registry.close_client(client.client_id()) {
                warn!("Failed to close client {}: {}", client.client_id(), e);
            }
            if let Err(e) = client.disconnect() {
                debug!("Disconnect of {}: {}", client.client_id(), e);
            }
        }
    }
}
