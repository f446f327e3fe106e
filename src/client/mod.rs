//! MQTT client handles
//!
//! [`MqttClientHandle`] is the one interface the samplers use. It comes in two
//! variants that share a [`Session`](session::Session):
//!
//! - [`ClientKind::Blocking`]: publish and subscribe wait for the broker's
//!   acknowledgement before returning
//! - [`ClientKind::Async`]: requests are queued and their outcome is observed
//!   later through state probes and [`MqttClientHandle::take_error`]
//!
//! In both variants received messages are buffered in an
//! [`Inbox`](crate::buffer::Inbox) and drained with
//! [`MqttClientHandle::poll_one`].

pub mod async_client;
pub mod blocking;
pub mod options;
pub mod session;

use std::fmt;
use std::sync::Arc;

use clap::ValueEnum;
use rumqttc::QoS;
use serde::{Deserialize, Serialize};

pub use async_client::AsyncClient;
pub use blocking::BlockingClient;
pub use options::{BrokerAddress, ConnectOptions, Credentials, TlsConfig};
pub use session::{ConnectionState, SessionStats};

use crate::buffer::Inbox;
use crate::error::MqttSamplerError;
use crate::message::MessageRecord;

/// Which client variant to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientKind {
    /// Wait for acknowledgements on every publish and subscribe.
    #[default]
    #[serde(alias = "mqtt_blocking_client")]
    Blocking,
    /// Queue requests and observe their completion asynchronously.
    #[serde(alias = "mqtt_async_client")]
    Async,
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientKind::Blocking => write!(f, "blocking"),
            ClientKind::Async => write!(f, "async"),
        }
    }
}

/// Something the client registry can tear down.
pub trait Closeable: Send + Sync {
    /// Releases the underlying connection. Must be safe to call more than once.
    fn close(&self) -> Result<(), MqttSamplerError>;

    fn client_id(&self) -> &str;
}

/// A connected MQTT client of either variant.
///
/// All methods take `&self`, so a handle can be shared through an `Arc`
/// between the thread that samples with it and the registry that closes it.
pub enum MqttClientHandle {
    Blocking(BlockingClient),
    Async(AsyncClient),
}

/// Creates and connects a client of the requested kind.
///
/// # Example
///
/// ```rust,ignore
/// use mqtt_sampler::client::{new_client, ClientKind, ConnectOptions};
/// use rumqttc::QoS;
///
/// let options = ConnectOptions::new("tcp://localhost:1883", "bench-1");
/// let client = new_client(ClientKind::Blocking, options)?;
/// client.subscribe("sensors/#", QoS::AtLeastOnce)?;
/// while let Some(message) = client.poll_one() {
///     println!("{}", message);
/// }
/// client.disconnect()?;
/// ```
pub fn new_client(
    kind: ClientKind,
    options: ConnectOptions,
) -> Result<MqttClientHandle, MqttSamplerError> {
    MqttClientHandle::connect(kind, &options)
}

impl MqttClientHandle {
    /// Connects a client of `kind`.
    ///
    /// The blocking variant returns once CONNACK has arrived. The async
    /// variant returns as soon as the network thread is running.
    pub fn connect(
        kind: ClientKind,
        options: &ConnectOptions,
    ) -> Result<Self, MqttSamplerError> {
        match kind {
            ClientKind::Blocking => BlockingClient::connect(options).map(MqttClientHandle::Blocking),
            ClientKind::Async => AsyncClient::connect(options).map(MqttClientHandle::Async),
        }
    }

    pub fn kind(&self) -> ClientKind {
        match self {
            MqttClientHandle::Blocking(_) => ClientKind::Blocking,
            MqttClientHandle::Async(_) => ClientKind::Async,
        }
    }

    /// Publishes `payload` to `topic`.
    ///
    /// Blocking handles return after the acknowledgement for `qos`; async
    /// handles return once the request is queued.
    pub fn publish(
        &self,
        topic: &str,
        qos: QoS,
        payload: &[u8],
        retained: bool,
    ) -> Result<(), MqttSamplerError> {
        match self {
            MqttClientHandle::Blocking(client) => client.publish(topic, qos, payload, retained),
            MqttClientHandle::Async(client) => client.publish(topic, qos, payload, retained),
        }
    }

    /// Subscribes to `topic`, replacing the inbox with a fresh one.
    ///
    /// Returns the granted QoS for blocking handles and the requested QoS for
    /// async handles.
    pub fn subscribe(&self, topic: &str, qos: QoS) -> Result<QoS, MqttSamplerError> {
        match self {
            MqttClientHandle::Blocking(client) => client.subscribe(topic, qos),
            MqttClientHandle::Async(client) => client.subscribe(topic, qos),
        }
    }

    /// Pops the oldest buffered message without waiting.
    pub fn poll_one(&self) -> Option<MessageRecord> {
        match self {
            MqttClientHandle::Blocking(client) => client.poll_one(),
            MqttClientHandle::Async(client) => client.poll_one(),
        }
    }

    /// The inbox of the latest subscription, if any.
    pub fn inbox(&self) -> Option<Arc<Inbox>> {
        match self {
            MqttClientHandle::Blocking(client) => client.inbox(),
            MqttClientHandle::Async(client) => client.inbox(),
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            MqttClientHandle::Blocking(client) => client.is_connected(),
            MqttClientHandle::Async(client) => client.is_connected(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.session().state()
    }

    /// True while the handle is connected or still establishing its session.
    ///
    /// Async handles report `Connecting` until CONNACK arrives, so this is
    /// the check for "worth reusing" rather than [`is_connected`](Self::is_connected).
    pub fn is_open(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connecting | ConnectionState::Connected
        )
    }

    /// Ends the session; repeated calls are no-ops.
    pub fn disconnect(&self) -> Result<(), MqttSamplerError> {
        match self {
            MqttClientHandle::Blocking(client) => client.disconnect(),
            MqttClientHandle::Async(client) => client.disconnect(),
        }
    }

    pub fn client_id(&self) -> &str {
        self.session().client_id()
    }

    pub fn broker_url(&self) -> &str {
        self.session().broker_url()
    }

    /// True when the broker refused the latest subscription. A rejected
    /// handle has no usable inbox until it subscribes again.
    pub fn subscription_rejected(&self) -> bool {
        self.session().subscription_rejected()
    }

    /// Oldest failure recorded on the network thread since the last call.
    pub fn take_error(&self) -> Option<MqttSamplerError> {
        self.session().take_error()
    }

    pub fn stats(&self) -> SessionStats {
        self.session().stats()
    }

    fn session(&self) -> &session::Session {
        match self {
            MqttClientHandle::Blocking(client) => client.session(),
            MqttClientHandle::Async(client) => client.session(),
        }
    }
}

impl fmt::Debug for MqttClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttClientHandle")
            .field("kind", &self.kind())
            .field("client_id", &self.client_id())
            .field("broker_url", &self.broker_url())
            .field("state", &self.state())
            .finish()
    }
}

impl Closeable for MqttClientHandle {
    fn close(&self) -> Result<(), MqttSamplerError> {
        self.disconnect()
    }

    fn client_id(&self) -> &str {
        MqttClientHandle::client_id(self)
    }
}
