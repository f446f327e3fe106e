//! Load plan configuration
//!
//! A [`LoadPlan`] describes one test run: which sampler to drive, how many
//! virtual users run it and for how many iterations, and the connection and
//! sampler settings each user applies. Plans are read from JSON with
//! [`LoadPlan::from_file`] or assembled from command-line flags.
//!
//! Every field has a default, so a plan file only needs the values it
//! changes:
//!
//! ```json
//! {
//!   "mode": "subscribe",
//!   "threads": 4,
//!   "connection": { "broker_url": "tcp://broker:1883", "client_type": "async" },
//!   "subscriber": { "topic": "sensors/#", "qos": "mqtt_at_least_once", "timeout_secs": 30 }
//! }
//! ```

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::ValueEnum;
use rumqttc::QoS;
use serde::{Deserialize, Serialize};

use crate::buffer::DEFAULT_BUFFER_CAPACITY;
use crate::client::options::validate_client_id;
use crate::client::{ClientKind, ConnectOptions, TlsConfig};
use crate::error::MqttSamplerError;
use crate::util::generate_client_id;

/// Broker used when none is configured.
pub const DEFAULT_BROKER_URL: &str = "tcp://localhost:1883";

/// Topic used when none is configured.
pub const DEFAULT_TOPIC: &str = "Sample.MQTT.Topic";

/// Username and password used when none are configured.
pub const DEFAULT_USERNAME: &str = "admin";
pub const DEFAULT_PASSWORD: &str = "admin";

/// Parses a QoS given as a level (`0`, `1`, `2`) or by name.
///
/// Names are matched case-insensitively and may use the `mqtt_` prefix:
/// `at_most_once`, `AT_LEAST_ONCE`, `mqtt_exactly_once`.
///
/// # Errors
///
/// Returns [`MqttSamplerError::InvalidArgument`] for anything else.
pub fn parse_qos(value: &str) -> Result<QoS, MqttSamplerError> {
    let normalized = value.trim().to_ascii_lowercase();
    let name = normalized.strip_prefix("mqtt_").unwrap_or(&normalized);
    match name {
        "0" | "at_most_once" => Ok(QoS::AtMostOnce),
        "1" | "at_least_once" => Ok(QoS::AtLeastOnce),
        "2" | "exactly_once" => Ok(QoS::ExactlyOnce),
        _ => Err(MqttSamplerError::InvalidArgument(format!(
            "Invalid QoS '{}': expected 0, 1, 2 or at_most_once, at_least_once, exactly_once",
            value
        ))),
    }
}

/// Serde support for `rumqttc::QoS` fields given as a number or a name.
pub mod qos_serde {
    use rumqttc::QoS;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::util::{qos_to_u8, u8_to_qos};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum QosRepr {
        Level(u8),
        Name(String),
    }

    pub fn serialize<S: Serializer>(qos: &QoS, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(qos_to_u8(*qos))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<QoS, D::Error> {
        match QosRepr::deserialize(deserializer)? {
            QosRepr::Level(level) => u8_to_qos(level)
                .ok_or_else(|| D::Error::custom(format!("invalid QoS level {}", level))),
            QosRepr::Name(name) => super::parse_qos(&name).map_err(D::Error::custom),
        }
    }
}

/// Which sampler the virtual users drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Publish,
    Subscribe,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Publish => write!(f, "publish"),
            Mode::Subscribe => write!(f, "subscribe"),
        }
    }
}

/// TLS file locations as they appear in a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub insecure: bool,
}

impl From<&TlsSettings> for TlsConfig {
    fn from(settings: &TlsSettings) -> Self {
        TlsConfig {
            ca_cert: settings.ca_cert.clone(),
            client_cert: settings.client_cert.clone(),
            client_key: settings.client_key.clone(),
            insecure: settings.insecure,
        }
    }
}

/// Settings shared by publishers and subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub broker_url: String,
    /// Empty means "generate one per virtual user".
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub clean_session: bool,
    /// Zero disables keep-alive.
    pub keep_alive_secs: u64,
    pub client_type: ClientKind,
    pub buffer_capacity: usize,
    pub connect_timeout_secs: u64,
    pub ack_timeout_secs: u64,
    pub auto_reconnect: bool,
    pub tls: Option<TlsSettings>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            broker_url: DEFAULT_BROKER_URL.to_string(),
            client_id: String::new(),
            username: Some(DEFAULT_USERNAME.to_string()),
            password: Some(DEFAULT_PASSWORD.to_string()),
            clean_session: false,
            keep_alive_secs: 0,
            client_type: ClientKind::Blocking,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            connect_timeout_secs: 5,
            ack_timeout_secs: 10,
            auto_reconnect: false,
            tls: None,
        }
    }
}

impl ConnectionConfig {
    /// Client id for the virtual user at `index` (zero-based) of `threads`.
    ///
    /// A configured id is used as-is by a single user and suffixed with
    /// `-{n}` when several users run, since a broker drops the older of two
    /// sessions with the same id. A blank id is generated per user.
    pub fn user_client_id(&self, threads: usize, index: usize) -> String {
        let configured = self.client_id.trim();
        if configured.is_empty() {
            generate_client_id(None)
        } else if threads > 1 {
            format!("{}-{}", configured, index + 1)
        } else {
            configured.to_string()
        }
    }

    /// Builds handle options using `client_id`.
    pub fn connect_options(&self, client_id: &str) -> ConnectOptions {
        let mut options = ConnectOptions::new(self.broker_url.trim(), client_id)
            .with_clean_session(self.clean_session)
            .with_keep_alive(Duration::from_secs(self.keep_alive_secs))
            .with_buffer_capacity(self.buffer_capacity)
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs.max(1)))
            .with_ack_timeout(Duration::from_secs(self.ack_timeout_secs.max(1)))
            .with_auto_reconnect(self.auto_reconnect);

        if let Some(username) = self.username.as_deref().filter(|u| !u.is_empty()) {
            options = options.with_credentials(username, self.password.clone().unwrap_or_default());
        }
        if let Some(tls) = &self.tls {
            options = options.with_tls(TlsConfig::from(tls));
        }
        options
    }

    /// Checks the values every sampler needs.
    pub fn validate(&self) -> Result<(), MqttSamplerError> {
        if self.broker_url.trim().is_empty() {
            return Err(MqttSamplerError::InvalidArgument(
                "The broker url cannot be empty".to_string(),
            ));
        }
        crate::client::BrokerAddress::parse(&self.broker_url)?;
        let client_id = self.client_id.trim();
        if !client_id.is_empty() {
            validate_client_id(client_id)?;
        }
        Ok(())
    }
}

/// Where the publisher's payload comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum MessageSource {
    /// The payload is this text.
    Text(String),
    /// The payload is the content of this file, read once at thread start.
    File(PathBuf),
}

impl Default for MessageSource {
    fn default() -> Self {
        MessageSource::Text(String::new())
    }
}

impl MessageSource {
    pub fn load(&self) -> Result<Vec<u8>, MqttSamplerError> {
        match self {
            MessageSource::Text(text) => Ok(text.as_bytes().to_vec()),
            MessageSource::File(path) => fs::read(path).map_err(|e| {
                MqttSamplerError::InvalidArgument(format!(
                    "Failed to read message file {:?}: {}",
                    path, e
                ))
            }),
        }
    }
}

/// Publisher sampler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub topic: String,
    #[serde(with = "qos_serde")]
    pub qos: QoS,
    pub retained: bool,
    pub message: MessageSource,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            qos: QoS::AtMostOnce,
            retained: false,
            message: MessageSource::default(),
        }
    }
}

/// Subscriber sampler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriberConfig {
    pub topic: String,
    #[serde(with = "qos_serde")]
    pub qos: QoS,
    /// Receive on a side thread and return from the sample at once.
    pub background: bool,
    /// Bound on each receive. Zero waits until interrupted.
    pub timeout_secs: u64,
    /// How long one bounded pop waits before re-checking the timeout and
    /// interrupt flag.
    pub poll_interval_ms: u64,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            qos: QoS::AtMostOnce,
            background: false,
            timeout_secs: 0,
            poll_interval_ms: 100,
        }
    }
}

impl SubscriberConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn validate(&self) -> Result<(), MqttSamplerError> {
        if self.topic.trim().is_empty() {
            return Err(MqttSamplerError::InvalidArgument(
                "The topic name(destination) cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// One complete test run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadPlan {
    pub mode: Mode,
    /// Number of virtual users.
    pub threads: usize,
    /// Samples per virtual user.
    pub iterations: u64,
    pub connection: ConnectionConfig,
    pub publisher: PublisherConfig,
    pub subscriber: SubscriberConfig,
}

impl Default for LoadPlan {
    fn default() -> Self {
        Self {
            mode: Mode::Publish,
            threads: 1,
            iterations: 1,
            connection: ConnectionConfig::default(),
            publisher: PublisherConfig::default(),
            subscriber: SubscriberConfig::default(),
        }
    }
}

impl LoadPlan {
    /// Reads a plan from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, MqttSamplerError> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self, MqttSamplerError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Checks the plan before any connection is attempted.
    pub fn validate(&self) -> Result<(), MqttSamplerError> {
        if self.threads == 0 {
            return Err(MqttSamplerError::InvalidArgument(
                "threads must be at least 1".to_string(),
            ));
        }
        self.connection.validate()?;
        // The last user carries the longest suffix.
        if self.threads > 1 && !self.connection.client_id.trim().is_empty() {
            validate_client_id(&self.connection.user_client_id(self.threads, self.threads - 1))?;
        }
        match self.mode {
            Mode::Publish => {
                if self.publisher.topic.trim().is_empty() {
                    return Err(MqttSamplerError::InvalidArgument(
                        "The topic name(destination) cannot be empty".to_string(),
                    ));
                }
            }
            Mode::Subscribe => self.subscriber.validate()?,
        }
        Ok(())
    }
}
