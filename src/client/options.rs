//! Connection options
//!
//! Broker address parsing, credentials, TLS settings and the translation of
//! a [`ConnectOptions`] into `rumqttc` options.
//!
//! Broker URLs take the form `scheme://host[:port]`:
//!
//! | Scheme | Transport | Default port |
//! |---|---|---|
//! | `tcp`, `mqtt` (or none) | plain TCP | 1883 |
//! | `ssl`, `mqtts`, `tls` | TLS | 8883 |

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use rumqttc::{MqttOptions, NetworkOptions, Transport};

use crate::buffer::DEFAULT_BUFFER_CAPACITY;
use crate::error::MqttSamplerError;
use crate::util::MAX_CLIENT_ID_LEN;

/// Default plain TCP port.
pub const DEFAULT_TCP_PORT: u16 = 1883;

/// Default TLS port.
pub const DEFAULT_TLS_PORT: u16 = 8883;

/// A parsed broker URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerAddress {
    /// Parses a broker URL such as `tcp://localhost:1883` or `ssl://[::1]`.
    ///
    /// # Errors
    ///
    /// Returns [`MqttSamplerError::InvalidArgument`] for an unknown scheme, an
    /// empty host, or a port that is not a number between 1 and 65535.
    pub fn parse(url: &str) -> Result<Self, MqttSamplerError> {
        let url = url.trim();
        let (scheme, rest) = match url.split_once("://") {
            Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
            None => ("tcp".to_string(), url),
        };

        let tls = match scheme.as_str() {
            "tcp" | "mqtt" => false,
            "ssl" | "mqtts" | "tls" => true,
            other => {
                return Err(MqttSamplerError::InvalidArgument(format!(
                    "Unsupported broker URL scheme '{}' in '{}'",
                    other, url
                )))
            }
        };

        // Anything after the authority (path, query) is ignored.
        let authority = rest.split(['/', '?']).next().unwrap_or_default();

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, tail) = bracketed.split_once(']').ok_or_else(|| {
                MqttSamplerError::InvalidArgument(format!("Unterminated IPv6 host in '{}'", url))
            })?;
            let port = match tail.strip_prefix(':') {
                Some(port) => Some(port),
                None if tail.is_empty() => None,
                None => {
                    return Err(MqttSamplerError::InvalidArgument(format!(
                        "Unexpected characters after host in '{}'",
                        url
                    )))
                }
            };
            (host, port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(MqttSamplerError::InvalidArgument(format!(
                "Broker URL '{}' has no host",
                url
            )));
        }

        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| {
                    MqttSamplerError::InvalidArgument(format!(
                        "Invalid port '{}' in broker URL '{}'",
                        port, url
                    ))
                })?,
            None if tls => DEFAULT_TLS_PORT,
            None => DEFAULT_TCP_PORT,
        };

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "ssl" } else { "tcp" };
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", scheme, self.host, self.port)
        }
    }
}

/// Username and password for broker authentication.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Configuration for TLS/SSL secure connections.
///
/// Used for `ssl://` broker URLs or whenever set explicitly through
/// [`ConnectOptions::with_tls`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    /// Path to the CA certificate used to verify the broker.
    pub ca_cert: Option<PathBuf>,

    /// Path to the client certificate for mutual TLS.
    /// Used together with `client_key`.
    pub client_cert: Option<PathBuf>,

    /// Path to the client private key for mutual TLS.
    pub client_key: Option<PathBuf>,

    /// Use the platform default verifier instead of a pinned CA.
    pub insecure: bool,
}

impl TlsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ca_cert(mut self, path: PathBuf) -> Self {
        self.ca_cert = Some(path);
        self
    }

    pub fn with_client_auth(mut self, cert_path: PathBuf, key_path: PathBuf) -> Self {
        self.client_cert = Some(cert_path);
        self.client_key = Some(key_path);
        self
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Both `client_cert` and `client_key` must be set for client auth.
    pub fn has_client_auth(&self) -> bool {
        self.client_cert.is_some() && self.client_key.is_some()
    }
}

/// Everything needed to open one client session.
///
/// # Example
///
/// ```rust,ignore
/// use mqtt_sampler::client::ConnectOptions;
/// use std::time::Duration;
///
/// let options = ConnectOptions::new("tcp://localhost:1883", "bench-1")
///     .with_credentials("admin", "admin")
///     .with_clean_session(true)
///     .with_keep_alive(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub broker_url: String,
    pub client_id: String,
    pub clean_session: bool,
    pub credentials: Option<Credentials>,
    /// Zero disables keep-alive pings.
    pub keep_alive: Duration,
    /// Slots in each subscription buffer.
    pub buffer_capacity: usize,
    /// How long `connect` waits for CONNACK.
    pub connect_timeout: Duration,
    /// How long a blocking publish or subscribe waits for its acknowledgement.
    pub ack_timeout: Duration,
    /// Capacity of the request channel between the handle and its network thread.
    pub request_capacity: usize,
    pub max_packet_size: usize,
    /// Keep the network loop alive across connection errors after the first
    /// successful CONNACK.
    pub auto_reconnect: bool,
    pub tls: Option<TlsConfig>,
}

impl ConnectOptions {
    pub fn new(broker_url: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            client_id: client_id.into(),
            clean_session: false,
            credentials: None,
            keep_alive: Duration::ZERO,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            connect_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(10),
            request_capacity: 64,
            max_packet_size: 1024 * 1024, // 1MB default
            auto_reconnect: false,
            tls: None,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some(Credentials::new(username, password));
        self
    }

    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_request_capacity(mut self, capacity: usize) -> Self {
        self.request_capacity = capacity;
        self
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Builds the `rumqttc` options for this session.
    ///
    /// # Errors
    ///
    /// - [`MqttSamplerError::InvalidClientId`] if the id is empty or too long
    /// - [`MqttSamplerError::InvalidArgument`] for a malformed broker URL or a
    ///   keep-alive below one second
    /// - [`MqttSamplerError::Tls`] if certificate files cannot be read
    pub fn to_mqtt_options(&self) -> Result<(MqttOptions, NetworkOptions), MqttSamplerError> {
        validate_client_id(&self.client_id)?;
        let address = BrokerAddress::parse(&self.broker_url)?;

        if !self.keep_alive.is_zero() && self.keep_alive < Duration::from_secs(1) {
            return Err(MqttSamplerError::InvalidArgument(format!(
                "Keep-alive must be zero or at least one second, got {:?}",
                self.keep_alive
            )));
        }

        let mut mqtt_options = MqttOptions::new(&self.client_id, &address.host, address.port);
        mqtt_options.set_keep_alive(Duration::from_secs(self.keep_alive.as_secs()));
        mqtt_options.set_clean_session(self.clean_session);
        mqtt_options.set_max_packet_size(self.max_packet_size, self.max_packet_size);
        mqtt_options.set_request_channel_capacity(self.request_capacity.max(1));

        if let Some(credentials) = &self.credentials {
            mqtt_options.set_credentials(&credentials.username, &credentials.password);
        }

        match (&self.tls, address.tls) {
            (Some(tls), _) => {
                mqtt_options.set_transport(build_tls_transport(tls)?);
            }
            (None, true) => {
                mqtt_options.set_transport(build_tls_transport(&TlsConfig::default())?);
            }
            (None, false) => {}
        }

        let mut network_options = NetworkOptions::new();
        network_options.set_connection_timeout(self.connect_timeout.as_secs().max(1));

        Ok((mqtt_options, network_options))
    }
}

/// Checks the MQTT 3.1.1 client identifier limits.
///
/// # Errors
///
/// Returns [`MqttSamplerError::InvalidClientId`] when `client_id` is empty or
/// longer than [`MAX_CLIENT_ID_LEN`] characters.
pub fn validate_client_id(client_id: &str) -> Result<(), MqttSamplerError> {
    if client_id.is_empty() {
        return Err(MqttSamplerError::InvalidClientId {
            id: client_id.to_string(),
            reason: "must not be empty".to_string(),
        });
    }
    let len = client_id.chars().count();
    if len > MAX_CLIENT_ID_LEN {
        return Err(MqttSamplerError::InvalidClientId {
            id: client_id.to_string(),
            reason: format!(
                "{} characters exceeds the limit of {}",
                len, MAX_CLIENT_ID_LEN
            ),
        });
    }
    Ok(())
}

/// Build the TLS transport from a [`TlsConfig`].
fn build_tls_transport(tls_config: &TlsConfig) -> Result<Transport, MqttSamplerError> {
    if tls_config.insecure || tls_config.ca_cert.is_none() {
        return Ok(Transport::tls_with_default_config());
    }

    let ca = match &tls_config.ca_cert {
        Some(ca_path) => fs::read(ca_path).map_err(|e| {
            MqttSamplerError::Tls(format!(
                "Failed to read CA certificate from {:?}: {}",
                ca_path, e
            ))
        })?,
        None => Vec::new(),
    };

    let client_auth = match (&tls_config.client_cert, &tls_config.client_key) {
        (Some(cert_path), Some(key_path)) => {
            let cert = fs::read(cert_path).map_err(|e| {
                MqttSamplerError::Tls(format!(
                    "Failed to read client certificate from {:?}: {}",
                    cert_path, e
                ))
            })?;
            let key = fs::read(key_path).map_err(|e| {
                MqttSamplerError::Tls(format!(
                    "Failed to read client key from {:?}: {}",
                    key_path, e
                ))
            })?;
            Some((cert, key))
        }
        _ => None,
    };

    Ok(Transport::tls(ca, client_auth, None))
}
