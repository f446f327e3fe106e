//! Error module
//!
//! Defines custom error types using `thiserror` for the MQTT sampler.
//! This module provides a unified error type covering client setup, publish,
//! subscribe and teardown failures, and implements the `From` trait for
//! automatic conversion from the underlying `rumqttc` error types.

use std::fmt;
use std::time::Duration;

use rumqttc::ConnectReturnCode;
use thiserror::Error;

/// Why a subscription could not be established.
///
/// Samplers report the two cases differently: a broker refusing the topic
/// filter is a permission problem, everything else is a transport problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    /// The broker rejected the request (SUBACK failure, not authorized).
    Security,
    /// The request never completed (channel closed, connection lost, timeout).
    Transport,
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Security => write!(f, "security"),
            FailureCause::Transport => write!(f, "transport"),
        }
    }
}

/// The main error type for the MQTT sampler.
///
/// # Error Categories
///
/// - **Setup errors**: connection, refused connection, invalid client id
/// - **Operation errors**: publish, subscribe, client request failures
/// - **Teardown errors**: per-handle close failures, aggregated teardown
/// - **Configuration errors**: invalid arguments, TLS files, JSON plans
///
/// # Example
///
/// ```rust,ignore
/// use mqtt_sampler::error::MqttSamplerError;
///
/// fn example() -> Result<(), MqttSamplerError> {
///     // Errors from underlying types are automatically converted
///     let plan = std::fs::read_to_string("plan.json")?;
///     Ok(())
/// }
/// ```
#[derive(Error, Debug)]
pub enum MqttSamplerError {
    /// The network session could not be established (transport failure or
    /// no CONNACK within the connect timeout).
    #[error("MQTT connection error for {broker}: {reason}")]
    Connection { broker: String, reason: String },

    /// The broker answered the CONNECT with a non-success return code.
    ///
    /// Bad credentials and authorization failures end up here.
    #[error("MQTT connection refused by broker: {0:?}")]
    ConnectionRefused(ConnectReturnCode),

    /// The client identifier is empty or longer than the protocol allows.
    #[error("Invalid client ID '{id}': {reason}")]
    InvalidClientId { id: String, reason: String },

    /// A publish was not acknowledged at the requested QoS.
    #[error("Publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    /// A subscription was rejected or never acknowledged.
    #[error("Subscribe to '{topic}' failed ({cause}): {reason}")]
    Subscribe {
        topic: String,
        cause: FailureCause,
        reason: String,
    },

    /// Closing one client during teardown failed.
    #[error("Closing client '{client_id}' failed: {reason}")]
    Close { client_id: String, reason: String },

    /// A poll loop ran past its caller-supplied timeout.
    #[error("Poll loop exceeded timeout of {0:?}")]
    TimeoutExceeded(Duration),

    /// Teardown finished with one or more close failures.
    #[error("Teardown failed for {} client(s)", .0.len())]
    Teardown(Vec<MqttSamplerError>),

    /// MQTT client request error from the rumqttc client.
    ///
    /// Note: The error is boxed to reduce the size of the Result type.
    #[error("MQTT client error: {0}")]
    Client(#[source] Box<rumqttc::ClientError>),

    /// Invalid argument or configuration value.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// TLS configuration error (unreadable certificate or key files).
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// General I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error for load plans.
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MqttSamplerError {
    /// Returns true when the failure was caused by the broker refusing
    /// credentials or permissions rather than by the network.
    pub fn is_security_failure(&self) -> bool {
        match self {
            MqttSamplerError::ConnectionRefused(code) => matches!(
                code,
                ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized
            ),
            MqttSamplerError::Subscribe { cause, .. } => *cause == FailureCause::Security,
            _ => false,
        }
    }

    /// Returns true for errors raised while opening the session.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            MqttSamplerError::Connection { .. }
                | MqttSamplerError::ConnectionRefused(_)
                | MqttSamplerError::Tls(_)
        )
    }
}

// Manual From implementation for the boxed error type
impl From<rumqttc::ClientError> for MqttSamplerError {
    fn from(err: rumqttc::ClientError) -> Self {
        MqttSamplerError::Client(Box::new(err))
    }
}
