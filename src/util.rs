//! Utility functions for the MQTT sampler.
//!
//! This module provides common helpers used across modules, including QoS
//! conversions, client ID generation and payload previews for log output.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rumqttc::QoS;

/// Timeout in seconds for graceful MQTT disconnect operations.
pub const DISCONNECT_TIMEOUT_SECS: u64 = 2;

/// Longest client identifier every MQTT 3.1.1 broker must accept.
pub const MAX_CLIENT_ID_LEN: usize = 23;

/// Prefix for generated client identifiers.
const CLIENT_ID_PREFIX: &str = "mqtt-sampler-";

static CLIENT_ID_SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// Convert QoS enum to u8 value.
///
/// # Returns
///
/// * `0` for `QoS::AtMostOnce`
/// * `1` for `QoS::AtLeastOnce`
/// * `2` for `QoS::ExactlyOnce`
#[must_use]
pub fn qos_to_u8(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

/// Convert u8 value to QoS enum, `None` for anything above 2.
#[must_use]
pub fn u8_to_qos(qos: u8) -> Option<QoS> {
    match qos {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

/// Generate a client ID from an optional string.
///
/// If `client_id` is `Some` and non-blank, returns it trimmed. Otherwise
/// generates `mqtt-sampler-xxxxxxxx` (21 characters), mixing the clock with a
/// process-wide sequence so that virtual users created in the same instant
/// still get distinct identifiers.
#[must_use]
pub fn generate_client_id(client_id: Option<&str>) -> String {
    match client_id.map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            let timestamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos();
            let sequence = CLIENT_ID_SEQUENCE.fetch_add(1, Ordering::Relaxed);
            let hash = (timestamp ^ (timestamp >> 32)) as u32;
            let mixed = hash ^ sequence.wrapping_mul(0x9E37_79B9);
            format!("{}{:08x}", CLIENT_ID_PREFIX, mixed)
        }
    }
}

/// Format a payload for human-readable log output (truncated, hex for binary).
#[must_use]
pub fn format_payload_preview(data: &[u8]) -> String {
    match std::str::from_utf8(data) {
        Ok(s) if s.chars().count() <= 120 => s.to_string(),
        Ok(s) => format!("{}...", s.chars().take(120).collect::<String>()),
        Err(_) if data.len() <= 60 => hex(data),
        Err(_) => format!("{}...", hex(&data[..60])),
    }
}

fn hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
