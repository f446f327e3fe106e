//! Received message records
//!
//! A [`MessageRecord`] is the immutable value the network thread hands to the
//! sample thread: the application payload plus the protocol metadata of the
//! delivery that carried it.

use std::fmt;

use chrono::{DateTime, Utc};
use rumqttc::{Publish, QoS};

use crate::util::qos_to_u8;

/// One application message received from the broker.
///
/// The QoS is the level the broker actually used for delivery, which can be
/// lower than the level requested at subscribe time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    topic: String,
    payload: Vec<u8>,
    qos: QoS,
    retained: bool,
    duplicate: bool,
    received_at: DateTime<Utc>,
}

impl MessageRecord {
    /// Creates a record stamped with the current wall-clock time.
    pub fn new(
        topic: impl Into<String>,
        payload: &[u8],
        qos: QoS,
        retained: bool,
        duplicate: bool,
    ) -> Self {
        Self::with_timestamp(topic, payload, qos, retained, duplicate, Utc::now())
    }

    /// Creates a record with an explicit arrival time.
    pub fn with_timestamp(
        topic: impl Into<String>,
        payload: &[u8],
        qos: QoS,
        retained: bool,
        duplicate: bool,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.to_vec(),
            qos,
            retained,
            duplicate,
            received_at,
        }
    }

    /// Builds a record from an inbound PUBLISH packet.
    pub fn from_publish(publish: &Publish) -> Self {
        Self::new(
            publish.topic.as_str(),
            &publish.payload,
            publish.qos,
            publish.retain,
            publish.dup,
        )
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consumes the record, returning the payload without copying it.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    pub fn is_retained(&self) -> bool {
        self.retained
    }

    pub fn is_duplicate(&self) -> bool {
        self.duplicate
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Arrival time as milliseconds since the Unix epoch.
    pub fn timestamp_millis(&self) -> i64 {
        self.received_at.timestamp_millis()
    }

    /// Human-readable description used as a sample response message.
    pub fn summary(&self, received_count: u64) -> String {
        format!(
            "Received {} messages.\nCurrent message QOS : {}\nIs current message a duplicate : {}\nReceived timestamp of current message : {}\nIs current message a retained message : {}",
            received_count,
            qos_to_u8(self.qos),
            self.duplicate,
            self.timestamp_millis(),
            self.retained
        )
    }
}

impl fmt::Display for MessageRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} bytes, qos {}{}{})",
            self.topic,
            self.payload.len(),
            qos_to_u8(self.qos),
            if self.retained { ", retained" } else { "" },
            if self.duplicate { ", dup" } else { "" }
        )
    }
}
