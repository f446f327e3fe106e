//! Sample drivers
//!
//! A sampler turns client operations into [`SampleResult`]s, one per
//! iteration of a virtual user. The lifecycle mirrors a load-test thread:
//!
//! 1. `thread_started` validates settings (and for publishers, connects)
//! 2. `sample` runs once per iteration
//! 3. `thread_finished` closes the thread's own client
//!
//! All clients are also registered with the run's
//! [`ClientRegistry`](crate::registry::ClientRegistry) so the runner can
//! close whatever is left at the end of the test.

pub mod poll;
pub mod publisher;
pub mod subscriber;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use poll::{PollLoop, PollOutcome, PollSource};
pub use publisher::PublisherSampler;
pub use subscriber::SubscriberSampler;

/// Response code for a successful sample.
pub const RESPONSE_OK: &str = "OK";

/// Response code for a failed sample.
pub const RESPONSE_FAILED: &str = "FAILED";

/// Shared stop flag observed by poll loops and the runner.
///
/// Raising it never kills a thread; loops notice it on their next check.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag. Returns `true` if it was not raised before.
    pub fn raise(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Outcome of one sample.
#[derive(Debug, Clone, Serialize)]
pub struct SampleResult {
    pub label: String,
    pub success: bool,
    pub response_code: String,
    pub response_message: String,
    #[serde(skip)]
    pub response_data: Vec<u8>,
    pub bytes: usize,
    pub started_at: DateTime<Utc>,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    #[serde(skip)]
    timer: Option<Instant>,
}

impl SampleResult {
    /// Starts timing a sample.
    pub fn start(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            success: false,
            response_code: String::new(),
            response_message: String::new(),
            response_data: Vec::new(),
            bytes: 0,
            started_at: Utc::now(),
            elapsed: Duration::ZERO,
            timer: Some(Instant::now()),
        }
    }

    /// Stops the clock and marks the sample successful.
    pub fn succeed(mut self, message: impl Into<String>, data: Vec<u8>) -> Self {
        self.finish(true, RESPONSE_OK, message.into(), data);
        self
    }

    /// Stops the clock and marks the sample failed.
    pub fn fail(mut self, message: impl Into<String>, data: Vec<u8>) -> Self {
        self.finish(false, RESPONSE_FAILED, message.into(), data);
        self
    }

    fn finish(&mut self, success: bool, code: &str, message: String, data: Vec<u8>) {
        if let Some(timer) = self.timer.take() {
            self.elapsed = timer.elapsed();
        }
        self.success = success;
        self.response_code = code.to_string();
        self.response_message = message;
        self.bytes = data.len();
        self.response_data = data;
    }
}

fn serialize_millis<S: serde::Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(elapsed.as_millis() as u64)
}
