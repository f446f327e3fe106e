//! Time-bounded poll loop
//!
//! Drains a client's inbox on the sample thread. Each pass waits at most one
//! poll interval for a message, then re-checks the interrupt flag and the
//! elapsed time against the caller's timeout. When the timeout passes, the
//! loop disconnects the client exactly once and stops.
//!
//! Connection loss does not end the loop on its own. Only a timeout, an
//! interrupt, or the inbox being closed by a disconnect does.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::InterruptFlag;
use crate::buffer::Inbox;
use crate::client::MqttClientHandle;
use crate::error::MqttSamplerError;
use crate::message::MessageRecord;

/// What a poll loop reads from and disconnects on timeout.
pub trait PollSource {
    /// Inbox of the current subscription, if there is one.
    fn inbox(&self) -> Option<Arc<Inbox>>;

    fn disconnect(&self) -> Result<(), MqttSamplerError>;

    fn client_id(&self) -> &str;
}

impl PollSource for MqttClientHandle {
    fn inbox(&self) -> Option<Arc<Inbox>> {
        MqttClientHandle::inbox(self)
    }

    fn disconnect(&self) -> Result<(), MqttSamplerError> {
        MqttClientHandle::disconnect(self)
    }

    fn client_id(&self) -> &str {
        MqttClientHandle::client_id(self)
    }
}

/// Why a poll loop returned.
#[derive(Debug)]
pub enum PollOutcome {
    /// A message, with the inbox's consumed count including it.
    Message(MessageRecord, u64),
    /// The timeout passed; the source has been disconnected.
    TimedOut,
    /// The interrupt flag was raised.
    Interrupted,
    /// No inbox, or the inbox was closed by a disconnect.
    Detached,
}

/// Poll loop settings.
#[derive(Debug, Clone)]
pub struct PollLoop {
    timeout: Option<Duration>,
    interval: Duration,
    interrupt: InterruptFlag,
}

impl PollLoop {
    /// `timeout` of `None` polls until interrupted or detached.
    pub fn new(timeout: Option<Duration>, interrupt: InterruptFlag) -> Self {
        Self {
            timeout,
            interval: Duration::from_millis(100),
            interrupt,
        }
    }

    /// Sets the longest single wait between flag and timeout checks.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Waits for one message.
    pub fn next_message<S: PollSource + ?Sized>(&self, source: &S) -> PollOutcome {
        self.poll_from(source, Instant::now())
    }

    /// Hands every message to `on_message` until the timeout, an interrupt,
    /// a detach, or `on_message` breaks.
    ///
    /// Returns how the loop ended and the number of messages delivered. A
    /// break from `on_message` is reported as the last message.
    pub fn drain<S, F>(&self, source: &S, mut on_message: F) -> (PollOutcome, u64)
    where
        S: PollSource + ?Sized,
        F: FnMut(&MessageRecord, u64) -> ControlFlow<()>,
    {
        let started = Instant::now();
        let mut delivered = 0;
        loop {
            match self.poll_from(source, started) {
                PollOutcome::Message(record, count) => {
                    delivered += 1;
                    if on_message(&record, count).is_break() {
                        return (PollOutcome::Message(record, count), delivered);
                    }
                }
                other => return (other, delivered),
            }
        }
    }

    fn poll_from<S: PollSource + ?Sized>(&self, source: &S, started: Instant) -> PollOutcome {
        loop {
            if self.interrupt.is_raised() {
                debug!("Poll loop for {} interrupted", source.client_id());
                return PollOutcome::Interrupted;
            }

            let mut wait = self.interval;
            if let Some(timeout) = self.timeout {
                let elapsed = started.elapsed();
                if elapsed >= timeout {
                    self.expire(source, timeout);
                    return PollOutcome::TimedOut;
                }
                wait = wait.min(timeout - elapsed);
            }

            let Some(inbox) = source.inbox() else {
                return PollOutcome::Detached;
            };
            if inbox.buffer().is_closed() {
                return PollOutcome::Detached;
            }
            if let Some(record) = inbox.poll_timeout(wait) {
                return PollOutcome::Message(record, inbox.received_count());
            }
        }
    }

    fn expire<S: PollSource + ?Sized>(&self, source: &S, timeout: Duration) {
        debug!(
            "{}; disconnecting {}",
            MqttSamplerError::TimeoutExceeded(timeout),
            source.client_id()
        );
        if let Err(e) = source.disconnect() {
            warn!(
                "Failed to disconnect {} after timeout: {}",
                source.client_id(),
                e
            );
        }
    }
}
