//! Inbound message buffer
//!
//! Bridges the network thread, which receives messages whenever the broker
//! sends them, and the sample thread, which polls for them on its own
//! schedule.
//!
//! The buffer has a fixed capacity. When it is full, [`InboundMessageBuffer::push`]
//! blocks the network thread until the consumer frees a slot, so a slow
//! sampler throttles delivery instead of growing memory without bound.
//! [`InboundMessageBuffer::try_pop`] never blocks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::message::MessageRecord;

/// Default number of slots in a subscription buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Returned by [`InboundMessageBuffer::push`] once the buffer has been closed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("inbound message buffer is closed")]
pub struct BufferClosed;

struct Slots {
    queue: VecDeque<MessageRecord>,
    closed: bool,
}

/// Bounded, thread-safe FIFO of received messages.
pub struct InboundMessageBuffer {
    slots: Mutex<Slots>,
    not_full: Condvar,
    not_empty: Condvar,
    capacity: usize,
    len: AtomicUsize,
    total_accepted: AtomicU64,
}

impl InboundMessageBuffer {
    /// Creates a buffer holding at most `capacity` messages (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Mutex::new(Slots {
                queue: VecDeque::with_capacity(capacity.min(DEFAULT_BUFFER_CAPACITY)),
                closed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            capacity,
            len: AtomicUsize::new(0),
            total_accepted: AtomicU64::new(0),
        }
    }

    /// Appends a record, blocking while the buffer is full.
    ///
    /// # Errors
    ///
    /// Returns [`BufferClosed`] if the buffer is closed before or while waiting
    /// for space. The record is dropped in that case.
    pub fn push(&self, record: MessageRecord) -> Result<(), BufferClosed> {
        let mut slots = self.slots.lock();
        while !slots.closed && slots.queue.len() >= self.capacity {
            self.not_full.wait(&mut slots);
        }
        if slots.closed {
            return Err(BufferClosed);
        }
        slots.queue.push_back(record);
        self.len.store(slots.queue.len(), Ordering::Release);
        self.total_accepted.fetch_add(1, Ordering::Relaxed);
        drop(slots);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Removes the head record without waiting.
    pub fn try_pop(&self) -> Option<MessageRecord> {
        let mut slots = self.slots.lock();
        let record = slots.queue.pop_front();
        if record.is_some() {
            self.len.store(slots.queue.len(), Ordering::Release);
            drop(slots);
            self.not_full.notify_one();
        }
        record
    }

    /// Removes the head record, waiting up to `wait` for one to arrive.
    ///
    /// Returns `None` on timeout or when the buffer is closed and drained.
    pub fn pop_timeout(&self, wait: Duration) -> Option<MessageRecord> {
        let deadline = Instant::now() + wait;
        let mut slots = self.slots.lock();
        while slots.queue.is_empty() && !slots.closed {
            if self.not_empty.wait_until(&mut slots, deadline).timed_out() {
                break;
            }
        }
        let record = slots.queue.pop_front();
        if record.is_some() {
            self.len.store(slots.queue.len(), Ordering::Release);
            drop(slots);
            self.not_full.notify_one();
        }
        record
    }

    /// Closes the buffer: queued records are discarded, blocked producers and
    /// waiting consumers are woken, and later pushes are rejected.
    pub fn close(&self) {
        let mut slots = self.slots.lock();
        slots.closed = true;
        slots.queue.clear();
        self.len.store(0, Ordering::Release);
        drop(slots);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.slots.lock().closed
    }

    /// Number of queued records. Does not take the queue lock.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total records ever accepted by [`push`](Self::push).
    pub fn total_accepted(&self) -> u64 {
        self.total_accepted.load(Ordering::Relaxed)
    }
}

impl Default for InboundMessageBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

/// One subscription cycle's buffer plus the count of messages the sampler
/// has consumed from it.
///
/// Handles swap in a fresh `Inbox` on every subscribe; readers holding the
/// previous `Arc` can keep draining it.
pub struct Inbox {
    buffer: InboundMessageBuffer,
    received: AtomicU64,
}

impl Inbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: InboundMessageBuffer::new(capacity),
            received: AtomicU64::new(0),
        }
    }

    pub fn buffer(&self) -> &InboundMessageBuffer {
        &self.buffer
    }

    /// Pops without waiting and counts the message as received.
    pub fn poll_one(&self) -> Option<MessageRecord> {
        let record = self.buffer.try_pop();
        if record.is_some() {
            self.received.fetch_add(1, Ordering::Relaxed);
        }
        record
    }

    /// Pops with a bounded wait and counts the message as received.
    pub fn poll_timeout(&self, wait: Duration) -> Option<MessageRecord> {
        let record = self.buffer.pop_timeout(wait);
        if record.is_some() {
            self.received.fetch_add(1, Ordering::Relaxed);
        }
        record
    }

    /// Messages handed to the sampler so far.
    pub fn received_count(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}
