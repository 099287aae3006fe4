//! Module for the durable message queue between the producer and the consumer.
//!
//! The queue delivers every message at least once. A polled message is leased to the caller; it
//! stays invisible to other consumers until the lease runs out and is delivered again unless the
//! caller deletes it with the receipt handed out by the poll.
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::QueueError;

pub mod json_lines;
#[cfg(test)]
pub mod memory;
pub mod postgres_queue;

/// Upper bound for the number of messages a single poll may claim.
pub const MAX_POLL_MESSAGES: usize = 32;

#[derive(Serialize, Deserialize, Debug, Clone)]
/// Parameters of the lease queue.
pub struct QueueParameters {
    /// Seconds a polled message stays invisible before it is delivered again.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    /// Milliseconds between two looks at the queue while a poll waits for messages.
    #[serde(default = "default_poll_interval_millis")]
    pub poll_interval_millis: u64,
}

impl Default for QueueParameters {
    fn default() -> Self {
        QueueParameters {
            lease_secs: default_lease_secs(),
            poll_interval_millis: default_poll_interval_millis(),
        }
    }
}

fn default_lease_secs() -> u64 {
    30
}

fn default_poll_interval_millis() -> u64 {
    500
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Identifier the queue assigns to an enqueued message.
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Proof of the lease on a delivered message. Deleting requires the receipt of the current lease.
pub struct ReceiptHandle {
    pub message_id: MessageId,
    pub lease_token: i64,
}

#[derive(Debug, Clone)]
/// One delivery of a message.
pub struct Envelope {
    pub message_id: MessageId,
    pub body: Vec<u8>,
    pub receipt: ReceiptHandle,
    /// How often the message has been handed out, including this delivery.
    pub delivery_count: u32,
}

impl Envelope {
    /// The body for log output, lossy for non UTF-8 content.
    pub fn body_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Anything a producer can hand serialized readings to.
pub trait MessageSink {
    /// Durably stores one message.
    fn enqueue(&mut self, body: &[u8]) -> Result<MessageId, QueueError>;
}

/// Capability of a durable, at-least-once message queue.
pub trait MessageQueue: MessageSink {
    /// Leases up to `max_messages` visible messages.
    ///
    /// Waits at most `wait_time` for messages to become visible and returns an empty batch when
    /// none showed up.
    fn poll(&mut self, max_messages: usize, wait_time: Duration) -> Result<Vec<Envelope>, QueueError>;

    /// Removes a leased message for good.
    fn delete(&mut self, receipt: &ReceiptHandle) -> Result<(), QueueError>;
}

impl<S: MessageSink + ?Sized> MessageSink for &mut S {
    fn enqueue(&mut self, body: &[u8]) -> Result<MessageId, QueueError> {
        (**self).enqueue(body)
    }
}

impl<Q: MessageQueue + ?Sized> MessageQueue for &mut Q {
    fn poll(&mut self, max_messages: usize, wait_time: Duration) -> Result<Vec<Envelope>, QueueError> {
        (**self).poll(max_messages, wait_time)
    }

    fn delete(&mut self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        (**self).delete(receipt)
    }
}

/// Pause before the next look at an empty queue, `None` once the poll has waited long enough.
pub fn next_poll_pause(elapsed: Duration, wait_time: Duration, poll_interval: Duration) -> Option<Duration> {
    if elapsed >= wait_time {
        return None;
    }
    Some(poll_interval.min(wait_time - elapsed))
}
