//! In-process lease queue with fault injection, used to exercise the pipeline in tests.
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::time::{Duration, Instant};

use super::{Envelope, MessageId, MessageQueue, MessageSink, ReceiptHandle, MAX_POLL_MESSAGES};
use crate::error::QueueError;

/// Things that happened to the queue and the store, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Persisted(i64),
    Deleted(MessageId),
}

pub type Journal = Rc<RefCell<Vec<Event>>>;

struct StoredMessage {
    id: MessageId,
    body: Vec<u8>,
    visible_at: Instant,
    lease_token: Option<i64>,
    delivery_count: u32,
}

pub struct MemoryQueue {
    messages: Vec<StoredMessage>,
    next_id: i64,
    next_lease_token: i64,
    lease: Duration,
    enqueue_attempts: usize,
    failing_enqueues: HashSet<usize>,
    fail_polls: bool,
    fail_deletes: bool,
    closed: bool,
    refused_reconnects: usize,
    reconnects: usize,
    poll_calls: usize,
    journal: Journal,
}

impl MemoryQueue {
    pub fn new(lease: Duration) -> MemoryQueue {
        MemoryQueue {
            messages: Vec::new(),
            next_id: 1,
            next_lease_token: 1,
            lease,
            enqueue_attempts: 0,
            failing_enqueues: HashSet::new(),
            fail_polls: false,
            fail_deletes: false,
            closed: false,
            refused_reconnects: 0,
            reconnects: 0,
            poll_calls: 0,
            journal: Journal::default(),
        }
    }

    /// Records deletions into `journal`, shared with a store to check ordering.
    pub fn with_journal(mut self, journal: Journal) -> MemoryQueue {
        self.journal = journal;
        self
    }

    /// Makes the enqueue attempts with the given zero based indices fail.
    pub fn fail_enqueues(&mut self, attempts: &[usize]) {
        self.failing_enqueues.extend(attempts.iter().copied());
    }

    pub fn fail_polls(&mut self, fail: bool) {
        self.fail_polls = fail;
    }

    pub fn fail_deletes(&mut self, fail: bool) {
        self.fail_deletes = fail;
    }

    /// Drops the connection. The next operation reconnects unless reconnects are refused.
    pub fn close_connection(&mut self) {
        self.closed = true;
    }

    /// Lets the next `attempts` reconnects fail with `QueueError::Disconnected`.
    pub fn refuse_reconnects(&mut self, attempts: usize) {
        self.refused_reconnects = attempts;
    }

    pub fn reconnects(&self) -> usize {
        self.reconnects
    }

    pub fn poll_calls(&self) -> usize {
        self.poll_calls
    }

    fn ensure_connected(&mut self) -> Result<(), QueueError> {
        if !self.closed {
            return Ok(());
        }
        if self.refused_reconnects > 0 {
            self.refused_reconnects -= 1;
            return Err(QueueError::Disconnected("connection refused".to_string()));
        }
        self.closed = false;
        self.reconnects += 1;
        Ok(())
    }

    /// Ends every running lease, as if the lease timeout passed.
    pub fn expire_leases(&mut self) {
        let now = Instant::now();
        for message in &mut self.messages {
            message.visible_at = now;
        }
    }

    /// Number of messages still held by the queue, leased or not.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn bodies(&self) -> Vec<String> {
        self.messages
            .iter()
            .map(|message| String::from_utf8_lossy(&message.body).into_owned())
            .collect()
    }

    pub fn deleted(&self) -> Vec<MessageId> {
        self.journal
            .borrow()
            .iter()
            .filter_map(|event| match event {
                Event::Deleted(id) => Some(*id),
                _ => None,
            })
            .collect()
    }
}

impl MessageSink for MemoryQueue {
    fn enqueue(&mut self, body: &[u8]) -> Result<MessageId, QueueError> {
        self.ensure_connected()?;
        let attempt = self.enqueue_attempts;
        self.enqueue_attempts += 1;
        if self.failing_enqueues.contains(&attempt) {
            return Err(QueueError::Unavailable(format!("send {} rejected", attempt)));
        }

        let id = MessageId(self.next_id);
        self.next_id += 1;
        self.messages.push(StoredMessage {
            id,
            body: body.to_vec(),
            visible_at: Instant::now(),
            lease_token: None,
            delivery_count: 0,
        });
        Ok(id)
    }
}

impl MessageQueue for MemoryQueue {
    fn poll(&mut self, max_messages: usize, _wait_time: Duration) -> Result<Vec<Envelope>, QueueError> {
        self.poll_calls += 1;
        self.ensure_connected()?;
        if self.fail_polls {
            return Err(QueueError::Unavailable("poll rejected".to_string()));
        }

        let now = Instant::now();
        let max_messages = max_messages.max(1).min(MAX_POLL_MESSAGES);
        let mut envelopes = Vec::new();

        for message in self.messages.iter_mut().filter(|message| message.visible_at <= now) {
            if envelopes.len() == max_messages {
                break;
            }
            let lease_token = self.next_lease_token;
            self.next_lease_token += 1;

            message.visible_at = now + self.lease;
            message.lease_token = Some(lease_token);
            message.delivery_count += 1;

            envelopes.push(Envelope {
                message_id: message.id,
                body: message.body.clone(),
                receipt: ReceiptHandle {
                    message_id: message.id,
                    lease_token,
                },
                delivery_count: message.delivery_count,
            });
        }
        Ok(envelopes)
    }

    fn delete(&mut self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        self.ensure_connected()?;
        if self.fail_deletes {
            return Err(QueueError::Unavailable("delete rejected".to_string()));
        }

        let position = self
            .messages
            .iter()
            .position(|message| message.id == receipt.message_id && message.lease_token == Some(receipt.lease_token))
            .ok_or(QueueError::LeaseLost(receipt.message_id.0))?;
        self.messages.remove(position);
        self.journal.borrow_mut().push(Event::Deleted(receipt.message_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leased_message_is_hidden_until_the_lease_ends() {
        let mut queue = MemoryQueue::new(Duration::from_secs(60));
        queue.enqueue(b"one").unwrap();

        assert_eq!(queue.poll(32, Duration::ZERO).unwrap().len(), 1);
        assert!(queue.poll(32, Duration::ZERO).unwrap().is_empty());

        queue.expire_leases();
        let redelivered = queue.poll(32, Duration::ZERO).unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].delivery_count, 2);
    }

    #[test]
    fn stale_receipt_cannot_delete() {
        let mut queue = MemoryQueue::new(Duration::from_secs(60));
        queue.enqueue(b"one").unwrap();
        let first = queue.poll(32, Duration::ZERO).unwrap().remove(0);
        queue.expire_leases();
        let second = queue.poll(32, Duration::ZERO).unwrap().remove(0);

        assert!(matches!(queue.delete(&first.receipt), Err(QueueError::LeaseLost(_))));
        queue.delete(&second.receipt).unwrap();
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn poll_respects_batch_limit() {
        let mut queue = MemoryQueue::new(Duration::from_secs(60));
        for _ in 0..40 {
            queue.enqueue(b"x").unwrap();
        }
        assert_eq!(queue.poll(5, Duration::ZERO).unwrap().len(), 5);
        assert_eq!(queue.poll(100, Duration::ZERO).unwrap().len(), MAX_POLL_MESSAGES);
    }

    #[test]
    fn closed_connection_comes_back_on_next_use() {
        let mut queue = MemoryQueue::new(Duration::from_secs(60));
        queue.enqueue(b"one").unwrap();
        queue.close_connection();
        queue.refuse_reconnects(1);

        assert!(matches!(queue.poll(32, Duration::ZERO), Err(QueueError::Disconnected(_))));
        assert_eq!(queue.poll(32, Duration::ZERO).unwrap().len(), 1);
        assert_eq!(queue.reconnects(), 1);
        assert_eq!(queue.poll_calls(), 2);
    }
}
