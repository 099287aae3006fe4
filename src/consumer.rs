//! Module for taking messages off the queue and storing the readings they carry in the database.
//!
//! A message is deleted from the queue only after its reading was stored. If the consumer dies in
//! between, the message is delivered again and stored a second time; duplicate rows are accepted,
//! lost readings are not.
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::database::ReadingStore;
use crate::error::QueueError;
use crate::queue::{Envelope, MessageQueue, MAX_POLL_MESSAGES};
use crate::record::{message_id_hint, SensorReading};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "lowercase")]
/// What happens to a message whose body can never become a reading.
pub enum ValidationFailurePolicy {
    /// Delete the message, so it cannot come back as a poison message.
    Discard,
    /// Leave the message in the queue. It is delivered again after every lease.
    Retain,
}

impl Default for ValidationFailurePolicy {
    fn default() -> Self {
        ValidationFailurePolicy::Discard
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
/// Parameters for the consumer.
pub struct ConsumerParameters {
    /// Maximum number of messages taken per poll, 1 to 32.
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    /// Seconds a poll waits for messages before returning empty.
    #[serde(default = "default_wait_time_secs")]
    pub wait_time_secs: u64,
    #[serde(default)]
    pub validation_failure_policy: ValidationFailurePolicy,
    /// Milliseconds to wait after a failed poll, and after an empty poll that did not wait.
    #[serde(default = "default_idle_pause_millis")]
    pub idle_pause_millis: u64,
    /// Consecutive polls failing on a lost connection before `run` gives up.
    #[serde(default = "default_max_connection_failures")]
    pub max_connection_failures: u32,
}

impl Default for ConsumerParameters {
    fn default() -> Self {
        ConsumerParameters {
            max_messages: default_max_messages(),
            wait_time_secs: default_wait_time_secs(),
            validation_failure_policy: ValidationFailurePolicy::default(),
            idle_pause_millis: default_idle_pause_millis(),
            max_connection_failures: default_max_connection_failures(),
        }
    }
}

fn default_max_messages() -> usize {
    MAX_POLL_MESSAGES
}

fn default_wait_time_secs() -> u64 {
    5
}

fn default_idle_pause_millis() -> u64 {
    1000
}

fn default_max_connection_failures() -> u32 {
    30
}

#[derive(Debug, Clone, Copy, PartialEq)]
/// Where a single message ended up.
pub enum MessageOutcome {
    /// Stored and deleted from the queue.
    Acknowledged,
    /// The body is not a valid reading. The store was not touched.
    ValidationFailed,
    /// The store failed. The message stays in the queue and comes back after its lease.
    PersistFailed,
    /// Stored, but the delete failed. The next delivery stores a duplicate row.
    AckFailed,
}

#[derive(Debug, Default, Clone, PartialEq)]
/// Counts of one poll cycle.
pub struct BatchReport {
    pub received: usize,
    pub acknowledged: usize,
    pub validation_failed: usize,
    pub persist_failed: usize,
    pub ack_failed: usize,
}

impl BatchReport {
    fn record(&mut self, outcome: MessageOutcome) {
        match outcome {
            MessageOutcome::Acknowledged => self.acknowledged += 1,
            MessageOutcome::ValidationFailed => self.validation_failed += 1,
            MessageOutcome::PersistFailed => self.persist_failed += 1,
            MessageOutcome::AckFailed => self.ack_failed += 1,
        }
    }
}

pub struct Consumer<Q, S> {
    queue: Q,
    store: S,
    max_messages: usize,
    wait_time: Duration,
    validation_failure_policy: ValidationFailurePolicy,
    idle_pause: Duration,
    max_connection_failures: u32,
}

impl<Q: MessageQueue, S: ReadingStore> Consumer<Q, S> {
    pub fn new(queue: Q, store: S, parameters: &ConsumerParameters) -> Consumer<Q, S> {
        Consumer {
            queue,
            store,
            max_messages: parameters.max_messages.max(1).min(MAX_POLL_MESSAGES),
            wait_time: Duration::from_secs(parameters.wait_time_secs),
            validation_failure_policy: parameters.validation_failure_policy,
            idle_pause: Duration::from_millis(parameters.idle_pause_millis),
            max_connection_failures: parameters.max_connection_failures.max(1),
        }
    }

    /// Polls the queue once and handles every received message on its own.
    ///
    /// # Errors
    ///
    /// * `QueueError` - The poll itself failed. Nothing was leased, so nothing is lost.
    pub fn poll_once(&mut self) -> Result<BatchReport, QueueError> {
        let envelopes = self.queue.poll(self.max_messages, self.wait_time)?;

        let mut report = BatchReport {
            received: envelopes.len(),
            ..BatchReport::default()
        };
        for envelope in &envelopes {
            report.record(self.process(envelope));
        }

        if report.received > 0 {
            log::info!(target: "queuelogd::consumer",
                       "Batch of {} messages: {} stored, {} invalid, {} store failures, {} delete failures",
                       report.received, report.acknowledged, report.validation_failed, report.persist_failed, report.ack_failed);
        }
        Ok(report)
    }

    /// Validates, stores and acknowledges one delivered message.
    pub fn process(&mut self, envelope: &Envelope) -> MessageOutcome {
        log::debug!(target: "queuelogd::consumer", "Raw message {} content: {}", envelope.message_id, envelope.body_lossy());
        if envelope.delivery_count > 1 {
            log::info!(target: "queuelogd::consumer", "Message {} delivered for the {}. time", envelope.message_id, envelope.delivery_count);
        }

        let reading = match SensorReading::from_message(&envelope.body) {
            Ok(reading) => reading,
            Err(err) => {
                log::warn!(target: "queuelogd::consumer",
                           "Skipped message {} (reading id {:?}): \'{}\', body: {}",
                           envelope.message_id, message_id_hint(&envelope.body), err, envelope.body_lossy());
                self.handle_invalid(envelope);
                return MessageOutcome::ValidationFailed;
            }
        };

        match self.store.insert_reading(&reading) {
            Ok(_) => {}
            Err(err) => {
                log::error!(target: "queuelogd::consumer",
                            "Could not store reading {} of message {}, leaving it for redelivery: \'{}\', body: {}",
                            reading.id, envelope.message_id, err, envelope.body_lossy());
                return MessageOutcome::PersistFailed;
            }
        };

        match self.queue.delete(&envelope.receipt) {
            Ok(_) => {
                log::debug!(target: "queuelogd::consumer", "Stored reading {} and deleted message {}", reading.id, envelope.message_id);
                MessageOutcome::Acknowledged
            }
            Err(err) => {
                log::warn!(target: "queuelogd::consumer",
                           "Stored reading {} but could not delete message {}, expect a duplicate: \'{}\'",
                           reading.id, envelope.message_id, err);
                MessageOutcome::AckFailed
            }
        }
    }

    fn handle_invalid(&mut self, envelope: &Envelope) {
        if self.validation_failure_policy == ValidationFailurePolicy::Retain {
            return;
        }
        match self.queue.delete(&envelope.receipt) {
            Ok(_) => log::info!(target: "queuelogd::consumer", "Discarded invalid message {}", envelope.message_id),
            Err(err) => {
                log::warn!(target: "queuelogd::consumer", "Could not discard invalid message {}: \'{}\'", envelope.message_id, err);
            }
        }
    }

    /// Polls until `thread_finish` is set.
    ///
    /// An empty poll returns after the poll wait time. Without a wait time the loop pauses for
    /// the idle pause instead, so it never spins. Messages in flight when the flag is set stay
    /// leased and are delivered again later.
    ///
    /// # Errors
    ///
    /// * `QueueError` - The queue connection stayed lost for `max_connection_failures` polls in a row.
    pub fn run(&mut self, thread_finish: &AtomicBool) -> Result<(), QueueError> {
        log::info!(target: "queuelogd::consumer", "Consumer started, polling up to {} messages", self.max_messages);
        let mut connection_failures = 0;

        while !thread_finish.load(Ordering::SeqCst) {
            match self.poll_once() {
                Ok(report) => {
                    connection_failures = 0;
                    if report.received == 0 {
                        log::trace!(target: "queuelogd::consumer", "No messages visible");
                        if self.wait_time == Duration::ZERO {
                            sleep(self.idle_pause);
                        }
                    }
                }
                Err(err) => {
                    log::error!(target: "queuelogd::consumer", "Could not poll the queue: \'{}\'", err);
                    if err.is_connection_lost() {
                        connection_failures += 1;
                        if connection_failures >= self.max_connection_failures {
                            log::error!(target: "queuelogd::consumer",
                                        "Queue connection lost for {} polls in a row, giving up", connection_failures);
                            return Err(err);
                        }
                    }
                    sleep(self.idle_pause);
                }
            }
        }

        log::info!(target: "queuelogd::consumer", "Consumer stopped");
        Ok(())
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}
