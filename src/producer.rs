//! Module turning readings into queue messages.
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::QueueError;
use crate::generator;
use crate::queue::{MessageId, MessageSink};
use crate::record::SensorReading;

#[derive(Serialize, Deserialize, Debug, Clone)]
/// Parameters for a producer run.
pub struct ProducerParameters {
    /// Number of readings sent per run.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for ProducerParameters {
    fn default() -> Self {
        ProducerParameters {
            batch_size: default_batch_size(),
        }
    }
}

fn default_batch_size() -> usize {
    10
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("cannot serialize reading: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug)]
/// A send that did not make it into the queue.
pub struct SendFailure {
    /// Position of the reading in the batch.
    pub index: usize,
    pub reading: SensorReading,
    pub error: SendError,
}

#[derive(Debug, Default)]
/// Result of sending one batch.
pub struct ProduceReport {
    pub sent: Vec<MessageId>,
    pub failures: Vec<SendFailure>,
}

impl ProduceReport {
    pub fn all_sent(&self) -> bool {
        self.failures.is_empty()
    }

    /// One entry per failed send: position in the batch, reading id and the error.
    pub fn failure_summary(&self) -> String {
        self.failures
            .iter()
            .map(|failure| format!("#{} (reading {}): {}", failure.index, failure.reading.id, failure.error))
            .collect::<Vec<String>>()
            .join("; ")
    }
}

pub struct Producer<S> {
    sink: S,
}

impl<S: MessageSink> Producer<S> {
    pub fn new(sink: S) -> Producer<S> {
        Producer { sink }
    }

    /// Serializes `reading` and enqueues it as one message.
    pub fn send(&mut self, reading: &SensorReading) -> Result<MessageId, SendError> {
        let body = reading.to_message()?;
        let message_id = self.sink.enqueue(&body)?;
        log::info!(target: "queuelogd::producer", "Sent message {} to queue: {}", message_id, String::from_utf8_lossy(&body));
        Ok(message_id)
    }

    /// Sends every reading on its own. A failed send is logged and reported, the remaining
    /// readings are still sent.
    pub fn produce<I>(&mut self, readings: I) -> ProduceReport
    where
        I: IntoIterator<Item = SensorReading>,
    {
        let mut report = ProduceReport::default();

        for (index, reading) in readings.into_iter().enumerate() {
            match self.send(&reading) {
                Ok(message_id) => report.sent.push(message_id),
                Err(error) => {
                    log::error!(target: "queuelogd::producer", "Could not send reading {} (#{} of batch): \'{}\'", reading.id, index, error);
                    report.failures.push(SendFailure { index, reading, error });
                }
            }
        }

        log::info!(target: "queuelogd::producer", "Sent {} messages, {} failed", report.sent.len(), report.failures.len());
        report
    }

    /// Generates `count` readings and sends them.
    pub fn produce_generated(&mut self, count: usize) -> ProduceReport {
        self.produce((0..count).map(|_| generator::reading()))
    }
}
