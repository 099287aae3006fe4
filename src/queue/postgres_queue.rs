//! Lease queue kept in a postgres table.
use std::thread::sleep;
use std::time::{Duration, Instant};

use postgres::Client;

use super::{next_poll_pause, Envelope, MessageId, MessageQueue, MessageSink, QueueParameters, ReceiptHandle, MAX_POLL_MESSAGES};
use crate::database::{self, DatabaseParameters};
use crate::error::QueueError;

static SQL_QUEUE_ENQUEUE: &'static str = include_str!("../sql/queue_enqueue.sql");
static SQL_QUEUE_CLAIM: &'static str = include_str!("../sql/queue_claim.sql");
static SQL_QUEUE_DELETE: &'static str = include_str!("../sql/queue_delete.sql");

/// Queue on the `reading_queue` table.
///
/// Claiming uses `FOR UPDATE SKIP LOCKED`, so any number of consumers can poll the same table
/// without handing one message to two of them during a lease.
///
/// A dropped connection is opened again before the next operation.
pub struct PostgresQueue {
    client: Client,
    database_parameters: DatabaseParameters,
    lease: Duration,
    poll_interval: Duration,
}

impl PostgresQueue {
    /// Opens the connection the queue works on.
    ///
    /// # Errors
    ///
    /// * `QueueError::Connect` - The database cannot be reached or TLS setup failed.
    pub fn connect(database_parameters: &DatabaseParameters, parameters: &QueueParameters) -> Result<PostgresQueue, QueueError> {
        let client = database::connect(database_parameters).map_err(QueueError::Connect)?;
        log::info!(target: "queuelogd::queue", "Queue connection established!");

        Ok(PostgresQueue {
            client,
            database_parameters: database_parameters.clone(),
            lease: Duration::from_secs(parameters.lease_secs),
            poll_interval: Duration::from_millis(parameters.poll_interval_millis.max(1)),
        })
    }

    fn ensure_connected(&mut self) -> Result<(), QueueError> {
        if !self.client.is_closed() {
            return Ok(());
        }

        log::warn!(target: "queuelogd::queue", "Queue connection lost, reconnecting!");
        self.client = database::connect(&self.database_parameters).map_err(QueueError::Connect)?;
        log::info!(target: "queuelogd::queue", "Queue connection re-established!");
        Ok(())
    }

    fn claim(&mut self, max_messages: usize) -> Result<Vec<Envelope>, QueueError> {
        self.ensure_connected()?;

        let lease_token: i64 = rand::random();
        let rows = self
            .client
            .query(SQL_QUEUE_CLAIM, &[&(max_messages as i64), &self.lease.as_secs_f64(), &lease_token])
            .map_err(transport_error)?;

        let mut envelopes = Vec::with_capacity(rows.len());
        for row in rows {
            let message_id = MessageId(row.get("id"));
            let body: String = row.get("body");
            let delivery_count: i32 = row.get("delivery_count");
            envelopes.push(Envelope {
                message_id,
                body: body.into_bytes(),
                receipt: ReceiptHandle { message_id, lease_token },
                delivery_count: delivery_count.max(0) as u32,
            });
        }
        envelopes.sort_by_key(|envelope| envelope.message_id.0);
        Ok(envelopes)
    }
}

fn transport_error(err: postgres::Error) -> QueueError {
    if err.is_closed() {
        QueueError::Disconnected(err.to_string())
    } else {
        QueueError::Transport(err)
    }
}

impl MessageSink for PostgresQueue {
    fn enqueue(&mut self, body: &[u8]) -> Result<MessageId, QueueError> {
        let body = std::str::from_utf8(body)?;
        self.ensure_connected()?;
        let row = self
            .client
            .query_one(SQL_QUEUE_ENQUEUE, &[&body])
            .map_err(transport_error)?;
        Ok(MessageId(row.get("id")))
    }
}

impl MessageQueue for PostgresQueue {
    fn poll(&mut self, max_messages: usize, wait_time: Duration) -> Result<Vec<Envelope>, QueueError> {
        let max_messages = max_messages.max(1).min(MAX_POLL_MESSAGES);
        let started = Instant::now();

        loop {
            let envelopes = self.claim(max_messages)?;
            if !envelopes.is_empty() {
                log::trace!(target: "queuelogd::queue", "Claimed {} messages", envelopes.len());
                return Ok(envelopes);
            }

            match next_poll_pause(started.elapsed(), wait_time, self.poll_interval) {
                Some(pause) => sleep(pause),
                None => return Ok(Vec::new()),
            }
        }
    }

    fn delete(&mut self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        self.ensure_connected()?;
        let deleted = self
            .client
            .execute(SQL_QUEUE_DELETE, &[&receipt.message_id.0, &receipt.lease_token])
            .map_err(transport_error)?;

        if deleted == 0 {
            return Err(QueueError::LeaseLost(receipt.message_id.0));
        }
        Ok(())
    }
}
