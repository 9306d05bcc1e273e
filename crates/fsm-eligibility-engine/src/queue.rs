use std::path::PathBuf;

use anyhow::{Context, Result};
use fsm_eligibility_core::{CheckId, CheckType, QueueDestination};
use fsm_eligibility_store_sqlite::SqliteStore;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Endpoints a consumer uses to process a check and to poll its status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckLinks {
    pub get_check: String,
    pub process: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bulk_progress: Option<String>,
}

/// "Please process this check" message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueMessage {
    pub check_type: CheckType,
    pub check_id: CheckId,
    pub links: CheckLinks,
}

#[must_use]
pub fn destination_for(group_id: Option<&str>) -> QueueDestination {
    if group_id.is_some() {
        QueueDestination::Bulk
    } else {
        QueueDestination::Standard
    }
}

pub trait QueuePublisher: Send + Sync {
    /// # Errors
    /// Returns an error when the message could not be handed to the queue.
    fn publish(&self, destination: QueueDestination, message: &QueueMessage) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: i64,
    pub destination: QueueDestination,
    pub message: QueueMessage,
}

/// Queue outbox kept in the same `SQLite` database as the checks.
#[derive(Debug, Clone)]
pub struct SqliteQueue {
    db_path: PathBuf,
}

impl SqliteQueue {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Decode up to `limit` pending messages in FIFO order. Received messages
    /// stay in the outbox until [`SqliteQueue::ack`] or [`SqliteQueue::requeue`].
    /// Bodies that cannot be decoded are dropped with a warning.
    ///
    /// # Errors
    /// Returns an error when the outbox cannot be read.
    pub fn receive(
        &self,
        destination: QueueDestination,
        limit: usize,
    ) -> Result<Vec<ReceivedMessage>> {
        let mut store = self.open_store()?;
        let mut received = Vec::new();
        for raw in store.peek_messages(destination, limit)? {
            match serde_json::from_str(&raw.body) {
                Ok(message) => received.push(ReceivedMessage {
                    message_id: raw.message_id,
                    destination,
                    message,
                }),
                Err(err) => {
                    warn!(
                        message_id = raw.message_id,
                        error = %err,
                        "dropping undecodable queue message"
                    );
                    store.ack_message(raw.message_id)?;
                }
            }
        }
        Ok(received)
    }

    /// Remove a handled message from the outbox.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn ack(&self, item: &ReceivedMessage) -> Result<()> {
        self.open_store()?.ack_message(item.message_id)?;
        Ok(())
    }

    /// Move a message to the back of its destination. The original is only
    /// removed once the copy is enqueued.
    ///
    /// # Errors
    /// Returns an error when the copy cannot be enqueued or the original removed.
    pub fn requeue(&self, item: &ReceivedMessage) -> Result<()> {
        self.publish(item.destination, &item.message)?;
        self.ack(item)
    }

    /// # Errors
    /// Returns an error when the outbox cannot be read.
    pub fn depth(&self, destination: QueueDestination) -> Result<u64> {
        self.open_store()?.queue_depth(destination)
    }
}

impl QueuePublisher for SqliteQueue {
    fn publish(&self, destination: QueueDestination, message: &QueueMessage) -> Result<()> {
        let body = serde_json::to_string(message).context("failed to serialize queue message")?;
        let mut store = self.open_store()?;
        store.enqueue_message(destination, &body)?;
        Ok(())
    }
}
