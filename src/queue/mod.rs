//! Named FIFO message channels with at-least-once delivery.
//!
//! Ordering holds within one queue name only. A dequeued message belongs to
//! the caller; nothing redelivers it if the caller crashes before finishing.

pub mod in_memory;
pub mod sqlite;

use crate::domain::QueueMessage;
use crate::error::Result;
use async_trait::async_trait;

pub use in_memory::InMemoryQueue;
pub use sqlite::SqliteQueue;

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Append `payload` to `queue_name`, creating the queue on first use.
    /// Fails with `QueueFull` when a configured capacity is reached.
    async fn enqueue(&self, queue_name: &str, payload: serde_json::Value) -> Result<QueueMessage>;

    /// Remove and return the oldest message, or `None` when the queue is
    /// empty. Emptiness is not an error.
    async fn dequeue(&self, queue_name: &str) -> Result<Option<QueueMessage>>;

    /// Number of messages waiting in `queue_name`.
    async fn depth(&self, queue_name: &str) -> Result<usize>;
}
