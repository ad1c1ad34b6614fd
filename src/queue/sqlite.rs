use super::MessageQueue;
use crate::domain::QueueMessage;
use crate::error::{PipelineError, Result};
use crate::metrics::QueueMetrics;
use crate::sqlite::{db_path_at_root, open_connection};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

/// Durable queue in a SQLite table. Dequeue selects and deletes the oldest
/// row of a queue inside one IMMEDIATE transaction, so concurrent
/// consumers (threads or processes) never receive the same message.
pub struct SqliteQueue {
    conn: Mutex<Connection>,
    capacity: Option<usize>,
}

impl SqliteQueue {
    pub fn open<P: AsRef<Path>>(db_path: P, capacity: Option<usize>) -> Result<Self> {
        let conn = open_connection(db_path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS queue_messages (
                seq          INTEGER PRIMARY KEY AUTOINCREMENT,
                id           TEXT NOT NULL UNIQUE,
                queue_name   TEXT NOT NULL,
                payload      TEXT NOT NULL,
                enqueued_at  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_queue_messages_queue
                ON queue_messages (queue_name, seq);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            capacity,
        })
    }

    pub fn open_at_root<P: AsRef<Path>>(data_root: P, capacity: Option<usize>) -> Result<Self> {
        Self::open(db_path_at_root(data_root), capacity)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PipelineError::Storage("queue connection lock poisoned".to_string()))
    }
}

fn count(conn: &Connection, queue_name: &str) -> Result<usize> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM queue_messages WHERE queue_name = ?1",
        params![queue_name],
        |row| row.get(0),
    )?;
    Ok(n as usize)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| PipelineError::Storage(format!("bad enqueued_at '{raw}': {e}")))
}

#[async_trait]
impl MessageQueue for SqliteQueue {
    async fn enqueue(&self, queue_name: &str, payload: serde_json::Value) -> Result<QueueMessage> {
        let message = QueueMessage::new(queue_name, payload);
        let payload_text = serde_json::to_string(&message.payload)?;

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let depth = count(&tx, queue_name)?;
        if let Some(capacity) = self.capacity {
            if depth >= capacity {
                QueueMetrics::record_full(queue_name);
                return Err(PipelineError::QueueFull {
                    queue: queue_name.to_string(),
                    capacity,
                });
            }
        }
        tx.execute(
            "INSERT INTO queue_messages (id, queue_name, payload, enqueued_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                message.id.to_string(),
                queue_name,
                payload_text,
                message.enqueued_at.to_rfc3339()
            ],
        )?;
        tx.commit()?;

        QueueMetrics::record_enqueued(queue_name, depth + 1);
        debug!(queue = queue_name, message_id = %message.id, "Enqueued message");
        Ok(message)
    }

    async fn dequeue(&self, queue_name: &str) -> Result<Option<QueueMessage>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let row = tx
            .query_row(
                "SELECT seq, id, payload, enqueued_at FROM queue_messages
                 WHERE queue_name = ?1 ORDER BY seq LIMIT 1",
                params![queue_name],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((seq, id, payload, enqueued_at)) = row else {
            return Ok(None);
        };
        tx.execute("DELETE FROM queue_messages WHERE seq = ?1", params![seq])?;
        let depth = count(&tx, queue_name)?;
        tx.commit()?;

        let message = QueueMessage {
            id: Uuid::parse_str(&id)
                .map_err(|e| PipelineError::Storage(format!("bad message id '{id}': {e}")))?,
            queue_name: queue_name.to_string(),
            payload: serde_json::from_str(&payload)?,
            enqueued_at: parse_timestamp(&enqueued_at)?,
        };
        QueueMetrics::record_dequeued(queue_name, depth);
        debug!(queue = queue_name, message_id = %message.id, "Dequeued message");
        Ok(Some(message))
    }

    async fn depth(&self, queue_name: &str) -> Result<usize> {
        let conn = self.lock()?;
        count(&conn, queue_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_round_trip_and_fifo() {
        let dir = TempDir::new().unwrap();
        let queue = SqliteQueue::open_at_root(dir.path(), None).unwrap();

        let first = queue.enqueue("q", json!({ "deviceId": "a" })).await.unwrap();
        queue.enqueue("q", json!({ "deviceId": "b" })).await.unwrap();
        assert_eq!(queue.depth("q").await.unwrap(), 2);

        let got = queue.dequeue("q").await.unwrap().unwrap();
        assert_eq!(got.id, first.id);
        assert_eq!(got.payload, json!({ "deviceId": "a" }));
        assert_eq!(
            queue.dequeue("q").await.unwrap().unwrap().payload,
            json!({ "deviceId": "b" })
        );
        assert!(queue.dequeue("q").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_messages_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let queue = SqliteQueue::open_at_root(dir.path(), None).unwrap();
            queue.enqueue("q", json!({ "deviceId": "persisted" })).await.unwrap();
        }
        let queue = SqliteQueue::open_at_root(dir.path(), None).unwrap();
        let got = queue.dequeue("q").await.unwrap().unwrap();
        assert_eq!(got.payload["deviceId"], "persisted");
    }

    #[tokio::test]
    async fn test_capacity() {
        let dir = TempDir::new().unwrap();
        let queue = SqliteQueue::open_at_root(dir.path(), Some(1)).unwrap();
        queue.enqueue("q", json!(1)).await.unwrap();
        assert!(matches!(
            queue.enqueue("q", json!(2)).await,
            Err(PipelineError::QueueFull { .. })
        ));
        queue.dequeue("q").await.unwrap();
        queue.enqueue("q", json!(3)).await.unwrap();
    }
}
