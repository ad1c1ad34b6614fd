use super::MessageQueue;
use crate::domain::QueueMessage;
use crate::error::{PipelineError, Result};
use crate::metrics::QueueMetrics;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// In-process queue for development, tests and the single-process `serve`
/// mode. One mutex guards every channel so enqueue/dequeue are serialized.
#[derive(Clone)]
pub struct InMemoryQueue {
    queues: Arc<Mutex<HashMap<String, VecDeque<QueueMessage>>>>,
    capacity: Option<usize>,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            capacity: None,
        }
    }

    /// Bound every named queue to `capacity` messages.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            capacity: Some(capacity),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, VecDeque<QueueMessage>>>> {
        self.queues
            .lock()
            .map_err(|_| PipelineError::Storage("queue lock poisoned".to_string()))
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn enqueue(&self, queue_name: &str, payload: serde_json::Value) -> Result<QueueMessage> {
        let mut queues = self.lock()?;
        let queue = queues.entry(queue_name.to_string()).or_default();

        if let Some(capacity) = self.capacity {
            if queue.len() >= capacity {
                QueueMetrics::record_full(queue_name);
                return Err(PipelineError::QueueFull {
                    queue: queue_name.to_string(),
                    capacity,
                });
            }
        }

        let message = QueueMessage::new(queue_name, payload);
        queue.push_back(message.clone());
        QueueMetrics::record_enqueued(queue_name, queue.len());

        debug!(queue = queue_name, message_id = %message.id, "Enqueued message");
        Ok(message)
    }

    async fn dequeue(&self, queue_name: &str) -> Result<Option<QueueMessage>> {
        let mut queues = self.lock()?;
        let Some(queue) = queues.get_mut(queue_name) else {
            return Ok(None);
        };
        let message = queue.pop_front();
        if let Some(msg) = &message {
            QueueMetrics::record_dequeued(queue_name, queue.len());
            debug!(queue = queue_name, message_id = %msg.id, "Dequeued message");
        }
        Ok(message)
    }

    async fn depth(&self, queue_name: &str) -> Result<usize> {
        let queues = self.lock()?;
        Ok(queues.get(queue_name).map_or(0, VecDeque::len))
    }
}
