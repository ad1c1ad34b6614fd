use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A message as stored by a `MessageQueue`. The payload is opaque to the
/// queue; producers and consumers agree on its shape per queue name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub id: Uuid,
    pub queue_name: String,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueMessage {
    pub fn new(queue_name: &str, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue_name: queue_name.to_string(),
            payload,
            enqueued_at: Utc::now(),
        }
    }
}
