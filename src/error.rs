use crate::domain::DeviceStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid status transition for device {device_id}: {from} -> {to}")]
    InvalidTransition {
        device_id: String,
        from: DeviceStatus,
        to: DeviceStatus,
    },

    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Device already exists: {0}")]
    DuplicateDevice(String),

    #[error("Queue '{queue}' is full (capacity {capacity})")]
    QueueFull { queue: String, capacity: usize },

    #[error("Invalid registration request: {0}")]
    InvalidRequest(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Failure of a single delivery to the downstream ingestion system.
///
/// Every variant is transient from the consumer's point of view and is
/// retried until the attempt cap is reached.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("ingestion request timed out after {0}ms")]
    Timeout(u64),

    #[error("ingestion transport error: {0}")]
    Transport(String),

    #[error("ingestion rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("ingestion did not acknowledge: {0}")]
    Unacknowledged(String),
}
