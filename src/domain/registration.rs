use super::status::DeviceStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const DEFAULT_SOURCE: &str = "api";

/// Body of a registration request as accepted by the gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRegistration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub hardware_id: String,
    pub model: String,
    #[serde(default)]
    pub firmware_version: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub initial_telemetry: Option<serde_json::Value>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub ts: Option<DateTime<Utc>>,
}

/// One device's registration and its lifecycle status.
///
/// `status`, `attempts`, `last_error`, `updated_at` and `version` are only
/// written by the registry's transition path, so they have no public setters.
/// `version` grows by one on every transition and backs the store's
/// compare-and-set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRecord {
    pub device_id: String,
    pub hardware_id: String,
    pub hardware_id_hash: String,
    pub model: String,
    pub firmware_version: Option<String>,
    pub location: Option<String>,
    pub initial_telemetry: Option<serde_json::Value>,
    pub source: String,
    pub ts: DateTime<Utc>,
    status: DeviceStatus,
    attempts: u32,
    pub created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_error: Option<String>,
    queue_message_id: Option<Uuid>,
    #[serde(default)]
    ingestion_result: Option<serde_json::Value>,
    #[serde(default)]
    version: u64,
}

impl RegistrationRecord {
    /// Build a fresh `pending` record for `device_id`.
    pub fn new(device_id: String, fields: NewRegistration, now: DateTime<Utc>) -> Self {
        Self {
            hardware_id_hash: hash_hardware_id(&fields.hardware_id),
            device_id,
            hardware_id: fields.hardware_id,
            model: fields.model,
            firmware_version: fields.firmware_version,
            location: fields.location,
            initial_telemetry: fields.initial_telemetry,
            source: fields
                .source
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            ts: fields.ts.unwrap_or(now),
            status: DeviceStatus::Pending,
            attempts: 0,
            created_at: now,
            updated_at: now,
            last_error: None,
            queue_message_id: None,
            ingestion_result: None,
            version: 0,
        }
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn queue_message_id(&self) -> Option<Uuid> {
        self.queue_message_id
    }

    /// Body the ingestion system answered with when it acknowledged.
    pub fn ingestion_result(&self) -> Option<&serde_json::Value> {
        self.ingestion_result.as_ref()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Apply an already validated edge. Callers outside the registry go
    /// through `DeviceRegistry::transition_status`.
    pub(crate) fn apply_transition(
        &mut self,
        next: DeviceStatus,
        note: TransitionNote,
        now: DateTime<Utc>,
    ) {
        if next == DeviceStatus::Processing {
            self.attempts += 1;
        }
        match next {
            DeviceStatus::Acknowledged => {
                self.last_error = None;
                self.ingestion_result = note.ingestion_result;
            }
            _ => {
                if let Some(error) = note.error {
                    self.last_error = Some(error);
                }
            }
        }
        if let Some(message_id) = note.queue_message_id {
            self.queue_message_id = Some(message_id);
        }
        self.status = next;
        self.updated_at = now;
        self.version += 1;
    }
}

/// Extra data carried by a status transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionNote {
    /// Failure reason of the attempt that caused this transition.
    pub error: Option<String>,
    pub queue_message_id: Option<Uuid>,
    /// Receipt body, kept on `acknowledged` only.
    pub ingestion_result: Option<serde_json::Value>,
}

impl TransitionNote {
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn enqueued(message_id: Uuid) -> Self {
        Self {
            queue_message_id: Some(message_id),
            ..Default::default()
        }
    }

    pub fn acknowledged(receipt_body: Option<serde_json::Value>) -> Self {
        Self {
            ingestion_result: receipt_body,
            ..Default::default()
        }
    }
}

/// What travels on `device-registrations.v1`. The raw hardware id stays in
/// the registry; downstream systems only see its hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationPayload {
    pub device_id: String,
    #[serde(default)]
    pub hardware_id_hash: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub firmware_version: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub initial_telemetry: Option<serde_json::Value>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub trace_id: Option<Uuid>,
}

impl RegistrationPayload {
    pub fn from_record(record: &RegistrationRecord) -> Self {
        Self {
            device_id: record.device_id.clone(),
            hardware_id_hash: Some(record.hardware_id_hash.clone()),
            model: Some(record.model.clone()),
            firmware_version: record.firmware_version.clone(),
            location: record.location.clone(),
            ts: Some(record.ts),
            initial_telemetry: record.initial_telemetry.clone(),
            source: Some(record.source.clone()),
            trace_id: Some(Uuid::new_v4()),
        }
    }
}

pub fn hash_hardware_id(hardware_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(hardware_id.as_bytes());
    hex::encode(hasher.finalize())
}
