//! Registration gateway: the request-side half of the pipeline.
//!
//! `register` creates the record, enqueues it and returns before any
//! ingestion work happens. Status lookups read straight from the registry.

pub mod validation;

use crate::constants::DEVICE_REGISTRATIONS_QUEUE;
use crate::domain::{DeviceStatus, RegistrationPayload, RegistrationRecord, TransitionNote};
use crate::error::{PipelineError, Result};
use crate::metrics::GatewayMetrics;
use crate::queue::MessageQueue;
use crate::registry::DeviceRegistry;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

pub use validation::{validate_device_id, validate_registration};

/// Answer to an accepted registration.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub device_id: String,
    /// Always `pending`: the caller learns about progress by polling.
    pub status: DeviceStatus,
    pub queue_message_id: Uuid,
}

#[derive(Clone)]
pub struct RegistrationGateway {
    registry: DeviceRegistry,
    queue: Arc<dyn MessageQueue>,
}

impl RegistrationGateway {
    pub fn new(registry: DeviceRegistry, queue: Arc<dyn MessageQueue>) -> Self {
        Self { registry, queue }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub async fn register(&self, body: &serde_json::Value) -> Result<RegisterResponse> {
        let started = Instant::now();
        let result = self.register_inner(body).await;
        match &result {
            Ok(resp) => {
                GatewayMetrics::record_registration_accepted(started.elapsed().as_secs_f64());
                info!(device_id = %resp.device_id, message_id = %resp.queue_message_id, "Registration accepted");
            }
            Err(e) => {
                GatewayMetrics::record_registration_rejected(rejection_reason(e));
                warn!(error = %e, "Registration rejected");
            }
        }
        result
    }

    async fn register_inner(&self, body: &serde_json::Value) -> Result<RegisterResponse> {
        let fields = validate_registration(body)?;
        let requested_id = fields.device_id.clone();

        let record = match self.registry.save_registration(fields).await {
            Ok(record) => record,
            Err(PipelineError::DuplicateDevice(id)) => self.resumable(requested_id, id).await?,
            Err(e) => return Err(e),
        };

        // Enqueue first: a full queue leaves the record pending and resumable
        let payload = serde_json::to_value(RegistrationPayload::from_record(&record))?;
        let message = self.queue.enqueue(DEVICE_REGISTRATIONS_QUEUE, payload).await?;

        self.registry
            .transition_status_with(
                &record.device_id,
                DeviceStatus::Queued,
                TransitionNote::enqueued(message.id),
            )
            .await?;

        Ok(RegisterResponse {
            device_id: record.device_id,
            status: DeviceStatus::Pending,
            queue_message_id: message.id,
        })
    }

    /// A colliding id may be re-submitted only while its record never made
    /// it onto the queue.
    async fn resumable(
        &self,
        requested_id: Option<String>,
        existing_id: String,
    ) -> Result<RegistrationRecord> {
        if requested_id.is_none() {
            return Err(PipelineError::DuplicateDevice(existing_id));
        }
        let existing = self.registry.get_registration(&existing_id).await?;
        if existing.status() == DeviceStatus::Pending {
            info!(device_id = %existing_id, "Resuming pending registration");
            Ok(existing)
        } else {
            Err(PipelineError::DuplicateDevice(existing_id))
        }
    }

    pub async fn get_status(&self, device_id: &str) -> Result<RegistrationRecord> {
        let result = self.registry.get_registration(device_id).await;
        GatewayMetrics::record_status_lookup(result.is_ok());
        result
    }

    pub async fn list(&self) -> Result<Vec<RegistrationRecord>> {
        self.registry.list_registrations().await
    }
}

fn rejection_reason(err: &PipelineError) -> &'static str {
    match err {
        PipelineError::InvalidRequest(_) => "invalid_request",
        PipelineError::DuplicateDevice(_) => "duplicate",
        PipelineError::QueueFull { .. } => "queue_full",
        PipelineError::InvalidTransition { .. } => "invalid_transition",
        _ => "internal",
    }
}
