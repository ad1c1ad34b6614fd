use crate::domain::RegistrationPayload;
use crate::error::DeliveryError;
use async_trait::async_trait;

/// Downstream system that receives accepted registrations.
#[async_trait]
pub trait IngestionPort: Send + Sync {
    async fn deliver(&self, payload: &RegistrationPayload) -> Result<IngestionReceipt, DeliveryError>;
}

#[derive(Clone, Debug)]
pub struct IngestionReceipt {
    pub status: u16,
    /// Parsed response body, when the endpoint answered with JSON.
    pub body: Option<serde_json::Value>,
}
