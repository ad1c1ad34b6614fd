use crate::app::ports::{IngestionPort, IngestionReceipt};
use crate::domain::RegistrationPayload;
use crate::error::{DeliveryError, PipelineError, Result};
use async_trait::async_trait;
use std::time::Duration;

const ACKNOWLEDGED: &str = "acknowledged";

/// POSTs registrations as JSON to the configured ingestion endpoint.
pub struct HttpIngestionClient {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpIngestionClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl IngestionPort for HttpIngestionClient {
    async fn deliver(&self, payload: &RegistrationPayload) -> std::result::Result<IngestionReceipt, DeliveryError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::Timeout(self.timeout.as_millis() as u64)
                } else {
                    DeliveryError::Transport(e.to_string())
                }
            })?;

        let status = resp.status().as_u16();
        let text = resp.text().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::Timeout(self.timeout.as_millis() as u64)
            } else {
                DeliveryError::Transport(e.to_string())
            }
        })?;

        if !(200..=299).contains(&status) {
            return Err(DeliveryError::Rejected {
                status,
                body: text.chars().take(512).collect(),
            });
        }

        let body: Option<serde_json::Value> = serde_json::from_str(&text).ok();
        // A JSON answer that reports its own status must report acknowledged
        if let Some(reported) = body
            .as_ref()
            .and_then(|b| b.get("status"))
            .and_then(|s| s.as_str())
        {
            if reported != ACKNOWLEDGED {
                return Err(DeliveryError::Unacknowledged(format!(
                    "endpoint reported status '{reported}'"
                )));
            }
        }

        Ok(IngestionReceipt { status, body })
    }
}
