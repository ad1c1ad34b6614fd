//! Device registry: one record per device and the status state machine.
//!
//! Storage back ends implement [`RegistrationStore`]; the transition rules
//! live in [`DeviceRegistry`] and never in a back end.

pub mod in_memory;
pub mod sqlite;

use crate::domain::{DeviceStatus, NewRegistration, RegistrationRecord, TransitionNote};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

pub use in_memory::InMemoryRegistrationStore;
pub use sqlite::SqliteRegistrationStore;

/// Keyed record storage used by the registry.
#[async_trait]
pub trait RegistrationStore: Send + Sync {
    /// Insert a new record. Fails with `DuplicateDevice` if the id exists.
    async fn insert(&self, record: &RegistrationRecord) -> Result<()>;

    async fn get(&self, device_id: &str) -> Result<Option<RegistrationRecord>>;

    /// All records, newest first.
    async fn list(&self) -> Result<Vec<RegistrationRecord>>;

    /// Replace the stored record only if its version is still
    /// `expected_version`. Returns `false` when the record changed underneath
    /// the caller, even if it came back to the same status.
    async fn replace_if_version(
        &self,
        record: &RegistrationRecord,
        expected_version: u64,
    ) -> Result<bool>;
}

// Bound on compare-and-set retries when other writers keep racing us.
const MAX_CAS_ROUNDS: usize = 16;

#[derive(Clone)]
pub struct DeviceRegistry {
    store: Arc<dyn RegistrationStore>,
}

impl DeviceRegistry {
    pub fn new(store: Arc<dyn RegistrationStore>) -> Self {
        Self { store }
    }

    /// Create a `pending` record. A missing `deviceId` gets a UUID.
    pub async fn save_registration(&self, mut fields: NewRegistration) -> Result<RegistrationRecord> {
        let device_id = fields
            .device_id
            .take()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let record = RegistrationRecord::new(device_id, fields, Utc::now());
        self.store.insert(&record).await?;
        debug!(device_id = %record.device_id, "Saved pending registration");
        Ok(record)
    }

    pub async fn get_registration(&self, device_id: &str) -> Result<RegistrationRecord> {
        self.store
            .get(device_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(device_id.to_string()))
    }

    pub async fn list_registrations(&self) -> Result<Vec<RegistrationRecord>> {
        self.store.list().await
    }

    pub async fn transition_status(
        &self,
        device_id: &str,
        next: DeviceStatus,
    ) -> Result<RegistrationRecord> {
        self.transition_status_with(device_id, next, TransitionNote::default())
            .await
    }

    /// Move `device_id` to `next` if the edge is allowed from its current
    /// status. Invalid edges leave the record untouched.
    pub async fn transition_status_with(
        &self,
        device_id: &str,
        next: DeviceStatus,
        note: TransitionNote,
    ) -> Result<RegistrationRecord> {
        for _ in 0..MAX_CAS_ROUNDS {
            let current = self.get_registration(device_id).await?;
            let from = current.status();
            let read_version = current.version();
            if !from.can_transition_to(next) {
                return Err(PipelineError::InvalidTransition {
                    device_id: device_id.to_string(),
                    from,
                    to: next,
                });
            }

            let mut updated = current;
            updated.apply_transition(next, note.clone(), Utc::now());
            if self.store.replace_if_version(&updated, read_version).await? {
                debug!(
                    device_id,
                    from = %from,
                    to = %next,
                    attempts = updated.attempts(),
                    "Status transition"
                );
                return Ok(updated);
            }
            debug!(device_id, "Concurrent update detected, re-reading record");
        }

        warn!(device_id, to = %next, "Gave up on contended status transition");
        Err(PipelineError::Storage(format!(
            "status of device {device_id} kept changing during transition to {next}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(Arc::new(InMemoryRegistrationStore::new()))
    }

    fn fields(device_id: Option<&str>) -> NewRegistration {
        NewRegistration {
            device_id: device_id.map(str::to_string),
            hardware_id: "HW123".to_string(),
            model: "TestModel".to_string(),
            initial_telemetry: Some(json!({ "battery": 98 })),
            ..Default::default()
        }
    }

    /// Drive a fresh record to `target` along valid edges.
    async fn record_in(registry: &DeviceRegistry, id: &str, target: DeviceStatus) {
        use DeviceStatus::*;
        registry.save_registration(fields(Some(id))).await.unwrap();
        let path: &[DeviceStatus] = match target {
            Pending => &[],
            Queued => &[Queued],
            Processing => &[Queued, Processing],
            Acknowledged => &[Queued, Processing, Acknowledged],
            Failed => &[Queued, Processing, Failed],
        };
        for step in path {
            registry.transition_status(id, *step).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_status_transitions_sequence() {
        let registry = registry();
        let saved = registry
            .save_registration(fields(Some("test-device-123")))
            .await
            .unwrap();
        assert_eq!(saved.status(), DeviceStatus::Pending);

        for next in [
            DeviceStatus::Queued,
            DeviceStatus::Processing,
            DeviceStatus::Acknowledged,
        ] {
            let rec = registry.transition_status("test-device-123", next).await.unwrap();
            assert_eq!(rec.status(), next);
        }

        let err = registry
            .transition_status("test-device-123", DeviceStatus::Queued)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidTransition {
                from: DeviceStatus::Acknowledged,
                to: DeviceStatus::Queued,
                ..
            }
        ));
        let final_rec = registry.get_registration("test-device-123").await.unwrap();
        assert_eq!(final_rec.status(), DeviceStatus::Acknowledged);
        assert_eq!(final_rec.attempts(), 1);
    }

    #[tokio::test]
    async fn test_every_pair_against_transition_table() {
        let registry = registry();
        for (i, from) in DeviceStatus::ALL.iter().enumerate() {
            for (j, to) in DeviceStatus::ALL.iter().enumerate() {
                let id = format!("dev-{i}-{j}");
                record_in(&registry, &id, *from).await;
                let before = registry.get_registration(&id).await.unwrap();

                let result = registry.transition_status(&id, *to).await;
                if from.can_transition_to(*to) {
                    let after = result.unwrap();
                    assert_eq!(after.status(), *to);
                    assert!(after.updated_at() >= before.updated_at());
                } else {
                    assert!(
                        matches!(result, Err(PipelineError::InvalidTransition { .. })),
                        "{from} -> {to} should be rejected"
                    );
                    let after = registry.get_registration(&id).await.unwrap();
                    assert_eq!(after, before);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_unknown_device_is_not_found() {
        let registry = registry();
        for next in DeviceStatus::ALL {
            assert!(matches!(
                registry.transition_status("ghost", next).await,
                Err(PipelineError::NotFound(_))
            ));
        }
        assert!(matches!(
            registry.get_registration("ghost").await,
            Err(PipelineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_device_rejected() {
        let registry = registry();
        registry.save_registration(fields(Some("dup"))).await.unwrap();
        assert!(matches!(
            registry.save_registration(fields(Some("dup"))).await,
            Err(PipelineError::DuplicateDevice(id)) if id == "dup"
        ));
    }

    #[tokio::test]
    async fn test_generated_device_ids_are_unique() {
        let registry = registry();
        let a = registry.save_registration(fields(None)).await.unwrap();
        let b = registry.save_registration(fields(None)).await.unwrap();
        assert_ne!(a.device_id, b.device_id);
        assert_eq!(registry.list_registrations().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_retry_edge_records_error_and_attempts() {
        let registry = registry();
        record_in(&registry, "retry", DeviceStatus::Processing).await;

        let rec = registry
            .transition_status_with("retry", DeviceStatus::Queued, TransitionNote::error("HTTP 500"))
            .await
            .unwrap();
        assert_eq!(rec.last_error(), Some("HTTP 500"));
        assert_eq!(rec.attempts(), 1);

        let rec = registry
            .transition_status("retry", DeviceStatus::Processing)
            .await
            .unwrap();
        assert_eq!(rec.attempts(), 2);
        let rec = registry
            .transition_status("retry", DeviceStatus::Acknowledged)
            .await
            .unwrap();
        assert!(rec.last_error().is_none());
    }

    /// Wraps a store and stalls the first `get` that follows `arm()`, so a
    /// caller can hold a stale read while others write.
    struct StallingStore {
        inner: InMemoryRegistrationStore,
        armed: std::sync::atomic::AtomicBool,
        stall: std::time::Duration,
    }

    impl StallingStore {
        fn new(stall: std::time::Duration) -> Self {
            Self {
                inner: InMemoryRegistrationStore::new(),
                armed: std::sync::atomic::AtomicBool::new(false),
                stall,
            }
        }

        fn arm(&self) {
            self.armed.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl RegistrationStore for StallingStore {
        async fn insert(&self, record: &RegistrationRecord) -> Result<()> {
            self.inner.insert(record).await
        }

        async fn get(&self, device_id: &str) -> Result<Option<RegistrationRecord>> {
            let found = self.inner.get(device_id).await?;
            if self.armed.swap(false, std::sync::atomic::Ordering::SeqCst) {
                tokio::time::sleep(self.stall).await;
            }
            Ok(found)
        }

        async fn list(&self) -> Result<Vec<RegistrationRecord>> {
            self.inner.list().await
        }

        async fn replace_if_version(
            &self,
            record: &RegistrationRecord,
            expected_version: u64,
        ) -> Result<bool> {
            self.inner.replace_if_version(record, expected_version).await
        }
    }

    #[tokio::test]
    async fn test_stale_claim_rereads_after_requeue_round_trip() {
        let store = Arc::new(StallingStore::new(std::time::Duration::from_millis(100)));
        let registry = DeviceRegistry::new(store.clone());
        record_in(&registry, "aba", DeviceStatus::Queued).await;

        // First claimant reads `queued` and stalls before writing
        store.arm();
        let slow = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry.transition_status("aba", DeviceStatus::Processing).await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // Second claimant runs a whole failed attempt meanwhile
        registry
            .transition_status("aba", DeviceStatus::Processing)
            .await
            .unwrap();
        registry
            .transition_status_with("aba", DeviceStatus::Queued, TransitionNote::error("B failed"))
            .await
            .unwrap();

        let claimed = slow.await.unwrap().unwrap();
        assert_eq!(claimed.status(), DeviceStatus::Processing);
        assert_eq!(claimed.attempts(), 2);
        assert_eq!(claimed.last_error(), Some("B failed"));

        let stored = registry.get_registration("aba").await.unwrap();
        assert_eq!(stored, claimed);
        assert_eq!(stored.version(), 4);
    }

    #[tokio::test]
    async fn test_concurrent_processing_gate_admits_one() {
        let registry = registry();
        record_in(&registry, "gate", DeviceStatus::Queued).await;

        let (a, b) = tokio::join!(
            registry.transition_status("gate", DeviceStatus::Processing),
            registry.transition_status("gate", DeviceStatus::Processing),
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        assert_eq!(registry.get_registration("gate").await.unwrap().attempts(), 1);
    }
}
