use super::RegistrationStore;
use crate::domain::RegistrationRecord;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// In-memory registration store for development/testing
#[derive(Clone)]
pub struct InMemoryRegistrationStore {
    records: Arc<Mutex<HashMap<String, RegistrationRecord>>>,
}

impl Default for InMemoryRegistrationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRegistrationStore {
    pub fn new() -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, RegistrationRecord>>> {
        self.records
            .lock()
            .map_err(|_| PipelineError::Storage("registry lock poisoned".to_string()))
    }
}

#[async_trait]
impl RegistrationStore for InMemoryRegistrationStore {
    async fn insert(&self, record: &RegistrationRecord) -> Result<()> {
        let mut records = self.lock()?;
        if records.contains_key(&record.device_id) {
            return Err(PipelineError::DuplicateDevice(record.device_id.clone()));
        }
        records.insert(record.device_id.clone(), record.clone());
        debug!(device_id = %record.device_id, "Inserted registration record");
        Ok(())
    }

    async fn get(&self, device_id: &str) -> Result<Option<RegistrationRecord>> {
        Ok(self.lock()?.get(device_id).cloned())
    }

    async fn list(&self) -> Result<Vec<RegistrationRecord>> {
        let mut all: Vec<RegistrationRecord> = self.lock()?.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }

    async fn replace_if_version(
        &self,
        record: &RegistrationRecord,
        expected_version: u64,
    ) -> Result<bool> {
        let mut records = self.lock()?;
        match records.get_mut(&record.device_id) {
            Some(stored) if stored.version() == expected_version => {
                *stored = record.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(PipelineError::NotFound(record.device_id.clone())),
        }
    }
}
