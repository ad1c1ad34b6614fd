use super::RegistrationStore;
use crate::domain::RegistrationRecord;
use crate::error::{PipelineError, Result};
use crate::sqlite::{db_path_at_root, open_connection};
use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Registration records in SQLite. The full record is kept as JSON next to
/// `status` and `version` columns; `version` backs the compare-and-set
/// update.
pub struct SqliteRegistrationStore {
    conn: Mutex<Connection>,
}

impl SqliteRegistrationStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_connection(db_path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS device_registrations (
                device_id   TEXT PRIMARY KEY,
                status      TEXT NOT NULL,
                version     INTEGER NOT NULL DEFAULT 0,
                created_at  TEXT NOT NULL,
                record      TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_at_root<P: AsRef<Path>>(data_root: P) -> Result<Self> {
        Self::open(db_path_at_root(data_root))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PipelineError::Storage("registry connection lock poisoned".to_string()))
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

#[async_trait]
impl RegistrationStore for SqliteRegistrationStore {
    async fn insert(&self, record: &RegistrationRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT INTO device_registrations (device_id, status, version, created_at, record)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.device_id,
                record.status().as_str(),
                record.version() as i64,
                record.created_at.to_rfc3339(),
                json
            ],
        );
        match inserted {
            Ok(_) => {
                debug!(device_id = %record.device_id, "Inserted registration record");
                Ok(())
            }
            Err(e) if is_unique_violation(&e) => {
                Err(PipelineError::DuplicateDevice(record.device_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, device_id: &str) -> Result<Option<RegistrationRecord>> {
        let conn = self.lock()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT record FROM device_registrations WHERE device_id = ?1",
                params![device_id],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(PipelineError::from))
            .transpose()
    }

    async fn list(&self) -> Result<Vec<RegistrationRecord>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT record FROM device_registrations ORDER BY created_at DESC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut records = Vec::new();
        for json in rows {
            records.push(serde_json::from_str(&json?)?);
        }
        Ok(records)
    }

    async fn replace_if_version(
        &self,
        record: &RegistrationRecord,
        expected_version: u64,
    ) -> Result<bool> {
        let json = serde_json::to_string(record)?;
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE device_registrations SET status = ?1, version = ?2, record = ?3
             WHERE device_id = ?4 AND version = ?5",
            params![
                record.status().as_str(),
                record.version() as i64,
                json,
                record.device_id,
                expected_version as i64
            ],
        )?;
        if changed == 1 {
            return Ok(true);
        }
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM device_registrations WHERE device_id = ?1",
                params![record.device_id],
                |row| row.get(0),
            )
            .optional()?;
        match exists {
            Some(_) => Ok(false),
            None => Err(PipelineError::NotFound(record.device_id.clone())),
        }
    }
}
