use crate::constants::SQLITE_FILE_NAME;
use crate::error::Result;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Location of the shared database under a data root.
pub fn db_path_at_root<P: AsRef<Path>>(data_root: P) -> PathBuf {
    data_root.as_ref().join(SQLITE_FILE_NAME)
}

/// Open (and create if needed) the database at `db_path` in WAL mode so a
/// gateway process and several consumer processes can share it.
pub fn open_connection<P: AsRef<Path>>(db_path: P) -> Result<Connection> {
    let db_path = db_path.as_ref();
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    Ok(conn)
}
