//! SQLite plumbing shared by the block cache and the derived-state store.
//!
//! Each operation opens its own connection on the blocking pool, so the async engine never holds
//! a connection across an await point and concurrent readers see only committed transactions.

use crate::error::StoreError;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Path to a SQLite database file
#[derive(Debug, Clone)]
pub(crate) struct Database {
    path: PathBuf,
}

impl Database {
    /// Create parent directories and run `schema` once.
    pub(crate) fn create(path: PathBuf, schema: &str) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Self { path };
        let conn = db.open_conn()?;
        conn.execute_batch(schema)?;
        Ok(db)
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    fn open_conn(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;
        Ok(conn)
    }

    /// Run `f` with a fresh connection on the blocking pool.
    pub(crate) async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db.open_conn()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

/// Heights are stored as SQLite integers.
pub(crate) fn to_sql_height(height: u64) -> Result<i64, StoreError> {
    i64::try_from(height).map_err(|_| StoreError::Corrupt(format!("height {} out of range", height)))
}

pub(crate) fn from_sql_height(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative height {}", value)))
}
