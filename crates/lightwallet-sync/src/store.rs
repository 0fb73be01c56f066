//! Derived-state store.
//!
//! Holds the scanning state after every committed height, the detected transactions, the
//! high-water mark and the engine's `SyncState`. A commit writes all of them in one transaction,
//! so a reader (or a restart) sees either the previous boundary or the new one.

use crate::block::{BlockSummary, ScanRange};
use crate::block_cache::BlockCache;
use crate::db::{from_sql_height, to_sql_height, Database};
use crate::error::StoreError;
use crate::scan::{DetectedTransaction, ScanState, ScannedBatch};
use crate::state::SyncState;
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use std::path::PathBuf;
use std::sync::Arc;

/// Everything written by one durable commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitBatch {
    /// Heights covered by this commit
    pub range: ScanRange,
    /// Scanning state after each height in `range`, ascending
    pub scan_states: Vec<(u64, ScanState)>,
    /// Transactions detected in `range`
    pub transactions: Vec<DetectedTransaction>,
    /// Engine state as of the new high-water mark
    pub sync_state: SyncState,
}

impl CommitBatch {
    /// Build a commit from a scanned batch
    pub fn from_scanned(batch: ScannedBatch, sync_state: SyncState) -> Self {
        Self {
            range: batch.range,
            scan_states: batch.states,
            transactions: batch.transactions,
            sync_state,
        }
    }

    /// High-water mark after this commit
    pub fn high_water_mark(&self) -> u64 {
        self.range.end
    }

    /// Check the batch is internally consistent and extends `current`.
    pub(crate) fn check(&self, current: Option<u64>) -> Result<(), StoreError> {
        if let Some(hwm) = current {
            if self.range.start != hwm + 1 {
                return Err(StoreError::Corrupt(format!(
                    "commit {} does not start above high-water mark {}",
                    self.range, hwm
                )));
            }
        }

        let heights: Vec<u64> = self.scan_states.iter().map(|(h, _)| *h).collect();
        if !heights.iter().copied().eq(self.range.heights()) {
            return Err(StoreError::Corrupt(format!(
                "commit {} carries scan states for {} height(s)",
                self.range,
                heights.len()
            )));
        }

        if let Some(tx) = self
            .transactions
            .iter()
            .find(|tx| !self.range.contains(tx.height))
        {
            return Err(StoreError::Corrupt(format!(
                "transaction at height {} outside commit {}",
                tx.height, self.range
            )));
        }

        if self.sync_state.highest_scanned_height != self.high_water_mark() {
            return Err(StoreError::Corrupt(format!(
                "sync state high-water mark {} does not match commit {}",
                self.sync_state.highest_scanned_height, self.range
            )));
        }

        Ok(())
    }
}

/// Derived-state store contract
#[async_trait]
pub trait DerivedStateStore: Send + Sync {
    /// Atomically persist `batch` and advance the high-water mark to its end height
    async fn commit(&self, batch: CommitBatch) -> Result<(), StoreError>;

    /// Atomically discard everything above `height` and set the high-water mark to it.
    /// No-op when `height` is at or above the current mark.
    async fn rollback_to(&self, height: u64) -> Result<(), StoreError>;

    /// Highest durably committed height, `None` before the first commit
    async fn current_high_water_mark(&self) -> Result<Option<u64>, StoreError>;

    /// Scanning state as of the high-water mark, `None` if nothing is committed above the
    /// birthday
    async fn scan_state(&self) -> Result<Option<ScanState>, StoreError>;

    /// Committed transactions detected in `range`
    async fn transactions(&self, range: ScanRange)
        -> Result<Vec<DetectedTransaction>, StoreError>;

    /// Engine state saved with the last commit or rollback
    async fn sync_state(&self) -> Result<Option<SyncState>, StoreError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sync_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    high_water_mark INTEGER NOT NULL,
    sync_state TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS scan_states (
    height INTEGER PRIMARY KEY,
    state BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS transactions (
    height INTEGER NOT NULL,
    tx_index INTEGER NOT NULL,
    txid TEXT NOT NULL,
    data BLOB NOT NULL,
    PRIMARY KEY (height, tx_index, txid)
);
CREATE INDEX IF NOT EXISTS idx_transactions_height ON transactions(height);
";

/// SQLite-backed derived-state store
#[derive(Debug, Clone)]
pub struct SqliteDerivedStore {
    db: Database,
}

impl SqliteDerivedStore {
    /// Open or create a store at `path`
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let db = Database::create(path.into(), SCHEMA)?;
        tracing::debug!("Opened derived-state store at {}", db.path().display());
        Ok(Self { db })
    }
}

fn select_high_water_mark(conn: &rusqlite::Connection) -> Result<Option<u64>, StoreError> {
    let hwm: Option<i64> = conn
        .query_row(
            "SELECT high_water_mark FROM sync_meta WHERE id = 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    hwm.map(from_sql_height).transpose()
}

fn select_sync_state(conn: &rusqlite::Connection) -> Result<Option<SyncState>, StoreError> {
    let json: Option<String> = conn
        .query_row("SELECT sync_state FROM sync_meta WHERE id = 1", [], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(json.map(|s| serde_json::from_str(&s)).transpose()?)
}

fn write_meta(
    conn: &rusqlite::Connection,
    high_water_mark: u64,
    sync_state: &SyncState,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO sync_meta (id, high_water_mark, sync_state, updated_at)
         VALUES (1, ?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET
            high_water_mark = excluded.high_water_mark,
            sync_state = excluded.sync_state,
            updated_at = excluded.updated_at",
        params![
            to_sql_height(high_water_mark)?,
            serde_json::to_string(sync_state)?,
            chrono::Utc::now().to_rfc3339()
        ],
    )?;
    Ok(())
}

#[async_trait]
impl DerivedStateStore for SqliteDerivedStore {
    async fn commit(&self, batch: CommitBatch) -> Result<(), StoreError> {
        self.db
            .run(move |conn| {
                let tx = conn.transaction()?;
                batch.check(select_high_water_mark(&tx)?)?;

                {
                    let mut insert_state =
                        tx.prepare("INSERT INTO scan_states (height, state) VALUES (?1, ?2)")?;
                    for (height, state) in &batch.scan_states {
                        insert_state.execute(params![to_sql_height(*height)?, &state.bytes])?;
                    }

                    let mut insert_tx = tx.prepare(
                        "INSERT INTO transactions (height, tx_index, txid, data)
                         VALUES (?1, ?2, ?3, ?4)",
                    )?;
                    for detected in &batch.transactions {
                        insert_tx.execute(params![
                            to_sql_height(detected.height)?,
                            detected.index,
                            hex::encode(detected.txid),
                            &detected.data
                        ])?;
                    }
                }

                write_meta(&tx, batch.high_water_mark(), &batch.sync_state)?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    async fn rollback_to(&self, height: u64) -> Result<(), StoreError> {
        self.db
            .run(move |conn| {
                let tx = conn.transaction()?;
                let Some(hwm) = select_high_water_mark(&tx)? else {
                    return Ok(());
                };
                if height >= hwm {
                    return Ok(());
                }

                let state = select_sync_state(&tx)?
                    .ok_or_else(|| StoreError::Corrupt("missing sync state".to_string()))?;
                if height < state.birthday_height {
                    return Err(StoreError::Corrupt(format!(
                        "rollback to {} below birthday {}",
                        height, state.birthday_height
                    )));
                }

                let floor = to_sql_height(height)?;
                tx.execute("DELETE FROM scan_states WHERE height > ?1", params![floor])?;
                let removed =
                    tx.execute("DELETE FROM transactions WHERE height > ?1", params![floor])?;
                write_meta(&tx, height, &state.rewind(height))?;
                tx.commit()?;

                tracing::debug!(
                    "Rolled back derived state from {} to {} ({} transaction(s) removed)",
                    hwm,
                    height,
                    removed
                );
                Ok(())
            })
            .await
    }

    async fn current_high_water_mark(&self) -> Result<Option<u64>, StoreError> {
        self.db.run(|conn| select_high_water_mark(conn)).await
    }

    async fn scan_state(&self) -> Result<Option<ScanState>, StoreError> {
        self.db
            .run(|conn| {
                let bytes: Option<Vec<u8>> = conn
                    .query_row(
                        "SELECT s.state FROM scan_states s
                         JOIN sync_meta m ON m.id = 1 AND s.height = m.high_water_mark",
                        [],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(bytes.map(ScanState::new))
            })
            .await
    }

    async fn transactions(
        &self,
        range: ScanRange,
    ) -> Result<Vec<DetectedTransaction>, StoreError> {
        self.db
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT height, tx_index, txid, data FROM transactions
                     WHERE height BETWEEN ?1 AND ?2
                     ORDER BY height ASC, tx_index ASC",
                )?;
                let rows = stmt.query_map(
                    params![to_sql_height(range.start)?, to_sql_height(range.end)?],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, u32>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Vec<u8>>(3)?,
                        ))
                    },
                )?;

                let mut transactions = Vec::new();
                for row in rows {
                    let (height, index, txid, data) = row?;
                    let txid = hex::decode(&txid)
                        .ok()
                        .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok())
                        .ok_or_else(|| StoreError::Corrupt(format!("invalid txid {}", txid)))?;
                    transactions.push(DetectedTransaction {
                        height: from_sql_height(height)?,
                        index,
                        txid,
                        data,
                    });
                }
                Ok(transactions)
            })
            .await
    }

    async fn sync_state(&self) -> Result<Option<SyncState>, StoreError> {
        self.db.run(|conn| select_sync_state(conn)).await
    }
}

/// Read-only view over committed data.
///
/// The cache may briefly hold blocks above the high-water mark while a commit is in flight; this
/// view hides them so readers only ever observe fully committed heights.
#[derive(Clone)]
pub struct CommittedView {
    cache: Arc<dyn BlockCache>,
    store: Arc<dyn DerivedStateStore>,
}

impl CommittedView {
    /// View over `cache` and `store`
    pub fn new(cache: Arc<dyn BlockCache>, store: Arc<dyn DerivedStateStore>) -> Self {
        Self { cache, store }
    }

    /// Committed high-water mark
    pub async fn high_water_mark(&self) -> Result<Option<u64>, StoreError> {
        self.store.current_high_water_mark().await
    }

    /// Committed block at `height`
    pub async fn block(&self, height: u64) -> Result<Option<BlockSummary>, StoreError> {
        match self.high_water_mark().await? {
            Some(hwm) if height <= hwm => self.cache.get(height).await,
            _ => Ok(None),
        }
    }

    /// Committed blocks in `range`
    pub async fn blocks(&self, range: ScanRange) -> Result<Vec<BlockSummary>, StoreError> {
        let Some(hwm) = self.high_water_mark().await? else {
            return Ok(Vec::new());
        };
        match ScanRange::new(range.start, range.end.min(hwm)) {
            Some(clamped) => self.cache.range(clamped).await,
            None => Ok(Vec::new()),
        }
    }

    /// Committed transactions in `range`
    pub async fn transactions(
        &self,
        range: ScanRange,
    ) -> Result<Vec<DetectedTransaction>, StoreError> {
        self.store.transactions(range).await
    }
}
