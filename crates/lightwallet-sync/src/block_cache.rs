//! Block summary cache.
//!
//! Append-only store of accepted block summaries keyed by height. The engine is the only writer;
//! the cache never holds a gap and every stored block extends the one below it.

use crate::block::{BlockSummary, ScanRange};
use crate::db::{from_sql_height, to_sql_height, Database};
use crate::error::StoreError;
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use std::path::{Path, PathBuf};

/// Block cache contract
#[async_trait]
pub trait BlockCache: Send + Sync {
    /// Append blocks directly above the current tip.
    ///
    /// Rejects blocks that do not extend the tip (or each other) with [`StoreError::Corrupt`].
    async fn append(&self, blocks: &[BlockSummary]) -> Result<(), StoreError>;

    /// Block at `height`, `None` if not cached
    async fn get(&self, height: u64) -> Result<Option<BlockSummary>, StoreError>;

    /// Remove every block at or above `height`
    async fn truncate_from(&self, height: u64) -> Result<(), StoreError>;

    /// Height of the highest cached block
    async fn latest_height(&self) -> Result<Option<u64>, StoreError>;

    /// Cached blocks in `range`, ascending
    async fn range(&self, range: ScanRange) -> Result<Vec<BlockSummary>, StoreError>;
}

/// Check that `blocks` extend `tip` and each other.
pub(crate) fn check_extends(
    tip: Option<&BlockSummary>,
    blocks: &[BlockSummary],
) -> Result<(), StoreError> {
    let mut parent = tip;
    for block in blocks {
        if let Some(parent) = parent {
            if !block.extends(parent) {
                return Err(StoreError::Corrupt(format!(
                    "block {} does not extend cached block {} ({})",
                    block.height, parent.height, parent.hash
                )));
            }
        }
        parent = Some(block);
    }
    Ok(())
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS blocks (
    height INTEGER PRIMARY KEY,
    hash TEXT NOT NULL,
    data BLOB NOT NULL
);";

/// SQLite-backed block cache
#[derive(Debug, Clone)]
pub struct SqliteBlockCache {
    db: Database,
}

impl SqliteBlockCache {
    /// Open or create a cache at `path`.
    ///
    /// The file belongs to one wallet: opening the engine truncates it to that wallet's
    /// high-water mark.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let db = Database::create(path.into(), SCHEMA)?;
        tracing::debug!("Opened block cache at {}", db.path().display());
        Ok(Self { db })
    }

    /// Database file path
    pub fn path(&self) -> &Path {
        self.db.path()
    }
}

#[async_trait]
impl BlockCache for SqliteBlockCache {
    async fn append(&self, blocks: &[BlockSummary]) -> Result<(), StoreError> {
        if blocks.is_empty() {
            return Ok(());
        }

        let blocks = blocks.to_vec();
        self.db
            .run(move |conn| {
                let tx = conn.transaction()?;
                let tip = select_tip(&tx)?;
                check_extends(tip.as_ref(), &blocks)?;
                {
                    let mut stmt =
                        tx.prepare("INSERT INTO blocks (height, hash, data) VALUES (?1, ?2, ?3)")?;
                    for block in &blocks {
                        let encoded = encode_block(block)?;
                        stmt.execute(params![
                            to_sql_height(block.height)?,
                            block.hash.to_hex(),
                            encoded
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }

    async fn get(&self, height: u64) -> Result<Option<BlockSummary>, StoreError> {
        self.db
            .run(move |conn| {
                let data: Option<Vec<u8>> = conn
                    .query_row(
                        "SELECT data FROM blocks WHERE height = ?1",
                        params![to_sql_height(height)?],
                        |row| row.get(0),
                    )
                    .optional()?;
                data.map(|bytes| decode_block(&bytes)).transpose()
            })
            .await
    }

    async fn truncate_from(&self, height: u64) -> Result<(), StoreError> {
        self.db
            .run(move |conn| {
                let tx = conn.transaction()?;
                let removed = tx.execute(
                    "DELETE FROM blocks WHERE height >= ?1",
                    params![to_sql_height(height)?],
                )?;
                tx.commit()?;
                if removed > 0 {
                    tracing::debug!("Truncated {} cached block(s) from height {}", removed, height);
                }
                Ok(())
            })
            .await
    }

    async fn latest_height(&self) -> Result<Option<u64>, StoreError> {
        self.db
            .run(|conn| {
                let height: Option<i64> =
                    conn.query_row("SELECT MAX(height) FROM blocks", [], |row| row.get(0))?;
                height.map(from_sql_height).transpose()
            })
            .await
    }

    async fn range(&self, range: ScanRange) -> Result<Vec<BlockSummary>, StoreError> {
        self.db
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT data FROM blocks WHERE height BETWEEN ?1 AND ?2 ORDER BY height ASC",
                )?;
                let rows = stmt.query_map(
                    params![to_sql_height(range.start)?, to_sql_height(range.end)?],
                    |row| row.get::<_, Vec<u8>>(0),
                )?;

                let mut blocks = Vec::new();
                for row in rows {
                    blocks.push(decode_block(&row?)?);
                }
                Ok(blocks)
            })
            .await
    }
}

fn select_tip(conn: &rusqlite::Connection) -> Result<Option<BlockSummary>, StoreError> {
    let data: Option<Vec<u8>> = conn
        .query_row(
            "SELECT data FROM blocks ORDER BY height DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    data.map(|bytes| decode_block(&bytes)).transpose()
}

fn encode_block(block: &BlockSummary) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(block)?)
}

fn decode_block(bytes: &[u8]) -> Result<BlockSummary, StoreError> {
    Ok(serde_json::from_slice(bytes)?)
}
