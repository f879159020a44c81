//! SQLite storage backend.
//!
//! Persists the block-tracker cursors and the confirmation buffer to a
//! single SQLite file. Uses `sqlx` with WAL mode for concurrent read
//! performance.
//!
//! # Usage
//! ```rust,no_run
//! use chain_events::storage::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./events.db", "mainnet:token").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory("test").await?;
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::{
    EmitterError,
    storage::{BufferedEvent, CursorSlot, CursorStore, EventRepository},
    types::BlockRef,
};

/// SQLite-backed cursor and event storage.
///
/// `scope` isolates cursor slots of independent emitters sharing one
/// database file; the confirmation buffer is already isolated by contract
/// address.
pub struct SqliteStorage {
    pool: SqlitePool,
    scope: String,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./events.db"`) or a full
    /// SQLite URL (`"sqlite:./events.db?mode=rwc"`).
    pub async fn open(path: &str, scope: impl Into<String>) -> Result<Self, EmitterError> {
        let url = if path.starts_with("sqlite:") {
            path.to_owned()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(EmitterError::storage)?;

        let storage = Self { pool, scope: scope.into() };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// All data is lost when the pool is dropped. Ideal for tests.
    pub async fn in_memory(scope: impl Into<String>) -> Result<Self, EmitterError> {
        // a single connection: every pooled connection would otherwise get
        // its own private in-memory database
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(EmitterError::storage)?;

        let storage = Self { pool, scope: scope.into() };
        storage.init_schema().await?;
        Ok(storage)
    }

    async fn init_schema(&self) -> Result<(), EmitterError> {
        // WAL mode for concurrent read throughput
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(EmitterError::storage)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS cursors (
                scope        TEXT    NOT NULL,
                slot         TEXT    NOT NULL,
                block_number INTEGER NOT NULL,
                block_hash   TEXT    NOT NULL,
                PRIMARY KEY (scope, slot)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(EmitterError::storage)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS buffered_events (
                contract_address    TEXT    NOT NULL,
                block_number        INTEGER NOT NULL,
                transaction_hash    TEXT    NOT NULL,
                log_index           INTEGER NOT NULL,
                event_name          TEXT    NOT NULL,
                target_confirmation INTEGER NOT NULL,
                emitted             INTEGER NOT NULL DEFAULT 0,
                content             TEXT    NOT NULL,
                PRIMARY KEY (contract_address, transaction_hash, log_index)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(EmitterError::storage)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_buffered_events_block
             ON buffered_events (contract_address, block_number);",
        )
        .execute(&self.pool)
        .await
        .map_err(EmitterError::storage)?;

        Ok(())
    }
}

fn parse_hash(text: &str) -> Result<B256, EmitterError> {
    B256::from_str(text).map_err(EmitterError::storage)
}

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<BufferedEvent, EmitterError> {
    Ok(BufferedEvent {
        contract_address: Address::from_str(row.get::<String, _>("contract_address").as_str())
            .map_err(EmitterError::storage)?,
        block_number: row.get::<i64, _>("block_number") as u64,
        transaction_hash: parse_hash(row.get::<String, _>("transaction_hash").as_str())?,
        log_index: row.get::<i64, _>("log_index") as u64,
        event_name: row.get("event_name"),
        target_confirmation: row.get::<i64, _>("target_confirmation") as u64,
        emitted: row.get::<i64, _>("emitted") != 0,
        content: row.get("content"),
    })
}

#[async_trait]
impl CursorStore for SqliteStorage {
    async fn load(&self, slot: CursorSlot) -> Result<Option<BlockRef>, EmitterError> {
        let row = sqlx::query(
            "SELECT block_number, block_hash FROM cursors WHERE scope = ? AND slot = ?",
        )
        .bind(&self.scope)
        .bind(slot.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(EmitterError::storage)?;

        row.map(|r| {
            Ok(BlockRef::new(
                r.get::<i64, _>("block_number") as u64,
                parse_hash(r.get::<String, _>("block_hash").as_str())?,
            ))
        })
        .transpose()
    }

    async fn save(&self, slot: CursorSlot, block: BlockRef) -> Result<(), EmitterError> {
        sqlx::query(
            "INSERT OR REPLACE INTO cursors (scope, slot, block_number, block_hash)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&self.scope)
        .bind(slot.as_str())
        .bind(block.number as i64)
        .bind(format!("{:#x}", block.hash))
        .execute(&self.pool)
        .await
        .map_err(EmitterError::storage)?;

        debug!(scope = %self.scope, slot = slot.as_str(), block = block.number, "cursor saved");
        Ok(())
    }
}

#[async_trait]
impl EventRepository for SqliteStorage {
    async fn bulk_insert(&self, rows: &[BufferedEvent]) -> Result<(), EmitterError> {
        let mut tx = self.pool.begin().await.map_err(EmitterError::storage)?;

        for row in rows {
            let existing = sqlx::query(
                "SELECT content FROM buffered_events
                 WHERE contract_address = ? AND transaction_hash = ? AND log_index = ?",
            )
            .bind(format!("{:#x}", row.contract_address))
            .bind(format!("{:#x}", row.transaction_hash))
            .bind(row.log_index as i64)
            .fetch_optional(&mut *tx)
            .await
            .map_err(EmitterError::storage)?;

            if let Some(existing) = existing {
                // dropping the transaction rolls back rows inserted so far
                return Err(EmitterError::Duplicate {
                    transaction_hash: row.transaction_hash,
                    log_index: row.log_index,
                    matching_content: existing.get::<String, _>("content") == row.content,
                });
            }

            sqlx::query(
                "INSERT INTO buffered_events
                 (contract_address, block_number, transaction_hash, log_index,
                  event_name, target_confirmation, emitted, content)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(format!("{:#x}", row.contract_address))
            .bind(row.block_number as i64)
            .bind(format!("{:#x}", row.transaction_hash))
            .bind(row.log_index as i64)
            .bind(&row.event_name)
            .bind(row.target_confirmation as i64)
            .bind(i64::from(row.emitted))
            .bind(&row.content)
            .execute(&mut *tx)
            .await
            .map_err(EmitterError::storage)?;
        }

        tx.commit().await.map_err(EmitterError::storage)?;

        debug!(count = rows.len(), "buffered events stored");
        Ok(())
    }

    async fn find_all(&self, contract: Address) -> Result<Vec<BufferedEvent>, EmitterError> {
        let rows = sqlx::query(
            "SELECT contract_address, block_number, transaction_hash, log_index,
                    event_name, target_confirmation, emitted, content
             FROM buffered_events WHERE contract_address = ?
             ORDER BY block_number, transaction_hash, log_index",
        )
        .bind(format!("{contract:#x}"))
        .fetch_all(&self.pool)
        .await
        .map_err(EmitterError::storage)?;

        rows.iter().map(row_to_event).collect()
    }

    async fn destroy_all(&self, contract: Address) -> Result<(), EmitterError> {
        sqlx::query("DELETE FROM buffered_events WHERE contract_address = ?")
            .bind(format!("{contract:#x}"))
            .execute(&self.pool)
            .await
            .map_err(EmitterError::storage)?;

        debug!(contract = %contract, "confirmation buffer cleared");
        Ok(())
    }

    async fn destroy_one(
        &self,
        contract: Address,
        transaction_hash: B256,
        log_index: u64,
    ) -> Result<(), EmitterError> {
        sqlx::query(
            "DELETE FROM buffered_events
             WHERE contract_address = ? AND transaction_hash = ? AND log_index = ?",
        )
        .bind(format!("{contract:#x}"))
        .bind(format!("{transaction_hash:#x}"))
        .bind(log_index as i64)
        .execute(&self.pool)
        .await
        .map_err(EmitterError::storage)?;

        Ok(())
    }

    async fn mark_emitted(
        &self,
        contract: Address,
        transaction_hash: B256,
        log_index: u64,
    ) -> Result<(), EmitterError> {
        sqlx::query(
            "UPDATE buffered_events SET emitted = 1
             WHERE contract_address = ? AND transaction_hash = ? AND log_index = ?",
        )
        .bind(format!("{contract:#x}"))
        .bind(format!("{transaction_hash:#x}"))
        .bind(log_index as i64)
        .execute(&self.pool)
        .await
        .map_err(EmitterError::storage)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::keccak256;

    use super::*;

    fn row(contract: Address, block: u64, tx_seed: &[u8], log_index: u64) -> BufferedEvent {
        BufferedEvent {
            contract_address: contract,
            block_number: block,
            transaction_hash: keccak256(tx_seed),
            log_index,
            event_name: "Transfer".to_owned(),
            target_confirmation: 12,
            emitted: false,
            content: format!("{{\"block\":{block}}}"),
        }
    }

    #[tokio::test]
    async fn cursor_roundtrip() {
        let store = SqliteStorage::in_memory("test").await.unwrap();

        assert!(store.load(CursorSlot::LastProcessed).await.unwrap().is_none());

        let block = BlockRef::new(1_000, keccak256(b"1000"));
        store.save(CursorSlot::LastProcessed, block).await.unwrap();

        assert_eq!(store.load(CursorSlot::LastProcessed).await.unwrap(), Some(block));
    }

    #[tokio::test]
    async fn cursor_upsert_overwrites() {
        let store = SqliteStorage::in_memory("test").await.unwrap();

        store.save(CursorSlot::LastFetched, BlockRef::new(100, keccak256(b"old"))).await.unwrap();
        store.save(CursorSlot::LastFetched, BlockRef::new(200, keccak256(b"new"))).await.unwrap();

        let loaded = store.load(CursorSlot::LastFetched).await.unwrap().unwrap();
        assert_eq!(loaded, BlockRef::new(200, keccak256(b"new")));
    }

    #[tokio::test]
    async fn cursor_scope_isolation() {
        let a = SqliteStorage::in_memory("a").await.unwrap();

        a.save(CursorSlot::LastFetched, BlockRef::new(1, keccak256(b"1"))).await.unwrap();

        let b = SqliteStorage { pool: a.pool.clone(), scope: "b".to_owned() };
        assert!(b.load(CursorSlot::LastFetched).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn event_roundtrip_preserves_fields() {
        let store = SqliteStorage::in_memory("test").await.unwrap();
        let contract = Address::repeat_byte(1);
        let event = row(contract, 123, b"tx", 7);

        store.bulk_insert(std::slice::from_ref(&event)).await.unwrap();

        let rows = store.find_all(contract).await.unwrap();
        assert_eq!(rows, vec![event]);
    }

    #[tokio::test]
    async fn find_all_orders_rows() {
        let store = SqliteStorage::in_memory("test").await.unwrap();
        let contract = Address::repeat_byte(1);

        store
            .bulk_insert(&[
                row(contract, 300, b"c", 0),
                row(contract, 100, b"a", 2),
                row(contract, 100, b"a", 1),
            ])
            .await
            .unwrap();

        let rows = store.find_all(contract).await.unwrap();
        assert_eq!(
            rows.iter().map(|r| (r.block_number, r.log_index)).collect::<Vec<_>>(),
            vec![(100, 1), (100, 2), (300, 0)]
        );
    }

    #[tokio::test]
    async fn duplicate_insert_rolls_back() {
        let store = SqliteStorage::in_memory("test").await.unwrap();
        let contract = Address::repeat_byte(1);

        store.bulk_insert(&[row(contract, 100, b"a", 0)]).await.unwrap();

        let err = store
            .bulk_insert(&[row(contract, 200, b"b", 0), row(contract, 100, b"a", 0)])
            .await
            .unwrap_err();
        assert!(matches!(err, EmitterError::Duplicate { matching_content: true, .. }));

        assert_eq!(store.find_all(contract).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn destroy_scopes_by_contract() {
        let store = SqliteStorage::in_memory("test").await.unwrap();
        let a = Address::repeat_byte(1);
        let b = Address::repeat_byte(2);

        store.bulk_insert(&[row(a, 100, b"a", 0), row(b, 100, b"b", 0)]).await.unwrap();
        store.destroy_all(a).await.unwrap();

        assert!(store.find_all(a).await.unwrap().is_empty());
        assert_eq!(store.find_all(b).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn destroy_one_and_mark_emitted() {
        let store = SqliteStorage::in_memory("test").await.unwrap();
        let contract = Address::repeat_byte(1);
        let keep = row(contract, 100, b"a", 0);
        let gone = row(contract, 100, b"a", 1);

        store.bulk_insert(&[keep.clone(), gone.clone()]).await.unwrap();

        store.mark_emitted(contract, keep.transaction_hash, keep.log_index).await.unwrap();
        store.destroy_one(contract, gone.transaction_hash, gone.log_index).await.unwrap();

        let rows = store.find_all(contract).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].emitted);
    }
}
