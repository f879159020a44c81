//! Pluggable persistence for the pipeline.
//!
//! Two surfaces are consumed by the core:
//!
//! - [`CursorStore`] — two durable slots holding the block tracker's
//!   `last fetched` / `last processed` cursors.
//! - [`EventRepository`] — the confirmation buffer: rows keyed by
//!   `(contract address, transaction hash, log index)` awaiting their
//!   confirmation target.
//!
//! Backends:
//! - [`memory`] — in-memory (tests, ephemeral pipelines)
//! - [`sqlite`] — SQLite via `sqlx` (embedded single-file persistence,
//!   behind the `sqlite` feature)

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

use alloy::primitives::{Address, B256, BlockNumber};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    EmitterError,
    types::{BlockRef, InvalidEvent, LogRecord},
};

/// The two cursor slots persisted per tracker scope.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CursorSlot {
    LastFetched,
    LastProcessed,
}

impl CursorSlot {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LastFetched => "last_fetched",
            Self::LastProcessed => "last_processed",
        }
    }
}

/// Durable key-value surface backing the block tracker.
///
/// A write must be visible to a subsequent `load` once `save` returns; the
/// tracker relies on that for crash recovery.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load(&self, slot: CursorSlot) -> Result<Option<BlockRef>, EmitterError>;

    async fn save(&self, slot: CursorSlot, block: BlockRef) -> Result<(), EmitterError>;
}

/// A persisted event awaiting its confirmation target.
///
/// `content` is the serialized [`LogRecord`] so promotion can re-emit the
/// exact payload that was fetched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BufferedEvent {
    pub contract_address: Address,
    pub block_number: BlockNumber,
    pub transaction_hash: B256,
    pub log_index: u64,
    pub event_name: String,
    pub target_confirmation: u64,
    pub emitted: bool,
    pub content: String,
}

impl BufferedEvent {
    /// Builds a row from a fetched record.
    pub fn from_record(record: &LogRecord, target_confirmation: u64) -> Result<Self, EmitterError> {
        Ok(Self {
            contract_address: record.address,
            block_number: record.block_number,
            transaction_hash: record.transaction_hash,
            log_index: record.log_index,
            event_name: record.event_name.clone(),
            target_confirmation,
            emitted: false,
            content: serde_json::to_string(record)?,
        })
    }

    /// Deserializes the buffered payload.
    pub fn record(&self) -> Result<LogRecord, EmitterError> {
        serde_json::from_str(&self.content).map_err(Into::into)
    }

    /// Identity key of the row within its contract.
    #[must_use]
    pub const fn identity(&self) -> (B256, u64) {
        (self.transaction_hash, self.log_index)
    }
}

impl From<&BufferedEvent> for InvalidEvent {
    fn from(row: &BufferedEvent) -> Self {
        Self {
            contract_address: row.contract_address,
            block_number: row.block_number,
            transaction_hash: row.transaction_hash,
            log_index: row.log_index,
            event_name: row.event_name.clone(),
        }
    }
}

/// The confirmation buffer.
///
/// Rows are scoped by contract address; operations on one contract must
/// never touch another contract's rows.
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Inserts all rows atomically.
    ///
    /// If any row's identity already exists, nothing is written and
    /// [`EmitterError::Duplicate`] is returned, with `matching_content`
    /// reporting whether the stored row carries the same payload.
    async fn bulk_insert(&self, rows: &[BufferedEvent]) -> Result<(), EmitterError>;

    /// All buffered rows for a contract, ordered by
    /// `(block_number, transaction_hash, log_index)`.
    async fn find_all(&self, contract: Address) -> Result<Vec<BufferedEvent>, EmitterError>;

    /// Deletes every row of a contract.
    async fn destroy_all(&self, contract: Address) -> Result<(), EmitterError>;

    /// Deletes one row by identity. Missing rows are not an error.
    async fn destroy_one(
        &self,
        contract: Address,
        transaction_hash: B256,
        log_index: u64,
    ) -> Result<(), EmitterError>;

    /// Flags a row as emitted just before its promotion delete, so a crash
    /// between emit and delete is observable on restart.
    async fn mark_emitted(
        &self,
        contract: Address,
        transaction_hash: B256,
        log_index: u64,
    ) -> Result<(), EmitterError>;
}
