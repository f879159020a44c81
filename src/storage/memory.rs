//! In-memory storage backend.
//!
//! Implements both [`CursorStore`] and [`EventRepository`] without any
//! persistence; intended for tests and ephemeral pipelines.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use alloy::primitives::{Address, B256};
use async_trait::async_trait;

use crate::{
    EmitterError,
    storage::{BufferedEvent, CursorSlot, CursorStore, EventRepository},
    types::BlockRef,
};

type EventKey = (Address, B256, u64);

/// In-memory cursor and event storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    cursors: Mutex<HashMap<CursorSlot, BlockRef>>,
    events: Mutex<HashMap<EventKey, BufferedEvent>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn events(&self) -> MutexGuard<'_, HashMap<EventKey, BufferedEvent>> {
        self.events.lock().expect("storage mutex poisoned")
    }
}

#[async_trait]
impl CursorStore for MemoryStorage {
    async fn load(&self, slot: CursorSlot) -> Result<Option<BlockRef>, EmitterError> {
        Ok(self.cursors.lock().expect("storage mutex poisoned").get(&slot).copied())
    }

    async fn save(&self, slot: CursorSlot, block: BlockRef) -> Result<(), EmitterError> {
        self.cursors.lock().expect("storage mutex poisoned").insert(slot, block);
        Ok(())
    }
}

#[async_trait]
impl EventRepository for MemoryStorage {
    async fn bulk_insert(&self, rows: &[BufferedEvent]) -> Result<(), EmitterError> {
        let mut events = self.events();

        // all-or-nothing: check every identity before touching the map
        for row in rows {
            let key = (row.contract_address, row.transaction_hash, row.log_index);
            if let Some(existing) = events.get(&key) {
                return Err(EmitterError::Duplicate {
                    transaction_hash: row.transaction_hash,
                    log_index: row.log_index,
                    matching_content: existing.content == row.content,
                });
            }
        }

        for row in rows {
            let key = (row.contract_address, row.transaction_hash, row.log_index);
            events.insert(key, row.clone());
        }
        Ok(())
    }

    async fn find_all(&self, contract: Address) -> Result<Vec<BufferedEvent>, EmitterError> {
        let mut rows: Vec<BufferedEvent> =
            self.events().values().filter(|row| row.contract_address == contract).cloned().collect();
        rows.sort_by(|a, b| {
            (a.block_number, a.transaction_hash, a.log_index)
                .cmp(&(b.block_number, b.transaction_hash, b.log_index))
        });
        Ok(rows)
    }

    async fn destroy_all(&self, contract: Address) -> Result<(), EmitterError> {
        self.events().retain(|(address, _, _), _| *address != contract);
        Ok(())
    }

    async fn destroy_one(
        &self,
        contract: Address,
        transaction_hash: B256,
        log_index: u64,
    ) -> Result<(), EmitterError> {
        self.events().remove(&(contract, transaction_hash, log_index));
        Ok(())
    }

    async fn mark_emitted(
        &self,
        contract: Address,
        transaction_hash: B256,
        log_index: u64,
    ) -> Result<(), EmitterError> {
        if let Some(row) = self.events().get_mut(&(contract, transaction_hash, log_index)) {
            row.emitted = true;
        }
        Ok(())
    }
}
