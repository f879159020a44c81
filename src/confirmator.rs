//! Promotion of buffered events once they reach their confirmation target.
//!
//! The confirmator runs on every new block header, after the fetch cycle,
//! behind the same fetch gate. It holds only the repository, the block
//! tracker and the dispatcher, never the emitter itself, so the emitter /
//! confirmator relationship stays acyclic.

use std::{collections::HashSet, sync::Arc};

use alloy::primitives::{Address, B256};
use tracing::{debug, info, warn};

use crate::{
    EmitterError,
    block_tracker::BlockTracker,
    dispatcher::Dispatcher,
    log_source::LogSource,
    storage::{BufferedEvent, EventRepository},
    types::{BlockRef, ConfirmationProgress, EmitterEvent, InvalidEvent, LogRecord},
};

pub struct Confirmator {
    contract_address: Address,
    target_confirmation: u64,
    repository: Arc<dyn EventRepository>,
    tracker: Arc<BlockTracker>,
    source: Arc<dyn LogSource>,
    dispatcher: Dispatcher,
}

impl Confirmator {
    #[must_use]
    pub fn new(
        contract_address: Address,
        target_confirmation: u64,
        repository: Arc<dyn EventRepository>,
        tracker: Arc<BlockTracker>,
        source: Arc<dyn LogSource>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self { contract_address, target_confirmation, repository, tracker, source, dispatcher }
    }

    /// Walks the confirmation buffer against the new head `head`.
    ///
    /// Rows below the target depth get a `newConfirmation`; rows at or
    /// past it are verified against the chain and either promoted to
    /// `newEvent` or dropped as `invalidConfirmation`. Promotions are
    /// emitted in `(block_number, log_index)` order.
    pub async fn run_confirmations_routine(&self, head: BlockRef) -> Result<(), EmitterError> {
        let mut rows = self.repository.find_all(self.contract_address).await?;
        if rows.is_empty() {
            return Ok(());
        }
        rows.sort_by_key(|row| (row.block_number, row.log_index));

        debug!(
            head = head.number,
            buffered = rows.len(),
            "running confirmations routine"
        );

        for row in rows {
            // a row above the head is left for reorg remediation
            let Some(depth) = head.number.checked_sub(row.block_number) else {
                continue;
            };

            let record = row.record()?;
            self.dispatcher
                .emit(EmitterEvent::NewConfirmation(ConfirmationProgress {
                    event: record.clone(),
                    confirmations: depth,
                    target_confirmation: self.target_confirmation,
                }))
                .await;

            if depth >= self.target_confirmation {
                self.promote(&row, record).await?;
            }
        }

        Ok(())
    }

    async fn promote(&self, row: &BufferedEvent, record: LogRecord) -> Result<(), EmitterError> {
        let mined_in = self.source.get_transaction_block(row.transaction_hash).await?;
        if mined_in != Some(row.block_number) {
            warn!(
                tx_hash = %row.transaction_hash,
                log_index = row.log_index,
                expected_block = row.block_number,
                "buffered transaction no longer on chain, dropping"
            );
            self.dispatcher.emit(EmitterEvent::InvalidConfirmation(InvalidEvent::from(row))).await;
            self.repository
                .destroy_one(self.contract_address, row.transaction_hash, row.log_index)
                .await?;
            return Ok(());
        }

        info!(
            event = %row.event_name,
            block_number = row.block_number,
            tx_hash = %row.transaction_hash,
            "confirmation target reached, emitting event"
        );

        let block_ref = record.block_ref();
        self.repository
            .mark_emitted(self.contract_address, row.transaction_hash, row.log_index)
            .await?;
        self.dispatcher.emit(EmitterEvent::NewEvent(record)).await;
        self.tracker.set_last_processed_if_higher(block_ref).await?;
        self.repository
            .destroy_one(self.contract_address, row.transaction_hash, row.log_index)
            .await?;

        Ok(())
    }

    /// Reorg remediation helper: every buffered row whose identity does
    /// not appear in the refetched set was dropped by the reorg and gets
    /// an `invalidConfirmation`. Rows themselves are deleted by the
    /// caller's buffer wipe.
    pub async fn check_dropped_transactions(
        &self,
        refetched: &[LogRecord],
    ) -> Result<(), EmitterError> {
        let live: HashSet<(B256, u64)> = refetched.iter().map(LogRecord::identity).collect();

        for row in self.repository.find_all(self.contract_address).await? {
            if !live.contains(&row.identity()) {
                warn!(
                    tx_hash = %row.transaction_hash,
                    log_index = row.log_index,
                    "buffered transaction dropped by reorg"
                );
                self.dispatcher
                    .emit(EmitterEvent::InvalidConfirmation(InvalidEvent::from(&row)))
                    .await;
            }
        }

        Ok(())
    }
}
