//! Reorg detection and remediation for the fetch pipeline.
//!
//! Detection compares the stored `last fetched` hash against the chain's
//! current header at the same height. Remediation refetches everything
//! past `last processed`, reports buffered events the reorg dropped,
//! wipes the buffer, and re-classifies the refetched range as one step.

use alloy::eips::BlockNumberOrTag;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::{
    EmitterError,
    emitter::fetch::{EmitterInner, apply_event_name_filter, classify_and_store},
    types::{Batch, BatchResult, BlockRef, EmitterEvent},
};

/// Checks whether the chain history under the fetched cursor changed.
///
/// On a confirmed reorg this also probes the processed cursor: if even
/// the last *processed* block's hash changed, already-delivered events
/// are beyond repair and `reorgOutOfRange` is emitted before `reorg`.
pub(crate) async fn is_reorg(inner: &EmitterInner) -> Result<bool, EmitterError> {
    let Some(last_fetched) = inner.tracker.last_fetched().await? else {
        return Ok(false);
    };

    let header = inner.source.get_block(BlockNumberOrTag::Number(last_fetched.number)).await?;
    if header.hash == last_fetched.hash {
        return Ok(false);
    }

    info!(
        block_number = last_fetched.number,
        stored_hash = %last_fetched.hash,
        chain_hash = %header.hash,
        "chain reorganization detected"
    );

    if let Some(last_processed) = inner.tracker.last_processed().await? {
        let processed_header =
            inner.source.get_block(BlockNumberOrTag::Number(last_processed.number)).await?;
        if processed_header.hash != last_processed.hash {
            warn!(
                block_number = last_processed.number,
                "reorg reaches below already-delivered events"
            );
            inner
                .dispatcher
                .emit(EmitterEvent::ReorgOutOfRange { block_number: last_processed.number })
                .await;
        }
    }

    inner.dispatcher.emit(EmitterEvent::Reorg { block_number: last_fetched.number }).await;
    Ok(true)
}

/// Rebuilds the unconfirmed window against the new chain history.
///
/// Yields a single batch covering the refetched range; it carries only
/// events that are already past the confirmation cutoff on the new
/// history.
pub(crate) async fn handle_reorg(
    inner: &EmitterInner,
    current: BlockRef,
    tx: &mpsc::Sender<BatchResult>,
) -> Result<(), EmitterError> {
    let from = match inner.tracker.last_processed().await? {
        Some(block) => block.number + 1,
        None => inner.starting_block.resolve(current.number),
    };

    info!(from_block = from, to_block = current.number, "refetching after reorg");

    let mut refetched = if from <= current.number {
        inner.source.get_past_logs(inner.contract_address, from, current.number, &inner.topics).await?
    } else {
        Vec::new()
    };
    apply_event_name_filter(inner, &mut refetched);

    // confirmations > 0 is a precondition of reorg handling, so the
    // confirmator is always present here
    if let Some(confirmator) = &inner.confirmator {
        confirmator.check_dropped_transactions(&refetched).await?;
    }
    inner.repository.destroy_all(inner.contract_address).await?;

    let confirmed = classify_and_store(inner, refetched, current).await?;
    inner.tracker.set_last_fetched(current).await?;

    let batch = Batch {
        steps_complete: 1,
        total_steps: 1,
        from_block: from,
        to_block: current.number,
        events: confirmed,
    };
    _ = tx.send(Ok(batch)).await;

    Ok(())
}
