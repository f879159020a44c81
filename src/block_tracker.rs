//! Cursor state machine for the fetch pipeline.
//!
//! Two cursors are tracked: *last fetched* (how far logs have been pulled
//! from the chain) and *last processed* (how far events have been handed
//! to consumers). Both are written through to a [`CursorStore`] before a
//! caller can observe further progress, so a restart resumes exactly where
//! the previous run left off.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::trace;

use crate::{
    EmitterError,
    storage::{CursorSlot, CursorStore},
    types::BlockRef,
};

#[derive(Debug, Default)]
struct Cursors {
    loaded: bool,
    last_fetched: Option<BlockRef>,
    last_processed: Option<BlockRef>,
}

/// Owner of the two pipeline cursors.
///
/// Only the fetch-gate holder mutates the tracker, so the internal lock is
/// never contended in steady state; it exists to keep the lazy load and
/// the read-modify-write of `set_last_processed_if_higher` coherent.
pub struct BlockTracker {
    store: Arc<dyn CursorStore>,
    cursors: Mutex<Cursors>,
}

impl BlockTracker {
    #[must_use]
    pub fn new(store: Arc<dyn CursorStore>) -> Self {
        Self { store, cursors: Mutex::new(Cursors::default()) }
    }

    pub async fn last_fetched(&self) -> Result<Option<BlockRef>, EmitterError> {
        let mut cursors = self.cursors.lock().await;
        self.ensure_loaded(&mut cursors).await?;
        Ok(cursors.last_fetched)
    }

    pub async fn set_last_fetched(&self, block: BlockRef) -> Result<(), EmitterError> {
        let mut cursors = self.cursors.lock().await;
        self.ensure_loaded(&mut cursors).await?;
        self.store.save(CursorSlot::LastFetched, block).await?;
        cursors.last_fetched = Some(block);
        trace!(block_number = block.number, "last fetched block advanced");
        Ok(())
    }

    pub async fn last_processed(&self) -> Result<Option<BlockRef>, EmitterError> {
        let mut cursors = self.cursors.lock().await;
        self.ensure_loaded(&mut cursors).await?;
        Ok(cursors.last_processed)
    }

    /// Advances the processed cursor only when `block.number` strictly
    /// exceeds the stored number (or none is stored). The hash is always
    /// taken from the accepted write.
    pub async fn set_last_processed_if_higher(&self, block: BlockRef) -> Result<(), EmitterError> {
        let mut cursors = self.cursors.lock().await;
        self.ensure_loaded(&mut cursors).await?;

        if let Some(current) = cursors.last_processed
            && block.number <= current.number
        {
            return Ok(());
        }

        self.store.save(CursorSlot::LastProcessed, block).await?;
        cursors.last_processed = Some(block);
        trace!(block_number = block.number, "last processed block advanced");
        Ok(())
    }

    async fn ensure_loaded(&self, cursors: &mut Cursors) -> Result<(), EmitterError> {
        if cursors.loaded {
            return Ok(());
        }
        cursors.last_fetched = self.store.load(CursorSlot::LastFetched).await?;
        cursors.last_processed = self.store.load(CursorSlot::LastProcessed).await?;
        cursors.loaded = true;
        Ok(())
    }
}
