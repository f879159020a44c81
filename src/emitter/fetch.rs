use std::{
    collections::HashMap,
    ops::RangeInclusive,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use alloy::{
    eips::BlockNumberOrTag,
    primitives::{Address, B256},
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, trace, warn};

use crate::{
    EmitterError,
    batch_iterator::BatchIterator,
    block_tracker::BlockTracker,
    confirmator::Confirmator,
    dispatcher::{Dispatcher, ListenerFuture, Subscription},
    emitter::reorg,
    log_source::{LogSource, TopicFilter},
    storage::{BufferedEvent, EventRepository},
    types::{Batch, BatchResult, BlockRef, Channel, EmitterEvent, LogRecord, StartBlock},
};

/// Batches buffered between the fetch task and the stream consumer.
const BATCH_CHANNEL_CAPACITY: usize = 64;

pub(crate) struct EmitterInner {
    pub(crate) contract_address: Address,
    pub(crate) topics: TopicFilter,
    pub(crate) events: Vec<String>,
    pub(crate) batch_size: u64,
    pub(crate) confirmations: u64,
    pub(crate) starting_block: StartBlock,
    pub(crate) serial_processing: bool,
    pub(crate) auto_start: bool,
    pub(crate) source: Arc<dyn LogSource>,
    pub(crate) tracker: Arc<BlockTracker>,
    pub(crate) repository: Arc<dyn EventRepository>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) confirmator: Option<Arc<Confirmator>>,
    /// Single-permit gate: at most one fetch or confirmation routine runs
    /// per emitter; contenders wait.
    pub(crate) fetch_gate: Arc<tokio::sync::Mutex<()>>,
    /// Set until the first cycle completes; within it, duplicate buffer
    /// rows with identical content are treated as already buffered.
    pub(crate) recovering: AtomicBool,
}

/// The manual fetch pipeline for one contract.
///
/// Cheap to clone; all clones share the same cursors, buffer and
/// dispatcher.
#[derive(Clone)]
pub struct EventsEmitter {
    inner: Arc<EmitterInner>,
}

impl EventsEmitter {
    pub(crate) fn from_inner(inner: EmitterInner) -> Self {
        Self { inner: Arc::new(inner) }
    }

    /// The dispatcher carrying this emitter's channels.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Registers a listener on one of the emitter's channels.
    #[must_use = "dropping the subscription unsubscribes the listener"]
    pub fn subscribe<F>(&self, channel: Channel, listener: F) -> Subscription
    where
        F: Fn(EmitterEvent) -> ListenerFuture + Send + Sync + 'static,
    {
        self.inner.dispatcher.subscribe(channel, listener)
    }

    /// The block tracker owning this emitter's cursors.
    #[must_use]
    pub fn tracker(&self) -> &Arc<BlockTracker> {
        &self.inner.tracker
    }

    /// The contract this emitter watches.
    #[must_use]
    pub fn contract_address(&self) -> Address {
        self.inner.contract_address
    }

    /// Configured confirmation depth.
    #[must_use]
    pub fn confirmations(&self) -> u64 {
        self.inner.confirmations
    }

    /// Runs one fetch cycle and streams its batches.
    ///
    /// With `current_block` the cycle fetches up to that head; without it
    /// the emitter resolves the head itself and the call counts as
    /// *forced* (an empty interval still yields a progress batch).
    ///
    /// At most one cycle runs at a time; concurrent calls queue on the
    /// fetch gate. Each yielded batch has been classified and durably
    /// buffered before it appears on the stream. A cycle failure is
    /// yielded in-band and also dispatched on the `error` channel; the
    /// cursors are left on the last completed batch so the next cycle
    /// re-fetches only what is missing.
    pub fn fetch(&self, current_block: Option<BlockRef>) -> ReceiverStream<BatchResult> {
        let (tx, rx) = mpsc::channel(BATCH_CHANNEL_CAPACITY);
        let inner = self.inner.clone();

        tokio::spawn(async move {
            let _gate = inner.fetch_gate.clone().lock_owned().await;
            if let Err(e) = run_cycle(&inner, current_block, &tx).await {
                error!(error = %e, "fetch cycle failed");
                inner.dispatcher.dispatch_error(e.clone());
                _ = tx.send(Err(e)).await;
            }
        });

        ReceiverStream::new(rx)
    }

    /// Dispatches an event respecting the `serial_processing` option:
    /// awaited when serial, scheduled when not.
    pub(crate) async fn dispatch_event(&self, event: EmitterEvent) {
        if self.inner.serial_processing {
            self.inner.dispatcher.emit(event).await;
        } else {
            let dispatcher = self.inner.dispatcher.clone();
            tokio::spawn(async move { dispatcher.emit(event).await });
        }
    }

    pub(crate) fn inner(&self) -> &Arc<EmitterInner> {
        &self.inner
    }
}

async fn run_cycle(
    inner: &Arc<EmitterInner>,
    current_block: Option<BlockRef>,
    tx: &mpsc::Sender<BatchResult>,
) -> Result<(), EmitterError> {
    let forced = current_block.is_none();
    let current = match current_block {
        Some(block) => block,
        None => inner.source.get_block(BlockNumberOrTag::Latest).await?,
    };

    if inner.confirmations > 0 && reorg::is_reorg(inner).await? {
        reorg::handle_reorg(inner, current, tx).await?;
        inner.recovering.store(false, Ordering::Relaxed);
        return Ok(());
    }

    let from = match inner.tracker.last_fetched().await? {
        Some(block) => block.number + 1,
        None => inner.starting_block.resolve(current.number),
    };
    let to = current.number;

    if from > to {
        trace!(from_block = from, to_block = to, "nothing new to fetch");
        if forced {
            let progress_only =
                Batch { steps_complete: 1, total_steps: 1, from_block: from, to_block: to, events: vec![] };
            _ = tx.send(Ok(progress_only)).await;
        }
        return Ok(());
    }

    debug!(from_block = from, to_block = to, batch_size = inner.batch_size, "starting fetch cycle");

    let mut batches = BatchIterator::new(from, to, inner.batch_size);
    let total_steps = batches.total_steps();

    while let Some(range) = batches.next() {
        let batch = process_batch(inner, &range, current, batches.steps_complete(), total_steps).await?;
        if tx.send(Ok(batch)).await.is_err() {
            // consumer gone; stop at the batch boundary, cursors stay consistent
            debug!("batch consumer dropped, ending cycle early");
            return Ok(());
        }
    }

    inner.recovering.store(false, Ordering::Relaxed);
    Ok(())
}

async fn process_batch(
    inner: &EmitterInner,
    range: &RangeInclusive<u64>,
    current: BlockRef,
    steps_complete: u64,
    total_steps: u64,
) -> Result<Batch, EmitterError> {
    let (from, to) = (*range.start(), *range.end());

    let mut logs =
        inner.source.get_past_logs(inner.contract_address, from, to, &inner.topics).await?;
    apply_event_name_filter(inner, &mut logs);

    let step_header = inner.source.get_block(BlockNumberOrTag::Number(to)).await?;

    let confirmed = classify_and_store(inner, logs, current).await?;
    inner.tracker.set_last_fetched(step_header).await?;

    trace!(
        from_block = from,
        to_block = to,
        confirmed = confirmed.len(),
        steps_complete,
        total_steps,
        "batch processed"
    );

    Ok(Batch { steps_complete, total_steps, from_block: from, to_block: to, events: confirmed })
}

/// Client-side event-name filter; only applies when no server-side topic
/// filter is configured.
pub(crate) fn apply_event_name_filter(inner: &EmitterInner, logs: &mut Vec<LogRecord>) {
    if inner.topics.is_empty() && !inner.events.is_empty() {
        logs.retain(|log| inner.events.iter().any(|name| name == &log.event_name));
    }
}

/// Splits logs at the confirmation cutoff, buffers the unconfirmed part,
/// and returns the confirmed part for emission.
pub(crate) async fn classify_and_store(
    inner: &EmitterInner,
    logs: Vec<LogRecord>,
    current: BlockRef,
) -> Result<Vec<LogRecord>, EmitterError> {
    // a head shallower than the confirmation depth confirms nothing
    let cutoff = current.number.checked_sub(inner.confirmations);
    let (confirmed, unconfirmed): (Vec<_>, Vec<_>) =
        logs.into_iter().partition(|log| cutoff.is_some_and(|cutoff| log.block_number <= cutoff));

    if !unconfirmed.is_empty() {
        debug!(count = unconfirmed.len(), ?cutoff, "buffering events below confirmation depth");
        buffer_events(inner, &unconfirmed).await?;
    }

    Ok(confirmed)
}

async fn buffer_events(inner: &EmitterInner, records: &[LogRecord]) -> Result<(), EmitterError> {
    let rows = records
        .iter()
        .map(|record| BufferedEvent::from_record(record, inner.confirmations))
        .collect::<Result<Vec<_>, _>>()?;

    match inner.repository.bulk_insert(&rows).await {
        Ok(()) => Ok(()),
        Err(EmitterError::Duplicate { matching_content: true, .. })
            if inner.recovering.load(Ordering::Relaxed) =>
        {
            warn!("buffer rows already present after restart, inserting the remainder");
            insert_fresh_rows(inner, rows).await
        }
        Err(e) => Err(e),
    }
}

/// Post-crash recovery path: the previous run buffered part of this range
/// before losing its cursor write. Rows whose identity and content match
/// are already buffered; a content mismatch is a real conflict.
async fn insert_fresh_rows(
    inner: &EmitterInner,
    rows: Vec<BufferedEvent>,
) -> Result<(), EmitterError> {
    let existing: HashMap<(B256, u64), String> = inner
        .repository
        .find_all(inner.contract_address)
        .await?
        .into_iter()
        .map(|row| (row.identity(), row.content))
        .collect();

    let mut fresh = Vec::new();
    for row in rows {
        match existing.get(&row.identity()) {
            None => fresh.push(row),
            Some(content) if *content == row.content => {}
            Some(_) => {
                return Err(EmitterError::Duplicate {
                    transaction_hash: row.transaction_hash,
                    log_index: row.log_index,
                    matching_content: false,
                });
            }
        }
    }

    if fresh.is_empty() {
        return Ok(());
    }
    inner.repository.bulk_insert(&fresh).await
}
