use std::sync::{Arc, atomic::AtomicBool};

use alloy::primitives::Address;

use crate::{
    EmitterError,
    block_tracker::BlockTracker,
    confirmator::Confirmator,
    dispatcher::Dispatcher,
    emitter::fetch::{EmitterInner, EventsEmitter},
    log_source::{LogSource, MAX_TOPIC_POSITIONS, TopicFilter},
    storage::{CursorStore, EventRepository},
    types::StartBlock,
};

/// Default number of blocks fetched per `eth_getLogs` call.
pub const DEFAULT_BATCH_SIZE: u64 = 120;

/// Default confirmation depth; zero disables buffering entirely.
pub const DEFAULT_CONFIRMATIONS: u64 = 0;

/// Configures and builds an [`EventsEmitter`] for one contract.
///
/// At least one of [`topics`](Self::topics) (server-side filter,
/// preferred) or [`event`](Self::event) names (client-side filter) must be
/// configured; everything else has defaults.
///
/// # Example
///
/// ```no_run
/// # use std::sync::Arc;
/// # use alloy::primitives::Address;
/// # use chain_events::{EventsEmitterBuilder, StartBlock, TopicFilter, storage::MemoryStorage};
/// # fn example(source: Arc<dyn chain_events::log_source::LogSource>) -> anyhow::Result<()> {
/// let storage = Arc::new(MemoryStorage::new());
/// let emitter = EventsEmitterBuilder::new(Address::ZERO)
///     .topics(TopicFilter::new().signature("Transfer(address,address,uint256)"))
///     .confirmations(12)
///     .starting_block(StartBlock::Latest)
///     .build(source, storage.clone(), storage)?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct EventsEmitterBuilder {
    contract_address: Address,
    topics: TopicFilter,
    events: Vec<String>,
    batch_size: u64,
    confirmations: u64,
    starting_block: StartBlock,
    serial_listeners: bool,
    serial_processing: bool,
    auto_start: bool,
}

impl EventsEmitterBuilder {
    #[must_use]
    pub fn new(contract_address: Address) -> Self {
        Self {
            contract_address,
            topics: TopicFilter::new(),
            events: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            confirmations: DEFAULT_CONFIRMATIONS,
            starting_block: StartBlock::default(),
            serial_listeners: false,
            serial_processing: false,
            auto_start: true,
        }
    }

    /// Server-side topic filter; raw signatures are hashed when the filter
    /// is assembled.
    #[must_use]
    pub fn topics(mut self, topics: TopicFilter) -> Self {
        self.topics = topics;
        self
    }

    /// Adds an event name to the client-side filter, applied after fetch
    /// when no topic filter is configured.
    #[must_use]
    pub fn event(mut self, name: impl Into<String>) -> Self {
        self.events.push(name.into());
        self
    }

    /// Replaces the client-side event name filter.
    #[must_use]
    pub fn events<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.events = names.into_iter().map(Into::into).collect();
        self
    }

    /// Blocks fetched per `eth_getLogs` call. Must be greater than 0.
    #[must_use]
    pub fn batch_size(mut self, batch_size: u64) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Confirmation depth before an event is delivered; zero delivers
    /// immediately without buffering.
    #[must_use]
    pub fn confirmations(mut self, confirmations: u64) -> Self {
        self.confirmations = confirmations;
        self
    }

    /// Where the first fetch starts when no cursor is persisted.
    #[must_use]
    pub fn starting_block(mut self, starting_block: impl Into<StartBlock>) -> Self {
        self.starting_block = starting_block.into();
        self
    }

    /// Await each listener in registration order instead of fanning out.
    #[must_use]
    pub fn serial_listeners(mut self, serial_listeners: bool) -> Self {
        self.serial_listeners = serial_listeners;
        self
    }

    /// Await the full dispatch of each event before dispatching the next.
    #[must_use]
    pub fn serial_processing(mut self, serial_processing: bool) -> Self {
        self.serial_processing = serial_processing;
        self
    }

    /// Start the auto emitter on the first `newEvent` subscription and
    /// stop it when the last one is dropped.
    #[must_use]
    pub fn auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    /// Validates the configuration and assembles the emitter.
    ///
    /// # Errors
    ///
    /// * [`EmitterError::MissingEventFilter`] - neither topics nor event names configured.
    /// * [`EmitterError::InvalidBatchSize`] - `batch_size` is 0.
    /// * [`EmitterError::TooManyTopicPositions`] - more than 4 topic positions.
    pub fn build(
        self,
        source: Arc<dyn LogSource>,
        cursor_store: Arc<dyn CursorStore>,
        repository: Arc<dyn EventRepository>,
    ) -> Result<EventsEmitter, EmitterError> {
        if self.batch_size == 0 {
            return Err(EmitterError::InvalidBatchSize);
        }
        if self.topics.is_empty() && self.events.is_empty() {
            return Err(EmitterError::MissingEventFilter);
        }
        if self.topics.positions().len() > MAX_TOPIC_POSITIONS {
            return Err(EmitterError::TooManyTopicPositions);
        }

        let dispatcher = Dispatcher::new(self.serial_listeners);
        let tracker = Arc::new(BlockTracker::new(cursor_store));

        let confirmator = (self.confirmations > 0).then(|| {
            Arc::new(Confirmator::new(
                self.contract_address,
                self.confirmations,
                repository.clone(),
                tracker.clone(),
                source.clone(),
                dispatcher.clone(),
            ))
        });

        Ok(EventsEmitter::from_inner(EmitterInner {
            contract_address: self.contract_address,
            topics: self.topics,
            events: self.events,
            batch_size: self.batch_size,
            confirmations: self.confirmations,
            starting_block: self.starting_block,
            serial_processing: self.serial_processing,
            auto_start: self.auto_start,
            source,
            tracker,
            repository,
            dispatcher,
            confirmator,
            fetch_gate: Arc::new(tokio::sync::Mutex::new(())),
            recovering: AtomicBool::new(true),
        }))
    }
}
