//! Confirmation-aware contract event pipeline.
//!
//! `chain-events` ingests contract logs from an Ethereum-family chain,
//! reconciles them against block reorganizations, and delivers them to
//! subscribers only once they are buried under a configurable
//! confirmation depth. Progress is checkpointed through two persisted
//! cursors, so a restarted pipeline resumes where it left off with
//! at-least-once delivery inside the confirmation window.
//!
//! # Overview
//!
//! - [`EventsEmitter`] — the manual fetch pipeline: batched catch-up from
//!   the persisted cursor, reorg detection and remediation, and a
//!   two-stage confirmation buffer.
//! - [`AutoEventsEmitter`] — drives the pipeline from a
//!   [`producer::BlockProducer`] and owns the start/stop lifecycle.
//! - [`Dispatcher`] — typed channels (`newEvent`, `progress`, `reorg`,
//!   `newConfirmation`, ...) with parallel or serial listener dispatch.
//! - [`storage`] — pluggable persistence for the cursors and the
//!   confirmation buffer (in-memory always, SQLite behind the `sqlite`
//!   feature).
//!
//! # Example
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use alloy::{
//!     primitives::address,
//!     providers::{Provider, ProviderBuilder},
//! };
//! use chain_events::{
//!     AutoEventsEmitter, Channel, EventsEmitterBuilder, TopicFilter,
//!     log_source::RpcLogSource,
//!     producer::PollingBlockProducer,
//!     storage::MemoryStorage,
//! };
//! use futures::FutureExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let provider = ProviderBuilder::new().connect("ws://localhost:8546").await?;
//!     let source = Arc::new(RpcLogSource::new(provider.root().clone()));
//!     let storage = Arc::new(MemoryStorage::new());
//!
//!     let emitter = EventsEmitterBuilder::new(address!("0xd8dA6BF26964af9d7eed9e03e53415d37aa96045"))
//!         .topics(TopicFilter::new().signature("Transfer(address,address,uint256)"))
//!         .confirmations(12)
//!         .build(source.clone(), storage.clone(), storage)?;
//!
//!     let producer = Arc::new(PollingBlockProducer::spawn(source, Duration::from_secs(5))?);
//!     let auto = AutoEventsEmitter::new(emitter, producer);
//!
//!     // auto-start: the emitter runs while this subscription is alive
//!     let _events = auto.subscribe(Channel::NewEvent, |event| {
//!         async move {
//!             println!("confirmed event: {event:?}");
//!             Ok(())
//!         }
//!         .boxed()
//!     });
//!
//!     tokio::signal::ctrl_c().await?;
//!     Ok(())
//! }
//! ```

pub mod block_tracker;
pub mod confirmator;
pub mod dispatcher;
pub mod log_source;
pub mod producer;
pub mod storage;

mod batch_iterator;
mod emitter;
mod error;
mod types;

pub use dispatcher::{Dispatcher, ListenerError, ListenerFuture, Subscription};
pub use emitter::{
    AutoEventsEmitter, DEFAULT_BATCH_SIZE, DEFAULT_CONFIRMATIONS, EventsEmitter,
    EventsEmitterBuilder, LifecycleState,
};
pub use error::EmitterError;
pub use log_source::TopicFilter;
pub use types::{
    Batch, BatchResult, BlockRef, Channel, ConfirmationProgress, EmitterEvent, InvalidEvent,
    LogRecord, ProgressInfo, StartBlock,
};
