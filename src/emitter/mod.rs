//! The event emitters.
//!
//! [`EventsEmitter`] is the manual fetch pipeline: callers hand it a head
//! block (or let it resolve one) and consume the resulting batch stream.
//! [`AutoEventsEmitter`] drives that pipeline from a
//! [`BlockProducer`](crate::producer::BlockProducer) and owns the
//! start/stop lifecycle, including subscription-driven auto-start.

mod auto;
mod fetch;
mod options;
mod reorg;

pub use auto::{AutoEventsEmitter, LifecycleState};
pub use fetch::EventsEmitter;
pub use options::{DEFAULT_BATCH_SIZE, DEFAULT_CONFIRMATIONS, EventsEmitterBuilder};
