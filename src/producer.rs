//! New-block producers.
//!
//! A producer broadcasts the chain head to any number of emitters. The
//! polling flavor asks the [`LogSource`] for the latest header on an
//! interval; the push flavor accepts headers from an external transport.
//! Both deduplicate by block number, so subscribers only ever see forward
//! progress.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use alloy::eips::BlockNumberOrTag;
use tokio::{
    sync::broadcast,
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::{EmitterError, log_source::LogSource, types::BlockRef};

/// Default polling cadence.
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_millis(5000);

/// Capacity of the head broadcast; slow subscribers observe a lag error
/// rather than blocking the producer.
const PRODUCER_CHANNEL_CAPACITY: usize = 1024;

/// Items broadcast by a producer: a new head, or a poll failure for the
/// subscriber to surface on its own `error` channel.
pub type ProducerMessage = Result<BlockRef, EmitterError>;

/// Source of new block headers shared across emitters.
pub trait BlockProducer: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<ProducerMessage>;
}

/// Polls the chain head on a fixed interval.
///
/// Poll failures are broadcast but never stop the loop; the producer runs
/// until [`stop`](Self::stop) is called or the handle is dropped.
pub struct PollingBlockProducer {
    sender: broadcast::Sender<ProducerMessage>,
    cancel: CancellationToken,
}

impl PollingBlockProducer {
    /// Spawns the polling loop.
    pub fn spawn(
        source: Arc<dyn LogSource>,
        polling_interval: Duration,
    ) -> Result<Self, EmitterError> {
        if polling_interval.is_zero() {
            return Err(EmitterError::InvalidPollingInterval);
        }

        let (sender, _) = broadcast::channel(PRODUCER_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        tokio::spawn(poll_loop(source, polling_interval, sender.clone(), cancel.clone()));

        Ok(Self { sender, cancel })
    }

    /// Stops the polling loop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for PollingBlockProducer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl BlockProducer for PollingBlockProducer {
    fn subscribe(&self) -> broadcast::Receiver<ProducerMessage> {
        self.sender.subscribe()
    }
}

async fn poll_loop(
    source: Arc<dyn LogSource>,
    polling_interval: Duration,
    sender: broadcast::Sender<ProducerMessage>,
    cancel: CancellationToken,
) {
    let mut ticker = interval(polling_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut last_emitted: Option<u64> = None;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match source.get_block(BlockNumberOrTag::Latest).await {
                    Ok(head) => {
                        // also suppresses momentary head regressions from
                        // load-balanced endpoints
                        if last_emitted.is_some_and(|n| head.number <= n) {
                            trace!(block_number = head.number, "head unchanged, skipping");
                            continue;
                        }
                        debug!(block_number = head.number, "new head observed");
                        last_emitted = Some(head.number);
                        _ = sender.send(Ok(head));
                    }
                    Err(e) => {
                        error!(error = %e, "failed to poll latest block");
                        _ = sender.send(Err(e));
                    }
                }
            }
        }
    }

    debug!("block polling stopped");
}

/// Accepts headers pushed from an external transport (websocket bridge,
/// test harness).
#[derive(Debug)]
pub struct PushBlockProducer {
    sender: broadcast::Sender<ProducerMessage>,
    last_emitted: Mutex<Option<u64>>,
}

impl Default for PushBlockProducer {
    fn default() -> Self {
        Self::new()
    }
}

impl PushBlockProducer {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(PRODUCER_CHANNEL_CAPACITY);
        Self { sender, last_emitted: Mutex::new(None) }
    }

    /// Forwards a header to subscribers; returns whether it was forwarded
    /// (duplicates and regressions are dropped).
    pub fn push(&self, head: BlockRef) -> bool {
        let mut last = self.last_emitted.lock().expect("producer mutex poisoned");
        if last.is_some_and(|n| head.number <= n) {
            trace!(block_number = head.number, "duplicate head ignored");
            return false;
        }
        *last = Some(head.number);
        _ = self.sender.send(Ok(head));
        true
    }

    /// Surfaces a transport failure to subscribers.
    pub fn push_error(&self, error: EmitterError) {
        _ = self.sender.send(Err(error));
    }
}

impl BlockProducer for PushBlockProducer {
    fn subscribe(&self) -> broadcast::Receiver<ProducerMessage> {
        self.sender.subscribe()
    }
}
