//! Shared harness for the end-to-end pipeline tests.
//!
//! [`MockChain`] is a deterministic, scriptable chain: blocks get stable
//! hashes derived from a per-history seed, logs live at fixed
//! coordinates, and [`MockChain::reorg`] replaces the history from a
//! given height (dropping the logs mined there unless re-added).

#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use alloy::{
    eips::BlockNumberOrTag,
    primitives::{Address, B256, keccak256},
};
use async_trait::async_trait;
use chain_events::{
    BlockRef, Channel, EmitterError, EmitterEvent, EventsEmitter, LogRecord, Subscription,
    log_source::{LogSource, TopicFilter},
};
use futures::FutureExt;
use tokio::sync::mpsc;

#[derive(Default)]
struct ChainState {
    head: u64,
    /// Seed per block height; bumping a suffix of seeds models a reorg.
    seeds: Vec<u64>,
    logs: Vec<LogRecord>,
    failing: bool,
}

impl ChainState {
    fn hash_at(&self, number: u64) -> B256 {
        let seed = self.seeds.get(number as usize).copied().unwrap_or_default();
        block_hash(number, seed)
    }
}

fn block_hash(number: u64, seed: u64) -> B256 {
    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&number.to_be_bytes());
    bytes[8..].copy_from_slice(&seed.to_be_bytes());
    keccak256(bytes)
}

pub struct MockChain {
    state: Mutex<ChainState>,
}

impl MockChain {
    /// A chain whose head is `head`; all blocks up to it exist.
    pub fn new(head: u64) -> Arc<Self> {
        let state = ChainState {
            head,
            seeds: vec![0; head as usize + 1],
            logs: Vec::new(),
            failing: false,
        };
        Arc::new(Self { state: Mutex::new(state) })
    }

    /// While set, every RPC call fails with a timeout.
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().unwrap().failing = failing;
    }

    fn check_failing(&self) -> Result<(), EmitterError> {
        if self.state.lock().unwrap().failing {
            return Err(EmitterError::Timeout);
        }
        Ok(())
    }

    /// Extends the chain to a new, higher head.
    pub fn advance_to(&self, head: u64) {
        let mut state = self.state.lock().unwrap();
        assert!(head >= state.head, "advance_to cannot rewind; use reorg");
        state.seeds.resize(head as usize + 1, 0);
        state.head = head;
    }

    /// Rewrites history from `from` to the head: every block at or above
    /// `from` gets a new hash and the logs mined there are dropped.
    pub fn reorg(&self, from: u64) {
        let mut state = self.state.lock().unwrap();
        let head = state.head;
        for number in from..=head {
            state.seeds[number as usize] += 1;
        }
        state.logs.retain(|log| log.block_number < from);
    }

    /// Mines a log at the given coordinates; its block hash is taken from
    /// the current history.
    pub fn add_log(
        &self,
        contract: Address,
        block_number: u64,
        tx_seed: &str,
        log_index: u64,
        event_name: &str,
    ) -> LogRecord {
        let mut state = self.state.lock().unwrap();
        assert!(block_number <= state.head, "log beyond head");
        let record = LogRecord {
            address: contract,
            block_number,
            block_hash: state.hash_at(block_number),
            transaction_hash: keccak256(tx_seed.as_bytes()),
            log_index,
            event_name: event_name.to_owned(),
            topics: vec![],
            payload: serde_json::json!({ "tx": tx_seed }),
        };
        state.logs.push(record.clone());
        record
    }

    pub fn head_ref(&self) -> BlockRef {
        let state = self.state.lock().unwrap();
        BlockRef::new(state.head, state.hash_at(state.head))
    }

    pub fn block_ref(&self, number: u64) -> BlockRef {
        let state = self.state.lock().unwrap();
        BlockRef::new(number, state.hash_at(number))
    }
}

#[async_trait]
impl LogSource for MockChain {
    async fn get_block_number(&self) -> Result<u64, EmitterError> {
        self.check_failing()?;
        Ok(self.state.lock().unwrap().head)
    }

    async fn get_block(&self, id: BlockNumberOrTag) -> Result<BlockRef, EmitterError> {
        self.check_failing()?;
        let state = self.state.lock().unwrap();
        let number = match id {
            BlockNumberOrTag::Latest => state.head,
            BlockNumberOrTag::Number(number) if number <= state.head => number,
            BlockNumberOrTag::Number(number) => return Err(EmitterError::BlockNotFound(number)),
            _ => return Err(EmitterError::BlockNotFound(0)),
        };
        Ok(BlockRef::new(number, state.hash_at(number)))
    }

    async fn get_past_logs(
        &self,
        address: Address,
        from: u64,
        to: u64,
        _topics: &TopicFilter,
    ) -> Result<Vec<LogRecord>, EmitterError> {
        self.check_failing()?;
        let state = self.state.lock().unwrap();
        let mut logs: Vec<LogRecord> = state
            .logs
            .iter()
            .filter(|log| {
                log.address == address && log.block_number >= from && log.block_number <= to
            })
            .cloned()
            .collect();
        logs.sort_by_key(|log| (log.block_number, log.log_index));
        Ok(logs)
    }

    async fn get_transaction_block(
        &self,
        transaction_hash: B256,
    ) -> Result<Option<u64>, EmitterError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .logs
            .iter()
            .find(|log| log.transaction_hash == transaction_hash)
            .map(|log| log.block_number))
    }
}

/// Builds an emitter over the mock chain with deterministic dispatch
/// (serial listeners, serial processing); `configure` tweaks the rest.
pub fn build_emitter(
    chain: &Arc<MockChain>,
    storage: &Arc<chain_events::storage::MemoryStorage>,
    contract: Address,
    configure: impl FnOnce(chain_events::EventsEmitterBuilder) -> chain_events::EventsEmitterBuilder,
) -> EventsEmitter {
    let builder = chain_events::EventsEmitterBuilder::new(contract)
        .event("Transfer")
        .serial_listeners(true)
        .serial_processing(true)
        .auto_start(false);
    configure(builder)
        .build(chain.clone(), storage.clone(), storage.clone())
        .expect("emitter configuration is valid")
}

/// Drains a fetch stream, panicking on in-band errors.
pub async fn drain_batches(
    mut stream: tokio_stream::wrappers::ReceiverStream<chain_events::BatchResult>,
) -> Vec<chain_events::Batch> {
    use tokio_stream::StreamExt;

    let mut batches = Vec::new();
    while let Some(item) = stream.next().await {
        batches.push(item.expect("fetch cycle failed"));
    }
    batches
}

/// Subscribes a forwarding listener; received events pile up in the
/// returned channel.
pub fn collect(
    emitter: &EventsEmitter,
    channel: Channel,
) -> (Subscription, mpsc::UnboundedReceiver<EmitterEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let subscription = emitter.subscribe(channel, move |event| {
        let tx = tx.clone();
        async move {
            tx.send(event).ok();
            Ok(())
        }
        .boxed()
    });
    (subscription, rx)
}

/// Subscribes one forwarding listener to several channels so relative
/// emission order across channels is observable.
pub fn collect_many<const N: usize>(
    emitter: &EventsEmitter,
    channels: [Channel; N],
) -> (Vec<Subscription>, mpsc::UnboundedReceiver<EmitterEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let subscriptions = channels
        .into_iter()
        .map(|channel| {
            let tx = tx.clone();
            emitter.subscribe(channel, move |event| {
                let tx = tx.clone();
                async move {
                    tx.send(event).ok();
                    Ok(())
                }
                .boxed()
            })
        })
        .collect();
    (subscriptions, rx)
}

/// Waits for the next event with a generous timeout.
pub async fn expect_event(rx: &mut mpsc::UnboundedReceiver<EmitterEvent>) -> EmitterEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Asserts no further event arrives within a short grace period.
pub async fn assert_drained(rx: &mut mpsc::UnboundedReceiver<EmitterEvent>) {
    let outcome = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(outcome.is_err(), "unexpected event: {:?}", outcome.unwrap());
}

/// Polls `condition` until it holds or the deadline passes.
pub async fn wait_until<F, Fut>(condition: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached before deadline");
}
