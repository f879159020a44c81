//! Chain access consumed by the pipeline.
//!
//! The core talks to the chain through the [`LogSource`] trait: range
//! log fetches, header lookups, and a transaction-existence probe used by
//! the confirmator's drop check. [`RpcLogSource`] adapts an Alloy provider
//! with retry and timeout; tests plug in scripted implementations.

mod rpc;

pub use rpc::RpcLogSource;

use alloy::{
    eips::BlockNumberOrTag,
    primitives::{Address, B256, keccak256},
    rpc::types::Log,
};
use async_trait::async_trait;

use crate::{
    EmitterError,
    types::{BlockRef, LogRecord},
};

/// Maximum topic positions an Ethereum log filter supports.
pub const MAX_TOPIC_POSITIONS: usize = 4;

/// Server-side topic filter: one OR-set of 32-byte topics per position.
///
/// An empty set at a position matches anything at that position; an empty
/// filter matches every log of the contract.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopicFilter {
    positions: Vec<Vec<B256>>,
}

impl TopicFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a position matching exactly one topic.
    #[must_use]
    pub fn topic(mut self, topic: B256) -> Self {
        self.positions.push(vec![topic]);
        self
    }

    /// Appends a position matching any of the given topics.
    #[must_use]
    pub fn any_of(mut self, topics: impl IntoIterator<Item = B256>) -> Self {
        self.positions.push(topics.into_iter().collect());
        self
    }

    /// Appends a position matching the keccak-256 hash of a raw event
    /// signature, e.g. `"Transfer(address,address,uint256)"`.
    #[must_use]
    pub fn signature(self, signature: &str) -> Self {
        self.topic(keccak256(signature.as_bytes()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.iter().all(Vec::is_empty)
    }

    #[must_use]
    pub fn positions(&self) -> &[Vec<B256>] {
        &self.positions
    }
}

/// Chain RPC surface consumed by the core.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Current head number.
    async fn get_block_number(&self) -> Result<u64, EmitterError>;

    /// Header (number, hash) for a block number or the `latest` tag.
    async fn get_block(&self, id: BlockNumberOrTag) -> Result<BlockRef, EmitterError>;

    /// Decoded logs of `address` over the closed interval `[from, to]`,
    /// ordered by `(block_number, log_index)`.
    async fn get_past_logs(
        &self,
        address: Address,
        from: u64,
        to: u64,
        topics: &TopicFilter,
    ) -> Result<Vec<LogRecord>, EmitterError>;

    /// The block a transaction is currently mined in, if any.
    async fn get_transaction_block(
        &self,
        transaction_hash: B256,
    ) -> Result<Option<u64>, EmitterError>;
}

/// Turns raw RPC logs into the structured records the pipeline consumes.
///
/// ABI-aware decoding lives outside the core; implementations typically
/// wrap a contract's ABI registry.
pub trait LogDecoder: Send + Sync {
    fn decode(&self, log: &Log) -> Result<LogRecord, EmitterError>;
}

/// Fallback decoder that names events by their `topic0` hash and carries
/// the undecoded data bytes as payload.
#[derive(Copy, Clone, Debug, Default)]
pub struct TopicRawDecoder;

impl LogDecoder for TopicRawDecoder {
    fn decode(&self, log: &Log) -> Result<LogRecord, EmitterError> {
        let (block_number, block_hash, transaction_hash, log_index) = log_identity(log)?;

        let topics = log.data().topics().to_vec();
        let event_name =
            topics.first().map_or_else(|| "anonymous".to_owned(), |topic| format!("{topic:#x}"));

        Ok(LogRecord {
            address: log.address(),
            block_number,
            block_hash,
            transaction_hash,
            log_index,
            event_name,
            topics,
            payload: serde_json::json!({ "data": log.data().data.to_string() }),
        })
    }
}

/// Extracts the chain coordinates of a mined log.
///
/// Pending logs carry no coordinates and are rejected; the pipeline only
/// ever scans mined ranges.
pub fn log_identity(log: &Log) -> Result<(u64, B256, B256, u64), EmitterError> {
    match (log.block_number, log.block_hash, log.transaction_hash, log.log_index) {
        (Some(number), Some(block_hash), Some(transaction_hash), Some(log_index)) => {
            Ok((number, block_hash, transaction_hash, log_index))
        }
        _ => Err(EmitterError::Serialization("log is missing block coordinates".into())),
    }
}
