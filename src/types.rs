use alloy::primitives::{Address, B256, BlockNumber};
use serde::{Deserialize, Serialize};

use crate::EmitterError;

/// A block identity: number plus canonical hash at that number.
///
/// Two refs at the same number with different hashes denote different
/// histories, which is exactly what reorg detection compares.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub number: BlockNumber,
    pub hash: B256,
}

impl BlockRef {
    #[must_use]
    pub const fn new(number: BlockNumber, hash: B256) -> Self {
        Self { number, hash }
    }
}

/// A decoded contract log as consumed by the pipeline.
///
/// Produced by a [`LogDecoder`](crate::log_source::LogDecoder) from a raw
/// RPC log. Identity is `(transaction_hash, log_index)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub address: Address,
    pub block_number: BlockNumber,
    pub block_hash: B256,
    pub transaction_hash: B256,
    pub log_index: u64,
    pub event_name: String,
    pub topics: Vec<B256>,
    pub payload: serde_json::Value,
}

impl LogRecord {
    /// The block this log was mined in.
    #[must_use]
    pub const fn block_ref(&self) -> BlockRef {
        BlockRef::new(self.block_number, self.block_hash)
    }

    /// Identity key of the log within the chain.
    #[must_use]
    pub const fn identity(&self) -> (B256, u64) {
        (self.transaction_hash, self.log_index)
    }
}

/// Per-batch progress of a fetch cycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressInfo {
    pub steps_complete: u64,
    pub total_steps: u64,
    pub from_block: BlockNumber,
    pub to_block: BlockNumber,
}

/// One fetched and classified block range.
///
/// `events` holds only the *confirmed* logs of the range; logs that still
/// need confirmations were written to the confirmation buffer before the
/// batch was yielded.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    pub steps_complete: u64,
    pub total_steps: u64,
    pub from_block: BlockNumber,
    pub to_block: BlockNumber,
    pub events: Vec<LogRecord>,
}

impl Batch {
    #[must_use]
    pub const fn progress(&self) -> ProgressInfo {
        ProgressInfo {
            steps_complete: self.steps_complete,
            total_steps: self.total_steps,
            from_block: self.from_block,
            to_block: self.to_block,
        }
    }
}

/// The result type yielded by [`EventsEmitter::fetch`](crate::EventsEmitter::fetch) streams.
pub type BatchResult = Result<Batch, EmitterError>;

/// Where a fresh emitter starts fetching when no cursor is persisted.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum StartBlock {
    /// Block 0.
    #[default]
    Genesis,
    /// The head observed by the first fetch cycle.
    Latest,
    /// A fixed block number.
    Number(BlockNumber),
}

impl StartBlock {
    /// Resolves the alias against the current head.
    #[must_use]
    pub const fn resolve(self, head: BlockNumber) -> BlockNumber {
        match self {
            Self::Genesis => 0,
            Self::Latest => head,
            Self::Number(n) => n,
        }
    }
}

impl From<BlockNumber> for StartBlock {
    fn from(number: BlockNumber) -> Self {
        Self::Number(number)
    }
}

/// Confirmation progress for a buffered event that has not reached its
/// target depth yet.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfirmationProgress {
    pub event: LogRecord,
    pub confirmations: u64,
    pub target_confirmation: u64,
}

/// A buffered event whose transaction disappeared from the canonical
/// chain before reaching its confirmation target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvalidEvent {
    pub contract_address: Address,
    pub block_number: BlockNumber,
    pub transaction_hash: B256,
    pub log_index: u64,
    pub event_name: String,
}

/// Channels exposed by an emitter's dispatcher.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    NewEvent,
    Progress,
    Reorg,
    ReorgOutOfRange,
    NewConfirmation,
    InvalidConfirmation,
    InitFinished,
    Error,
}

/// Payloads delivered to channel listeners.
#[derive(Clone, Debug)]
pub enum EmitterEvent {
    /// A confirmed contract event.
    NewEvent(LogRecord),
    /// Progress of the current fetch cycle, one per batch.
    Progress(ProgressInfo),
    /// A reorg was detected at the last fetched block.
    Reorg { block_number: BlockNumber },
    /// A reorg reaches below the last *processed* block; already-delivered
    /// events cannot be repaired by the library.
    ReorgOutOfRange { block_number: BlockNumber },
    /// A buffered event gained a confirmation.
    NewConfirmation(ConfirmationProgress),
    /// A buffered event was dropped by a reorg.
    InvalidConfirmation(InvalidEvent),
    /// Historical catch-up finished.
    InitFinished,
    /// A pipeline failure; the cycle was aborted and will be retried.
    Error(EmitterError),
}

impl EmitterEvent {
    /// The channel this payload is delivered on.
    #[must_use]
    pub const fn channel(&self) -> Channel {
        match self {
            Self::NewEvent(_) => Channel::NewEvent,
            Self::Progress(_) => Channel::Progress,
            Self::Reorg { .. } => Channel::Reorg,
            Self::ReorgOutOfRange { .. } => Channel::ReorgOutOfRange,
            Self::NewConfirmation(_) => Channel::NewConfirmation,
            Self::InvalidConfirmation(_) => Channel::InvalidConfirmation,
            Self::InitFinished => Channel::InitFinished,
            Self::Error(_) => Channel::Error,
        }
    }
}
