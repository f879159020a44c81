use std::sync::Arc;

use alloy::{
    primitives::{B256, BlockNumber},
    transports::{RpcError, TransportErrorKind},
};
use thiserror::Error;

/// Failures produced by the event pipeline.
///
/// All payloads are cheap to clone so the error can travel both the
/// in-band fetch stream and the `error` dispatch channel.
#[derive(Error, Debug, Clone)]
pub enum EmitterError {
    #[error("at least one of `topics` or `events` must be configured")]
    MissingEventFilter,

    #[error("batch size must be greater than 0")]
    InvalidBatchSize,

    #[error("polling interval must be greater than 0")]
    InvalidPollingInterval,

    #[error("at most 4 topic positions are supported")]
    TooManyTopicPositions,

    #[error("RPC error: {0}")]
    Rpc(Arc<RpcError<TransportErrorKind>>),

    #[error("operation timed out")]
    Timeout,

    #[error("block {0} not found")]
    BlockNotFound(BlockNumber),

    #[error(
        "event {transaction_hash}#{log_index} is already buffered (content matches: {matching_content})"
    )]
    Duplicate { transaction_hash: B256, log_index: u64, matching_content: bool },

    #[error("storage error: {0}")]
    Storage(Arc<str>),

    #[error("listener error: {0}")]
    Listener(Arc<str>),

    #[error("serialization error: {0}")]
    Serialization(Arc<str>),

    #[error("block subscription lagged by {0} messages")]
    ProducerLagged(u64),
}

impl EmitterError {
    /// Wraps an arbitrary storage backend failure.
    pub fn storage(error: impl std::fmt::Display) -> Self {
        Self::Storage(error.to_string().into())
    }
}

impl From<RpcError<TransportErrorKind>> for EmitterError {
    fn from(error: RpcError<TransportErrorKind>) -> Self {
        Self::Rpc(Arc::new(error))
    }
}

impl From<serde_json::Error> for EmitterError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string().into())
    }
}
