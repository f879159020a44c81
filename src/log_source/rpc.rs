use std::{fmt::Debug, sync::Arc, time::Duration};

use alloy::{
    consensus::BlockHeader,
    eips::BlockNumberOrTag,
    network::{BlockResponse, Ethereum, Network, TransactionResponse, primitives::HeaderResponse},
    primitives::{Address, B256},
    providers::{Provider, RootProvider},
    rpc::types::{Filter, Topic},
    transports::{RpcError, TransportErrorKind},
};
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use tokio::time::timeout;
use tracing::{error, info, trace};

use crate::{
    EmitterError,
    log_source::{LogDecoder, LogSource, TopicFilter, TopicRawDecoder},
    types::{BlockRef, LogRecord},
};

const DEFAULT_MAX_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_RETRIES: usize = 3;
const DEFAULT_MIN_DELAY: Duration = Duration::from_millis(500);

/// [`LogSource`] over an Alloy provider, with built-in retry and timeout.
///
/// Every call retries transient RPC failures with exponential backoff and
/// is bounded by a total timeout, so a flaky endpoint degrades into a
/// cycle retry instead of a stuck pipeline.
#[derive(Clone)]
pub struct RpcLogSource<N: Network = Ethereum> {
    provider: RootProvider<N>,
    decoder: Arc<dyn LogDecoder>,
    max_timeout: Duration,
    max_retries: usize,
    min_delay: Duration,
}

impl<N: Network> RpcLogSource<N> {
    /// Wraps a provider with the default raw-topic decoder.
    #[must_use]
    pub fn new(provider: RootProvider<N>) -> Self {
        Self::with_decoder(provider, Arc::new(TopicRawDecoder))
    }

    /// Wraps a provider with an ABI-aware decoder.
    #[must_use]
    pub fn with_decoder(provider: RootProvider<N>, decoder: Arc<dyn LogDecoder>) -> Self {
        Self {
            provider,
            decoder,
            max_timeout: DEFAULT_MAX_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            min_delay: DEFAULT_MIN_DELAY,
        }
    }

    /// Total time budget for one call including retries.
    #[must_use]
    pub fn max_timeout(mut self, max_timeout: Duration) -> Self {
        self.max_timeout = max_timeout;
        self
    }

    /// Maximum retry attempts per call.
    #[must_use]
    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Initial backoff delay.
    #[must_use]
    pub fn min_delay(mut self, min_delay: Duration) -> Self {
        self.min_delay = min_delay;
        self
    }

    /// Execute `operation` with exponential backoff and a total timeout.
    async fn retry_with_total_timeout<T: Debug, F, Fut>(
        &self,
        operation: F,
    ) -> Result<T, EmitterError>
    where
        F: Fn(RootProvider<N>) -> Fut,
        Fut: Future<Output = Result<T, RpcError<TransportErrorKind>>>,
    {
        let retry_strategy = ExponentialBuilder::default()
            .with_max_times(self.max_retries)
            .with_min_delay(self.min_delay);

        timeout(
            self.max_timeout,
            (|| operation(self.provider.clone()))
                .retry(retry_strategy)
                .notify(|err: &RpcError<TransportErrorKind>, dur: Duration| {
                    info!(error = %err, "RPC error, retrying after {:?}", dur);
                })
                .sleep(tokio::time::sleep),
        )
        .await
        .map_err(|_| EmitterError::Timeout)?
        .map_err(EmitterError::from)
    }

    fn build_filter(address: Address, from: u64, to: u64, topics: &TopicFilter) -> Filter {
        let mut filter = Filter::new().address(address).from_block(from).to_block(to);

        for (position, set) in topics.positions().iter().enumerate() {
            if set.is_empty() {
                continue;
            }
            let topic = Topic::from(set.clone());
            filter = match position {
                0 => filter.event_signature(topic),
                1 => filter.topic1(topic),
                2 => filter.topic2(topic),
                // positions beyond 3 are rejected at configuration time
                _ => filter.topic3(topic),
            };
        }

        filter
    }
}

#[async_trait]
impl<N: Network> LogSource for RpcLogSource<N> {
    async fn get_block_number(&self) -> Result<u64, EmitterError> {
        trace!("eth_blockNumber called");
        let result = self
            .retry_with_total_timeout(move |provider| async move {
                provider.get_block_number().await
            })
            .await;
        if let Err(e) = &result {
            error!(error = %e, "eth_blockNumber failed");
        }
        result
    }

    async fn get_block(&self, id: BlockNumberOrTag) -> Result<BlockRef, EmitterError> {
        trace!(block_id = ?id, "eth_getBlockByNumber called");
        let result = self
            .retry_with_total_timeout(move |provider| async move {
                provider.get_block_by_number(id).await
            })
            .await;
        if let Err(e) = &result {
            error!(error = %e, "eth_getBlockByNumber failed");
        }

        let block = result?
            .ok_or(EmitterError::BlockNotFound(id.as_number().unwrap_or_default()))?;
        let header = block.header();
        Ok(BlockRef::new(header.number(), header.hash()))
    }

    async fn get_past_logs(
        &self,
        address: Address,
        from: u64,
        to: u64,
        topics: &TopicFilter,
    ) -> Result<Vec<LogRecord>, EmitterError> {
        trace!(from_block = from, to_block = to, "eth_getLogs called");
        let filter = Self::build_filter(address, from, to, topics);

        let result = self
            .retry_with_total_timeout(move |provider| {
                let filter = filter.clone();
                async move { provider.get_logs(&filter).await }
            })
            .await;

        let logs = match result {
            Ok(logs) => logs,
            Err(e) => {
                error!(error = %e, from_block = from, to_block = to, "eth_getLogs failed");
                return Err(e);
            }
        };

        let mut records = logs
            .iter()
            .filter(|log| !log.removed)
            .map(|log| self.decoder.decode(log))
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by_key(|record| (record.block_number, record.log_index));

        if !records.is_empty() {
            info!(
                log_count = records.len(),
                from_block = from,
                to_block = to,
                "found logs in block range"
            );
        }

        Ok(records)
    }

    async fn get_transaction_block(
        &self,
        transaction_hash: B256,
    ) -> Result<Option<u64>, EmitterError> {
        trace!(tx_hash = %transaction_hash, "eth_getTransactionByHash called");
        let result = self
            .retry_with_total_timeout(move |provider| async move {
                provider.get_transaction_by_hash(transaction_hash).await
            })
            .await;
        if let Err(e) = &result {
            error!(error = %e, "eth_getTransactionByHash failed");
        }

        Ok(result?.and_then(|tx| tx.block_number()))
    }
}
