//! Node client abstraction.
//!
//! `ChainRpc` is the single seam between the indexer and a blockchain node.
//! Production uses `AlloyRpc` (HTTP, one provider per call); tests use
//! `MockRpc` from the `test-utils` feature.

use alloy::eips::BlockNumberOrTag;
use alloy::primitives::{Address, Bytes, B256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, Log};
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::contracts::IMulticall3;
use crate::error::RpcError;

/// Canonical Multicall3 deployment, identical on every EVM chain.
pub const MULTICALL3_ADDRESS: Address =
    alloy::primitives::address!("cA11bde05977b3631167028862bE2a173976CA11");

/// A log as returned by the node, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
}

impl RawLog {
    /// Event selector, if the log has one.
    pub fn topic0(&self) -> Option<B256> {
        self.topics.first().copied()
    }

    fn from_rpc(log: Log) -> Result<Self, RpcError> {
        let missing = |field: &str| RpcError::transient("eth_getLogs", format!("log without {field}"));
        Ok(Self {
            address: log.inner.address,
            topics: log.inner.data.topics().to_vec(),
            data: log.inner.data.data.clone(),
            block_number: log.block_number.ok_or_else(|| missing("block number"))?,
            tx_hash: log.transaction_hash.ok_or_else(|| missing("transaction hash"))?,
            log_index: log.log_index.ok_or_else(|| missing("log index"))?,
        })
    }
}

/// Block header fields the indexer needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub number: u64,
    pub hash: B256,
    pub timestamp: u64,
}

/// Log filter over an inclusive block range.
///
/// `topics` is an OR-set matched against topic0; empty means any event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    pub addresses: Vec<Address>,
    pub topics: Vec<B256>,
    pub from_block: u64,
    pub to_block: u64,
}

impl LogQuery {
    /// Same filter over a different range.
    pub fn with_range(&self, from_block: u64, to_block: u64) -> Self {
        Self {
            addresses: self.addresses.clone(),
            topics: self.topics.clone(),
            from_block,
            to_block,
        }
    }

    /// Whether `log` satisfies this filter.
    pub fn matches(&self, log: &RawLog) -> bool {
        (self.from_block..=self.to_block).contains(&log.block_number)
            && (self.addresses.is_empty() || self.addresses.contains(&log.address))
            && (self.topics.is_empty()
                || log.topic0().is_some_and(|t| self.topics.contains(&t)))
    }

    fn to_filter(&self) -> Filter {
        let mut filter = Filter::new()
            .from_block(self.from_block)
            .to_block(self.to_block)
            .address(self.addresses.clone());
        if !self.topics.is_empty() {
            filter = filter.event_signature(self.topics.clone());
        }
        filter
    }
}

/// One read-only contract call inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadCall {
    pub target: Address,
    pub calldata: Bytes,
}

impl ReadCall {
    pub fn new<C: SolCall>(target: Address, call: &C) -> Self {
        Self {
            target,
            calldata: Bytes::from(call.abi_encode()),
        }
    }
}

/// Minimal node surface used by the indexer.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Latest block number.
    async fn block_number(&self) -> Result<u64, RpcError>;

    /// Header of block `number`, `None` if the node does not have it.
    async fn block(&self, number: u64) -> Result<Option<BlockInfo>, RpcError>;

    /// Logs matching `query`.
    async fn logs(&self, query: &LogQuery) -> Result<Vec<RawLog>, RpcError>;

    /// Execute independent reads in one round trip, returning raw return
    /// data in call order. Any failing call fails the whole batch.
    async fn batch_call(&self, calls: &[ReadCall]) -> Result<Vec<Bytes>, RpcError>;
}

/// HTTP node client backed by Alloy providers.
///
/// Batches go through Multicall3 `aggregate3` with `allowFailure = false`.
#[derive(Debug, Clone)]
pub struct AlloyRpc {
    url: String,
    multicall: Address,
}

impl AlloyRpc {
    /// Create a client, rejecting malformed URLs up front.
    pub fn new(url: &str, multicall: Address) -> anyhow::Result<Self> {
        let _: alloy::transports::http::reqwest::Url = url.parse()?;
        info!(url = url, multicall = %multicall, "Initializing node client");
        Ok(Self {
            url: url.to_string(),
            multicall,
        })
    }

    fn provider(&self, op: &'static str) -> Result<impl Provider, RpcError> {
        let url = self
            .url
            .parse()
            .map_err(|e| RpcError::fatal(op, format!("invalid rpc url: {e}")))?;
        Ok(ProviderBuilder::new().on_http(url))
    }
}

#[async_trait]
impl ChainRpc for AlloyRpc {
    async fn block_number(&self) -> Result<u64, RpcError> {
        let provider = self.provider("eth_blockNumber")?;
        provider
            .get_block_number()
            .await
            .map_err(|e| RpcError::classify("eth_blockNumber", e))
    }

    async fn block(&self, number: u64) -> Result<Option<BlockInfo>, RpcError> {
        let provider = self.provider("eth_getBlockByNumber")?;
        let block = provider
            .get_block_by_number(BlockNumberOrTag::Number(number))
            .await
            .map_err(|e| RpcError::classify("eth_getBlockByNumber", e))?;

        Ok(block.map(|b| BlockInfo {
            number: b.header.number,
            hash: b.header.hash,
            timestamp: b.header.timestamp,
        }))
    }

    async fn logs(&self, query: &LogQuery) -> Result<Vec<RawLog>, RpcError> {
        let provider = self.provider("eth_getLogs")?;
        let logs = provider
            .get_logs(&query.to_filter())
            .await
            .map_err(|e| RpcError::classify("eth_getLogs", e))?;

        debug!(
            from = query.from_block,
            to = query.to_block,
            count = logs.len(),
            "Fetched logs"
        );

        logs.into_iter().map(RawLog::from_rpc).collect()
    }

    async fn batch_call(&self, calls: &[ReadCall]) -> Result<Vec<Bytes>, RpcError> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        let provider = self.provider("aggregate3")?;
        let multicall = IMulticall3::new(self.multicall, &provider);

        let batch: Vec<IMulticall3::Call3> = calls
            .iter()
            .map(|c| IMulticall3::Call3 {
                target: c.target,
                allowFailure: false,
                callData: c.calldata.clone(),
            })
            .collect();

        let result = multicall
            .aggregate3(batch)
            .call()
            .await
            .map_err(|e| RpcError::classify("aggregate3", e))?;

        if result.returnData.len() != calls.len() {
            return Err(RpcError::fatal(
                "aggregate3",
                format!(
                    "expected {} results, got {}",
                    calls.len(),
                    result.returnData.len()
                ),
            ));
        }

        Ok(result.returnData.into_iter().map(|r| r.returnData).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    fn log(addr: Address, topic: B256, block: u64) -> RawLog {
        RawLog {
            address: addr,
            topics: vec![topic],
            data: Bytes::new(),
            block_number: block,
            tx_hash: B256::with_last_byte(1),
            log_index: 0,
        }
    }

    #[test]
    fn test_query_matching() {
        let a = address!("1000000000000000000000000000000000000001");
        let b = address!("2000000000000000000000000000000000000002");
        let t = B256::with_last_byte(7);

        let query = LogQuery {
            addresses: vec![a],
            topics: vec![t],
            from_block: 10,
            to_block: 20,
        };

        assert!(query.matches(&log(a, t, 10)));
        assert!(query.matches(&log(a, t, 20)));
        assert!(!query.matches(&log(a, t, 21)));
        assert!(!query.matches(&log(b, t, 15)));
        assert!(!query.matches(&log(a, B256::ZERO, 15)));

        let any_topic = LogQuery {
            topics: vec![],
            ..query.with_range(0, 100)
        };
        assert!(any_topic.matches(&log(a, B256::ZERO, 50)));
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(AlloyRpc::new("not a url", MULTICALL3_ADDRESS).is_err());
        assert!(AlloyRpc::new("http://localhost:8545", MULTICALL3_ADDRESS).is_ok());
    }

    #[tokio::test]
    #[ignore] // Requires network
    async fn test_block_number_live() {
        let rpc = AlloyRpc::new("https://eth.llamarpc.com", MULTICALL3_ADDRESS).unwrap();
        assert!(rpc.block_number().await.unwrap() > 0);
    }
}
