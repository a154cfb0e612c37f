//! Retrying, caching front for a `ChainRpc` node client.

use alloy::primitives::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::error::RpcError;
use crate::retry::RetryPolicy;
use crate::rpc::{BlockInfo, ChainRpc, LogQuery, RawLog, ReadCall};

/// RPC gateway.
///
/// Every call gets a per-attempt deadline and transient failures are
/// retried under the `RetryPolicy`. Fatal failures return immediately.
/// Block headers are kept in a bounded LRU so timestamp lookups for
/// recently-seen blocks cost nothing.
pub struct RpcGateway {
    rpc: Arc<dyn ChainRpc>,
    policy: RetryPolicy,
    blocks: Mutex<LruCache<u64, BlockInfo>>,
}

impl RpcGateway {
    pub fn new(rpc: Arc<dyn ChainRpc>, policy: RetryPolicy, block_cache_size: usize) -> Self {
        let capacity = NonZeroUsize::new(block_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            rpc,
            policy,
            blocks: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn block_number(&self) -> Result<u64, RpcError> {
        self.with_retry("eth_blockNumber", || self.rpc.block_number())
            .await
    }

    /// Block header, served from cache when possible.
    pub async fn block(&self, number: u64) -> Result<Option<BlockInfo>, RpcError> {
        if let Some(info) = self.blocks.lock().get(&number) {
            return Ok(Some(*info));
        }

        let block = self
            .with_retry("eth_getBlockByNumber", || self.rpc.block(number))
            .await?;

        if let Some(info) = block {
            self.blocks.lock().put(number, info);
        }
        Ok(block)
    }

    pub async fn logs(&self, query: &LogQuery) -> Result<Vec<RawLog>, RpcError> {
        self.with_retry("eth_getLogs", || self.rpc.logs(query)).await
    }

    /// Batched reads; results are in call order.
    pub async fn batch_call(&self, calls: &[ReadCall]) -> Result<Vec<Bytes>, RpcError> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }
        self.with_retry("batch_call", || self.rpc.batch_call(calls))
            .await
    }

    /// Number of cached block headers.
    pub fn cached_blocks(&self) -> usize {
        self.blocks.lock().len()
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, RpcError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let attempts = self.policy.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.policy.delay_for(attempt - 1);
                debug!(
                    op = op,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying rpc call after delay"
                );
                tokio::time::sleep(delay).await;
            }

            let started = Instant::now();
            let result = match tokio::time::timeout(self.policy.attempt_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(RpcError::Timeout {
                    op,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                }),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_fatal() => {
                    warn!(op = op, error = %e, "Fatal rpc error, not retrying");
                    return Err(e);
                }
                Err(e) => {
                    debug!(op = op, attempt = attempt + 1, error = %e, "Transient rpc error");
                    last_error = Some(e);
                }
            }
        }

        let err = last_error.unwrap_or_else(|| RpcError::transient(op, "no attempts made"));
        warn!(op = op, attempts = attempts, error = %err, "Rpc retries exhausted");
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRpc;
    use std::time::Duration;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(2),
            factor: 2.0,
            max_delay: Duration::from_millis(10),
            jitter: 0.2,
            attempt_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_always_transient_makes_exactly_max_attempts() {
        let mock = Arc::new(MockRpc::new(100));
        mock.fail_logs_always(RpcError::transient("eth_getLogs", "429"));
        let policy = fast_policy(4);
        let bound = policy.max_total_backoff() + Duration::from_millis(500);
        let gateway = RpcGateway::new(mock.clone(), policy, 16);

        let query = LogQuery {
            addresses: vec![],
            topics: vec![],
            from_block: 0,
            to_block: 10,
        };

        let started = Instant::now();
        let err = gateway.logs(&query).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(mock.log_calls(), 4);
        assert!(started.elapsed() <= bound);
    }

    #[tokio::test]
    async fn test_fatal_is_not_retried() {
        let mock = Arc::new(MockRpc::new(100));
        mock.fail_logs_always(RpcError::fatal("eth_getLogs", "payload too large"));
        let gateway = RpcGateway::new(mock.clone(), fast_policy(5), 16);

        let query = LogQuery {
            addresses: vec![],
            topics: vec![],
            from_block: 0,
            to_block: 10,
        };
        let err = gateway.logs(&query).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(mock.log_calls(), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let mock = Arc::new(MockRpc::new(100));
        mock.fail_next_logs(2, RpcError::transient("eth_getLogs", "503"));
        let gateway = RpcGateway::new(mock.clone(), fast_policy(5), 16);

        let query = LogQuery {
            addresses: vec![],
            topics: vec![],
            from_block: 0,
            to_block: 10,
        };
        assert!(gateway.logs(&query).await.is_ok());
        assert_eq!(mock.log_calls(), 3);
    }

    #[tokio::test]
    async fn test_slow_node_times_out_as_transient() {
        let mock = Arc::new(MockRpc::new(100));
        mock.set_latency(Duration::from_millis(500));
        let policy = RetryPolicy {
            attempt_timeout: Duration::from_millis(20),
            ..fast_policy(2)
        };
        let gateway = RpcGateway::new(mock.clone(), policy, 16);

        let err = gateway.block_number().await.unwrap_err();
        assert!(matches!(err, RpcError::Timeout { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_block_cache_hit() {
        let mock = Arc::new(MockRpc::new(100));
        let gateway = RpcGateway::new(mock.clone(), fast_policy(3), 2);

        let first = gateway.block(42).await.unwrap().unwrap();
        let second = gateway.block(42).await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(mock.block_calls(), 1);

        // Capacity 2: a third distinct block evicts the oldest
        gateway.block(43).await.unwrap();
        gateway.block(44).await.unwrap();
        assert_eq!(gateway.cached_blocks(), 2);
        gateway.block(42).await.unwrap();
        assert_eq!(mock.block_calls(), 4);
    }

    #[tokio::test]
    async fn test_missing_block_not_cached() {
        let mock = Arc::new(MockRpc::new(10));
        let gateway = RpcGateway::new(mock.clone(), fast_policy(3), 8);

        assert!(gateway.block(11).await.unwrap().is_none());
        assert_eq!(gateway.cached_blocks(), 0);
    }
}
