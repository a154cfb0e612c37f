//! In-memory node for tests.
//!
//! Serves logs from a fixed list, synthesizes block headers with a 12s block
//! time, answers reads through a pluggable handler and can be scripted to
//! fail or stall.

use alloy::primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::RpcError;
use crate::rpc::{BlockInfo, ChainRpc, LogQuery, RawLog, ReadCall};

/// Seconds between synthetic blocks.
pub const BLOCK_TIME: u64 = 12;

type CallHandler = Box<dyn Fn(&ReadCall) -> Result<Bytes, RpcError> + Send + Sync>;

#[derive(Default)]
struct Failures {
    logs_always: Option<RpcError>,
    logs_next: VecDeque<RpcError>,
    logs_at_block: Vec<(u64, RpcError)>,
    calls_always: Option<RpcError>,
}

/// Scriptable `ChainRpc`.
pub struct MockRpc {
    head: AtomicU64,
    genesis_timestamp: u64,
    logs: Mutex<Vec<RawLog>>,
    queries: Mutex<Vec<LogQuery>>,
    call_handler: RwLock<CallHandler>,
    failures: Mutex<Failures>,
    latency: Mutex<Option<Duration>>,
    block_number_calls: AtomicUsize,
    block_calls: AtomicUsize,
    log_calls: AtomicUsize,
    batch_calls: AtomicUsize,
}

impl MockRpc {
    pub fn new(head: u64) -> Self {
        Self {
            head: AtomicU64::new(head),
            genesis_timestamp: 1_700_000_000,
            logs: Mutex::new(Vec::new()),
            queries: Mutex::new(Vec::new()),
            call_handler: RwLock::new(Box::new(|_| Ok(Bytes::from(vec![0u8; 32])))),
            failures: Mutex::new(Failures::default()),
            latency: Mutex::new(None),
            block_number_calls: AtomicUsize::new(0),
            block_calls: AtomicUsize::new(0),
            log_calls: AtomicUsize::new(0),
            batch_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    /// Timestamp the mock reports for `block`.
    pub fn timestamp_of(&self, block: u64) -> u64 {
        self.genesis_timestamp + block * BLOCK_TIME
    }

    /// Block whose timestamp is the latest one not after `timestamp`.
    pub fn block_at(&self, timestamp: u64) -> u64 {
        timestamp.saturating_sub(self.genesis_timestamp) / BLOCK_TIME
    }

    pub fn push_log(&self, log: RawLog) {
        self.logs.lock().push(log);
    }

    pub fn push_logs(&self, logs: impl IntoIterator<Item = RawLog>) {
        self.logs.lock().extend(logs);
    }

    pub fn set_call_handler<F>(&self, handler: F)
    where
        F: Fn(&ReadCall) -> Result<Bytes, RpcError> + Send + Sync + 'static,
    {
        *self.call_handler.write() = Box::new(handler);
    }

    pub fn fail_logs_always(&self, err: RpcError) {
        self.failures.lock().logs_always = Some(err);
    }

    pub fn fail_next_logs(&self, count: usize, err: RpcError) {
        let mut failures = self.failures.lock();
        for _ in 0..count {
            failures.logs_next.push_back(err.clone());
        }
    }

    /// Fail every log query whose range covers `block`.
    pub fn fail_logs_at_block(&self, block: u64, err: RpcError) {
        self.failures.lock().logs_at_block.push((block, err));
    }

    pub fn fail_calls_always(&self, err: RpcError) {
        self.failures.lock().calls_always = Some(err);
    }

    pub fn clear_failures(&self) {
        *self.failures.lock() = Failures::default();
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    pub fn block_number_calls(&self) -> usize {
        self.block_number_calls.load(Ordering::SeqCst)
    }

    pub fn block_calls(&self) -> usize {
        self.block_calls.load(Ordering::SeqCst)
    }

    pub fn log_calls(&self) -> usize {
        self.log_calls.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    /// Every log query received, in arrival order.
    pub fn log_queries(&self) -> Vec<LogQuery> {
        self.queries.lock().clone()
    }

    async fn stall(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn log_failure(&self, query: &LogQuery) -> Option<RpcError> {
        let mut failures = self.failures.lock();
        if let Some(err) = &failures.logs_always {
            return Some(err.clone());
        }
        if let Some(err) = failures.logs_next.pop_front() {
            return Some(err);
        }
        failures
            .logs_at_block
            .iter()
            .find(|(block, _)| (query.from_block..=query.to_block).contains(block))
            .map(|(_, err)| err.clone())
    }
}

#[async_trait]
impl ChainRpc for MockRpc {
    async fn block_number(&self) -> Result<u64, RpcError> {
        self.block_number_calls.fetch_add(1, Ordering::SeqCst);
        self.stall().await;
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn block(&self, number: u64) -> Result<Option<BlockInfo>, RpcError> {
        self.block_calls.fetch_add(1, Ordering::SeqCst);
        self.stall().await;
        if number > self.head.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(BlockInfo {
            number,
            hash: B256::left_padding_from(&number.to_be_bytes()),
            timestamp: self.timestamp_of(number),
        }))
    }

    async fn logs(&self, query: &LogQuery) -> Result<Vec<RawLog>, RpcError> {
        self.log_calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().push(query.clone());
        self.stall().await;

        if let Some(err) = self.log_failure(query) {
            return Err(err);
        }

        Ok(self
            .logs
            .lock()
            .iter()
            .filter(|log| query.matches(log))
            .cloned()
            .collect())
    }

    async fn batch_call(&self, calls: &[ReadCall]) -> Result<Vec<Bytes>, RpcError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.stall().await;

        if let Some(err) = &self.failures.lock().calls_always {
            return Err(err.clone());
        }

        let handler = self.call_handler.read();
        calls.iter().map(|call| handler(call)).collect()
    }
}

/// Build a log with a transaction hash derived from its position.
pub fn raw_log(address: Address, topics: Vec<B256>, data: Bytes, block: u64, index: u64) -> RawLog {
    let mut tx = [0u8; 32];
    tx[..8].copy_from_slice(&block.to_be_bytes());
    tx[24..].copy_from_slice(&index.to_be_bytes());
    RawLog {
        address,
        topics,
        data,
        block_number: block,
        tx_hash: B256::from(tx),
        log_index: index,
    }
}
