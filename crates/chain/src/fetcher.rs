//! Chunked, wave-parallel log fetching.
//!
//! A fetch job covers one address group and one OR-set of topics over a
//! block range. The range is split into fixed-size chunks, and chunks are
//! requested in parallel waves of up to `concurrency` queries:
//! - a chunk whose retries are exhausted degrades to an empty result
//! - a wave in which every chunk failed is retried with half the concurrency
//! - after `max_wave_retries` halvings without a successful chunk, failing
//!   waves are abandoned
//! - a fatal error aborts the whole job
//!
//! Jobs are admitted one at a time through a shared [`FetchQueue`], which
//! bounds the total burst the pipeline puts on the node.

use futures::future::join_all;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::error::RpcError;
use crate::gateway::RpcGateway;
use crate::rpc::{LogQuery, RawLog};

/// Admission queue allowing a single fetch job at a time.
#[derive(Debug, Clone)]
pub struct FetchQueue {
    permits: Arc<Semaphore>,
}

impl FetchQueue {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(1)),
        }
    }
}

impl Default for FetchQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Fetcher tuning.
#[derive(Debug, Clone)]
pub struct FetcherSettings {
    /// Blocks per log query
    pub chunk_size: u64,
    /// Initial parallel queries per wave
    pub concurrency: usize,
    /// Halvings allowed before a failing wave is abandoned
    pub max_wave_retries: u32,
}

impl Default for FetcherSettings {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            concurrency: 30,
            max_wave_retries: 3,
        }
    }
}

/// One (address group, event set, range) request.
#[derive(Debug, Clone)]
pub struct FetchJob {
    /// Label for logs, usually the contract type
    pub label: String,
    pub query: LogQuery,
}

/// Counters for one job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchStats {
    pub chunks: usize,
    pub degraded: usize,
    pub abandoned: usize,
    pub waves: usize,
    pub logs: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub logs: Vec<RawLog>,
    pub stats: FetchStats,
}

/// Batched event fetcher.
pub struct BatchedEventFetcher {
    gateway: Arc<RpcGateway>,
    settings: FetcherSettings,
    queue: FetchQueue,
}

impl BatchedEventFetcher {
    pub fn new(gateway: Arc<RpcGateway>, settings: FetcherSettings) -> Self {
        Self::with_queue(gateway, settings, FetchQueue::new())
    }

    /// Share an admission queue with other fetchers.
    pub fn with_queue(gateway: Arc<RpcGateway>, settings: FetcherSettings, queue: FetchQueue) -> Self {
        Self {
            gateway,
            settings,
            queue,
        }
    }

    pub fn gateway(&self) -> &Arc<RpcGateway> {
        &self.gateway
    }

    pub fn settings(&self) -> &FetcherSettings {
        &self.settings
    }

    /// Fetch every log for `job`.
    ///
    /// Only fatal errors are returned; transient trouble shows up as
    /// degraded or abandoned chunks in the stats.
    pub async fn fetch(&self, job: &FetchJob) -> Result<FetchOutcome, RpcError> {
        let query = &job.query;
        if query.from_block > query.to_block {
            return Ok(FetchOutcome::default());
        }

        let _permit = self
            .queue
            .permits
            .acquire()
            .await
            .map_err(|_| RpcError::fatal("eth_getLogs", "fetch queue closed"))?;

        let mut pending: VecDeque<(u64, u64)> =
            chunk_ranges(query.from_block, query.to_block, self.settings.chunk_size).into();
        let mut stats = FetchStats {
            chunks: pending.len(),
            ..Default::default()
        };
        let mut logs = Vec::new();
        let mut concurrency = self.settings.concurrency.max(1);
        let mut wave_retries = 0u32;

        debug!(
            job = %job.label,
            from = query.from_block,
            to = query.to_block,
            chunks = stats.chunks,
            "Starting fetch job"
        );

        while !pending.is_empty() {
            let take = concurrency.min(pending.len());
            let wave: Vec<(u64, u64)> = pending.drain(..take).collect();
            stats.waves += 1;

            let results = join_all(wave.iter().map(|&(from, to)| {
                let chunk = query.with_range(from, to);
                async move { self.gateway.logs(&chunk).await }
            }))
            .await;

            let mut failed = Vec::new();
            for (range, result) in wave.iter().zip(results) {
                match result {
                    Ok(chunk_logs) => logs.extend(chunk_logs),
                    Err(e) if e.is_fatal() => {
                        warn!(
                            job = %job.label,
                            from = range.0,
                            to = range.1,
                            error = %e,
                            "Fatal error fetching chunk"
                        );
                        return Err(e);
                    }
                    Err(e) => failed.push((*range, e)),
                }
            }

            if !failed.is_empty() && failed.len() == wave.len() {
                if wave_retries < self.settings.max_wave_retries {
                    wave_retries += 1;
                    concurrency = (concurrency / 2).max(1);
                    warn!(
                        job = %job.label,
                        failed = failed.len(),
                        concurrency = concurrency,
                        retry = wave_retries,
                        "Entire wave failed, halving concurrency"
                    );
                    for (range, _) in failed.into_iter().rev() {
                        pending.push_front(range);
                    }
                    continue;
                }

                stats.abandoned += failed.len();
                for (range, e) in &failed {
                    warn!(
                        job = %job.label,
                        from = range.0,
                        to = range.1,
                        error = %e,
                        "Abandoning chunk after repeated wave failures"
                    );
                }
            } else {
                stats.degraded += failed.len();
                for (range, e) in &failed {
                    warn!(
                        job = %job.label,
                        from = range.0,
                        to = range.1,
                        error = %e,
                        "Chunk failed, continuing with empty result"
                    );
                }
                wave_retries = 0;
            }
        }

        stats.logs = logs.len();
        if stats.degraded > 0 || stats.abandoned > 0 {
            info!(
                job = %job.label,
                logs = stats.logs,
                degraded = stats.degraded,
                abandoned = stats.abandoned,
                "Fetch job finished with gaps"
            );
        } else {
            debug!(job = %job.label, logs = stats.logs, waves = stats.waves, "Fetch job finished");
        }

        Ok(FetchOutcome { logs, stats })
    }
}

/// Split `[from, to]` into consecutive inclusive ranges of `size` blocks.
pub fn chunk_ranges(from: u64, to: u64, size: u64) -> Vec<(u64, u64)> {
    let size = size.max(1);
    let mut ranges = Vec::new();
    let mut start = from;
    while start <= to {
        let end = start.saturating_add(size - 1).min(to);
        ranges.push((start, end));
        if end == u64::MAX {
            break;
        }
        start = end + 1;
    }
    ranges
}
