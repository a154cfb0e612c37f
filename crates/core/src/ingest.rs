//! Fetch, decode and timestamp logs for a set of contracts.

use alloy::primitives::Address;
use anyhow::{Context, Result};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use indexer_chain::{
    BatchedEventFetcher, ContractType, EventDecoder, FetchJob, LogQuery, RawLog, RpcGateway,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::types::{ContractRecord, RawEvent};

/// Parallel block header lookups when resolving timestamps.
const TIMESTAMP_CONCURRENCY: usize = 8;

pub struct EventIngestor {
    fetcher: BatchedEventFetcher,
    decoder: EventDecoder,
}

impl EventIngestor {
    pub fn new(fetcher: BatchedEventFetcher, decoder: EventDecoder) -> Self {
        Self { fetcher, decoder }
    }

    pub fn gateway(&self) -> &Arc<RpcGateway> {
        self.fetcher.gateway()
    }

    pub fn decoder(&self) -> &EventDecoder {
        &self.decoder
    }

    /// All events emitted by `contracts` in `[from, to]`, ordered by
    /// (block, log index).
    ///
    /// One fetch job per contract type. Jobs are submitted together and
    /// admitted one at a time by the fetch queue.
    pub async fn collect(
        &self,
        contracts: &[ContractRecord],
        from: u64,
        to: u64,
    ) -> Result<Vec<RawEvent>> {
        let mut groups: BTreeMap<ContractType, Vec<Address>> = BTreeMap::new();
        for contract in contracts.iter().filter(|c| c.active) {
            groups.entry(contract.kind).or_default().push(contract.address);
        }

        let jobs: Vec<FetchJob> = groups
            .iter()
            .filter_map(|(kind, addresses)| {
                let topics = self.decoder.topics(*kind);
                (!topics.is_empty()).then(|| FetchJob {
                    label: kind.to_string(),
                    query: LogQuery {
                        addresses: addresses.clone(),
                        topics,
                        from_block: from,
                        to_block: to,
                    },
                })
            })
            .collect();

        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let outcomes = join_all(jobs.iter().map(|job| self.fetcher.fetch(job))).await;

        let mut logs = Vec::new();
        for (job, outcome) in jobs.iter().zip(outcomes) {
            let outcome = outcome
                .with_context(|| format!("Fetching {} logs for blocks {}-{}", job.label, from, to))?;
            debug!(
                job = %job.label,
                from,
                to,
                logs = outcome.stats.logs,
                chunks = outcome.stats.chunks,
                degraded = outcome.stats.degraded,
                abandoned = outcome.stats.abandoned,
                "Fetch job complete"
            );
            logs.extend(outcome.logs);
        }

        let kinds: HashMap<Address, ContractType> =
            contracts.iter().map(|c| (c.address, c.kind)).collect();
        self.decode(logs, &kinds).await
    }

    /// Decode `logs`, attach block timestamps and drop duplicates.
    pub async fn decode(
        &self,
        logs: Vec<RawLog>,
        kinds: &HashMap<Address, ContractType>,
    ) -> Result<Vec<RawEvent>> {
        let blocks: BTreeSet<u64> = logs.iter().map(|l| l.block_number).collect();
        let timestamps = self.timestamps(blocks).await?;

        let mut seen = HashSet::new();
        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            if !seen.insert((log.tx_hash, log.log_index)) {
                continue;
            }
            let Some(kind) = kinds.get(&log.address).copied() else {
                warn!(address = %log.address, tx = %log.tx_hash, "Log from unregistered contract");
                continue;
            };
            let Some(timestamp) = timestamps.get(&log.block_number).copied() else {
                anyhow::bail!("Missing timestamp for block {}", log.block_number);
            };

            let decoded = self.decoder.decode(kind, &log);
            if decoded.is_unknown() {
                warn!(
                    address = %log.address,
                    kind = %kind,
                    tx = %log.tx_hash,
                    index = log.log_index,
                    "Undecodable log stored as Unknown"
                );
            }

            events.push(RawEvent {
                tx_hash: log.tx_hash,
                log_index: log.log_index,
                block_number: log.block_number,
                block_timestamp: timestamp,
                contract: log.address,
                contract_kind: kind,
                name: decoded.name,
                args: decoded.args,
                alerted: false,
            });
        }

        events.sort_by_key(|e| (e.block_number, e.log_index));
        Ok(events)
    }

    async fn timestamps(&self, blocks: BTreeSet<u64>) -> Result<HashMap<u64, u64>> {
        let gateway = self.gateway();
        let results: Vec<_> = stream::iter(blocks)
            .map(|number| async move { (number, gateway.block(number).await) })
            .buffer_unordered(TIMESTAMP_CONCURRENCY)
            .collect()
            .await;

        let mut timestamps = HashMap::with_capacity(results.len());
        for (number, result) in results {
            match result.with_context(|| format!("Fetching header of block {}", number))? {
                Some(block) => {
                    timestamps.insert(number, block.timestamp);
                }
                None => anyhow::bail!("Block {} not found", number),
            }
        }
        Ok(timestamps)
    }
}
