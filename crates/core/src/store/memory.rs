//! In-memory `Store`.
//!
//! One lock guards all tables, so a window commit is atomic with respect
//! to readers. Commits can be made to fail for exercising rollback paths.

use alloy::primitives::Address;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use super::{ChallengeFilter, EventFilter, MinterFilter, PositionFilter, Store};
use crate::state::{
    ChallengeState, CollateralState, MinterState, PositionState, SkippedBlock, SystemState,
};
use crate::types::{CommitSummary, ContractRecord, EventKey, RawEvent, WindowBatch};

#[derive(Default)]
struct Tables {
    checkpoint: Option<u64>,
    contracts: BTreeMap<Address, ContractRecord>,
    events: HashMap<EventKey, RawEvent>,
    positions: BTreeMap<Address, PositionState>,
    challenges: BTreeMap<u64, ChallengeState>,
    minters: BTreeMap<Address, MinterState>,
    collaterals: BTreeMap<Address, CollateralState>,
    system: Option<SystemState>,
    skipped: Vec<SkippedBlock>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    fail_commits: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `commit_window` fail until cleared.
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub fn event_count(&self) -> usize {
        self.tables.read().events.len()
    }
}

fn insert_contracts(tables: &mut Tables, records: &[ContractRecord]) -> usize {
    let mut inserted = 0;
    for record in records {
        if !tables.contracts.contains_key(&record.address) {
            tables.contracts.insert(record.address, record.clone());
            inserted += 1;
        }
    }
    inserted
}

fn sorted_events<'a>(events: impl Iterator<Item = &'a RawEvent>) -> Vec<RawEvent> {
    let mut out: Vec<RawEvent> = events.cloned().collect();
    out.sort_by_key(|e| (e.block_number, e.log_index));
    out
}

#[async_trait]
impl Store for MemoryStore {
    async fn checkpoint(&self) -> Result<Option<u64>> {
        Ok(self.tables.read().checkpoint)
    }

    async fn load_contracts(&self) -> Result<Vec<ContractRecord>> {
        let mut contracts: Vec<ContractRecord> =
            self.tables.read().contracts.values().cloned().collect();
        contracts.sort_by_key(|c| (c.first_block, c.address));
        Ok(contracts)
    }

    async fn upsert_contracts(&self, records: &[ContractRecord]) -> Result<usize> {
        Ok(insert_contracts(&mut self.tables.write(), records))
    }

    async fn commit_window(&self, batch: &WindowBatch) -> Result<CommitSummary> {
        if self.fail_commits.load(Ordering::SeqCst) {
            anyhow::bail!("Simulated commit failure for blocks {}-{}", batch.from_block, batch.to_block);
        }

        let mut tables = self.tables.write();

        let mut events_inserted = 0;
        for event in &batch.events {
            if let std::collections::hash_map::Entry::Vacant(slot) = tables.events.entry(event.key()) {
                slot.insert(event.clone());
                events_inserted += 1;
            }
        }

        let contracts_inserted = insert_contracts(&mut tables, &batch.contracts);

        for position in &batch.positions {
            tables.positions.insert(position.address, position.clone());
        }
        for challenge in &batch.challenges {
            tables.challenges.insert(challenge.number, challenge.clone());
        }
        for minter in &batch.minters {
            tables.minters.insert(minter.address, minter.clone());
        }
        if !batch.collaterals.is_empty() {
            tables.collaterals = batch
                .collaterals
                .iter()
                .map(|c| (c.token, c.clone()))
                .collect();
        }
        if let Some(system) = &batch.system {
            tables.system = Some(system.clone());
        }
        if let Some(skipped) = &batch.skipped {
            tables.skipped.push(skipped.clone());
        }

        let checkpoint = tables
            .checkpoint
            .map_or(batch.to_block, |cp| cp.max(batch.to_block));
        tables.checkpoint = Some(checkpoint);

        Ok(CommitSummary {
            events_inserted,
            contracts_inserted,
            checkpoint,
        })
    }

    async fn events(&self, filter: &EventFilter) -> Result<Vec<RawEvent>> {
        let tables = self.tables.read();
        let mut events = sorted_events(tables.events.values().filter(|e| filter.matches(e)));
        if let Some(limit) = filter.limit {
            events.truncate(limit);
        }
        Ok(events)
    }

    async fn positions(&self, filter: &PositionFilter) -> Result<Vec<PositionState>> {
        Ok(self
            .tables
            .read()
            .positions
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect())
    }

    async fn challenges(&self, filter: &ChallengeFilter) -> Result<Vec<ChallengeState>> {
        Ok(self
            .tables
            .read()
            .challenges
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect())
    }

    async fn minters(&self, filter: &MinterFilter) -> Result<Vec<MinterState>> {
        Ok(self
            .tables
            .read()
            .minters
            .values()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect())
    }

    async fn collaterals(&self) -> Result<Vec<CollateralState>> {
        Ok(self.tables.read().collaterals.values().cloned().collect())
    }

    async fn system_state(&self) -> Result<Option<SystemState>> {
        Ok(self.tables.read().system.clone())
    }

    async fn unalerted_events(&self, limit: usize) -> Result<Vec<RawEvent>> {
        let tables = self.tables.read();
        let mut events = sorted_events(tables.events.values().filter(|e| !e.alerted));
        events.truncate(limit);
        Ok(events)
    }

    async fn mark_alerted(&self, keys: &[EventKey]) -> Result<usize> {
        let mut tables = self.tables.write();
        let mut marked = 0;
        for key in keys {
            if let Some(event) = tables.events.get_mut(key) {
                if !event.alerted {
                    event.alerted = true;
                    marked += 1;
                }
            }
        }
        Ok(marked)
    }

    async fn skipped_blocks(&self) -> Result<Vec<SkippedBlock>> {
        Ok(self.tables.read().skipped.clone())
    }
}
