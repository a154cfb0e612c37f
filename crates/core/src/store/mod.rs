//! Persistence for events, snapshots, the contract registry and the checkpoint.
//!
//! This module provides:
//! - The `Store` trait, the only way the engine and readers touch storage
//! - Filter structs for the query side
//! - `SqliteStore` (sqlx, embedded migrations)
//! - `MemoryStore` for tests and dry runs
//!
//! `commit_window` is the single write path for ingested data. It applies a
//! `WindowBatch` atomically and advances the checkpoint to the window's last
//! block in the same transaction; the checkpoint never moves backwards.

use alloy::primitives::Address;
use anyhow::Result;
use async_trait::async_trait;
use indexer_chain::ContractType;

use crate::state::{
    ChallengeState, ChallengeStatus, CollateralState, MinterKind, MinterState, MinterStatus,
    PositionState, PositionStatus, SkippedBlock, SystemState,
};
use crate::types::{CommitSummary, ContractRecord, EventKey, RawEvent, WindowBatch};

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Raw event query. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub contract: Option<Address>,
    pub kind: Option<ContractType>,
    pub name: Option<String>,
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    pub from_timestamp: Option<u64>,
    pub to_timestamp: Option<u64>,
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Events from `block` on. `None` matches every block.
    pub fn starting_at(block: Option<u64>) -> Self {
        Self {
            from_block: block,
            ..Default::default()
        }
    }

    pub fn since(mut self, timestamp: u64) -> Self {
        self.from_timestamp = Some(timestamp);
        self
    }

    pub fn matches(&self, event: &RawEvent) -> bool {
        self.contract.map_or(true, |c| c == event.contract)
            && self.kind.map_or(true, |k| k == event.contract_kind)
            && self.name.as_deref().map_or(true, |n| n == event.name)
            && self.from_block.map_or(true, |b| event.block_number >= b)
            && self.to_block.map_or(true, |b| event.block_number <= b)
            && self.from_timestamp.map_or(true, |t| event.block_timestamp >= t)
            && self.to_timestamp.map_or(true, |t| event.block_timestamp <= t)
    }
}

/// Snapshot query by `updated_block` range. Shared by the entity filters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockRange {
    pub from: Option<u64>,
    pub to: Option<u64>,
}

impl BlockRange {
    pub fn contains(&self, block: u64) -> bool {
        self.from.map_or(true, |f| block >= f) && self.to.map_or(true, |t| block <= t)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PositionFilter {
    pub address: Option<Address>,
    pub owner: Option<Address>,
    pub collateral: Option<Address>,
    pub status: Option<PositionStatus>,
    pub updated: BlockRange,
    /// Skip closed positions
    pub active_only: bool,
}

impl PositionFilter {
    pub fn active() -> Self {
        Self {
            active_only: true,
            ..Default::default()
        }
    }

    pub fn by_address(address: Address) -> Self {
        Self {
            address: Some(address),
            ..Default::default()
        }
    }

    pub fn matches(&self, position: &PositionState) -> bool {
        self.address.map_or(true, |a| a == position.address)
            && self.owner.map_or(true, |o| o == position.owner)
            && self.collateral.map_or(true, |c| c == position.collateral)
            && self.status.map_or(true, |s| s == position.status)
            && self.updated.contains(position.updated_block)
            && !(self.active_only && position.closed)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChallengeFilter {
    pub number: Option<u64>,
    pub position: Option<Address>,
    pub challenger: Option<Address>,
    pub status: Option<ChallengeStatus>,
    pub updated: BlockRange,
    /// Skip succeeded and ended challenges
    pub active_only: bool,
}

impl ChallengeFilter {
    pub fn active() -> Self {
        Self {
            active_only: true,
            ..Default::default()
        }
    }

    pub fn by_number(number: u64) -> Self {
        Self {
            number: Some(number),
            ..Default::default()
        }
    }

    pub fn matches(&self, challenge: &ChallengeState) -> bool {
        self.number.map_or(true, |n| n == challenge.number)
            && self.position.map_or(true, |p| p == challenge.position)
            && self.challenger.map_or(true, |c| c == challenge.challenger)
            && self.status.map_or(true, |s| s == challenge.status)
            && self.updated.contains(challenge.updated_block)
            && !(self.active_only && challenge.status.is_terminal())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MinterFilter {
    pub address: Option<Address>,
    pub kind: Option<MinterKind>,
    pub status: Option<MinterStatus>,
    pub updated: BlockRange,
}

impl MinterFilter {
    pub fn by_address(address: Address) -> Self {
        Self {
            address: Some(address),
            ..Default::default()
        }
    }

    pub fn matches(&self, minter: &MinterState) -> bool {
        self.address.map_or(true, |a| a == minter.address)
            && self.kind.map_or(true, |k| k == minter.kind)
            && self.status.map_or(true, |s| s == minter.status)
            && self.updated.contains(minter.updated_block)
    }
}

/// Storage backend.
#[async_trait]
pub trait Store: Send + Sync {
    /// Last fully committed block, `None` before the first window.
    async fn checkpoint(&self) -> Result<Option<u64>>;

    async fn load_contracts(&self) -> Result<Vec<ContractRecord>>;

    /// Insert contracts not already known. Returns the number inserted.
    async fn upsert_contracts(&self, records: &[ContractRecord]) -> Result<usize>;

    /// Apply a window atomically and advance the checkpoint.
    async fn commit_window(&self, batch: &WindowBatch) -> Result<CommitSummary>;

    /// Events ordered by (block, log index).
    async fn events(&self, filter: &EventFilter) -> Result<Vec<RawEvent>>;

    async fn positions(&self, filter: &PositionFilter) -> Result<Vec<PositionState>>;

    async fn challenges(&self, filter: &ChallengeFilter) -> Result<Vec<ChallengeState>>;

    async fn minters(&self, filter: &MinterFilter) -> Result<Vec<MinterState>>;

    async fn collaterals(&self) -> Result<Vec<CollateralState>>;

    async fn system_state(&self) -> Result<Option<SystemState>>;

    /// Oldest events not yet acknowledged by a notifier.
    async fn unalerted_events(&self, limit: usize) -> Result<Vec<RawEvent>>;

    /// Acknowledge events. Returns the number newly marked.
    async fn mark_alerted(&self, keys: &[EventKey]) -> Result<usize>;

    async fn skipped_blocks(&self) -> Result<Vec<SkippedBlock>>;
}
