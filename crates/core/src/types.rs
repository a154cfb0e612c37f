//! Records shared by the registry, ingestion, reconstruction and storage.

use alloy::primitives::{Address, B256, I256, U256};
use indexer_chain::ContractType;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::{
    ChallengeState, CollateralState, MinterState, PositionState, SkippedBlock, SystemState,
};
use crate::u256_math::parse_u256;

/// A watched contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractRecord {
    pub address: Address,
    pub kind: ContractType,
    /// Block the contract was first observed in
    pub first_block: u64,
    /// Free-form data taken from the discovering event
    pub metadata: Value,
    pub active: bool,
}

impl ContractRecord {
    pub fn new(address: Address, kind: ContractType, first_block: u64) -> Self {
        Self {
            address,
            kind,
            first_block,
            metadata: Value::Object(Default::default()),
            active: true,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Idempotency key of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventKey {
    pub tx_hash: B256,
    pub log_index: u64,
}

/// A decoded, normalized log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub tx_hash: B256,
    pub log_index: u64,
    pub block_number: u64,
    pub block_timestamp: u64,
    pub contract: Address,
    pub contract_kind: ContractType,
    pub name: String,
    pub args: Value,
    /// Acknowledged by a notifier
    #[serde(default)]
    pub alerted: bool,
}

impl RawEvent {
    pub fn key(&self) -> EventKey {
        EventKey {
            tx_hash: self.tx_hash,
            log_index: self.log_index,
        }
    }

    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }

    pub fn arg_address(&self, name: &str) -> Option<Address> {
        self.args.get(name)?.as_str()?.parse().ok()
    }

    pub fn arg_u256(&self, name: &str) -> Option<U256> {
        match self.args.get(name)? {
            Value::Number(n) => n.as_u64().map(U256::from),
            Value::String(s) => parse_u256(s),
            _ => None,
        }
    }

    pub fn arg_u64(&self, name: &str) -> Option<u64> {
        self.arg_u256(name).and_then(|v| u64::try_from(v).ok())
    }

    pub fn arg_i256(&self, name: &str) -> Option<I256> {
        match self.args.get(name)? {
            Value::Number(n) => n.as_i64().map(I256::try_from).and_then(Result::ok),
            Value::String(s) => I256::from_dec_str(s).ok(),
            _ => None,
        }
    }

    pub fn arg_str(&self, name: &str) -> Option<&str> {
        self.args.get(name)?.as_str()
    }
}

/// Everything one block window commits atomically.
#[derive(Debug, Clone, Default)]
pub struct WindowBatch {
    pub from_block: u64,
    pub to_block: u64,
    pub events: Vec<RawEvent>,
    pub contracts: Vec<ContractRecord>,
    pub positions: Vec<PositionState>,
    pub challenges: Vec<ChallengeState>,
    pub minters: Vec<MinterState>,
    /// Replaces the whole collateral table when non-empty
    pub collaterals: Vec<CollateralState>,
    pub system: Option<SystemState>,
    pub skipped: Option<SkippedBlock>,
}

impl WindowBatch {
    pub fn new(from_block: u64, to_block: u64) -> Self {
        Self {
            from_block,
            to_block,
            ..Default::default()
        }
    }

    /// Empty window recording that `block` was given up on.
    pub fn skip(block: u64, reason: impl Into<String>, skipped_at: u64) -> Self {
        Self {
            skipped: Some(SkippedBlock {
                block_number: block,
                reason: reason.into(),
                skipped_at,
            }),
            ..Self::new(block, block)
        }
    }
}

/// Result of a committed window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    /// Events newly inserted (duplicates excluded)
    pub events_inserted: usize,
    pub contracts_inserted: usize,
    pub checkpoint: u64,
}
