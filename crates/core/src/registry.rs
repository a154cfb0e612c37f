//! Watched contract set.
//!
//! Core contracts are seeded from configuration. Positions, minters and
//! bridges are discovered from events and appended, never removed.
//! Discovery only returns candidates; the caller persists them with its
//! window and then publishes them here with [`ContractRegistry::commit`].

use alloy::primitives::{Address, U256};
use alloy::sol_types::SolCall;
use anyhow::{Context, Result};
use dashmap::DashMap;
use indexer_chain::contracts::IBridge;
use indexer_chain::{event_names, ContractType, ReadCall, RpcError, RpcGateway};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::store::Store;
use crate::types::{ContractRecord, RawEvent};

pub struct ContractRegistry {
    store: Arc<dyn Store>,
    gateway: Arc<RpcGateway>,
    cache: DashMap<Address, ContractRecord>,
}

impl ContractRegistry {
    pub fn new(store: Arc<dyn Store>, gateway: Arc<RpcGateway>) -> Self {
        Self {
            store,
            gateway,
            cache: DashMap::new(),
        }
    }

    /// Seed the core contracts. Safe to call on every start.
    pub async fn initialize(&self, core: &[(ContractType, Address)], first_block: u64) -> Result<()> {
        let records: Vec<ContractRecord> = core
            .iter()
            .map(|(kind, address)| ContractRecord::new(*address, *kind, first_block))
            .collect();
        let inserted = self
            .store
            .upsert_contracts(&records)
            .await
            .context("Failed to seed core contracts")?;
        self.reload().await?;
        info!(
            seeded = inserted,
            known = self.cache.len(),
            "Contract registry initialized"
        );
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        for record in self.store.load_contracts().await? {
            self.cache.insert(record.address, record);
        }
        Ok(())
    }

    /// Active contracts, optionally of one type. Reloads from storage when
    /// the cache is empty.
    pub async fn active(&self, kind: Option<ContractType>) -> Result<Vec<ContractRecord>> {
        if self.cache.is_empty() {
            self.reload().await?;
        }
        let mut records: Vec<ContractRecord> = self
            .cache
            .iter()
            .filter(|r| r.active && kind.map_or(true, |k| r.kind == k))
            .map(|r| r.clone())
            .collect();
        records.sort_by_key(|r| (r.first_block, r.address));
        Ok(records)
    }

    pub fn kind_of(&self, address: &Address) -> Option<ContractType> {
        self.cache.get(address).map(|r| r.kind)
    }

    /// Core contract of `kind`, if configured.
    pub fn core(&self, kind: ContractType) -> Option<Address> {
        self.cache
            .iter()
            .find(|r| r.kind == kind)
            .map(|r| r.address)
    }

    /// Address to type for every known contract.
    pub fn snapshot(&self) -> HashMap<Address, ContractType> {
        self.cache.iter().map(|r| (r.address, r.kind)).collect()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Publish records that are now durable.
    pub fn commit(&self, records: &[ContractRecord]) {
        for record in records {
            self.cache
                .entry(record.address)
                .or_insert_with(|| record.clone());
        }
    }

    /// New contracts announced by `events`.
    ///
    /// `PositionOpened` on the minting hub yields a position;
    /// `MinterApplied` on the token yields a minter or bridge, decided by
    /// probing `horizon()`.
    #[instrument(skip(self, events), fields(events = events.len()))]
    pub async fn discover(&self, events: &[RawEvent]) -> Result<Vec<ContractRecord>> {
        let mut seen = HashSet::new();
        let mut found = Vec::new();

        for event in events {
            let (address, is_minter) = match (event.contract_kind, event.name.as_str()) {
                (ContractType::CoreMintingHub, event_names::POSITION_OPENED) => {
                    match event.arg_address("position") {
                        Some(position) => (position, false),
                        None => continue,
                    }
                }
                (ContractType::CoreToken, event_names::MINTER_APPLIED) => {
                    match event.arg_address("minter") {
                        Some(minter) => (minter, true),
                        None => continue,
                    }
                }
                _ => continue,
            };

            if self.cache.contains_key(&address) || !seen.insert(address) {
                continue;
            }

            let record = if is_minter {
                let kind = self.classify_minter(address).await?;
                ContractRecord::new(address, kind, event.block_number).with_metadata(json!({
                    "applicationPeriod": event.args.get("applicationPeriod"),
                    "applicationFee": event.args.get("applicationFee"),
                    "message": event.args.get("message"),
                }))
            } else {
                ContractRecord::new(address, ContractType::Position, event.block_number)
                    .with_metadata(json!({
                        "owner": event.args.get("owner"),
                        "original": event.args.get("original"),
                        "collateral": event.args.get("collateral"),
                    }))
            };

            debug!(address = %address, kind = %record.kind, block = record.first_block, "Discovered contract");
            found.push(record);
        }

        if !found.is_empty() {
            info!(discovered = found.len(), "New contracts discovered");
        }
        Ok(found)
    }

    /// Bridge if `horizon()` answers, generic minter if it reverts.
    async fn classify_minter(&self, minter: Address) -> Result<ContractType> {
        let probe = ReadCall::new(minter, &IBridge::horizonCall {});
        match self.gateway.batch_call(&[probe]).await {
            Ok(results) => {
                let is_bridge = results
                    .first()
                    .and_then(|data| IBridge::horizonCall::abi_decode_returns(data, true).ok())
                    .is_some_and(|r| r._0 > U256::ZERO);
                Ok(if is_bridge {
                    ContractType::Bridge
                } else {
                    ContractType::Minter
                })
            }
            Err(RpcError::Fatal { .. }) => Ok(ContractType::Minter),
            Err(e) => Err(e).with_context(|| format!("Failed to probe minter {}", minter)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use alloy::primitives::{Bytes, B256};
    use alloy::sol_types::SolValue;
    use indexer_chain::mock::MockRpc;
    use indexer_chain::RetryPolicy;
    use std::time::Duration;

    const TOKEN: Address = Address::repeat_byte(0xA0);
    const HUB: Address = Address::repeat_byte(0xA1);
    const BRIDGE: Address = Address::repeat_byte(0xB0);
    const MINTER: Address = Address::repeat_byte(0xB1);

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            ..Default::default()
        }
    }

    fn setup() -> (Arc<MockRpc>, Arc<MemoryStore>, ContractRegistry) {
        let rpc = Arc::new(MockRpc::new(1_000));
        rpc.set_call_handler(|call| {
            if call.target == BRIDGE {
                Ok(Bytes::from(U256::from(1_900_000_000u64).abi_encode()))
            } else {
                Err(RpcError::fatal("batch_call", "execution reverted"))
            }
        });
        let gateway = Arc::new(RpcGateway::new(rpc.clone(), fast_policy(), 16));
        let store = Arc::new(MemoryStore::new());
        let registry = ContractRegistry::new(store.clone(), gateway);
        (rpc, store, registry)
    }

    fn event(contract_kind: ContractType, name: &str, args: serde_json::Value, block: u64) -> RawEvent {
        RawEvent {
            tx_hash: B256::left_padding_from(&block.to_be_bytes()),
            log_index: 0,
            block_number: block,
            block_timestamp: 0,
            contract: if contract_kind == ContractType::CoreToken { TOKEN } else { HUB },
            contract_kind,
            name: name.to_string(),
            args,
            alerted: false,
        }
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let (_, store, registry) = setup();
        let core = [(ContractType::CoreToken, TOKEN), (ContractType::CoreMintingHub, HUB)];
        registry.initialize(&core, 100).await.unwrap();
        registry.initialize(&core, 100).await.unwrap();

        assert_eq!(store.load_contracts().await.unwrap().len(), 2);
        assert_eq!(registry.kind_of(&HUB), Some(ContractType::CoreMintingHub));
        assert_eq!(registry.core(ContractType::CoreToken), Some(TOKEN));
        assert_eq!(registry.active(Some(ContractType::CoreToken)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_active_reloads_from_store() {
        let (rpc, store, _) = setup();
        store
            .upsert_contracts(&[ContractRecord::new(HUB, ContractType::CoreMintingHub, 1)])
            .await
            .unwrap();
        let gateway = Arc::new(RpcGateway::new(rpc, fast_policy(), 16));
        let fresh = ContractRegistry::new(store, gateway);
        assert!(fresh.is_empty());
        assert_eq!(fresh.active(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_discover_positions_and_minters() {
        let (_, _, registry) = setup();
        registry
            .initialize(&[(ContractType::CoreToken, TOKEN), (ContractType::CoreMintingHub, HUB)], 1)
            .await
            .unwrap();

        let position = Address::repeat_byte(0xC0);
        let events = vec![
            event(
                ContractType::CoreMintingHub,
                event_names::POSITION_OPENED,
                json!({ "owner": "0x0101010101010101010101010101010101010101", "position": normalize(&position) }),
                10,
            ),
            // Duplicate announcement in the same batch
            event(
                ContractType::CoreMintingHub,
                event_names::POSITION_OPENED,
                json!({ "position": normalize(&position) }),
                11,
            ),
            event(
                ContractType::CoreToken,
                event_names::MINTER_APPLIED,
                json!({ "minter": normalize(&BRIDGE), "applicationPeriod": 86400 }),
                12,
            ),
            event(
                ContractType::CoreToken,
                event_names::MINTER_APPLIED,
                json!({ "minter": normalize(&MINTER), "message": "hi" }),
                13,
            ),
            // Wrong emitter for the event name
            event(
                ContractType::CoreToken,
                event_names::POSITION_OPENED,
                json!({ "position": normalize(&Address::repeat_byte(0xEE)) }),
                14,
            ),
        ];

        let found = registry.discover(&events).await.unwrap();
        let kinds: Vec<(Address, ContractType)> = found.iter().map(|r| (r.address, r.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                (position, ContractType::Position),
                (BRIDGE, ContractType::Bridge),
                (MINTER, ContractType::Minter),
            ]
        );
        assert_eq!(found[0].first_block, 10);
        assert_eq!(found[2].metadata["message"], "hi");

        // Not published until committed.
        assert_eq!(registry.kind_of(&position), None);
        registry.commit(&found);
        assert_eq!(registry.kind_of(&position), Some(ContractType::Position));
        assert!(registry.discover(&events).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transient_probe_failure_propagates() {
        let (rpc, _, registry) = setup();
        rpc.fail_calls_always(RpcError::transient("batch_call", "429 Too Many Requests"));
        let events = vec![event(
            ContractType::CoreToken,
            event_names::MINTER_APPLIED,
            json!({ "minter": normalize(&MINTER) }),
            5,
        )];
        assert!(registry.discover(&events).await.is_err());
    }

    fn normalize(address: &Address) -> String {
        indexer_chain::normalize_address(address)
    }
}
