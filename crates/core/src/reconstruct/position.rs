//! Position snapshots.

use alloy::primitives::Address;
use anyhow::Result;
use indexer_chain::contracts::{IERC20, IPosition};
use indexer_chain::{event_names, ContractType, ReadCall, RpcGateway};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

use super::read_or_keep;
use crate::state::PositionState;
use crate::types::RawEvent;

/// Fold position events into `positions`. Returns every position touched.
pub(super) fn apply_events(
    positions: &mut BTreeMap<Address, PositionState>,
    events: &[RawEvent],
) -> HashSet<Address> {
    let mut touched = HashSet::new();

    for event in events {
        match (event.contract_kind, event.name.as_str()) {
            (ContractType::CoreMintingHub, event_names::POSITION_OPENED) => {
                let Some(address) = event.arg_address("position") else {
                    continue;
                };
                positions.entry(address).or_insert_with(|| {
                    PositionState::opened(
                        address,
                        event.arg_address("owner").unwrap_or_default(),
                        event.arg_address("original").unwrap_or(address),
                        event.arg_address("collateral").unwrap_or_default(),
                        event.block_number,
                    )
                });
                touched.insert(address);
            }
            (ContractType::CoreMintingHub, name)
                if name == event_names::CHALLENGE_STARTED
                    || name == event_names::CHALLENGE_AVERTED
                    || name == event_names::CHALLENGE_SUCCEEDED =>
            {
                if let Some(address) = event.arg_address("position") {
                    touched.insert(address);
                }
            }
            (ContractType::Position, name) => {
                let Some(state) = positions.get_mut(&event.contract) else {
                    debug!(position = %event.contract, event = name, "Event for unknown position");
                    continue;
                };
                match name {
                    event_names::MINTING_UPDATE => {
                        if let Some(collateral) = event.arg_u256("collateral") {
                            state.collateral_balance = collateral;
                        }
                        if let Some(price) = event.arg_u256("price") {
                            state.price = price;
                        }
                        if let Some(principal) = event.arg_u256("principal") {
                            state.principal = principal;
                        }
                    }
                    event_names::POSITION_DENIED => state.denied = true,
                    event_names::OWNERSHIP_TRANSFERRED => {
                        if let Some(owner) = event.arg_address("newOwner") {
                            state.owner = owner;
                        }
                    }
                    _ => {}
                }
                state.updated_block = state.updated_block.max(event.block_number);
                touched.insert(event.contract);
            }
            _ => {}
        }
    }

    touched
}

/// Read the mutable position fields in one batch, plus the collateral
/// balance. Token metadata is read once and tolerated to fail.
pub(super) async fn refresh(gateway: &RpcGateway, state: &mut PositionState) -> Result<()> {
    let p = state.address;
    let mut calls = vec![
        ReadCall::new(p, &IPosition::ownerCall {}),
        ReadCall::new(p, &IPosition::originalCall {}),
        ReadCall::new(p, &IPosition::collateralCall {}),
        ReadCall::new(p, &IPosition::priceCall {}),
        ReadCall::new(p, &IPosition::virtualPriceCall {}),
        ReadCall::new(p, &IPosition::principalCall {}),
        ReadCall::new(p, &IPosition::getInterestCall {}),
        ReadCall::new(p, &IPosition::getDebtCall {}),
        ReadCall::new(p, &IPosition::limitCall {}),
        ReadCall::new(p, &IPosition::availableForMintingCall {}),
        ReadCall::new(p, &IPosition::riskPremiumPPMCall {}),
        ReadCall::new(p, &IPosition::reserveContributionCall {}),
        ReadCall::new(p, &IPosition::fixedAnnualRatePPMCall {}),
        ReadCall::new(p, &IPosition::minimumCollateralCall {}),
        ReadCall::new(p, &IPosition::challengePeriodCall {}),
        ReadCall::new(p, &IPosition::startCall {}),
        ReadCall::new(p, &IPosition::cooldownCall {}),
        ReadCall::new(p, &IPosition::expirationCall {}),
        ReadCall::new(p, &IPosition::lastAccrualCall {}),
        ReadCall::new(p, &IPosition::challengedAmountCall {}),
        ReadCall::new(p, &IPosition::isClosedCall {}),
    ];
    let has_collateral = state.collateral != Address::ZERO;
    if has_collateral {
        calls.push(ReadCall::new(state.collateral, &IERC20::balanceOfCall { account: p }));
    }

    let Some(mut r) = read_or_keep(gateway, &calls, "position").await? else {
        return Ok(());
    };

    state.owner = r.next::<IPosition::ownerCall>()?._0;
    state.original = r.next::<IPosition::originalCall>()?._0;
    let collateral = r.next::<IPosition::collateralCall>()?._0;
    state.price = r.next::<IPosition::priceCall>()?._0;
    state.virtual_price = r.next::<IPosition::virtualPriceCall>()?._0;
    state.principal = r.next::<IPosition::principalCall>()?._0;
    state.interest = r.next::<IPosition::getInterestCall>()?._0;
    state.debt = r.next::<IPosition::getDebtCall>()?._0;
    state.limit = r.next::<IPosition::limitCall>()?._0;
    state.available_for_minting = r.next::<IPosition::availableForMintingCall>()?._0;
    state.risk_premium_ppm = r.next::<IPosition::riskPremiumPPMCall>()?._0.to::<u32>();
    state.reserve_contribution_ppm = r.next::<IPosition::reserveContributionCall>()?._0.to::<u32>();
    state.fixed_annual_rate_ppm = r.next::<IPosition::fixedAnnualRatePPMCall>()?._0.to::<u32>();
    state.minimum_collateral = r.next::<IPosition::minimumCollateralCall>()?._0;
    state.challenge_period = r.next::<IPosition::challengePeriodCall>()?._0.to::<u64>();
    state.start = r.next::<IPosition::startCall>()?._0.to::<u64>();
    state.cooldown = r.next::<IPosition::cooldownCall>()?._0.to::<u64>();
    state.expiration = r.next::<IPosition::expirationCall>()?._0.to::<u64>();
    state.last_accrual = r.next::<IPosition::lastAccrualCall>()?._0.to::<u64>();
    state.challenged_amount = r.next::<IPosition::challengedAmountCall>()?._0;
    state.closed = r.next::<IPosition::isClosedCall>()?._0;
    if has_collateral {
        state.collateral_balance = r.next::<IERC20::balanceOfCall>()?._0;
    }

    if collateral != state.collateral && collateral != Address::ZERO {
        state.collateral = collateral;
        state.collateral_symbol.clear();
    }
    if state.collateral_symbol.is_empty() && state.collateral != Address::ZERO {
        refresh_token_metadata(gateway, state).await;
    }

    Ok(())
}

async fn refresh_token_metadata(gateway: &RpcGateway, state: &mut PositionState) {
    let token = state.collateral;
    let calls = [
        ReadCall::new(token, &IERC20::symbolCall {}),
        ReadCall::new(token, &IERC20::decimalsCall {}),
    ];
    let decoded = match gateway.batch_call(&calls).await {
        Ok(data) => {
            let mut r = super::Returns::new(data);
            r.next::<IERC20::symbolCall>()
                .and_then(|s| Ok((s._0, r.next::<IERC20::decimalsCall>()?._0)))
        }
        Err(e) => Err(e),
    };
    match decoded {
        Ok((symbol, decimals)) => {
            state.collateral_symbol = symbol;
            state.collateral_decimals = decimals;
        }
        Err(e) => {
            warn!(token = %token, error = %e, "Collateral metadata unavailable");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconstruct::testkit;
    use alloy::primitives::{B256, U256};
    use indexer_chain::mock::MockRpc;
    use indexer_chain::{RetryPolicy, RpcError};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    const POSITION: Address = Address::repeat_byte(0xC0);

    fn event(kind: ContractType, contract: Address, name: &str, args: serde_json::Value, block: u64) -> RawEvent {
        RawEvent {
            tx_hash: B256::left_padding_from(&block.to_be_bytes()),
            log_index: 0,
            block_number: block,
            block_timestamp: 1_700_000_000 + block,
            contract,
            contract_kind: kind,
            name: name.to_string(),
            args,
            alerted: false,
        }
    }

    fn gateway(rpc: Arc<MockRpc>) -> RpcGateway {
        RpcGateway::new(
            rpc,
            RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                ..Default::default()
            },
            16,
        )
    }

    #[test]
    fn test_apply_events_lifecycle() {
        let mut positions = BTreeMap::new();
        let hub = Address::repeat_byte(0xA1);
        let events = vec![
            event(
                ContractType::CoreMintingHub,
                hub,
                event_names::POSITION_OPENED,
                json!({
                    "owner": "0x0101010101010101010101010101010101010101",
                    "position": "0xc0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0",
                    "original": "0xc0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0",
                    "collateral": "0xcccccccccccccccccccccccccccccccccccccccc",
                }),
                100,
            ),
            event(
                ContractType::Position,
                POSITION,
                event_names::MINTING_UPDATE,
                json!({ "collateral": 5, "price": "3000000000000000000000", "principal": 9 }),
                101,
            ),
            event(
                ContractType::Position,
                POSITION,
                event_names::OWNERSHIP_TRANSFERRED,
                json!({ "newOwner": "0x0202020202020202020202020202020202020202" }),
                102,
            ),
        ];

        let touched = apply_events(&mut positions, &events);
        assert_eq!(touched, HashSet::from([POSITION]));

        let p = &positions[&POSITION];
        assert_eq!(p.created_block, 100);
        assert_eq!(p.updated_block, 102);
        assert_eq!(p.collateral, Address::repeat_byte(0xCC));
        assert_eq!(p.collateral_balance, U256::from(5u64));
        assert_eq!(p.price, "3000000000000000000000".parse::<U256>().unwrap());
        assert_eq!(p.owner, Address::repeat_byte(0x02));

        let denied = vec![event(
            ContractType::Position,
            POSITION,
            event_names::POSITION_DENIED,
            json!({}),
            103,
        )];
        apply_events(&mut positions, &denied);
        assert!(positions[&POSITION].denied);
    }

    #[tokio::test]
    async fn test_refresh_reads_all_fields() {
        let rpc = Arc::new(MockRpc::new(1_000));
        rpc.set_call_handler(|call| testkit::answer(call, 0x77));
        let gateway = gateway(rpc.clone());

        let mut state = PositionState::opened(POSITION, Address::ZERO, POSITION, Address::repeat_byte(0xCC), 1);
        refresh(&gateway, &mut state).await.unwrap();

        assert_eq!(state.owner, Address::repeat_byte(0x77));
        assert_eq!(state.collateral, Address::repeat_byte(0x77));
        assert_eq!(state.debt, U256::from(0x77u64));
        assert_eq!(state.challenge_period, 0x77);
        assert_eq!(state.risk_premium_ppm, 0x77);
        assert_eq!(state.collateral_symbol, "TKN");
        assert_eq!(state.collateral_decimals, 18);
        assert!(!state.closed);
        // One batch for the position, one for token metadata
        assert_eq!(rpc.batch_calls(), 2);
    }

    #[tokio::test]
    async fn test_transient_read_keeps_values() {
        let rpc = Arc::new(MockRpc::new(1_000));
        rpc.fail_calls_always(RpcError::transient("batch_call", "503 Service Unavailable"));
        let gateway = gateway(rpc);

        let mut state = PositionState::opened(POSITION, Address::ZERO, POSITION, Address::ZERO, 1);
        state.debt = U256::from(42u64);
        let before = state.clone();
        refresh(&gateway, &mut state).await.unwrap();
        assert_eq!(state, before);
    }

    #[tokio::test]
    async fn test_fatal_read_fails() {
        let rpc = Arc::new(MockRpc::new(1_000));
        rpc.fail_calls_always(RpcError::fatal("batch_call", "execution reverted"));
        let gateway = gateway(rpc);

        let mut state = PositionState::opened(POSITION, Address::ZERO, POSITION, Address::ZERO, 1);
        let err = refresh(&gateway, &mut state).await.unwrap_err();
        assert!(indexer_chain::is_fatal_rpc(&err));
    }
}
