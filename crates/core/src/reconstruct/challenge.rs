use alloy::primitives::{Address, U256};
use anyhow::Result;
use indexer_chain::contracts::IMintingHub;
use indexer_chain::{event_names, ContractType, ReadCall, RpcGateway};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use super::read_or_keep;
use crate::state::{ChallengeState, PositionState};
use crate::types::RawEvent;

/// Fold minting hub challenge events into `challenges`. Returns the
/// challenge numbers touched.
pub(super) fn apply_events(
    challenges: &mut BTreeMap<u64, ChallengeState>,
    positions: &BTreeMap<Address, PositionState>,
    events: &[RawEvent],
) -> HashSet<u64> {
    let mut touched = HashSet::new();

    for event in events.iter().filter(|e| e.contract_kind == ContractType::CoreMintingHub) {
        let Some(number) = event.arg_u64("number") else {
            continue;
        };

        match event.name.as_str() {
            event_names::CHALLENGE_STARTED => {
                let Some(position) = event.arg_address("position") else {
                    continue;
                };
                let period = positions.get(&position).map_or(0, |p| p.challenge_period);
                challenges.entry(number).or_insert_with(|| {
                    ChallengeState::started(
                        number,
                        event.arg_address("challenger").unwrap_or_default(),
                        position,
                        event.arg_u256("size").unwrap_or_default(),
                        event.block_timestamp,
                        period,
                        event.block_number,
                    )
                });
            }
            event_names::CHALLENGE_AVERTED => {
                let Some(state) = challenges.get_mut(&number) else {
                    debug!(number, "Averted challenge not known");
                    continue;
                };
                state.record_averted(event.arg_u256("size").unwrap_or_default(), event.block_number);
            }
            event_names::CHALLENGE_SUCCEEDED => {
                let Some(state) = challenges.get_mut(&number) else {
                    debug!(number, "Succeeded challenge not known");
                    continue;
                };
                state.record_succeeded(
                    event.arg_u256("challengeSize").unwrap_or_default(),
                    event.arg_u256("acquiredCollateral").unwrap_or_default(),
                    event.arg_u256("bid").unwrap_or_default(),
                    event.block_number,
                );
            }
            _ => continue,
        }
        touched.insert(number);
    }

    touched
}

/// Current auction price of a live challenge. Settled challenges have no
/// price.
pub(super) async fn refresh(gateway: &RpcGateway, hub: Address, state: &mut ChallengeState) -> Result<()> {
    if state.status.is_terminal() {
        state.current_price = U256::ZERO;
        return Ok(());
    }
    let Ok(challenge_number) = u32::try_from(state.number) else {
        return Ok(());
    };

    let calls = [ReadCall::new(hub, &IMintingHub::priceCall { challengeNumber: challenge_number })];
    if let Some(mut r) = read_or_keep(gateway, &calls, "challenge").await? {
        state.current_price = r.next::<IMintingHub::priceCall>()?._0;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconstruct::testkit;
    use crate::state::ChallengeStatus;
    use alloy::primitives::B256;
    use indexer_chain::mock::MockRpc;
    use indexer_chain::RetryPolicy;
    use serde_json::json;
    use std::sync::Arc;

    const HUB: Address = Address::repeat_byte(0xA1);
    const POSITION: Address = Address::repeat_byte(0xC0);

    fn event(name: &str, args: serde_json::Value, block: u64, index: u64) -> RawEvent {
        RawEvent {
            tx_hash: B256::left_padding_from(&block.to_be_bytes()),
            log_index: index,
            block_number: block,
            block_timestamp: 1_000 + block,
            contract: HUB,
            contract_kind: ContractType::CoreMintingHub,
            name: name.to_string(),
            args,
            alerted: false,
        }
    }

    fn positions() -> BTreeMap<Address, PositionState> {
        let mut p = PositionState::opened(POSITION, Address::ZERO, POSITION, Address::ZERO, 1);
        p.challenge_period = 100;
        BTreeMap::from([(POSITION, p)])
    }

    #[test]
    fn test_partial_avert_then_success() {
        let mut challenges = BTreeMap::new();
        let events = vec![
            event(
                event_names::CHALLENGE_STARTED,
                json!({
                    "challenger": "0x0909090909090909090909090909090909090909",
                    "position": "0xc0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0",
                    "size": 10,
                    "number": 7,
                }),
                10,
                0,
            ),
            event(event_names::CHALLENGE_AVERTED, json!({ "number": 7, "size": 4 }), 11, 0),
            event(
                event_names::CHALLENGE_SUCCEEDED,
                json!({ "number": 7, "bid": 30, "acquiredCollateral": 6, "challengeSize": 6 }),
                12,
                0,
            ),
        ];

        let touched = apply_events(&mut challenges, &positions(), &events);
        assert_eq!(touched, HashSet::from([7]));

        let c = &challenges[&7];
        assert_eq!(c.start, 1_010);
        assert_eq!(c.period, 100);
        assert_eq!(c.averted, U256::from(4u64));
        assert_eq!(c.succeeded, U256::from(6u64));
        assert_eq!(c.total_bid, U256::from(30u64));
        assert_eq!(c.remaining(), U256::ZERO);
        assert_eq!(c.derive_status(1_020), ChallengeStatus::Succeeded);
    }

    #[test]
    fn test_events_for_unknown_challenge_ignored() {
        let mut challenges = BTreeMap::new();
        let events = vec![event(event_names::CHALLENGE_AVERTED, json!({ "number": 3, "size": 1 }), 5, 0)];
        assert!(apply_events(&mut challenges, &positions(), &events).is_empty());
        assert!(challenges.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_reads_price_for_live_challenges_only() {
        let rpc = Arc::new(MockRpc::new(100));
        rpc.set_call_handler(|call| testkit::answer(call, 1_234));
        let gateway = RpcGateway::new(rpc.clone(), RetryPolicy::default(), 8);

        let mut live = ChallengeState::started(1, Address::ZERO, POSITION, U256::from(5u64), 0, 100, 1);
        refresh(&gateway, HUB, &mut live).await.unwrap();
        assert_eq!(live.current_price, U256::from(1_234u64));

        let mut done = live.clone();
        done.status = ChallengeStatus::Ended;
        refresh(&gateway, HUB, &mut done).await.unwrap();
        assert_eq!(done.current_price, U256::ZERO);
        assert_eq!(rpc.batch_calls(), 1);
    }
}
