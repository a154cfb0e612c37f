use alloy::primitives::Address;
use anyhow::Result;
use indexer_chain::contracts::IBridge;
use indexer_chain::{event_names, ContractType, ReadCall, RpcGateway};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

use super::read_or_keep;
use crate::state::{MinterKind, MinterState};
use crate::types::RawEvent;

/// Fold token minter events into `minters`. `kinds` tells bridges apart
/// from generic minters.
pub(super) fn apply_events(
    minters: &mut BTreeMap<Address, MinterState>,
    kinds: &HashMap<Address, ContractType>,
    events: &[RawEvent],
) -> HashSet<Address> {
    let mut touched = HashSet::new();

    for event in events.iter().filter(|e| e.contract_kind == ContractType::CoreToken) {
        let Some(address) = event.arg_address("minter") else {
            continue;
        };

        match event.name.as_str() {
            event_names::MINTER_APPLIED => {
                let kind = match kinds.get(&address) {
                    Some(ContractType::Bridge) => MinterKind::Bridge,
                    _ => MinterKind::Generic,
                };
                minters.entry(address).or_insert_with(|| {
                    MinterState::applied(
                        address,
                        kind,
                        event.block_timestamp,
                        event.arg_u64("applicationPeriod").unwrap_or_default(),
                        event.arg_u256("applicationFee").unwrap_or_default(),
                        event.arg_str("message").unwrap_or_default().to_string(),
                        event.block_number,
                    )
                });
            }
            event_names::MINTER_DENIED => {
                let Some(state) = minters.get_mut(&address) else {
                    debug!(minter = %address, "Denial for unknown minter");
                    continue;
                };
                state.denied_at = Some(event.block_timestamp);
                state.denial_message = event.arg_str("message").map(str::to_string);
                state.updated_block = state.updated_block.max(event.block_number);
            }
            _ => continue,
        }
        touched.insert(address);
    }

    touched
}

/// Bridge parameters. Generic minters have nothing to read.
pub(super) async fn refresh(gateway: &RpcGateway, state: &mut MinterState) -> Result<()> {
    if state.kind != MinterKind::Bridge {
        return Ok(());
    }

    let b = state.address;
    let calls = [
        ReadCall::new(b, &IBridge::usdCall {}),
        ReadCall::new(b, &IBridge::limitCall {}),
        ReadCall::new(b, &IBridge::mintedCall {}),
        ReadCall::new(b, &IBridge::horizonCall {}),
    ];
    let Some(mut r) = read_or_keep(gateway, &calls, "bridge").await? else {
        return Ok(());
    };

    state.bridge_token = Some(r.next::<IBridge::usdCall>()?._0);
    state.bridge_limit = Some(r.next::<IBridge::limitCall>()?._0);
    state.bridge_minted = Some(r.next::<IBridge::mintedCall>()?._0);
    let horizon = r.next::<IBridge::horizonCall>()?._0;
    state.bridge_horizon = Some(u64::try_from(horizon).unwrap_or(u64::MAX));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconstruct::testkit;
    use crate::state::MinterStatus;
    use alloy::primitives::{B256, U256};
    use indexer_chain::mock::MockRpc;
    use indexer_chain::RetryPolicy;
    use serde_json::json;
    use std::sync::Arc;

    const TOKEN: Address = Address::repeat_byte(0xA0);
    const BRIDGE: Address = Address::repeat_byte(0xB0);
    const MINTER: Address = Address::repeat_byte(0xB1);

    fn event(name: &str, args: serde_json::Value, timestamp: u64) -> RawEvent {
        RawEvent {
            tx_hash: B256::left_padding_from(&timestamp.to_be_bytes()),
            log_index: 0,
            block_number: timestamp / 12,
            block_timestamp: timestamp,
            contract: TOKEN,
            contract_kind: ContractType::CoreToken,
            name: name.to_string(),
            args,
            alerted: false,
        }
    }

    #[test]
    fn test_apply_then_deny() {
        let kinds = HashMap::from([(BRIDGE, ContractType::Bridge), (MINTER, ContractType::Minter)]);
        let mut minters = BTreeMap::new();
        let events = vec![
            event(
                event_names::MINTER_APPLIED,
                json!({
                    "minter": "0xb0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0",
                    "applicationPeriod": 1_000,
                    "applicationFee": 1,
                    "message": "bridge",
                }),
                10_000,
            ),
            event(
                event_names::MINTER_APPLIED,
                json!({
                    "minter": "0xb1b1b1b1b1b1b1b1b1b1b1b1b1b1b1b1b1b1b1b1",
                    "applicationPeriod": 1_000,
                    "applicationFee": 1,
                    "message": "minter",
                }),
                10_000,
            ),
            event(
                event_names::MINTER_DENIED,
                json!({ "minter": "0xb1b1b1b1b1b1b1b1b1b1b1b1b1b1b1b1b1b1b1b1", "message": "no" }),
                10_500,
            ),
        ];

        let touched = apply_events(&mut minters, &kinds, &events);
        assert_eq!(touched.len(), 2);
        assert_eq!(minters[&BRIDGE].kind, MinterKind::Bridge);
        assert_eq!(minters[&BRIDGE].derive_status(10_999), MinterStatus::Proposed);
        assert_eq!(minters[&BRIDGE].derive_status(11_000), MinterStatus::Approved);
        assert_eq!(minters[&MINTER].kind, MinterKind::Generic);
        assert_eq!(minters[&MINTER].denial_message.as_deref(), Some("no"));
        assert_eq!(minters[&MINTER].derive_status(10_500), MinterStatus::Denied);
    }

    #[tokio::test]
    async fn test_refresh_reads_bridges_only() {
        let rpc = Arc::new(MockRpc::new(100));
        rpc.set_call_handler(|call| testkit::answer(call, 500));
        let gateway = RpcGateway::new(rpc.clone(), RetryPolicy::default(), 8);

        let mut generic = MinterState::applied(MINTER, MinterKind::Generic, 0, 0, U256::ZERO, String::new(), 1);
        refresh(&gateway, &mut generic).await.unwrap();
        assert_eq!(rpc.batch_calls(), 0);

        let mut bridge = MinterState::applied(BRIDGE, MinterKind::Bridge, 0, 0, U256::ZERO, String::new(), 1);
        refresh(&gateway, &mut bridge).await.unwrap();
        assert_eq!(bridge.bridge_token, Some(Address::repeat_byte(0x55)));
        assert_eq!(bridge.bridge_limit, Some(U256::from(500u64)));
        assert_eq!(bridge.bridge_horizon, Some(u64::from(u32::MAX)));
        assert_eq!(rpc.batch_calls(), 1);
    }
}
