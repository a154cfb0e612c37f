//! Protocol-wide aggregate.
//!
//! Supply, reserve, equity and savings figures come from one read batch
//! against the core contracts. Profit and loss totals are carried forward
//! from the previous snapshot: only events after its block are added. The
//! 24h metrics read the last day of stored events. Both include the
//! current window's events, which are not committed yet.

use alloy::primitives::U256;
use anyhow::Result;
use indexer_api::PriceOracle;
use indexer_chain::contracts::{IEquity, IERC20, ISavings, IStablecoin};
use indexer_chain::{event_names, is_fatal_rpc, ContractType, ReadCall, RpcGateway};
use std::collections::HashSet;
use tracing::warn;

use super::{read_or_keep, CoreAddresses, WindowContext};
use crate::state::{ChallengeState, PositionState, PositionStatus, SystemState};
use crate::store::{EventFilter, Store};
use crate::types::RawEvent;

const DAY_SECS: u64 = 86_400;

pub(super) struct SystemReader<'a> {
    pub gateway: &'a RpcGateway,
    pub store: &'a dyn Store,
    pub prices: Option<&'a PriceOracle>,
    pub core: &'a CoreAddresses,
}

impl SystemReader<'_> {
    pub async fn build(
        &self,
        ctx: &WindowContext<'_>,
        positions: &[PositionState],
        challenges: &[ChallengeState],
    ) -> Result<SystemState> {
        let previous = self.store.system_state().await?;
        // The previous totals cover every event up to its block
        let first_new_block = previous.as_ref().map(|s| s.block_number + 1);
        let mut system = previous.unwrap_or_default();
        system.block_number = ctx.to_block;
        system.timestamp = ctx.now;

        let mut fresh = system.clone();
        match self.read_contracts(&mut fresh).await {
            Ok(()) => system = fresh,
            Err(e) if is_fatal_rpc(&e) => {
                warn!(error = %format!("{:#}", e), "System read failed, keeping previous figures");
            }
            Err(e) => return Err(e),
        }

        let new_profits = self
            .merged(ctx, ContractType::CoreToken, event_names::PROFIT, EventFilter::starting_at(first_new_block))
            .await?;
        let new_losses = self
            .merged(ctx, ContractType::CoreToken, event_names::LOSS, EventFilter::starting_at(first_new_block))
            .await?;
        system.total_profit = system.total_profit.saturating_add(sum_arg(&new_profits, "amount"));
        system.total_loss = system.total_loss.saturating_add(sum_arg(&new_losses, "amount"));

        let day = EventFilter::default().since(ctx.now.saturating_sub(DAY_SECS));
        let profits = self.merged(ctx, ContractType::CoreToken, event_names::PROFIT, day.clone()).await?;
        let losses = self.merged(ctx, ContractType::CoreToken, event_names::LOSS, day.clone()).await?;
        let trades = self.merged(ctx, ContractType::CoreEquity, event_names::TRADE, day).await?;
        system.profit_24h = sum_arg(&profits, "amount");
        system.loss_24h = sum_arg(&losses, "amount");
        system.equity_trade_volume_24h = sum_arg(&trades, "totPrice");
        system.equity_trades_24h = trades.len() as u64;

        system.position_count = positions.len() as u64;
        system.live_position_count = positions
            .iter()
            .filter(|p| p.status != PositionStatus::Closed)
            .count() as u64;
        system.active_challenge_count = challenges
            .iter()
            .filter(|c| !c.status.is_terminal())
            .count() as u64;

        if let (Some(oracle), Some(token)) = (self.prices, self.core.token) {
            system.fiat_rates.insert("USD".to_string(), oracle.price(token).await.usd);
        }

        Ok(system)
    }

    async fn read_contracts(&self, system: &mut SystemState) -> Result<()> {
        let Some(token) = self.core.token else {
            return Ok(());
        };

        let mut calls = vec![
            ReadCall::new(token, &IERC20::totalSupplyCall {}),
            ReadCall::new(token, &IStablecoin::minterReserveCall {}),
            ReadCall::new(token, &IStablecoin::equityCall {}),
        ];
        if let Some(equity) = self.core.equity {
            calls.push(ReadCall::new(equity, &IEquity::priceCall {}));
            calls.push(ReadCall::new(equity, &IEquity::totalSupplyCall {}));
        }
        if let Some(savings) = self.core.savings {
            calls.push(ReadCall::new(token, &IERC20::balanceOfCall { account: savings }));
            calls.push(ReadCall::new(savings, &ISavings::currentRatePPMCall {}));
        }

        let Some(mut r) = read_or_keep(self.gateway, &calls, "system").await? else {
            return Ok(());
        };

        system.total_supply = r.next::<IERC20::totalSupplyCall>()?._0;
        system.minter_reserve = r.next::<IStablecoin::minterReserveCall>()?._0;
        system.equity = r.next::<IStablecoin::equityCall>()?._0;
        if self.core.equity.is_some() {
            system.equity_price = r.next::<IEquity::priceCall>()?._0;
            system.equity_supply = r.next::<IEquity::totalSupplyCall>()?._0;
        }
        if self.core.savings.is_some() {
            system.total_savings = r.next::<IERC20::balanceOfCall>()?._0;
            system.savings_rate_ppm = r.next::<ISavings::currentRatePPMCall>()?._0.to::<u32>();
        }
        Ok(())
    }

    /// Stored events of `name` matching `filter`, plus this window's,
    /// without duplicates.
    async fn merged(
        &self,
        ctx: &WindowContext<'_>,
        kind: ContractType,
        name: &str,
        filter: EventFilter,
    ) -> Result<Vec<RawEvent>> {
        let filter = EventFilter {
            kind: Some(kind),
            name: Some(name.to_string()),
            ..filter
        };
        let mut events = self.store.events(&filter).await?;
        let mut seen: HashSet<_> = events.iter().map(RawEvent::key).collect();
        for event in ctx.events.iter().filter(|e| filter.matches(e)) {
            if seen.insert(event.key()) {
                events.push(event.clone());
            }
        }
        Ok(events)
    }
}

fn sum_arg(events: &[RawEvent], arg: &str) -> U256 {
    events
        .iter()
        .filter_map(|e| e.arg_u256(arg))
        .fold(U256::ZERO, |acc, v| acc.saturating_add(v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconstruct::testkit;
    use crate::store::MemoryStore;
    use crate::types::WindowBatch;
    use alloy::primitives::{Address, B256};
    use indexer_chain::mock::MockRpc;
    use indexer_chain::{RetryPolicy, RpcError};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    const TOKEN: Address = Address::repeat_byte(0xA0);
    const EQUITY: Address = Address::repeat_byte(0xA2);
    const SAVINGS: Address = Address::repeat_byte(0xA3);
    const NOW: u64 = 2_000_000;

    fn event(kind: ContractType, name: &str, args: serde_json::Value, index: u64, timestamp: u64) -> RawEvent {
        RawEvent {
            tx_hash: B256::left_padding_from(&timestamp.to_be_bytes()),
            log_index: index,
            block_number: timestamp / 12,
            block_timestamp: timestamp,
            contract: if kind == ContractType::CoreToken { TOKEN } else { EQUITY },
            contract_kind: kind,
            name: name.to_string(),
            args,
            alerted: false,
        }
    }

    fn core() -> CoreAddresses {
        CoreAddresses {
            token: Some(TOKEN),
            equity: Some(EQUITY),
            savings: Some(SAVINGS),
            minting_hub: None,
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
            8,
        )
    }

    #[tokio::test]
    async fn test_build_merges_stored_and_window_events() {
        let store = MemoryStore::new();
        let old_profit = event(ContractType::CoreToken, event_names::PROFIT, json!({ "amount": 100 }), 0, NOW - 2 * DAY_SECS);
        let recent_loss = event(ContractType::CoreToken, event_names::LOSS, json!({ "amount": 7 }), 1, NOW - 60);
        let mut batch = WindowBatch::new(1, 10);
        batch.events = vec![old_profit.clone(), recent_loss];
        store.commit_window(&batch).await.unwrap();

        let window_events = vec![
            // Already stored: must not count twice
            old_profit,
            event(ContractType::CoreToken, event_names::PROFIT, json!({ "amount": 5 }), 2, NOW - 10),
            event(
                ContractType::CoreEquity,
                event_names::TRADE,
                json!({ "who": "0x0101010101010101010101010101010101010101", "amount": -3, "totPrice": 40, "newprice": 1 }),
                3,
                NOW - 5,
            ),
        ];

        let rpc = Arc::new(MockRpc::new(100));
        rpc.set_call_handler(|call| testkit::answer(call, 1_000));
        let gateway = gateway(rpc);
        let kinds = HashMap::new();
        let ctx = WindowContext {
            events: &window_events,
            to_block: 11,
            now: NOW,
            refresh_all: true,
            kinds: &kinds,
        };

        let mut open = PositionState::opened(Address::repeat_byte(1), Address::ZERO, Address::ZERO, Address::ZERO, 1);
        open.status = PositionStatus::Open;
        let mut closed = open.clone();
        closed.status = PositionStatus::Closed;
        let live = ChallengeState::started(1, Address::ZERO, Address::ZERO, U256::from(1u64), 0, 10, 1);

        let core = core();
        let reader = SystemReader {
            gateway: &gateway,
            store: &store,
            prices: None,
            core: &core,
        };
        let system = reader.build(&ctx, &[open, closed], &[live]).await.unwrap();

        assert_eq!(system.block_number, 11);
        assert_eq!(system.total_supply, U256::from(1_000u64));
        assert_eq!(system.total_savings, U256::from(1_000u64));
        assert_eq!(system.savings_rate_ppm, 50_000);
        assert_eq!(system.total_profit, U256::from(105u64));
        assert_eq!(system.profit_24h, U256::from(5u64));
        assert_eq!(system.loss_24h, U256::from(7u64));
        assert_eq!(system.equity_trade_volume_24h, U256::from(40u64));
        assert_eq!(system.equity_trades_24h, 1);
        assert_eq!(system.position_count, 2);
        assert_eq!(system.live_position_count, 1);
        assert_eq!(system.active_challenge_count, 1);
        assert!(system.fiat_rates.is_empty());
    }

    #[tokio::test]
    async fn test_transient_read_keeps_previous_figures() {
        let store = MemoryStore::new();
        let mut batch = WindowBatch::new(1, 5);
        batch.system = Some(SystemState {
            total_supply: U256::from(9u64),
            ..Default::default()
        });
        store.commit_window(&batch).await.unwrap();

        let rpc = Arc::new(MockRpc::new(100));
        rpc.fail_calls_always(RpcError::transient("batch_call", "connection reset"));
        let gateway = gateway(rpc);
        let kinds = HashMap::new();
        let ctx = WindowContext {
            events: &[],
            to_block: 6,
            now: NOW,
            refresh_all: true,
            kinds: &kinds,
        };

        let core = core();
        let reader = SystemReader {
            gateway: &gateway,
            store: &store,
            prices: None,
            core: &core,
        };
        let system = reader.build(&ctx, &[], &[]).await.unwrap();
        assert_eq!(system.total_supply, U256::from(9u64));
        assert_eq!(system.block_number, 6);
    }

    #[tokio::test]
    async fn test_totals_carry_forward_across_cycles() {
        let store = MemoryStore::new();
        let rpc = Arc::new(MockRpc::new(100));
        rpc.set_call_handler(|call| testkit::answer(call, 1_000));
        let gateway = gateway(rpc);
        let kinds = HashMap::new();
        let core = core();
        let reader = SystemReader {
            gateway: &gateway,
            store: &store,
            prices: None,
            core: &core,
        };

        // First cycle: one stored profit plus one in the closing window.
        let mut stored = event(ContractType::CoreToken, event_names::PROFIT, json!({ "amount": 100 }), 0, NOW - 3 * DAY_SECS);
        stored.block_number = 5;
        let mut batch = WindowBatch::new(1, 9);
        batch.events = vec![stored];
        store.commit_window(&batch).await.unwrap();

        let mut closing = event(ContractType::CoreToken, event_names::PROFIT, json!({ "amount": 20 }), 1, NOW - 2 * DAY_SECS);
        closing.block_number = 10;
        let window = vec![closing.clone()];
        let ctx = WindowContext {
            events: &window,
            to_block: 10,
            now: NOW - 2 * DAY_SECS,
            refresh_all: true,
            kinds: &kinds,
        };
        let first = reader.build(&ctx, &[], &[]).await.unwrap();
        assert_eq!(first.total_profit, U256::from(120u64));

        let mut batch = WindowBatch::new(10, 10);
        batch.events = window;
        batch.system = Some(first);
        store.commit_window(&batch).await.unwrap();

        // Second cycle: a mid-cycle window, then the closing one.
        let mut mid = event(ContractType::CoreToken, event_names::PROFIT, json!({ "amount": 3 }), 2, NOW - 100);
        mid.block_number = 15;
        let mut loss = event(ContractType::CoreToken, event_names::LOSS, json!({ "amount": 4 }), 3, NOW - 90);
        loss.block_number = 15;
        let mut batch = WindowBatch::new(11, 15);
        batch.events = vec![mid, loss];
        store.commit_window(&batch).await.unwrap();

        let mut last = event(ContractType::CoreToken, event_names::PROFIT, json!({ "amount": 1 }), 4, NOW - 10);
        last.block_number = 20;
        // Replayed event from an earlier window: already counted
        let window = vec![closing, last];
        let ctx = WindowContext {
            events: &window,
            to_block: 20,
            now: NOW,
            refresh_all: true,
            kinds: &kinds,
        };
        let second = reader.build(&ctx, &[], &[]).await.unwrap();
        assert_eq!(second.block_number, 20);
        assert_eq!(second.total_profit, U256::from(124u64));
        assert_eq!(second.total_loss, U256::from(4u64));
        assert_eq!(second.profit_24h, U256::from(4u64));
        assert_eq!(second.loss_24h, U256::from(4u64));
    }

    #[tokio::test]
    async fn test_fatal_read_keeps_previous_figures() {
        let store = MemoryStore::new();
        let mut batch = WindowBatch::new(1, 5);
        batch.system = Some(SystemState {
            block_number: 5,
            total_supply: U256::from(9u64),
            total_profit: U256::from(50u64),
            ..Default::default()
        });
        store.commit_window(&batch).await.unwrap();

        let rpc = Arc::new(MockRpc::new(100));
        rpc.fail_calls_always(RpcError::fatal("batch_call", "execution reverted"));
        let gateway = gateway(rpc);
        let kinds = HashMap::new();
        let window = vec![event(ContractType::CoreToken, event_names::PROFIT, json!({ "amount": 2 }), 0, NOW)];
        let ctx = WindowContext {
            events: &window,
            to_block: 6,
            now: NOW,
            refresh_all: true,
            kinds: &kinds,
        };

        let core = core();
        let reader = SystemReader {
            gateway: &gateway,
            store: &store,
            prices: None,
            core: &core,
        };
        let system = reader.build(&ctx, &[], &[]).await.unwrap();
        assert_eq!(system.total_supply, U256::from(9u64));
        assert_eq!(system.total_profit, U256::from(52u64));
        assert_eq!(system.block_number, 6);
    }
}
