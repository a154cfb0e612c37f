use alloy::primitives::Address;
use std::collections::{BTreeMap, HashMap};

use crate::state::{CollateralState, PositionState};
use crate::u256_math::token_to_f64;

/// Per-token totals over every non-closed position.
///
/// `quotes` maps collateral tokens to USD prices; tokens without a quote
/// are valued at zero.
pub fn aggregate_collaterals(
    positions: &[PositionState],
    quotes: &HashMap<Address, f64>,
    block: u64,
) -> Vec<CollateralState> {
    let mut by_token: BTreeMap<Address, CollateralState> = BTreeMap::new();

    for position in positions.iter().filter(|p| !p.closed && !p.denied) {
        let entry = by_token
            .entry(position.collateral)
            .or_insert_with(|| CollateralState {
                token: position.collateral,
                symbol: String::new(),
                decimals: position.collateral_decimals,
                total_balance: Default::default(),
                position_count: 0,
                total_limit: Default::default(),
                total_available: Default::default(),
                price_usd: 0.0,
                value_usd: 0.0,
                updated_block: block,
            });

        if entry.symbol.is_empty() && !position.collateral_symbol.is_empty() {
            entry.symbol = position.collateral_symbol.clone();
            entry.decimals = position.collateral_decimals;
        }
        entry.total_balance = entry.total_balance.saturating_add(position.collateral_balance);
        entry.total_limit = entry.total_limit.saturating_add(position.limit);
        entry.total_available = entry
            .total_available
            .saturating_add(position.available_for_minting);
        entry.position_count += 1;
    }

    by_token
        .into_values()
        .map(|mut c| {
            c.price_usd = quotes.get(&c.token).copied().unwrap_or(0.0);
            c.value_usd = token_to_f64(c.total_balance, c.decimals) * c.price_usd;
            c
        })
        .collect()
}
