//! State reconstruction.
//!
//! Each window's events are folded into the stored snapshots, then the
//! affected entities are refreshed with batched on-chain reads and their
//! statuses re-derived at the window's block time.
//!
//! Only the entities a window's events name are loaded and refreshed. The
//! window that reaches the cycle's target head also refreshes every live
//! position, challenge and minter and rebuilds the collateral and system
//! aggregates.
//!
//! Read failures follow the RPC taxonomy:
//! - transient (after retries): keep the previous values, log a warning
//! - fatal on an entity the window touched: fail the window so the
//!   controller can bisect it
//! - fatal on an untouched entity during the full refresh: keep its
//!   previous snapshot, log a warning

use alloy::primitives::{Address, Bytes};
use alloy::sol_types::SolCall;
use anyhow::{Context, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use indexer_api::PriceOracle;
use indexer_chain::{event_names, is_fatal_rpc, ContractType, ReadCall, RpcError, RpcGateway};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::state::{ChallengeState, CollateralState, MinterState, PositionState, SystemState};
use crate::store::{ChallengeFilter, MinterFilter, PositionFilter, Store};
use crate::types::RawEvent;

mod challenge;
mod collateral;
mod minter;
mod position;
mod system;

pub use collateral::aggregate_collaterals;

/// Core contract addresses the aggregate readers need.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoreAddresses {
    pub token: Option<Address>,
    pub equity: Option<Address>,
    pub savings: Option<Address>,
    pub minting_hub: Option<Address>,
}

/// Inputs for one window.
pub struct WindowContext<'a> {
    pub events: &'a [RawEvent],
    pub to_block: u64,
    /// Timestamp of `to_block`
    pub now: u64,
    /// Refresh every live entity and rebuild aggregates
    pub refresh_all: bool,
    /// Known contracts including this window's discoveries
    pub kinds: &'a HashMap<Address, ContractType>,
}

/// Snapshots to persist for one window.
#[derive(Debug, Clone, Default)]
pub struct WindowStates {
    pub positions: Vec<PositionState>,
    pub challenges: Vec<ChallengeState>,
    pub minters: Vec<MinterState>,
    pub collaterals: Vec<CollateralState>,
    pub system: Option<SystemState>,
}

pub struct StateReconstructor {
    gateway: Arc<RpcGateway>,
    store: Arc<dyn Store>,
    prices: Option<Arc<PriceOracle>>,
    core: CoreAddresses,
    read_concurrency: usize,
}

impl StateReconstructor {
    pub fn new(
        gateway: Arc<RpcGateway>,
        store: Arc<dyn Store>,
        prices: Option<Arc<PriceOracle>>,
        core: CoreAddresses,
        read_concurrency: usize,
    ) -> Self {
        Self {
            gateway,
            store,
            prices,
            core,
            read_concurrency: read_concurrency.max(1),
        }
    }

    #[instrument(skip(self, ctx), fields(to = ctx.to_block, events = ctx.events.len(), refresh_all = ctx.refresh_all))]
    pub async fn reconstruct(&self, ctx: &WindowContext<'_>) -> Result<WindowStates> {
        let Entities {
            mut positions,
            mut challenges,
            mut minters,
        } = if ctx.refresh_all {
            self.load_all().await?
        } else {
            self.load_scoped(ctx.events).await?
        };

        let mut touched_positions = position::apply_events(&mut positions, ctx.events);
        let touched_challenges = challenge::apply_events(&mut challenges, &positions, ctx.events);
        let touched_minters = minter::apply_events(&mut minters, ctx.kinds, ctx.events);
        touched_positions.extend(
            touched_challenges
                .iter()
                .filter_map(|n| challenges.get(n).map(|c| c.position)),
        );

        let position_set: HashSet<Address> = if ctx.refresh_all {
            positions
                .values()
                .filter(|p| !p.closed || touched_positions.contains(&p.address))
                .map(|p| p.address)
                .collect()
        } else {
            touched_positions.clone()
        };
        let challenge_set: HashSet<u64> = if ctx.refresh_all {
            challenges
                .values()
                .filter(|c| {
                    !c.status.is_terminal() || c.needs_period() || touched_challenges.contains(&c.number)
                })
                .map(|c| c.number)
                .collect()
        } else {
            touched_challenges.clone()
        };
        let minter_set: HashSet<Address> = if ctx.refresh_all {
            minters.keys().copied().collect()
        } else {
            touched_minters.clone()
        };

        // Positions first: challenges borrow their challenge period.
        let touched = &touched_positions;
        let refreshed: Vec<PositionState> = stream::iter(
            position_set
                .iter()
                .filter_map(|a| positions.remove(a))
                .collect::<Vec<_>>(),
        )
        .map(|state| async move {
            let mut fresh = state.clone();
            if let Err(e) = position::refresh(&self.gateway, &mut fresh).await {
                keep_untouched(e, touched.contains(&state.address), "position")?;
                fresh = state;
            }
            fresh.updated_block = fresh.updated_block.max(ctx.to_block);
            fresh.refresh_status(ctx.now);
            Ok::<_, anyhow::Error>(fresh)
        })
        .buffer_unordered(self.read_concurrency)
        .try_collect()
        .await?;
        let mut out_positions = Vec::with_capacity(refreshed.len());
        for state in refreshed {
            out_positions.push(state.clone());
            positions.insert(state.address, state);
        }
        out_positions.sort_by_key(|p| p.address);

        let mut out_challenges = Vec::with_capacity(challenge_set.len());
        for number in &challenge_set {
            let Some(state) = challenges.get_mut(number) else {
                continue;
            };
            if state.period == 0 {
                if let Some(p) = positions.get(&state.position) {
                    state.period = p.challenge_period;
                }
            }
            state.refresh_status(ctx.now);
            if let Some(hub) = self.core.minting_hub {
                if let Err(e) = challenge::refresh(&self.gateway, hub, state).await {
                    keep_untouched(e, touched_challenges.contains(number), "challenge")?;
                }
            }
            state.updated_block = state.updated_block.max(ctx.to_block);
            out_challenges.push(state.clone());
        }
        out_challenges.sort_by_key(|c| c.number);

        let mut out_minters = Vec::with_capacity(minter_set.len());
        for address in &minter_set {
            let Some(state) = minters.get_mut(address) else {
                continue;
            };
            let mut fresh = state.clone();
            match minter::refresh(&self.gateway, &mut fresh).await {
                Ok(()) => *state = fresh,
                Err(e) => keep_untouched(e, touched_minters.contains(address), "minter")?,
            }
            state.refresh_status(ctx.now);
            state.updated_block = state.updated_block.max(ctx.to_block);
            out_minters.push(state.clone());
        }
        out_minters.sort_by_key(|m| m.address);

        let (collaterals, system) = if ctx.refresh_all {
            let all_positions: Vec<PositionState> = positions.values().cloned().collect();
            let tokens: Vec<Address> = {
                let mut t: Vec<Address> = all_positions
                    .iter()
                    .filter(|p| !p.closed)
                    .map(|p| p.collateral)
                    .collect();
                t.sort();
                t.dedup();
                t
            };
            let quotes = match &self.prices {
                Some(oracle) => oracle
                    .prices(&tokens)
                    .await
                    .into_iter()
                    .map(|(k, q)| (k, q.usd))
                    .collect(),
                None => HashMap::new(),
            };
            let collaterals = aggregate_collaterals(&all_positions, &quotes, ctx.to_block);

            let all_challenges: Vec<ChallengeState> = challenges.values().cloned().collect();
            let system = system::SystemReader {
                gateway: &self.gateway,
                store: self.store.as_ref(),
                prices: self.prices.as_deref(),
                core: &self.core,
            }
            .build(ctx, &all_positions, &all_challenges)
            .await?;
            (collaterals, Some(system))
        } else {
            (Vec::new(), None)
        };

        debug!(
            positions = out_positions.len(),
            challenges = out_challenges.len(),
            minters = out_minters.len(),
            collaterals = collaterals.len(),
            "Window states reconstructed"
        );

        Ok(WindowStates {
            positions: out_positions,
            challenges: out_challenges,
            minters: out_minters,
            collaterals,
            system,
        })
    }

    async fn load_all(&self) -> Result<Entities> {
        Ok(Entities {
            positions: self
                .store
                .positions(&PositionFilter::default())
                .await?
                .into_iter()
                .map(|p| (p.address, p))
                .collect(),
            challenges: self
                .store
                .challenges(&ChallengeFilter::default())
                .await?
                .into_iter()
                .map(|c| (c.number, c))
                .collect(),
            minters: self
                .store
                .minters(&MinterFilter::default())
                .await?
                .into_iter()
                .map(|m| (m.address, m))
                .collect(),
        })
    }

    /// Stored snapshots of the entities `events` name, plus the positions
    /// of the challenges among them.
    async fn load_scoped(&self, events: &[RawEvent]) -> Result<Entities> {
        let scope = EventScope::of(events);
        let mut entities = Entities::default();

        for number in &scope.challenges {
            for c in self.store.challenges(&ChallengeFilter::by_number(*number)).await? {
                entities.challenges.insert(c.number, c);
            }
        }

        let mut addresses = scope.positions;
        addresses.extend(entities.challenges.values().map(|c| c.position));
        for address in &addresses {
            for p in self.store.positions(&PositionFilter::by_address(*address)).await? {
                entities.positions.insert(p.address, p);
            }
        }

        for address in &scope.minters {
            for m in self.store.minters(&MinterFilter::by_address(*address)).await? {
                entities.minters.insert(m.address, m);
            }
        }

        Ok(entities)
    }
}

#[derive(Default)]
struct Entities {
    positions: BTreeMap<Address, PositionState>,
    challenges: BTreeMap<u64, ChallengeState>,
    minters: BTreeMap<Address, MinterState>,
}

/// Entity ids named by a window's events.
#[derive(Debug, Default, PartialEq, Eq)]
struct EventScope {
    positions: BTreeSet<Address>,
    challenges: BTreeSet<u64>,
    minters: BTreeSet<Address>,
}

impl EventScope {
    fn of(events: &[RawEvent]) -> Self {
        let mut scope = Self::default();
        for event in events {
            match (event.contract_kind, event.name.as_str()) {
                (ContractType::CoreMintingHub, event_names::POSITION_OPENED) => {
                    scope.positions.extend(event.arg_address("position"));
                }
                (ContractType::CoreMintingHub, name)
                    if name == event_names::CHALLENGE_STARTED
                        || name == event_names::CHALLENGE_AVERTED
                        || name == event_names::CHALLENGE_SUCCEEDED =>
                {
                    scope.positions.extend(event.arg_address("position"));
                    scope.challenges.extend(event.arg_u64("number"));
                }
                (ContractType::Position, _) => {
                    scope.positions.insert(event.contract);
                }
                (ContractType::CoreToken, name)
                    if name == event_names::MINTER_APPLIED || name == event_names::MINTER_DENIED =>
                {
                    scope.minters.extend(event.arg_address("minter"));
                }
                _ => {}
            }
        }
        scope
    }
}

/// Fatal reads of entities the window's events never touched keep the
/// previous snapshot. Everything else fails the window.
fn keep_untouched(err: anyhow::Error, touched: bool, what: &str) -> Result<()> {
    if touched || !is_fatal_rpc(&err) {
        return Err(err);
    }
    warn!(what, error = %format!("{:#}", err), "Refresh failed, keeping previous snapshot");
    Ok(())
}

/// Run a read batch. `None` means a transient failure: keep old values.
pub(crate) async fn read_or_keep(
    gateway: &RpcGateway,
    calls: &[ReadCall],
    what: &str,
) -> Result<Option<Returns>> {
    match gateway.batch_call(calls).await {
        Ok(data) => Ok(Some(Returns::new(data))),
        Err(e) if e.is_transient() => {
            warn!(what, calls = calls.len(), error = %e, "Read failed, keeping previous values");
            Ok(None)
        }
        Err(e) => Err(e).with_context(|| format!("Reading {}", what)),
    }
}

/// Sequential decoder over a batch's return data.
pub(crate) struct Returns {
    data: std::vec::IntoIter<Bytes>,
}

impl Returns {
    fn new(data: Vec<Bytes>) -> Self {
        Self {
            data: data.into_iter(),
        }
    }

    /// Decode the next return value as `C`'s output. Malformed data is
    /// deterministic, so it is reported as a fatal call failure.
    pub(crate) fn next<C: SolCall>(&mut self) -> Result<C::Return, RpcError> {
        let data = self
            .data
            .next()
            .ok_or_else(|| RpcError::fatal("batch_call", format!("missing result for {}", C::SIGNATURE)))?;
        C::abi_decode_returns(&data, true)
            .map_err(|e| RpcError::fatal("batch_call", format!("{}: {}", C::SIGNATURE, e)))
    }
}
