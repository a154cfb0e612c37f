//! Materialized entity snapshots and their status derivations.
//!
//! Statuses are pure functions of the stored fields and a block timestamp
//! (`now`). Reconstructors recompute them every time an entity is refreshed.

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::u256_math::collateral_value;

macro_rules! status_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    _ => anyhow::bail!("Unknown {}: {}", stringify!($name), s),
                }
            }
        }
    };
}

status_enum!(PositionStatus {
    Proposed => "PROPOSED",
    Open => "OPEN",
    Cooldown => "COOLDOWN",
    Challenged => "CHALLENGED",
    Undercollateralized => "UNDERCOLLATERALIZED",
    Expired => "EXPIRED",
    Closed => "CLOSED",
});

status_enum!(ChallengeStatus {
    Opened => "OPENED",
    Averting => "AVERTING",
    Auction => "AUCTION",
    Succeeded => "SUCCEEDED",
    Ended => "ENDED",
});

status_enum!(MinterStatus {
    Proposed => "PROPOSED",
    Approved => "APPROVED",
    Denied => "DENIED",
    Expired => "EXPIRED",
});

status_enum!(MinterKind {
    Generic => "GENERIC",
    Bridge => "BRIDGE",
});

impl ChallengeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Ended)
    }
}

/// Collateralized debt position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionState {
    pub address: Address,
    pub owner: Address,
    /// Position this one was cloned from (itself for originals)
    pub original: Address,
    pub collateral: Address,
    pub collateral_symbol: String,
    pub collateral_decimals: u8,
    pub collateral_balance: U256,
    pub price: U256,
    pub virtual_price: U256,
    pub principal: U256,
    pub interest: U256,
    pub debt: U256,
    pub limit: U256,
    pub available_for_minting: U256,
    pub minimum_collateral: U256,
    pub risk_premium_ppm: u32,
    pub reserve_contribution_ppm: u32,
    pub fixed_annual_rate_ppm: u32,
    pub challenge_period: u64,
    pub start: u64,
    pub cooldown: u64,
    pub expiration: u64,
    pub last_accrual: u64,
    pub challenged_amount: U256,
    pub closed: bool,
    pub denied: bool,
    pub status: PositionStatus,
    pub created_block: u64,
    pub updated_block: u64,
}

impl PositionState {
    /// Skeleton created from a `PositionOpened` event.
    pub fn opened(
        address: Address,
        owner: Address,
        original: Address,
        collateral: Address,
        block: u64,
    ) -> Self {
        Self {
            address,
            owner,
            original,
            collateral,
            collateral_symbol: String::new(),
            collateral_decimals: 18,
            collateral_balance: U256::ZERO,
            price: U256::ZERO,
            virtual_price: U256::ZERO,
            principal: U256::ZERO,
            interest: U256::ZERO,
            debt: U256::ZERO,
            limit: U256::ZERO,
            available_for_minting: U256::ZERO,
            minimum_collateral: U256::ZERO,
            risk_premium_ppm: 0,
            reserve_contribution_ppm: 0,
            fixed_annual_rate_ppm: 0,
            challenge_period: 0,
            start: 0,
            cooldown: 0,
            expiration: 0,
            last_accrual: 0,
            challenged_amount: U256::ZERO,
            closed: false,
            denied: false,
            status: PositionStatus::Proposed,
            created_block: block,
            updated_block: block,
        }
    }

    /// Stablecoin value of the locked collateral at the position price.
    pub fn collateral_value(&self) -> U256 {
        collateral_value(self.collateral_balance, self.price)
    }

    pub fn is_undercollateralized(&self) -> bool {
        !self.debt.is_zero() && self.collateral_value() < self.debt
    }

    /// Status at block time `now`.
    ///
    /// Precedence: closed, challenged, proposed, expired, cooldown,
    /// undercollateralized, open.
    pub fn derive_status(&self, now: u64) -> PositionStatus {
        if self.closed || self.denied {
            PositionStatus::Closed
        } else if !self.challenged_amount.is_zero() {
            PositionStatus::Challenged
        } else if now < self.start {
            PositionStatus::Proposed
        } else if now > self.expiration {
            PositionStatus::Expired
        } else if now < self.cooldown {
            PositionStatus::Cooldown
        } else if self.is_undercollateralized() {
            PositionStatus::Undercollateralized
        } else {
            PositionStatus::Open
        }
    }

    pub fn refresh_status(&mut self, now: u64) {
        self.status = self.derive_status(now);
    }
}

/// Liquidation challenge against a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeState {
    /// Challenge number assigned by the minting hub
    pub number: u64,
    pub challenger: Address,
    pub position: Address,
    /// Start timestamp
    pub start: u64,
    /// Challenge period of the position
    pub period: u64,
    pub initial_size: U256,
    pub averted: U256,
    /// Collateral size settled by successful bids
    pub succeeded: U256,
    pub acquired_collateral: U256,
    pub total_bid: U256,
    pub remaining_size: U256,
    pub current_price: U256,
    pub status: ChallengeStatus,
    pub created_block: u64,
    pub updated_block: u64,
}

impl ChallengeState {
    pub fn started(
        number: u64,
        challenger: Address,
        position: Address,
        size: U256,
        start: u64,
        period: u64,
        block: u64,
    ) -> Self {
        Self {
            number,
            challenger,
            position,
            start,
            period,
            initial_size: size,
            averted: U256::ZERO,
            succeeded: U256::ZERO,
            acquired_collateral: U256::ZERO,
            total_bid: U256::ZERO,
            remaining_size: size,
            current_price: U256::ZERO,
            status: ChallengeStatus::Opened,
            created_block: block,
            updated_block: block,
        }
    }

    /// Initial size minus averted and succeeded amounts.
    pub fn remaining(&self) -> U256 {
        self.initial_size
            .saturating_sub(self.averted)
            .saturating_sub(self.succeeded)
    }

    pub fn record_averted(&mut self, size: U256, block: u64) {
        self.averted = self.averted.saturating_add(size);
        self.remaining_size = self.remaining();
        self.updated_block = block;
    }

    pub fn record_succeeded(&mut self, size: U256, acquired: U256, bid: U256, block: u64) {
        self.succeeded = self.succeeded.saturating_add(size);
        self.acquired_collateral = self.acquired_collateral.saturating_add(acquired);
        self.total_bid = self.total_bid.saturating_add(bid);
        self.remaining_size = self.remaining();
        self.updated_block = block;
    }

    /// Status at block time `now`.
    ///
    /// A zero `period` means the position's challenge period has not been
    /// read yet. Such a challenge is only settled by its sizes, never by
    /// time.
    pub fn derive_status(&self, now: u64) -> ChallengeStatus {
        if self.remaining().is_zero() {
            return self.settled_status();
        }
        if self.period == 0 {
            return self.open_status();
        }

        let auction_start = self.start.saturating_add(self.period);
        let auction_end = auction_start.saturating_add(self.period);
        if now >= auction_end {
            self.settled_status()
        } else if now >= auction_start {
            ChallengeStatus::Auction
        } else {
            self.open_status()
        }
    }

    /// Still waiting on its challenge period.
    pub fn needs_period(&self) -> bool {
        self.period == 0 && !self.remaining().is_zero()
    }

    fn settled_status(&self) -> ChallengeStatus {
        if self.acquired_collateral.is_zero() {
            ChallengeStatus::Ended
        } else {
            ChallengeStatus::Succeeded
        }
    }

    fn open_status(&self) -> ChallengeStatus {
        if self.averted.is_zero() {
            ChallengeStatus::Opened
        } else {
            ChallengeStatus::Averting
        }
    }

    pub fn refresh_status(&mut self, now: u64) {
        self.remaining_size = self.remaining();
        self.status = self.derive_status(now);
    }
}

/// Registered minter, generic or bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinterState {
    pub address: Address,
    pub kind: MinterKind,
    pub applied_at: u64,
    pub application_period: u64,
    pub application_fee: U256,
    pub message: String,
    pub denied_at: Option<u64>,
    pub denial_message: Option<String>,
    pub status: MinterStatus,
    /// Bridge only: the bridged stablecoin
    pub bridge_token: Option<Address>,
    pub bridge_limit: Option<U256>,
    pub bridge_minted: Option<U256>,
    pub bridge_horizon: Option<u64>,
    pub created_block: u64,
    pub updated_block: u64,
}

impl MinterState {
    pub fn applied(
        address: Address,
        kind: MinterKind,
        applied_at: u64,
        application_period: u64,
        application_fee: U256,
        message: String,
        block: u64,
    ) -> Self {
        Self {
            address,
            kind,
            applied_at,
            application_period,
            application_fee,
            message,
            denied_at: None,
            denial_message: None,
            status: MinterStatus::Proposed,
            bridge_token: None,
            bridge_limit: None,
            bridge_minted: None,
            bridge_horizon: None,
            created_block: block,
            updated_block: block,
        }
    }

    /// Status at block time `now`.
    pub fn derive_status(&self, now: u64) -> MinterStatus {
        if let Some(denied_at) = self.denied_at {
            if denied_at >= self.applied_at && now >= denied_at {
                return MinterStatus::Denied;
            }
        }
        if self.kind == MinterKind::Bridge && self.bridge_horizon.is_some_and(|h| now > h) {
            MinterStatus::Expired
        } else if now < self.applied_at.saturating_add(self.application_period) {
            MinterStatus::Proposed
        } else {
            MinterStatus::Approved
        }
    }

    pub fn refresh_status(&mut self, now: u64) {
        self.status = self.derive_status(now);
    }
}

/// Per-collateral-token aggregate over non-closed positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollateralState {
    pub token: Address,
    pub symbol: String,
    pub decimals: u8,
    pub total_balance: U256,
    pub position_count: u64,
    pub total_limit: U256,
    pub total_available: U256,
    pub price_usd: f64,
    pub value_usd: f64,
    pub updated_block: u64,
}

/// Protocol-wide aggregate, overwritten every cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemState {
    pub block_number: u64,
    pub timestamp: u64,
    pub total_supply: U256,
    pub minter_reserve: U256,
    pub equity: U256,
    pub equity_price: U256,
    pub equity_supply: U256,
    pub total_savings: U256,
    pub savings_rate_ppm: u32,
    pub total_profit: U256,
    pub total_loss: U256,
    pub profit_24h: U256,
    pub loss_24h: U256,
    pub equity_trade_volume_24h: U256,
    pub equity_trades_24h: u64,
    pub position_count: u64,
    /// Positions not closed
    pub live_position_count: u64,
    pub active_challenge_count: u64,
    /// Quote currency code to price
    pub fiat_rates: BTreeMap<String, f64>,
}

/// Block the controller gave up on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedBlock {
    pub block_number: u64,
    pub reason: String,
    pub skipped_at: u64,
}
