//! Indexer clients for external services.
//!
//! This crate provides:
//! - Token USD prices (CoinGecko-compatible feed behind a TTL cache)
//! - Critical alert delivery (log or Telegram)

mod alert;
mod price;

pub use alert::{Alert, AlertSink, LogAlertSink, TelegramAlertSink, TelegramConfig};
pub use price::{CoinGeckoClient, PriceFeed, PriceOracle, PriceSource, Quote, NEUTRAL_PRICE};
