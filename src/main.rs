//! Stablecoin Protocol Indexer
//!
//! Mirrors a collateralized stablecoin protocol's on-chain state into SQLite.
//! Features:
//! - Windowed log ingestion with adaptive, chunked fetching
//! - Discovery of positions, minters and bridges from protocol events
//! - Position, challenge, collateral, minter and system snapshots
//! - Atomic per-window commits with a monotonic checkpoint

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use indexer_api::{AlertSink, CoinGeckoClient, LogAlertSink, PriceOracle, TelegramAlertSink, TelegramConfig};
use indexer_chain::{AlloyRpc, BatchedEventFetcher, EventDecoder, FetchQueue, RpcGateway};
use indexer_core::{
    load_config_from_env, ContractRegistry, CoreAddresses, EventIngestor, IndexerConfig,
    SqliteStore, StateReconstructor, Store, SyncController, SyncSettings,
};

#[tokio::main]
async fn main() -> Result<()> {
    print_banner();

    dotenvy::dotenv().ok();

    // LOG_FORMAT=json switches to structured output
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,indexer_core=debug,indexer_chain=debug"));
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    let config = load_config_from_env()?;
    config.log_config();

    info!(chain_id = config.chain.chain_id, "Starting stablecoin indexer");

    let controller = initialize_components(&config).await?;
    controller.run().await?;

    info!("Indexer stopped");
    Ok(())
}

async fn initialize_components(config: &IndexerConfig) -> Result<SyncController> {
    info!("Initializing components...");

    let rpc = Arc::new(AlloyRpc::new(&config.chain.rpc_url, config.rpc.multicall_address)?);
    let gateway = Arc::new(RpcGateway::new(
        rpc,
        config.rpc.retry_policy(),
        config.rpc.block_cache_size,
    ));
    let head = gateway
        .block_number()
        .await
        .context("RPC endpoint unreachable")?;
    info!(head, "RPC gateway initialized");

    let store = Arc::new(SqliteStore::connect(&config.storage.database_url).await?);
    store.run_migrations().await?;
    let store: Arc<dyn Store> = store;
    if let Some(checkpoint) = store.checkpoint().await? {
        info!(checkpoint, "Resuming from checkpoint");
    }

    let registry = Arc::new(ContractRegistry::new(store.clone(), gateway.clone()));
    registry
        .initialize(&config.contracts.core_contracts(), config.chain.deployment_block)
        .await?;

    let fetcher = BatchedEventFetcher::with_queue(
        gateway.clone(),
        config.fetcher.settings(),
        FetchQueue::new(),
    );
    let ingestor = Arc::new(EventIngestor::new(fetcher, EventDecoder::new()?));

    let prices = config.price.enabled.then(|| {
        let feed = Arc::new(CoinGeckoClient::new(&config.price.api_url, &config.price.platform));
        Arc::new(PriceOracle::new(feed, config.price.cache_ttl(), config.price.timeout()))
    });
    info!(enabled = prices.is_some(), api = %config.price.api_url, "Price oracle");

    let core = CoreAddresses {
        token: config.contracts.token,
        equity: config.contracts.equity,
        savings: config.contracts.savings,
        minting_hub: config.contracts.minting_hub,
    };
    let reconstructor = Arc::new(StateReconstructor::new(
        gateway.clone(),
        store.clone(),
        prices,
        core,
        config.sync.read_concurrency,
    ));

    let alerts: Arc<dyn AlertSink> = if config.alerts.enabled {
        let telegram = TelegramConfig {
            bot_token: config.alerts.telegram_bot_token.clone(),
            chat_id: config.alerts.telegram_chat_id.clone(),
        };
        info!("Telegram alerts enabled");
        Arc::new(TelegramAlertSink::new(&telegram)?)
    } else {
        Arc::new(LogAlertSink)
    };

    Ok(SyncController::new(
        SyncSettings::from_config(config),
        gateway,
        store,
        registry,
        ingestor,
        reconstructor,
        alerts,
    ))
}

fn print_banner() {
    println!(r#"
    ╔═╗┌┬┐┌─┐┌┐ ┬  ┌─┐┌─┐┌─┐┬┌┐┌  ╦┌┐┌┌┬┐┌─┐─┐ ┬┌─┐┬─┐
    ╚═╗ │ ├─┤├┴┐│  ├┤ │  │ │││││  ║│││ ││├┤ ┌┴┬┘├┤ ├┬┘
    ╚═╝ ┴ ┴ ┴└─┘┴─┘└─┘└─┘└─┘┴┘└┘  ╩┘└┘─┴┘└─┘┴ └─└─┘┴└─
    Stablecoin Indexer v0.1.0
    "#);
}
