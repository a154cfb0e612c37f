//! Sync controller.
//!
//! Drives indexing cycles. Each cycle covers `[checkpoint + 1, head]` in
//! fixed-size windows, and every window is committed atomically with its
//! checkpoint advance. A window is processed as:
//! 1. Fetch and decode events for every active contract
//! 2. Discover new contracts and fetch their events in the same window
//! 3. Reconstruct the touched state (everything on the cycle's last window)
//! 4. Commit events, contracts, snapshots and checkpoint together
//!
//! A window failing on a fatal call is halved until the failing block is
//! isolated. That block is retried once, then skipped with an audit row.
//! Any other failure aborts the cycle and leaves the checkpoint in place.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use indexer_api::{Alert, AlertSink};
use indexer_chain::{is_fatal_rpc, RpcGateway};
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::config::IndexerConfig;
use crate::ingest::EventIngestor;
use crate::reconstruct::{StateReconstructor, WindowContext};
use crate::registry::ContractRegistry;
use crate::store::Store;
use crate::types::{CommitSummary, WindowBatch};

/// Cycle state machine: `Idle -> Processing -> (Idle | Error)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Idle,
    Processing,
    Error,
}

impl SyncStatus {
    fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Processing => 1,
            Self::Error => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Processing,
            2 => Self::Error,
            _ => Self::Idle,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Processing => "PROCESSING",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health signal for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: SyncStatus,
    pub last_processed_block: Option<u64>,
    pub chain_head: Option<u64>,
    /// Blocks between the checkpoint and the confirmed head
    pub lag: Option<u64>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

/// What a cycle covered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub from_block: u64,
    pub to_block: u64,
    pub windows: usize,
    pub events: usize,
    pub contracts: usize,
    pub skipped_blocks: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A cycle was already processing
    AlreadyRunning,
    /// Nothing between the checkpoint and the head
    UpToDate,
    Completed(CycleReport),
    Failed(String),
}

/// Controller tuning.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// First block indexed when storage holds no checkpoint
    pub deployment_block: u64,
    /// Blocks behind head treated as not yet final
    pub confirmations: u64,
    pub window_size: u64,
    pub failure_alert_threshold: u32,
    pub interval: Duration,
}

impl SyncSettings {
    pub fn from_config(config: &IndexerConfig) -> Self {
        Self {
            deployment_block: config.chain.deployment_block,
            confirmations: config.chain.confirmations,
            window_size: config.sync.window_size.max(1),
            failure_alert_threshold: config.sync.failure_alert_threshold,
            interval: config.sync.interval(),
        }
    }
}

pub struct SyncController {
    settings: SyncSettings,
    gateway: Arc<RpcGateway>,
    store: Arc<dyn Store>,
    registry: Arc<ContractRegistry>,
    ingestor: Arc<EventIngestor>,
    reconstructor: Arc<StateReconstructor>,
    alerts: Arc<dyn AlertSink>,
    status: AtomicU8,
    failures: AtomicU32,
    health: RwLock<HealthSnapshot>,
}

impl SyncController {
    pub fn new(
        settings: SyncSettings,
        gateway: Arc<RpcGateway>,
        store: Arc<dyn Store>,
        registry: Arc<ContractRegistry>,
        ingestor: Arc<EventIngestor>,
        reconstructor: Arc<StateReconstructor>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            settings,
            gateway,
            store,
            registry,
            ingestor,
            reconstructor,
            alerts,
            status: AtomicU8::new(SyncStatus::Idle.as_u8()),
            failures: AtomicU32::new(0),
            health: RwLock::new(HealthSnapshot {
                status: SyncStatus::Idle,
                last_processed_block: None,
                chain_head: None,
                lag: None,
                last_error: None,
                consecutive_failures: 0,
                last_cycle_at: None,
            }),
        }
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn health(&self) -> HealthSnapshot {
        self.health.read().clone()
    }

    /// Trigger on the interval until ctrl-c.
    pub async fn run(&self) -> Result<()> {
        info!(
            interval_secs = self.settings.interval.as_secs(),
            window_size = self.settings.window_size,
            "Sync controller started"
        );

        let mut ticker = interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.trigger().await {
                        TriggerOutcome::Completed(report) => info!(
                            from = report.from_block,
                            to = report.to_block,
                            windows = report.windows,
                            events = report.events,
                            skipped = report.skipped_blocks.len(),
                            "Cycle complete"
                        ),
                        TriggerOutcome::UpToDate => debug!("Up to date"),
                        TriggerOutcome::AlreadyRunning => debug!("Previous cycle still running"),
                        TriggerOutcome::Failed(_) => {}
                    }
                }
                result = tokio::signal::ctrl_c() => {
                    result.context("Failed to listen for shutdown signal")?;
                    info!("Received shutdown signal, stopping sync controller");
                    return Ok(());
                }
            }
        }
    }

    /// Run one cycle unless one is already running.
    pub async fn trigger(&self) -> TriggerOutcome {
        let processing = SyncStatus::Processing.as_u8();
        if self
            .status
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| {
                (s != processing).then_some(processing)
            })
            .is_err()
        {
            debug!("Cycle already processing, trigger ignored");
            return TriggerOutcome::AlreadyRunning;
        }
        self.health.write().status = SyncStatus::Processing;

        let result = self.cycle().await;
        let now = Utc::now();

        match result {
            Ok(report) => {
                self.failures.store(0, Ordering::SeqCst);
                {
                    let mut health = self.health.write();
                    health.status = SyncStatus::Idle;
                    health.last_error = None;
                    health.consecutive_failures = 0;
                    health.last_cycle_at = Some(now);
                }
                self.status.store(SyncStatus::Idle.as_u8(), Ordering::SeqCst);
                match report {
                    Some(report) => TriggerOutcome::Completed(report),
                    None => TriggerOutcome::UpToDate,
                }
            }
            Err(e) => {
                let message = format!("{:#}", e);
                let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                error!(error = %message, consecutive_failures = failures, "Sync cycle failed");
                {
                    let mut health = self.health.write();
                    health.status = SyncStatus::Error;
                    health.last_error = Some(message.clone());
                    health.consecutive_failures = failures;
                    health.last_cycle_at = Some(now);
                }
                self.status.store(SyncStatus::Error.as_u8(), Ordering::SeqCst);

                let threshold = self.settings.failure_alert_threshold;
                if threshold > 0 && failures % threshold == 0 {
                    let alert = Alert::new(
                        "Indexer sync failing",
                        format!("{} consecutive failed cycles. Last error: {}", failures, message),
                    );
                    if let Err(e) = self.alerts.critical(&alert).await {
                        warn!(error = %e, "Failed to deliver sync alert");
                    }
                }
                TriggerOutcome::Failed(message)
            }
        }
    }

    #[instrument(skip(self))]
    async fn cycle(&self) -> Result<Option<CycleReport>> {
        let head = self
            .gateway
            .block_number()
            .await
            .context("Failed to fetch chain head")?;
        let target = head.saturating_sub(self.settings.confirmations);
        let checkpoint = self.store.checkpoint().await?;
        let start = checkpoint.map_or(self.settings.deployment_block, |cp| cp + 1);

        self.record_progress(checkpoint, head, target);

        if start > target {
            return Ok(None);
        }

        info!(from = start, to = target, head, "Starting sync cycle");
        let mut report = CycleReport {
            from_block: start,
            to_block: target,
            ..Default::default()
        };

        let mut from = start;
        while from <= target {
            let to = from
                .saturating_add(self.settings.window_size.max(1) - 1)
                .min(target);
            self.process_range(from, to, target, &mut report).await?;
            self.record_progress(Some(to), head, target);
            from = to + 1;
        }

        Ok(Some(report))
    }

    fn record_progress(&self, checkpoint: Option<u64>, head: u64, target: u64) {
        let mut health = self.health.write();
        health.chain_head = Some(head);
        health.last_processed_block = checkpoint;
        health.lag = Some(target.saturating_sub(checkpoint.unwrap_or(0)));
    }

    /// Process `[from, to]`, splitting on fatal call failures.
    async fn process_range(&self, from: u64, to: u64, target: u64, report: &mut CycleReport) -> Result<()> {
        let mut pending = vec![(from, to)];

        while let Some((from, to)) = pending.pop() {
            let err = match self.process_window(from, to, target).await {
                Ok(summary) => {
                    report.record(&summary);
                    continue;
                }
                Err(e) if !is_fatal_rpc(&e) => return Err(e),
                Err(e) => e,
            };

            if from < to {
                let mid = from + (to - from) / 2;
                warn!(from, to, error = %format!("{:#}", err), "Window failed, halving");
                pending.push((mid + 1, to));
                pending.push((from, mid));
                continue;
            }

            warn!(block = from, error = %format!("{:#}", err), "Block failed, retrying once");
            match self.process_window(from, from, target).await {
                Ok(summary) => report.record(&summary),
                Err(e) if is_fatal_rpc(&e) => {
                    let reason = format!("{:#}", e);
                    error!(block = from, reason = %reason, "Skipping block");
                    let batch = WindowBatch::skip(from, reason, Utc::now().timestamp().max(0) as u64);
                    self.store
                        .commit_window(&batch)
                        .await
                        .with_context(|| format!("Failed to record skipped block {}", from))?;
                    report.windows += 1;
                    report.skipped_blocks.push(from);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    #[instrument(skip(self))]
    async fn process_window(&self, from: u64, to: u64, target: u64) -> Result<CommitSummary> {
        let contracts = self.registry.active(None).await?;
        let mut events = self.ingestor.collect(&contracts, from, to).await?;

        let discovered = self.registry.discover(&events).await?;
        if !discovered.is_empty() {
            let extra = self
                .ingestor
                .collect(&discovered, from, to)
                .await
                .context("Failed to fetch events of discovered contracts")?;
            debug!(contracts = discovered.len(), events = extra.len(), "Second pass complete");
            events.extend(extra);
            events.sort_by_key(|e| (e.block_number, e.log_index));
        }

        let mut kinds = self.registry.snapshot();
        kinds.extend(discovered.iter().map(|c| (c.address, c.kind)));

        let now = self
            .gateway
            .block(to)
            .await
            .with_context(|| format!("Failed to fetch block {}", to))?
            .with_context(|| format!("Block {} not found", to))?
            .timestamp;

        let states = self
            .reconstructor
            .reconstruct(&WindowContext {
                events: &events,
                to_block: to,
                now,
                refresh_all: to == target,
                kinds: &kinds,
            })
            .await?;

        let batch = WindowBatch {
            from_block: from,
            to_block: to,
            events,
            contracts: discovered,
            positions: states.positions,
            challenges: states.challenges,
            minters: states.minters,
            collaterals: states.collaterals,
            system: states.system,
            skipped: None,
        };
        let summary = self
            .store
            .commit_window(&batch)
            .await
            .with_context(|| format!("Failed to commit blocks {}-{}", from, to))?;
        self.registry.commit(&batch.contracts);

        debug!(
            events = summary.events_inserted,
            contracts = summary.contracts_inserted,
            checkpoint = summary.checkpoint,
            "Window committed"
        );
        Ok(summary)
    }
}

impl CycleReport {
    fn record(&mut self, summary: &CommitSummary) {
        self.windows += 1;
        self.events += summary.events_inserted;
        self.contracts += summary.contracts_inserted;
    }
}
