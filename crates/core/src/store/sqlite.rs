//! SQLite `Store` backed by sqlx.

use alloy::primitives::{Address, B256};
use anyhow::{Context, Result};
use async_trait::async_trait;
use indexer_chain::{normalize_address, ContractType};
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, Transaction};
use std::str::FromStr;
use tracing::{debug, info};

use super::{BlockRange, ChallengeFilter, EventFilter, MinterFilter, PositionFilter, Store};
use crate::state::{
    ChallengeState, CollateralState, MinterState, PositionState, SkippedBlock, SystemState,
};
use crate::types::{CommitSummary, ContractRecord, EventKey, RawEvent, WindowBatch};

const EVENT_COLUMNS: &str = "tx_hash, log_index, block_number, block_timestamp, contract, \
                             contract_kind, event_name, args, alerted";

/// Database storage for the indexer.
///
/// Provides async access to SQLite with connection pooling. Every window
/// commit runs in one transaction.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to `database_url` (e.g. `sqlite://indexer.db`), creating the
    /// file if missing.
    pub async fn connect(database_url: &str) -> Result<Self> {
        info!(url = %database_url, "Connecting to database");

        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database url {}", database_url))?
            .create_if_missing(true);

        // An in-memory database lives only as long as its single connection.
        let in_memory = database_url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        Ok(Self { pool })
    }

    /// Fresh in-memory database with migrations applied.
    pub async fn in_memory() -> Result<Self> {
        let store = Self::connect("sqlite::memory:").await?;
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run embedded migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;
        info!("Database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn hash_hex(hash: &B256) -> String {
    format!("{:#x}", hash)
}

fn to_json_text<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("Failed to serialize snapshot")
}

fn from_json_text<T: DeserializeOwned>(row: &SqliteRow, column: &str) -> Result<T> {
    let text: String = row.try_get(column)?;
    serde_json::from_str(&text).with_context(|| format!("Corrupt JSON in column {}", column))
}

fn event_from_row(row: &SqliteRow) -> Result<RawEvent> {
    let tx_hash: String = row.try_get("tx_hash")?;
    let contract: String = row.try_get("contract")?;
    let kind: String = row.try_get("contract_kind")?;
    Ok(RawEvent {
        tx_hash: tx_hash.parse().context("Invalid tx hash")?,
        log_index: row.try_get::<i64, _>("log_index")? as u64,
        block_number: row.try_get::<i64, _>("block_number")? as u64,
        block_timestamp: row.try_get::<i64, _>("block_timestamp")? as u64,
        contract: contract.parse().context("Invalid contract address")?,
        contract_kind: kind.parse()?,
        name: row.try_get("event_name")?,
        args: from_json_text(row, "args")?,
        alerted: row.try_get("alerted")?,
    })
}

fn push_updated_range(qb: &mut QueryBuilder<'_, Sqlite>, range: &BlockRange) {
    if let Some(from) = range.from {
        qb.push(" AND updated_block >= ").push_bind(from as i64);
    }
    if let Some(to) = range.to {
        qb.push(" AND updated_block <= ").push_bind(to as i64);
    }
}

fn contract_from_row(row: &SqliteRow) -> Result<ContractRecord> {
    let address: String = row.try_get("address")?;
    let kind: String = row.try_get("kind")?;
    Ok(ContractRecord {
        address: address.parse::<Address>().context("Invalid contract address")?,
        kind: kind.parse::<ContractType>()?,
        first_block: row.try_get::<i64, _>("first_block")? as u64,
        metadata: from_json_text(row, "metadata")?,
        active: row.try_get("active")?,
    })
}

async fn insert_contracts(
    tx: &mut Transaction<'_, Sqlite>,
    records: &[ContractRecord],
) -> Result<usize> {
    let mut inserted = 0;
    for record in records {
        let result = sqlx::query(
            r#"
            INSERT INTO contracts (address, kind, first_block, metadata, active)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(address) DO NOTHING
            "#,
        )
        .bind(normalize_address(&record.address))
        .bind(record.kind.as_str())
        .bind(record.first_block as i64)
        .bind(to_json_text(&record.metadata)?)
        .bind(record.active)
        .execute(&mut **tx)
        .await
        .context("Failed to insert contract")?;
        inserted += result.rows_affected() as usize;
    }
    Ok(inserted)
}

async fn insert_events(tx: &mut Transaction<'_, Sqlite>, events: &[RawEvent]) -> Result<usize> {
    let mut inserted = 0;
    for event in events {
        let result = sqlx::query(
            r#"
            INSERT INTO raw_events (
                tx_hash, log_index, block_number, block_timestamp,
                contract, contract_kind, event_name, args, alerted
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(tx_hash, log_index) DO NOTHING
            "#,
        )
        .bind(hash_hex(&event.tx_hash))
        .bind(event.log_index as i64)
        .bind(event.block_number as i64)
        .bind(event.block_timestamp as i64)
        .bind(normalize_address(&event.contract))
        .bind(event.contract_kind.as_str())
        .bind(&event.name)
        .bind(to_json_text(&event.args)?)
        .bind(event.alerted)
        .execute(&mut **tx)
        .await
        .context("Failed to insert event")?;
        inserted += result.rows_affected() as usize;
    }
    Ok(inserted)
}

async fn write_snapshots(tx: &mut Transaction<'_, Sqlite>, batch: &WindowBatch) -> Result<()> {
    for p in &batch.positions {
        sqlx::query(
            r#"
            INSERT INTO positions (address, owner, collateral, status, closed, updated_block, data)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(address) DO UPDATE SET
                owner = excluded.owner,
                collateral = excluded.collateral,
                status = excluded.status,
                closed = excluded.closed,
                updated_block = excluded.updated_block,
                data = excluded.data
            "#,
        )
        .bind(normalize_address(&p.address))
        .bind(normalize_address(&p.owner))
        .bind(normalize_address(&p.collateral))
        .bind(p.status.as_str())
        .bind(p.closed)
        .bind(p.updated_block as i64)
        .bind(to_json_text(p)?)
        .execute(&mut **tx)
        .await
        .context("Failed to upsert position")?;
    }

    for c in &batch.challenges {
        sqlx::query(
            r#"
            INSERT INTO challenges (number, position, challenger, status, updated_block, data)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(number) DO UPDATE SET
                position = excluded.position,
                challenger = excluded.challenger,
                status = excluded.status,
                updated_block = excluded.updated_block,
                data = excluded.data
            "#,
        )
        .bind(c.number as i64)
        .bind(normalize_address(&c.position))
        .bind(normalize_address(&c.challenger))
        .bind(c.status.as_str())
        .bind(c.updated_block as i64)
        .bind(to_json_text(c)?)
        .execute(&mut **tx)
        .await
        .context("Failed to upsert challenge")?;
    }

    for m in &batch.minters {
        sqlx::query(
            r#"
            INSERT INTO minters (address, kind, status, updated_block, data)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(address) DO UPDATE SET
                kind = excluded.kind,
                status = excluded.status,
                updated_block = excluded.updated_block,
                data = excluded.data
            "#,
        )
        .bind(normalize_address(&m.address))
        .bind(m.kind.as_str())
        .bind(m.status.as_str())
        .bind(m.updated_block as i64)
        .bind(to_json_text(m)?)
        .execute(&mut **tx)
        .await
        .context("Failed to upsert minter")?;
    }

    if !batch.collaterals.is_empty() {
        sqlx::query("DELETE FROM collaterals")
            .execute(&mut **tx)
            .await
            .context("Failed to clear collaterals")?;
        for c in &batch.collaterals {
            sqlx::query("INSERT INTO collaterals (token, updated_block, data) VALUES (?, ?, ?)")
                .bind(normalize_address(&c.token))
                .bind(c.updated_block as i64)
                .bind(to_json_text(c)?)
                .execute(&mut **tx)
                .await
                .context("Failed to insert collateral")?;
        }
    }

    if let Some(system) = &batch.system {
        sqlx::query(
            r#"
            INSERT INTO system_state (id, block_number, data) VALUES (1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                block_number = excluded.block_number,
                data = excluded.data
            "#,
        )
        .bind(system.block_number as i64)
        .bind(to_json_text(system)?)
        .execute(&mut **tx)
        .await
        .context("Failed to write system state")?;
    }

    if let Some(skipped) = &batch.skipped {
        sqlx::query("INSERT INTO skipped_blocks (block_number, reason, skipped_at) VALUES (?, ?, ?)")
            .bind(skipped.block_number as i64)
            .bind(&skipped.reason)
            .bind(skipped.skipped_at as i64)
            .execute(&mut **tx)
            .await
            .context("Failed to record skipped block")?;
    }

    Ok(())
}

async fn advance_checkpoint(tx: &mut Transaction<'_, Sqlite>, block: u64) -> Result<u64> {
    sqlx::query(
        r#"
        INSERT INTO sync_checkpoint (id, last_block, updated_at) VALUES (1, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            last_block = MAX(last_block, excluded.last_block),
            updated_at = excluded.updated_at
        "#,
    )
    .bind(block as i64)
    .bind(chrono::Utc::now().timestamp())
    .execute(&mut **tx)
    .await
    .context("Failed to advance checkpoint")?;

    let last: i64 = sqlx::query_scalar("SELECT last_block FROM sync_checkpoint WHERE id = 1")
        .fetch_one(&mut **tx)
        .await
        .context("Failed to read checkpoint")?;
    Ok(last as u64)
}

#[async_trait]
impl Store for SqliteStore {
    async fn checkpoint(&self) -> Result<Option<u64>> {
        let last: Option<i64> =
            sqlx::query_scalar("SELECT last_block FROM sync_checkpoint WHERE id = 1")
                .fetch_optional(&self.pool)
                .await
                .context("Failed to fetch checkpoint")?;
        Ok(last.map(|b| b as u64))
    }

    async fn load_contracts(&self) -> Result<Vec<ContractRecord>> {
        let rows = sqlx::query(
            "SELECT address, kind, first_block, metadata, active FROM contracts \
             ORDER BY first_block, address",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to load contracts")?;
        rows.iter().map(contract_from_row).collect()
    }

    async fn upsert_contracts(&self, records: &[ContractRecord]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let inserted = insert_contracts(&mut tx, records).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    async fn commit_window(&self, batch: &WindowBatch) -> Result<CommitSummary> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let events_inserted = insert_events(&mut tx, &batch.events).await?;
        let contracts_inserted = insert_contracts(&mut tx, &batch.contracts).await?;
        write_snapshots(&mut tx, batch).await?;
        let checkpoint = advance_checkpoint(&mut tx, batch.to_block).await?;

        tx.commit().await.context("Failed to commit window")?;

        debug!(
            from = batch.from_block,
            to = batch.to_block,
            events_inserted,
            contracts_inserted,
            checkpoint,
            "Window committed"
        );

        Ok(CommitSummary {
            events_inserted,
            contracts_inserted,
            checkpoint,
        })
    }

    async fn events(&self, filter: &EventFilter) -> Result<Vec<RawEvent>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM raw_events WHERE 1 = 1", EVENT_COLUMNS));
        if let Some(contract) = &filter.contract {
            qb.push(" AND contract = ").push_bind(normalize_address(contract));
        }
        if let Some(kind) = filter.kind {
            qb.push(" AND contract_kind = ").push_bind(kind.as_str());
        }
        if let Some(name) = &filter.name {
            qb.push(" AND event_name = ").push_bind(name.clone());
        }
        if let Some(from) = filter.from_block {
            qb.push(" AND block_number >= ").push_bind(from as i64);
        }
        if let Some(to) = filter.to_block {
            qb.push(" AND block_number <= ").push_bind(to as i64);
        }
        if let Some(from) = filter.from_timestamp {
            qb.push(" AND block_timestamp >= ").push_bind(from as i64);
        }
        if let Some(to) = filter.to_timestamp {
            qb.push(" AND block_timestamp <= ").push_bind(to as i64);
        }
        qb.push(" ORDER BY block_number, log_index");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("Failed to query events")?;
        rows.iter().map(event_from_row).collect()
    }

    async fn positions(&self, filter: &PositionFilter) -> Result<Vec<PositionState>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT data FROM positions WHERE 1 = 1");
        if let Some(address) = &filter.address {
            qb.push(" AND address = ").push_bind(normalize_address(address));
        }
        if let Some(owner) = &filter.owner {
            qb.push(" AND owner = ").push_bind(normalize_address(owner));
        }
        if let Some(collateral) = &filter.collateral {
            qb.push(" AND collateral = ").push_bind(normalize_address(collateral));
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        push_updated_range(&mut qb, &filter.updated);
        if filter.active_only {
            qb.push(" AND closed = 0");
        }
        qb.push(" ORDER BY address");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("Failed to query positions")?;
        rows.iter().map(|r| from_json_text(r, "data")).collect()
    }

    async fn challenges(&self, filter: &ChallengeFilter) -> Result<Vec<ChallengeState>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT data FROM challenges WHERE 1 = 1");
        if let Some(number) = filter.number {
            qb.push(" AND number = ").push_bind(number as i64);
        }
        if let Some(position) = &filter.position {
            qb.push(" AND position = ").push_bind(normalize_address(position));
        }
        if let Some(challenger) = &filter.challenger {
            qb.push(" AND challenger = ").push_bind(normalize_address(challenger));
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        push_updated_range(&mut qb, &filter.updated);
        if filter.active_only {
            qb.push(" AND status NOT IN ('SUCCEEDED', 'ENDED')");
        }
        qb.push(" ORDER BY number");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("Failed to query challenges")?;
        rows.iter().map(|r| from_json_text(r, "data")).collect()
    }

    async fn minters(&self, filter: &MinterFilter) -> Result<Vec<MinterState>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT data FROM minters WHERE 1 = 1");
        if let Some(address) = &filter.address {
            qb.push(" AND address = ").push_bind(normalize_address(address));
        }
        if let Some(kind) = filter.kind {
            qb.push(" AND kind = ").push_bind(kind.as_str());
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        push_updated_range(&mut qb, &filter.updated);
        qb.push(" ORDER BY address");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("Failed to query minters")?;
        rows.iter().map(|r| from_json_text(r, "data")).collect()
    }

    async fn collaterals(&self) -> Result<Vec<CollateralState>> {
        let rows = sqlx::query("SELECT data FROM collaterals ORDER BY token")
            .fetch_all(&self.pool)
            .await
            .context("Failed to query collaterals")?;
        rows.iter().map(|r| from_json_text(r, "data")).collect()
    }

    async fn system_state(&self) -> Result<Option<SystemState>> {
        let row = sqlx::query("SELECT data FROM system_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch system state")?;
        row.as_ref().map(|r| from_json_text(r, "data")).transpose()
    }

    async fn unalerted_events(&self, limit: usize) -> Result<Vec<RawEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM raw_events WHERE alerted = 0 ORDER BY block_number, log_index LIMIT ?",
            EVENT_COLUMNS
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query unalerted events")?;
        rows.iter().map(event_from_row).collect()
    }

    async fn mark_alerted(&self, keys: &[EventKey]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut marked = 0;
        for key in keys {
            let result = sqlx::query(
                "UPDATE raw_events SET alerted = 1 WHERE tx_hash = ? AND log_index = ? AND alerted = 0",
            )
            .bind(hash_hex(&key.tx_hash))
            .bind(key.log_index as i64)
            .execute(&mut *tx)
            .await
            .context("Failed to mark event alerted")?;
            marked += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(marked)
    }

    async fn skipped_blocks(&self) -> Result<Vec<SkippedBlock>> {
        let rows = sqlx::query(
            "SELECT block_number, reason, skipped_at FROM skipped_blocks ORDER BY block_number",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to query skipped blocks")?;
        rows.iter()
            .map(|row| {
                Ok(SkippedBlock {
                    block_number: row.try_get::<i64, _>("block_number")? as u64,
                    reason: row.try_get("reason")?,
                    skipped_at: row.try_get::<i64, _>("skipped_at")? as u64,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fixtures;
    use alloy::primitives::U256;
    use serde_json::json;

    #[tokio::test]
    async fn test_sqlite_store_behaviour() {
        let store = SqliteStore::in_memory().await.unwrap();
        fixtures::exercise_store(&store).await;
    }

    #[tokio::test]
    async fn test_event_round_trip_preserves_large_values() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut event = fixtures::event(7, 3, "Trade");
        event.args = json!({
            "who": "0x1111111111111111111111111111111111111111",
            "amount": "-123456789012345678901234567890",
        });
        let mut batch = WindowBatch::new(1, 7);
        batch.events = vec![event.clone()];
        store.commit_window(&batch).await.unwrap();

        let loaded = store.events(&EventFilter::named("Trade")).await.unwrap();
        assert_eq!(loaded, vec![event]);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut position = fixtures::position(0x42, false);
        position.debt = U256::MAX;
        let mut batch = WindowBatch::new(1, 2);
        batch.positions = vec![position.clone()];
        store.commit_window(&batch).await.unwrap();

        let loaded = store
            .positions(&PositionFilter {
                owner: Some(position.owner),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(loaded, vec![position]);
    }

    #[tokio::test]
    async fn test_run_migrations_twice() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.run_migrations().await.unwrap();
        assert_eq!(store.checkpoint().await.unwrap(), None);
    }
}
