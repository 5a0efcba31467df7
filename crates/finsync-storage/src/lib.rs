//! Relational store for the sync engine: schema, staged merge-upserts, entity metadata,
//! plus an immutable archive for raw provider payloads.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use finsync_core::{
    EntityId, Entity, EntityUpsert, FinancialRecord, PeriodType, PriceRecord, StatementKind, Unit,
};
use sha2::{Digest, Sha256};
use sqlx::migrate::Migrator;
use sqlx::query_builder::Separated;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "finsync-storage";

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Rows per multi-row `INSERT` into a staging table; keeps bind counts well below SQLite's limit.
const STAGING_ROWS_PER_INSERT: usize = 400;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unreachable at {url}: {source}")]
    Connection {
        url: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("applying migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("reconciling {table} failed: {source}")]
    Reconciliation {
        table: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("{table} does not accept these records")]
    TableMismatch { table: &'static str },
    #[error("updating entity metadata failed: {source}")]
    Metadata {
        #[source]
        source: sqlx::Error,
    },
    #[error("group memberships for {entity_id} are not valid json: {source}")]
    Json {
        entity_id: EntityId,
        #[source]
        source: serde_json::Error,
    },
    #[error("stored value {value:?} in {column} could not be decoded")]
    Decode { column: &'static str, value: String },
    #[error(transparent)]
    Query(#[from] sqlx::Error),
}

/// Logical tables the reconciler can merge into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TargetTable {
    Statement(StatementKind),
    DailyPrices,
}

impl TargetTable {
    pub fn name(&self) -> &'static str {
        match self {
            TargetTable::Statement(kind) => kind.table_name(),
            TargetTable::DailyPrices => "daily_prices",
        }
    }

    fn layout(&self) -> TableLayout {
        match self {
            TargetTable::Statement(_) => TableLayout {
                name: self.name(),
                columns: STATEMENT_COLUMNS,
                key_len: 4,
            },
            TargetTable::DailyPrices => TableLayout {
                name: self.name(),
                columns: PRICE_COLUMNS,
                key_len: 2,
            },
        }
    }
}

/// Column name + staging type. Natural-key columns come first.
type ColumnDef = (&'static str, &'static str);

const STATEMENT_COLUMNS: &[ColumnDef] = &[
    ("entity_id", "TEXT NOT NULL"),
    ("fiscal_date", "TEXT NOT NULL"),
    ("field_name", "TEXT NOT NULL"),
    ("period_type", "TEXT NOT NULL"),
    ("field_value", "REAL"),
    ("unit", "TEXT NOT NULL"),
    ("source", "TEXT NOT NULL"),
    ("captured_at", "TEXT NOT NULL"),
];

const PRICE_COLUMNS: &[ColumnDef] = &[
    ("entity_id", "TEXT NOT NULL"),
    ("trade_date", "TEXT NOT NULL"),
    ("open_price", "REAL NOT NULL"),
    ("close_price", "REAL NOT NULL"),
    ("high_price", "REAL NOT NULL"),
    ("low_price", "REAL NOT NULL"),
    ("volume", "INTEGER NOT NULL"),
    ("captured_at", "TEXT NOT NULL"),
];

#[derive(Debug, Clone, Copy)]
struct TableLayout {
    name: &'static str,
    columns: &'static [ColumnDef],
    key_len: usize,
}

impl TableLayout {
    fn staging_name(&self) -> String {
        format!("staging_{}", self.name)
    }

    fn key_columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns[..self.key_len].iter().map(|(name, _)| *name)
    }

    fn value_columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns[self.key_len..].iter().map(|(name, _)| *name)
    }

    fn column_list(&self) -> String {
        self.columns
            .iter()
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn key_list(&self) -> String {
        self.key_columns().collect::<Vec<_>>().join(", ")
    }

    /// The staging primary key collapses duplicate keys inside one batch (last row wins).
    fn staging_ddl(&self) -> String {
        let columns = self
            .columns
            .iter()
            .map(|(name, ty)| format!("{name} {ty}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "CREATE TEMP TABLE {} ({columns}, PRIMARY KEY ({}))",
            self.staging_name(),
            self.key_list()
        )
    }

    fn matched_count_sql(&self) -> String {
        let predicate = self
            .key_columns()
            .map(|k| format!("t.{k} = s.{k}"))
            .collect::<Vec<_>>()
            .join(" AND ");
        format!(
            "SELECT COUNT(*) FROM temp.{} s WHERE EXISTS (SELECT 1 FROM {} t WHERE {predicate})",
            self.staging_name(),
            self.name
        )
    }

    // `WHERE true` disambiguates the upsert clause from a join constraint in SQLite's grammar.
    fn merge_sql(&self) -> String {
        let assignments = self
            .value_columns()
            .map(|c| format!("{c} = excluded.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let columns = self.column_list();
        format!(
            "INSERT INTO {table} ({columns}) SELECT {columns} FROM temp.{staging} WHERE true \
             ON CONFLICT ({keys}) DO UPDATE SET {assignments}",
            table = self.name,
            staging = self.staging_name(),
            keys = self.key_list(),
        )
    }
}

/// A canonical record shape the reconciler knows how to stage.
pub trait MergeRecord: Send + Sync {
    fn accepts(table: TargetTable) -> bool;
    fn entity_id(&self) -> &str;
    /// Binds the record's values in the column order of its table layout.
    fn bind_row(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>);
}

impl MergeRecord for FinancialRecord {
    fn accepts(table: TargetTable) -> bool {
        matches!(table, TargetTable::Statement(_))
    }

    fn entity_id(&self) -> &str {
        &self.entity_id
    }

    fn bind_row(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>) {
        row.push_bind(self.entity_id.clone())
            .push_bind(self.fiscal_date)
            .push_bind(self.field_name.clone())
            .push_bind(self.period_type.to_string())
            .push_bind(self.field_value)
            .push_bind(self.unit.to_string())
            .push_bind(self.source.clone())
            .push_bind(self.captured_at);
    }
}

impl MergeRecord for PriceRecord {
    fn accepts(table: TargetTable) -> bool {
        matches!(table, TargetTable::DailyPrices)
    }

    fn entity_id(&self) -> &str {
        &self.entity_id
    }

    fn bind_row(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>) {
        row.push_bind(self.entity_id.clone())
            .push_bind(self.trade_date)
            .push_bind(self.open)
            .push_bind(self.close)
            .push_bind(self.high)
            .push_bind(self.low)
            .push_bind(self.volume)
            .push_bind(self.captured_at);
    }
}

/// Outcome of one reconciliation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub table: &'static str,
    /// Distinct natural keys in the incoming batch.
    pub staged: u64,
    /// Keys that already existed and were updated in place.
    pub matched: u64,
    pub inserted: u64,
    pub rows_affected: u64,
}

impl ReconcileReport {
    fn empty(table: TargetTable) -> Self {
        Self {
            table: table.name(),
            staged: 0,
            matched: 0,
            inserted: 0,
            rows_affected: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityUpsertReport {
    pub inserted: u64,
    pub updated: u64,
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if needed) the database and proves it answers a query.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let connection_error = |source: sqlx::Error| StoreError::Connection {
            url: database_url.to_string(),
            source,
        };
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(connection_error)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(connection_error)?;
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(connection_error)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Merges `records` into `table`: matching natural keys are updated in place, new keys
    /// are inserted, rows absent from the batch are left alone.
    ///
    /// Staging and merge share one transaction, so a failure leaves `table` untouched.
    pub async fn reconcile<R: MergeRecord>(
        &self,
        table: TargetTable,
        records: &[R],
    ) -> Result<ReconcileReport, StoreError> {
        if !R::accepts(table) {
            return Err(StoreError::TableMismatch {
                table: table.name(),
            });
        }
        if records.is_empty() {
            return Ok(ReconcileReport::empty(table));
        }

        let layout = table.layout();
        let span = info_span!("reconcile", table = layout.name, records = records.len());
        let result = self.merge_batch(layout, records).instrument(span).await;
        match result {
            Ok(report) => {
                info!(
                    table = report.table,
                    staged = report.staged,
                    matched = report.matched,
                    inserted = report.inserted,
                    rows_affected = report.rows_affected,
                    "reconciled batch"
                );
                Ok(report)
            }
            Err(source) => {
                warn!(table = layout.name, error = %source, "reconciliation rolled back");
                Err(StoreError::Reconciliation {
                    table: layout.name,
                    source,
                })
            }
        }
    }

    pub async fn reconcile_statements(
        &self,
        kind: StatementKind,
        records: &[FinancialRecord],
    ) -> Result<ReconcileReport, StoreError> {
        self.reconcile(TargetTable::Statement(kind), records).await
    }

    pub async fn reconcile_prices(
        &self,
        records: &[PriceRecord],
    ) -> Result<ReconcileReport, StoreError> {
        self.reconcile(TargetTable::DailyPrices, records).await
    }

    async fn merge_batch<R: MergeRecord>(
        &self,
        layout: TableLayout,
        records: &[R],
    ) -> Result<ReconcileReport, sqlx::Error> {
        let staging = layout.staging_name();
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!("DROP TABLE IF EXISTS temp.{staging}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&layout.staging_ddl()).execute(&mut *tx).await?;

        let insert_prefix = format!(
            "INSERT OR REPLACE INTO temp.{staging} ({}) ",
            layout.column_list()
        );
        for rows in records.chunks(STAGING_ROWS_PER_INSERT) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(&insert_prefix);
            builder.push_values(rows, |mut row, record| record.bind_row(&mut row));
            builder.build().execute(&mut *tx).await?;
        }

        let staged: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM temp.{staging}"))
            .fetch_one(&mut *tx)
            .await?;
        let matched: i64 = sqlx::query_scalar(&layout.matched_count_sql())
            .fetch_one(&mut *tx)
            .await?;
        let merged = sqlx::query(&layout.merge_sql()).execute(&mut *tx).await?;
        debug!(staged, matched, "merged staging rows");

        sqlx::query(&format!("DROP TABLE temp.{staging}"))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let staged = staged.max(0) as u64;
        let matched = matched.max(0) as u64;
        Ok(ReconcileReport {
            table: layout.name,
            staged,
            matched,
            inserted: staged.saturating_sub(matched),
            rows_affected: merged.rows_affected(),
        })
    }

    /// Entity-list upsert: existence is checked per identifier, descriptive fields are
    /// overwritten on match. Refresh metadata is never touched here.
    pub async fn upsert_entities(
        &self,
        snapshot: &[EntityUpsert],
    ) -> Result<EntityUpsertReport, StoreError> {
        let mut report = EntityUpsertReport::default();
        let mut tx = self.pool.begin().await?;

        for entity in snapshot {
            let groups = serde_json::to_string(&entity.group_weights).map_err(|source| {
                StoreError::Json {
                    entity_id: entity.id.clone(),
                    source,
                }
            })?;
            let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM companies WHERE id = ?")
                .bind(&entity.id)
                .fetch_optional(&mut *tx)
                .await?;

            if exists.is_some() {
                sqlx::query(
                    "UPDATE companies SET name = ?, sector = ?, industry = ?, group_memberships = ?, active = 1 \
                     WHERE id = ?",
                )
                .bind(&entity.name)
                .bind(&entity.sector)
                .bind(&entity.industry)
                .bind(&groups)
                .bind(&entity.id)
                .execute(&mut *tx)
                .await?;
                report.updated += 1;
            } else {
                sqlx::query(
                    "INSERT INTO companies (id, name, sector, industry, group_memberships, active) \
                     VALUES (?, ?, ?, ?, ?, 1)",
                )
                .bind(&entity.id)
                .bind(&entity.name)
                .bind(&entity.sector)
                .bind(&entity.industry)
                .bind(&groups)
                .execute(&mut *tx)
                .await?;
                report.inserted += 1;
            }
        }

        tx.commit().await?;
        info!(
            inserted = report.inserted,
            updated = report.updated,
            "entity list upserted"
        );
        Ok(report)
    }

    pub async fn set_active(&self, entity_id: &str, active: bool) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE companies SET active = ? WHERE id = ?")
            .bind(active)
            .bind(entity_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn load_active_entities(&self) -> Result<Vec<Entity>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, sector, industry, group_memberships, active, next_expected_event_date, \
             last_financial_update FROM companies WHERE active = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entity_from_row).collect()
    }

    pub async fn load_entity(&self, entity_id: &str) -> Result<Option<Entity>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, sector, industry, group_memberships, active, next_expected_event_date, \
             last_financial_update FROM companies WHERE id = ?",
        )
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(entity_from_row).transpose()
    }

    /// Writes `last_financial_update = timestamp` for each id in one short transaction.
    ///
    /// Callers invoke this only after the entity's reconciliation has committed.
    pub async fn advance_metadata(
        &self,
        entity_ids: &[EntityId],
        timestamp: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        if entity_ids.is_empty() {
            return Ok(0);
        }
        let metadata_error = |source: sqlx::Error| StoreError::Metadata { source };
        let mut tx = self.pool.begin().await.map_err(metadata_error)?;
        let mut updated = 0;
        for entity_id in entity_ids {
            let result = sqlx::query("UPDATE companies SET last_financial_update = ? WHERE id = ?")
                .bind(timestamp)
                .bind(entity_id)
                .execute(&mut *tx)
                .await
                .map_err(metadata_error)?;
            updated += result.rows_affected();
        }
        tx.commit().await.map_err(metadata_error)?;
        debug!(updated, %timestamp, "advanced last_financial_update");
        Ok(updated)
    }

    pub async fn update_next_event_dates(
        &self,
        updates: &[(EntityId, NaiveDate)],
    ) -> Result<u64, StoreError> {
        if updates.is_empty() {
            return Ok(0);
        }
        let metadata_error = |source: sqlx::Error| StoreError::Metadata { source };
        let mut tx = self.pool.begin().await.map_err(metadata_error)?;
        let mut updated = 0;
        for (entity_id, date) in updates {
            let result =
                sqlx::query("UPDATE companies SET next_expected_event_date = ? WHERE id = ?")
                    .bind(*date)
                    .bind(entity_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(metadata_error)?;
            updated += result.rows_affected();
        }
        tx.commit().await.map_err(metadata_error)?;
        Ok(updated)
    }

    /// Latest stored trade date per entity, for incremental price refreshes.
    pub async fn latest_trade_dates(&self) -> Result<BTreeMap<EntityId, NaiveDate>, StoreError> {
        let rows = sqlx::query(
            "SELECT entity_id, MAX(trade_date) AS last_trade FROM daily_prices GROUP BY entity_id",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = BTreeMap::new();
        for row in rows {
            let entity_id: String = row.try_get("entity_id")?;
            let raw: String = row.try_get("last_trade")?;
            out.insert(entity_id, parse_stored_date("daily_prices.trade_date", &raw)?);
        }
        Ok(out)
    }

    pub async fn count_rows(&self, table: TargetTable) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table.name()))
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    pub async fn load_statement_records(
        &self,
        kind: StatementKind,
        entity_id: &str,
    ) -> Result<Vec<FinancialRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT entity_id, fiscal_date, field_name, period_type, field_value, unit, source, captured_at \
             FROM {} WHERE entity_id = ? ORDER BY fiscal_date, period_type, field_name",
            kind.table_name()
        ))
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<FinancialRecord, StoreError> {
                let period: String = row.try_get("period_type")?;
                let unit: String = row.try_get("unit")?;
                Ok(FinancialRecord {
                    entity_id: row.try_get("entity_id")?,
                    fiscal_date: row.try_get("fiscal_date")?,
                    field_name: row.try_get("field_name")?,
                    field_value: row.try_get("field_value")?,
                    unit: Unit::from_str(&unit).map_err(|_| StoreError::Decode {
                        column: "unit",
                        value: unit.clone(),
                    })?,
                    source: row.try_get("source")?,
                    period_type: PeriodType::from_str(&period).map_err(|_| StoreError::Decode {
                        column: "period_type",
                        value: period.clone(),
                    })?,
                    captured_at: row.try_get("captured_at")?,
                })
            })
            .collect()
    }

    pub async fn load_prices(&self, entity_id: &str) -> Result<Vec<PriceRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT entity_id, trade_date, open_price, close_price, high_price, low_price, volume, captured_at \
             FROM daily_prices WHERE entity_id = ? ORDER BY trade_date",
        )
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<PriceRecord, StoreError> {
                Ok(PriceRecord {
                    entity_id: row.try_get("entity_id")?,
                    trade_date: row.try_get("trade_date")?,
                    open: row.try_get("open_price")?,
                    close: row.try_get("close_price")?,
                    high: row.try_get("high_price")?,
                    low: row.try_get("low_price")?,
                    volume: row.try_get("volume")?,
                    captured_at: row.try_get("captured_at")?,
                })
            })
            .collect()
    }
}

fn entity_from_row(row: &SqliteRow) -> Result<Entity, StoreError> {
    let id: String = row.try_get("id")?;
    let groups: String = row.try_get("group_memberships")?;
    let group_weights = serde_json::from_str(&groups).map_err(|source| StoreError::Json {
        entity_id: id.clone(),
        source,
    })?;
    Ok(Entity {
        name: row.try_get("name")?,
        sector: row.try_get("sector")?,
        industry: row.try_get("industry")?,
        group_weights,
        active: row.try_get("active")?,
        next_expected_event_date: row.try_get("next_expected_event_date")?,
        last_financial_update: row.try_get("last_financial_update")?,
        id,
    })
}

fn parse_stored_date(column: &'static str, raw: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(raw.get(..10).unwrap_or(raw), "%Y-%m-%d").map_err(|_| {
        StoreError::Decode {
            column,
            value: raw.to_string(),
        }
    })
}

#[derive(Debug, Clone)]
pub struct ArchivedPayload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Write-once archive of raw provider payloads, addressed by capture time, entity and hash.
#[derive(Debug, Clone)]
pub struct PayloadArchive {
    root: PathBuf,
}

impl PayloadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn payload_relative_path(
        &self,
        captured_at: DateTime<Utc>,
        entity_id: &str,
        dataset: &str,
        content_hash: &str,
    ) -> PathBuf {
        PathBuf::from(captured_at.format("%Y%m%d_%H%M%S").to_string())
            .join(entity_id)
            .join(format!("{dataset}-{content_hash}.json"))
    }

    /// Writes through a temp file + rename; an existing path means the payload is already archived.
    pub async fn store_payload(
        &self,
        captured_at: DateTime<Utc>,
        entity_id: &str,
        dataset: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPayload> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            self.payload_relative_path(captured_at, entity_id, dataset, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let archived = |deduplicated| ArchivedPayload {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp payload file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp payload file {}", temp_path.display()))?;
        file.flush().await?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            if err.kind() == std::io::ErrorKind::AlreadyExists {
                return Ok(archived(true));
            }
            return Err(err).with_context(|| {
                format!(
                    "renaming temp payload {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }
        Ok(archived(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::{tempdir, TempDir};

    async fn test_store() -> (TempDir, Store) {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("finsync.db").display());
        let store = Store::connect(&url).await.expect("connect");
        store.migrate().await.expect("migrate");
        (dir, store)
    }

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, 12, 0, 0).single().expect("ts")
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("date")
    }

    fn fact(entity: &str, field: &str, value: f64, captured_at: DateTime<Utc>) -> FinancialRecord {
        FinancialRecord {
            entity_id: entity.to_string(),
            fiscal_date: date(2025, 9, 30),
            field_name: field.to_string(),
            field_value: Some(value),
            unit: Unit::Currency,
            source: "yfinance".to_string(),
            period_type: PeriodType::Annual,
            captured_at,
        }
    }

    fn bar(entity: &str, day: u32, close: f64, volume: i64) -> PriceRecord {
        PriceRecord {
            entity_id: entity.to_string(),
            trade_date: date(2026, 2, day),
            open: close - 1.0,
            close,
            high: close + 1.0,
            low: close - 2.0,
            volume,
            captured_at: ts(1),
        }
    }

    #[test]
    fn merge_sql_joins_on_the_natural_key() {
        let layout = TargetTable::Statement(StatementKind::Income).layout();
        let sql = layout.merge_sql();
        assert!(sql.contains("ON CONFLICT (entity_id, fiscal_date, field_name, period_type)"));
        assert!(sql.contains("field_value = excluded.field_value"));
        assert!(!sql.contains("entity_id = excluded.entity_id"));

        let prices = TargetTable::DailyPrices.layout();
        assert!(prices
            .staging_ddl()
            .ends_with("PRIMARY KEY (entity_id, trade_date))"));
    }

    #[tokio::test]
    async fn connect_reports_unreachable_store() {
        let dir = tempdir().expect("tempdir");
        let url = format!(
            "sqlite://{}",
            dir.path().join("missing").join("nope.db").display()
        );
        let err = Store::connect(&url).await.expect_err("must fail");
        assert!(matches!(err, StoreError::Connection { .. }));
    }

    #[tokio::test]
    async fn reconciling_the_same_batch_twice_is_idempotent() {
        let (_dir, store) = test_store().await;
        let batch = vec![
            fact("AAPL", "Total Revenue", 100.0, ts(1)),
            fact("AAPL", "Net Income", 20.0, ts(1)),
        ];

        let first = store
            .reconcile_statements(StatementKind::Income, &batch)
            .await
            .expect("first");
        assert_eq!((first.staged, first.matched, first.inserted), (2, 0, 2));

        let second = store
            .reconcile_statements(StatementKind::Income, &batch)
            .await
            .expect("second");
        assert_eq!((second.staged, second.matched, second.inserted), (2, 2, 0));

        let count = store
            .count_rows(TargetTable::Statement(StatementKind::Income))
            .await
            .expect("count");
        assert_eq!(count, 2);
        let stored = store
            .load_statement_records(StatementKind::Income, "AAPL")
            .await
            .expect("load");
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|r| r.captured_at == ts(1)));
    }

    #[tokio::test]
    async fn last_write_wins_on_matching_key() {
        let (_dir, store) = test_store().await;
        store
            .reconcile_statements(
                StatementKind::Balance,
                &[fact("MSFT", "Total Assets", 1.0, ts(1))],
            )
            .await
            .expect("first");
        store
            .reconcile_statements(
                StatementKind::Balance,
                &[fact("MSFT", "Total Assets", 2.0, ts(2))],
            )
            .await
            .expect("second");

        let stored = store
            .load_statement_records(StatementKind::Balance, "MSFT")
            .await
            .expect("load");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].field_value, Some(2.0));
        assert_eq!(stored[0].captured_at, ts(2));
    }

    #[tokio::test]
    async fn duplicate_keys_inside_one_batch_collapse_to_the_last() {
        let (_dir, store) = test_store().await;
        let report = store
            .reconcile_statements(
                StatementKind::CashFlow,
                &[
                    fact("NVDA", "Free Cash Flow", 5.0, ts(1)),
                    fact("NVDA", "Free Cash Flow", 7.0, ts(1)),
                ],
            )
            .await
            .expect("reconcile");
        assert_eq!(report.staged, 1);
        let stored = store
            .load_statement_records(StatementKind::CashFlow, "NVDA")
            .await
            .expect("load");
        assert_eq!(stored[0].field_value, Some(7.0));
    }

    #[tokio::test]
    async fn rows_missing_from_the_batch_are_left_untouched() {
        let (_dir, store) = test_store().await;
        store
            .reconcile_prices(&[bar("AAPL", 2, 10.0, 100), bar("AAPL", 3, 11.0, 100)])
            .await
            .expect("seed");
        store
            .reconcile_prices(&[bar("AAPL", 3, 12.0, 100), bar("AAPL", 4, 13.0, 100)])
            .await
            .expect("merge");

        let prices = store.load_prices("AAPL").await.expect("load");
        let closes: Vec<_> = prices.iter().map(|p| p.close).collect();
        assert_eq!(closes, vec![10.0, 12.0, 13.0]);
    }

    #[tokio::test]
    async fn failed_merge_rolls_back_the_whole_batch() {
        let (_dir, store) = test_store().await;
        let err = store
            .reconcile_prices(&[bar("AAPL", 2, 10.0, 100), bar("AAPL", 3, 11.0, -5)])
            .await
            .expect_err("volume check must fail");
        assert!(matches!(
            err,
            StoreError::Reconciliation {
                table: "daily_prices",
                ..
            }
        ));
        assert_eq!(
            store.count_rows(TargetTable::DailyPrices).await.expect("count"),
            0
        );

        // The staging table does not outlive the failed transaction.
        let report = store
            .reconcile_prices(&[bar("AAPL", 2, 10.0, 100)])
            .await
            .expect("retry");
        assert_eq!(report.inserted, 1);
    }

    #[tokio::test]
    async fn mismatched_table_is_rejected() {
        let (_dir, store) = test_store().await;
        let err = store
            .reconcile(TargetTable::DailyPrices, &[fact("AAPL", "x", 1.0, ts(1))])
            .await
            .expect_err("mismatch");
        assert!(matches!(err, StoreError::TableMismatch { .. }));
    }

    #[tokio::test]
    async fn entity_upsert_overwrites_descriptive_fields_only() {
        let (_dir, store) = test_store().await;
        let mut apple = EntityUpsert {
            id: "AAPL".into(),
            name: "Apple".into(),
            sector: None,
            industry: None,
            group_weights: BTreeMap::from([("SPY".to_string(), 6.5)]),
        };
        let first = store.upsert_entities(&[apple.clone()]).await.expect("insert");
        assert_eq!(first, EntityUpsertReport { inserted: 1, updated: 0 });

        store
            .advance_metadata(&["AAPL".to_string()], ts(4))
            .await
            .expect("advance");

        apple.name = "Apple Inc.".into();
        apple.sector = Some("Technology".into());
        let second = store.upsert_entities(&[apple]).await.expect("update");
        assert_eq!(second, EntityUpsertReport { inserted: 0, updated: 1 });

        let stored = store.load_entity("AAPL").await.expect("load").expect("row");
        assert_eq!(stored.name, "Apple Inc.");
        assert_eq!(stored.sector.as_deref(), Some("Technology"));
        assert_eq!(stored.group_weights.get("SPY"), Some(&6.5));
        assert_eq!(stored.last_financial_update, Some(ts(4)));
    }

    #[tokio::test]
    async fn metadata_updates_only_touch_named_entities() {
        let (_dir, store) = test_store().await;
        let snapshot: Vec<_> = ["A", "B"]
            .iter()
            .map(|id| EntityUpsert {
                id: id.to_string(),
                name: id.to_string(),
                sector: None,
                industry: None,
                group_weights: BTreeMap::new(),
            })
            .collect();
        store.upsert_entities(&snapshot).await.expect("seed");

        let advanced = store
            .advance_metadata(&["A".to_string(), "UNKNOWN".to_string()], ts(5))
            .await
            .expect("advance");
        assert_eq!(advanced, 1);
        store
            .update_next_event_dates(&[("B".to_string(), date(2026, 4, 30))])
            .await
            .expect("event");

        let entities = store.load_active_entities().await.expect("load");
        assert_eq!(entities[0].last_financial_update, Some(ts(5)));
        assert_eq!(entities[1].last_financial_update, None);
        assert_eq!(entities[1].next_expected_event_date, Some(date(2026, 4, 30)));

        assert!(store.set_active("B", false).await.expect("deactivate"));
        assert_eq!(store.load_active_entities().await.expect("load").len(), 1);
    }

    #[tokio::test]
    async fn latest_trade_dates_per_entity() {
        let (_dir, store) = test_store().await;
        store
            .reconcile_prices(&[
                bar("AAPL", 2, 1.0, 1),
                bar("AAPL", 9, 1.0, 1),
                bar("MSFT", 5, 1.0, 1),
            ])
            .await
            .expect("seed");
        let latest = store.latest_trade_dates().await.expect("latest");
        assert_eq!(latest.get("AAPL"), Some(&date(2026, 2, 9)));
        assert_eq!(latest.get("MSFT"), Some(&date(2026, 2, 5)));
    }

    #[tokio::test]
    async fn archive_writes_once_per_content_hash() {
        let dir = tempdir().expect("tempdir");
        let archive = PayloadArchive::new(dir.path());
        let first = archive
            .store_payload(ts(1), "AAPL", "statements", b"{\"a\":1}")
            .await
            .expect("first");
        let second = archive
            .store_payload(ts(1), "AAPL", "statements", b"{\"a\":1}")
            .await
            .expect("second");
        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
    }
}
