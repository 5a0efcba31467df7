//! Sync pipeline orchestration: staleness evaluation, chunked fetch/normalize/reconcile
//! batches, price and event-calendar refreshes, run reports and scheduling.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, SubsecRound, TimeZone, Utc};
use finsync_adapters::{
    normalize_prices, normalize_statements, with_timeout, FetchContext, FetchError,
    FixtureFetcher, HttpProviderConfig, HttpProviderFetcher, MarketDataFetcher, PriceRange,
    UnitClassifier,
};
use finsync_core::{
    clean_entity_id, Entity, EntityId, EntityStage, EntityState, EntityUpsert, FinancialRecord,
    StatementKind,
};
use finsync_storage::{MergeRecord, PayloadArchive, Store, TargetTable};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

pub const CRATE_NAME: &str = "finsync-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Fixtures,
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceStrategy {
    /// Re-download the whole history every run.
    Full,
    /// Request from the latest stored trade date, inclusive.
    Incremental,
}

/// Thresholds for the staleness rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessPolicy {
    pub grace_days: i64,
    pub ceiling_days: i64,
}

impl Default for StalenessPolicy {
    fn default() -> Self {
        Self {
            grace_days: 1,
            ceiling_days: 730,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub workspace_root: PathBuf,
    pub provider: ProviderKind,
    pub provider_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    pub chunk_size: usize,
    pub fetch_concurrency: usize,
    pub price_strategy: PriceStrategy,
    pub staleness: StalenessPolicy,
    pub archive_dir: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://finsync.db".to_string(),
            workspace_root: PathBuf::from("."),
            provider: ProviderKind::Fixtures,
            provider_url: "http://localhost:8085".to_string(),
            user_agent: "finsync-bot/0.1".to_string(),
            http_timeout_secs: 20,
            fetch_timeout_secs: 60,
            chunk_size: 50,
            fetch_concurrency: 1,
            price_strategy: PriceStrategy::Incremental,
            staleness: StalenessPolicy::default(),
            archive_dir: None,
            scheduler_enabled: false,
            sync_cron_1: "0 0 6 * * *".to_string(),
            sync_cron_2: "0 0 18 * * *".to_string(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            workspace_root: std::env::var("FINSYNC_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            provider: match std::env::var("FINSYNC_PROVIDER").as_deref() {
                Ok("http") | Ok("HTTP") => ProviderKind::Http,
                _ => ProviderKind::Fixtures,
            },
            provider_url: std::env::var("FINSYNC_PROVIDER_URL").unwrap_or(defaults.provider_url),
            user_agent: std::env::var("FINSYNC_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("FINSYNC_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            fetch_timeout_secs: env_parse("FINSYNC_FETCH_TIMEOUT_SECS")
                .unwrap_or(defaults.fetch_timeout_secs),
            chunk_size: env_parse("FINSYNC_CHUNK_SIZE").unwrap_or(defaults.chunk_size),
            fetch_concurrency: env_parse("FINSYNC_FETCH_CONCURRENCY")
                .unwrap_or(defaults.fetch_concurrency),
            price_strategy: match std::env::var("FINSYNC_PRICE_STRATEGY").as_deref() {
                Ok("full") | Ok("FULL") => PriceStrategy::Full,
                _ => PriceStrategy::Incremental,
            },
            staleness: StalenessPolicy {
                grace_days: env_parse("FINSYNC_EVENT_GRACE_DAYS")
                    .unwrap_or(defaults.staleness.grace_days),
                ceiling_days: env_parse("FINSYNC_STALENESS_CEILING_DAYS")
                    .unwrap_or(defaults.staleness.ceiling_days),
            },
            archive_dir: std::env::var("FINSYNC_ARCHIVE_DIR").ok().map(PathBuf::from),
            scheduler_enabled: std::env::var("FINSYNC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron_1: std::env::var("SYNC_CRON_1").unwrap_or(defaults.sync_cron_1),
            sync_cron_2: std::env::var("SYNC_CRON_2").unwrap_or(defaults.sync_cron_2),
        }
    }

    fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs.max(1))
    }
}

// ---------------------------------------------------------------------------
// Staleness
// ---------------------------------------------------------------------------

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

/// Whether one entity's stored financials are due for a refresh at `now`.
///
/// A missing `last_financial_update` always refreshes. A missing next event date leaves
/// only the age ceiling in play.
pub fn needs_refresh(entity: &Entity, now: DateTime<Utc>, policy: &StalenessPolicy) -> bool {
    let Some(last_update) = entity.last_financial_update else {
        return true;
    };
    if last_update < now - chrono::Duration::days(policy.ceiling_days) {
        return true;
    }
    match entity.next_expected_event_date {
        Some(event) => {
            let occurred = start_of_day(event) + chrono::Duration::days(policy.grace_days);
            occurred <= now && last_update <= occurred
        }
        None => false,
    }
}

/// Active entities needing a financial refresh, in input order.
pub fn evaluate_staleness(
    entities: &[Entity],
    now: DateTime<Utc>,
    policy: &StalenessPolicy,
) -> Vec<EntityId> {
    entities
        .iter()
        .filter(|e| e.active && needs_refresh(e, now, policy))
        .map(|e| e.id.clone())
        .collect()
}

/// Active entities whose next event date is unknown or older than their last financial
/// update; their calendar needs re-deriving, not their financials.
pub fn check_earnings_last_update(entities: &[Entity]) -> Vec<EntityId> {
    entities
        .iter()
        .filter(|e| e.active)
        .filter(|e| match (e.next_expected_event_date, e.last_financial_update) {
            (None, _) => true,
            (Some(event), Some(last_update)) => start_of_day(event) < last_update,
            (Some(_), None) => false,
        })
        .map(|e| e.id.clone())
        .collect()
}

/// Contiguous chunks of at most `chunk_size` ids; a zero size is treated as one.
pub fn partition_worklist(worklist: &[EntityId], chunk_size: usize) -> Vec<&[EntityId]> {
    worklist.chunks(chunk_size.max(1)).collect()
}

fn dedupe_preserving_order(ids: &[EntityId]) -> Vec<EntityId> {
    let mut seen = BTreeSet::new();
    ids.iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// Run summaries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityFailure {
    pub entity_id: EntityId,
    pub stage: EntityStage,
    pub cause: String,
}

/// What happened to one chunk of the worklist.
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub chunk_index: usize,
    pub captured_at: DateTime<Utc>,
    pub attempted: Vec<EntityId>,
    pub succeeded: Vec<EntityId>,
    pub failed: Vec<EntityFailure>,
    pub records_written: u64,
    /// Chunk-level failure; entities in `attempted` that are neither succeeded nor failed
    /// were reconciled but did not have their metadata advanced.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub run_id: Uuid,
    pub chunks: Vec<BatchOutcome>,
}

impl BatchSummary {
    pub fn attempted(&self) -> usize {
        self.chunks.iter().map(|c| c.attempted.len()).sum()
    }

    pub fn succeeded(&self) -> Vec<EntityId> {
        self.chunks
            .iter()
            .flat_map(|c| c.succeeded.iter().cloned())
            .collect()
    }

    pub fn failures(&self) -> impl Iterator<Item = &EntityFailure> {
        self.chunks.iter().flat_map(|c| c.failed.iter())
    }

    pub fn records_written(&self) -> u64 {
        self.chunks.iter().map(|c| c.records_written).sum()
    }

    pub fn failure_counts(&self) -> BTreeMap<EntityStage, usize> {
        let mut counts = BTreeMap::new();
        for failure in self.failures() {
            *counts.entry(failure.stage).or_default() += 1;
        }
        counts
    }

    pub fn chunk_errors(&self) -> usize {
        self.chunks.iter().filter(|c| c.error.is_some()).count()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PriceRunSummary {
    pub attempted: usize,
    pub succeeded: Vec<EntityId>,
    pub failed: Vec<EntityFailure>,
    pub records_written: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CalendarRunSummary {
    pub attempted: usize,
    pub updated: Vec<(EntityId, NaiveDate)>,
    /// Fetched fine but the provider had no upcoming event.
    pub no_event: Vec<EntityId>,
    pub failed: Vec<EntityFailure>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EntityListSummary {
    pub submitted: usize,
    pub inserted: u64,
    pub updated: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: &'static str,
    pub success: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub stages: Vec<StageReport>,
    pub entity_list: Option<EntityListSummary>,
    pub worklist_len: usize,
    pub batch: BatchSummary,
    pub prices: Option<PriceRunSummary>,
    pub calendar: Option<CalendarRunSummary>,
    pub reports_dir: String,
}

impl SyncRunSummary {
    /// True when the financial batch attempted something and nothing succeeded.
    pub fn all_entities_failed(&self) -> bool {
        self.batch.attempted() > 0 && self.batch.succeeded().is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntityListFile {
    pub entities: Vec<EntityUpsert>,
}

pub fn load_entity_list(path: &Path) -> Result<Vec<EntityUpsert>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let file: EntityListFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(file.entities)
}

/// Per-entity state tracking for one chunk.
struct ChunkLedger {
    order: Vec<EntityId>,
    states: BTreeMap<EntityId, EntityState>,
    failures: Vec<EntityFailure>,
}

impl ChunkLedger {
    fn new(ids: &[EntityId]) -> Self {
        Self {
            order: ids.to_vec(),
            states: ids
                .iter()
                .map(|id| (id.clone(), EntityState::Pending))
                .collect(),
            failures: Vec::new(),
        }
    }

    fn advance(&mut self, entity_id: &str, next: EntityState) {
        let Some(state) = self.states.get_mut(entity_id) else {
            return;
        };
        match state.advance(next) {
            Ok(advanced) => *state = advanced,
            Err(err) => debug!(entity_id, error = %err, "ignored state transition"),
        }
    }

    fn fail(&mut self, entity_id: &str, stage: EntityStage, cause: String) {
        let before = self.states.get(entity_id).copied();
        self.advance(entity_id, EntityState::Failed(stage));
        if self.states.get(entity_id).copied() != before {
            warn!(entity_id, %stage, %cause, "entity failed");
            self.failures.push(EntityFailure {
                entity_id: entity_id.to_string(),
                stage,
                cause,
            });
        }
    }

    fn in_state(&self, state: EntityState) -> Vec<EntityId> {
        self.order
            .iter()
            .filter(|id| self.states.get(*id) == Some(&state))
            .cloned()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub fn build_fetcher(config: &SyncConfig) -> Result<Arc<dyn MarketDataFetcher>> {
    match config.provider {
        ProviderKind::Fixtures => Ok(Arc::new(FixtureFetcher::new(
            config.workspace_root.join("fixtures"),
        ))),
        ProviderKind::Http => {
            let mut fetcher = HttpProviderFetcher::new(HttpProviderConfig {
                base_url: config.provider_url.clone(),
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                max_concurrency: config.fetch_concurrency.max(1),
                ..Default::default()
            })?;
            if let Some(dir) = &config.archive_dir {
                fetcher = fetcher.with_archive(PayloadArchive::new(dir.clone()));
            }
            Ok(Arc::new(fetcher))
        }
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: Store,
    fetcher: Arc<dyn MarketDataFetcher>,
    units: UnitClassifier,
    span: Span,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        store: Store,
        fetcher: Arc<dyn MarketDataFetcher>,
    ) -> Result<Self> {
        let units = UnitClassifier::from_workspace_root(&config.workspace_root)?;
        Ok(Self {
            config,
            store,
            fetcher,
            units,
            span: info_span!("finsync"),
            run_lock: Mutex::new(()),
        })
    }

    /// Connects to the store (fatal on failure), applies migrations and builds the
    /// configured fetcher.
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let store = Store::connect(&config.database_url)
            .await
            .context("store unreachable")?;
        store.migrate().await.context("applying migrations")?;
        let fetcher = build_fetcher(&config)?;
        Self::new(config, store, fetcher)
    }

    /// Parents every event this pipeline emits to `span`.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn evaluate_staleness(&self) -> Result<Vec<EntityId>> {
        let entities = self
            .store
            .load_active_entities()
            .await
            .context("loading active entities")?;
        let worklist = evaluate_staleness(&entities, Utc::now(), &self.config.staleness);
        info!(parent: &self.span, active = entities.len(), stale = worklist.len(), "evaluated staleness");
        Ok(worklist)
    }

    pub async fn ingest_entity_list(&self, snapshot: &[EntityUpsert]) -> Result<EntityListSummary> {
        // last occurrence of an id wins
        let mut by_id: BTreeMap<EntityId, EntityUpsert> = BTreeMap::new();
        for entity in snapshot {
            let mut cleaned = entity.clone();
            cleaned.id = clean_entity_id(&entity.id);
            if cleaned.id.is_empty() {
                warn!(parent: &self.span, name = %entity.name, "skipping entity without an identifier");
                continue;
            }
            by_id.insert(cleaned.id.clone(), cleaned);
        }
        let cleaned: Vec<EntityUpsert> = by_id.into_values().collect();
        let report = self
            .store
            .upsert_entities(&cleaned)
            .await
            .context("upserting entity list")?;
        Ok(EntityListSummary {
            submitted: cleaned.len(),
            inserted: report.inserted,
            updated: report.updated,
        })
    }

    /// Drives fetch, normalize and reconcile per chunk, then advances metadata for the
    /// entities that made it through. Never aborts on entity or chunk failures.
    pub async fn run_batch(&self, worklist: &[EntityId], chunk_size: usize) -> BatchSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!(parent: &self.span, "sync_run", %run_id);
        self.run_batch_in(run_id, worklist, chunk_size)
            .instrument(span)
            .await
    }

    async fn run_batch_in(
        &self,
        run_id: Uuid,
        worklist: &[EntityId],
        chunk_size: usize,
    ) -> BatchSummary {
        let worklist = dedupe_preserving_order(worklist);
        let chunks = partition_worklist(&worklist, chunk_size);
        info!(entities = worklist.len(), chunks = chunks.len(), "starting financial batch");

        let mut outcomes = Vec::with_capacity(chunks.len());
        for (chunk_index, chunk) in chunks.into_iter().enumerate() {
            let span = info_span!("chunk", chunk_index, chunk_len = chunk.len());
            let outcome = self.run_chunk(run_id, chunk_index, chunk).instrument(span).await;
            outcomes.push(outcome);
        }

        let summary = BatchSummary {
            run_id,
            chunks: outcomes,
        };
        info!(
            attempted = summary.attempted(),
            succeeded = summary.succeeded().len(),
            failed = summary.failures().count(),
            chunk_errors = summary.chunk_errors(),
            records = summary.records_written(),
            "financial batch finished"
        );
        summary
    }

    async fn run_chunk(&self, run_id: Uuid, chunk_index: usize, chunk: &[EntityId]) -> BatchOutcome {
        let captured_at = Utc::now().trunc_subsecs(0);
        let ctx = FetchContext {
            run_id,
            captured_at,
        };
        let mut ledger = ChunkLedger::new(chunk);

        // fetch; never inside a transaction
        let fetched = self.fetch_all(&ctx, chunk).await;

        let mut by_table: BTreeMap<StatementKind, (Vec<FinancialRecord>, BTreeSet<EntityId>)> =
            BTreeMap::new();
        for (entity_id, result) in fetched {
            let raw = match result {
                Ok(raw) => raw,
                Err(err) => {
                    ledger.fail(&entity_id, EntityStage::Fetch, err.to_string());
                    continue;
                }
            };
            ledger.advance(&entity_id, EntityState::Fetched);

            match normalize_statements(&entity_id, &raw, captured_at, &self.units) {
                Ok(normalized) => {
                    ledger.advance(&entity_id, EntityState::Normalized);
                    debug!(
                        entity_id = %entity_id,
                        records = normalized.record_count(),
                        gaps = normalized.gaps.len(),
                        "normalized statements"
                    );
                    for (kind, records) in normalized.records {
                        if records.is_empty() {
                            continue;
                        }
                        let (rows, owners) = by_table.entry(kind).or_default();
                        rows.extend(records);
                        owners.insert(entity_id.clone());
                    }
                }
                Err(err) => ledger.fail(&entity_id, EntityStage::Normalize, err.to_string()),
            }
        }

        let mut records_written = 0;
        for (kind, (records, owners)) in &by_table {
            let (written, rejected) = self
                .reconcile_isolated(TargetTable::Statement(*kind), records)
                .await;
            records_written += written;
            if !rejected.is_empty() {
                error!(table = kind.table_name(), entities = owners.len(), rejected = rejected.len(), "table reconciliation failed");
            }
            for (entity_id, cause) in rejected {
                ledger.fail(&entity_id, EntityStage::Reconcile, cause);
            }
        }

        for entity_id in ledger.in_state(EntityState::Normalized) {
            ledger.advance(&entity_id, EntityState::Reconciled);
        }

        // metadata strictly after the reconciliation commits above
        let reconciled = ledger.in_state(EntityState::Reconciled);
        let mut chunk_error = None;
        match self.store.advance_metadata(&reconciled, captured_at).await {
            Ok(_) => {
                for entity_id in &reconciled {
                    ledger.advance(entity_id, EntityState::MetadataAdvanced);
                }
            }
            Err(err) => {
                error!(entities = reconciled.len(), error = %err, "advancing metadata failed; entities stay stale");
                chunk_error = Some(format!("advancing metadata: {err}"));
            }
        }

        let succeeded = ledger.in_state(EntityState::MetadataAdvanced);
        info!(
            attempted = chunk.len(),
            succeeded = succeeded.len(),
            failed = ledger.failures.len(),
            records_written,
            "chunk finished"
        );
        BatchOutcome {
            chunk_index,
            captured_at,
            attempted: chunk.to_vec(),
            succeeded,
            failed: ledger.failures,
            records_written,
            error: chunk_error,
        }
    }

    /// Merges `records` into `table` as one transaction. When that merge is rolled back,
    /// each entity's rows are merged again on their own, so only entities whose own rows
    /// are rejected come back in the returned map (entity id to cause).
    async fn reconcile_isolated<R: MergeRecord + Clone>(
        &self,
        table: TargetTable,
        records: &[R],
    ) -> (u64, BTreeMap<EntityId, String>) {
        let mut rejected = BTreeMap::new();
        if records.is_empty() {
            return (0, rejected);
        }
        let err = match self.store.reconcile(table, records).await {
            Ok(report) => return (report.rows_affected, rejected),
            Err(err) => err,
        };
        warn!(table = table.name(), error = %err, "combined merge rolled back; merging per entity");

        let mut by_entity: BTreeMap<EntityId, Vec<R>> = BTreeMap::new();
        for record in records {
            by_entity
                .entry(record.entity_id().to_string())
                .or_default()
                .push(record.clone());
        }
        let mut written = 0;
        for (entity_id, rows) in by_entity {
            match self.store.reconcile(table, &rows).await {
                Ok(report) => written += report.rows_affected,
                Err(err) => {
                    warn!(table = table.name(), entity_id = %entity_id, error = %err, "entity merge rejected");
                    rejected.insert(entity_id, err.to_string());
                }
            }
        }
        (written, rejected)
    }

    async fn fetch_all(
        &self,
        ctx: &FetchContext,
        chunk: &[EntityId],
    ) -> Vec<(EntityId, Result<finsync_adapters::RawStatements, FetchError>)> {
        let timeout = self.config.fetch_timeout();
        stream::iter(chunk.iter().cloned())
            .map(|entity_id| async move {
                let result = with_timeout(
                    &entity_id,
                    timeout,
                    self.fetcher.fetch_statements(ctx, &entity_id),
                )
                .await;
                (entity_id, result)
            })
            .buffered(self.config.fetch_concurrency.max(1))
            .collect()
            .await
    }

    /// Refreshes daily prices for `entity_ids`, chunked like the financial batch.
    pub async fn refresh_prices(&self, entity_ids: &[EntityId]) -> Result<PriceRunSummary> {
        let entity_ids = dedupe_preserving_order(entity_ids);
        let latest = match self.config.price_strategy {
            PriceStrategy::Incremental => self
                .store
                .latest_trade_dates()
                .await
                .context("loading latest trade dates")?,
            PriceStrategy::Full => BTreeMap::new(),
        };
        let timeout = self.config.fetch_timeout();
        let mut summary = PriceRunSummary {
            attempted: entity_ids.len(),
            ..Default::default()
        };

        for chunk in partition_worklist(&entity_ids, self.config.chunk_size) {
            let ctx = FetchContext {
                run_id: Uuid::new_v4(),
                captured_at: Utc::now().trunc_subsecs(0),
            };
            let ctx = &ctx;
            let latest = &latest;
            let fetched: Vec<_> = stream::iter(chunk.iter().cloned())
                .map(|entity_id| async move {
                    let range = latest
                        .get(&entity_id)
                        .map_or(PriceRange::full(), |d| PriceRange::starting(*d));
                    let result = with_timeout(
                        &entity_id,
                        timeout,
                        self.fetcher.fetch_prices(ctx, &entity_id, range),
                    )
                    .await;
                    (entity_id, result)
                })
                .buffered(self.config.fetch_concurrency.max(1))
                .collect()
                .await;

            let mut records = Vec::new();
            let mut with_rows = Vec::new();
            let mut ok_ids = Vec::new();
            for (entity_id, result) in fetched {
                let frame = match result {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(parent: &self.span, entity_id = %entity_id, stage = "fetch", cause = %err, "price fetch failed");
                        summary.failed.push(EntityFailure {
                            entity_id,
                            stage: EntityStage::Fetch,
                            cause: err.to_string(),
                        });
                        continue;
                    }
                };
                match normalize_prices(&entity_id, &frame, ctx.captured_at) {
                    Ok(rows) if rows.is_empty() => {
                        warn!(parent: &self.span, entity_id = %entity_id, "provider returned no prices");
                        ok_ids.push(entity_id);
                    }
                    Ok(rows) => {
                        records.extend(rows);
                        with_rows.push(entity_id);
                    }
                    Err(err) => {
                        warn!(parent: &self.span, entity_id = %entity_id, stage = "normalize", cause = %err, "price normalization failed");
                        summary.failed.push(EntityFailure {
                            entity_id,
                            stage: EntityStage::Normalize,
                            cause: err.to_string(),
                        });
                    }
                }
            }

            let (written, rejected) = self
                .reconcile_isolated(TargetTable::DailyPrices, &records)
                .await;
            summary.records_written += written;
            if !rejected.is_empty() {
                error!(parent: &self.span, entities = with_rows.len(), rejected = rejected.len(), "price reconciliation failed");
            }
            for entity_id in with_rows {
                match rejected.get(&entity_id) {
                    Some(cause) => summary.failed.push(EntityFailure {
                        entity_id,
                        stage: EntityStage::Reconcile,
                        cause: cause.clone(),
                    }),
                    None => ok_ids.push(entity_id),
                }
            }
            summary.succeeded.extend(ok_ids);
        }

        info!(
            parent: &self.span,
            attempted = summary.attempted,
            succeeded = summary.succeeded.len(),
            failed = summary.failed.len(),
            records = summary.records_written,
            "price refresh finished"
        );
        Ok(summary)
    }

    /// Re-derives next expected event dates. Failures and absent dates keep stored values.
    pub async fn refresh_event_calendar(&self, entity_ids: &[EntityId]) -> Result<CalendarRunSummary> {
        let entity_ids = dedupe_preserving_order(entity_ids);
        let ctx = FetchContext {
            run_id: Uuid::new_v4(),
            captured_at: Utc::now().trunc_subsecs(0),
        };
        let ctx = &ctx;
        let timeout = self.config.fetch_timeout();
        let fetched: Vec<_> = stream::iter(entity_ids.iter().cloned())
            .map(|entity_id| async move {
                let result = with_timeout(
                    &entity_id,
                    timeout,
                    self.fetcher.fetch_next_event_date(ctx, &entity_id),
                )
                .await;
                (entity_id, result)
            })
            .buffered(self.config.fetch_concurrency.max(1))
            .collect()
            .await;

        let mut summary = CalendarRunSummary {
            attempted: entity_ids.len(),
            ..Default::default()
        };
        for (entity_id, result) in fetched {
            match result {
                Ok(Some(date)) => summary.updated.push((entity_id, date)),
                Ok(None) => summary.no_event.push(entity_id),
                Err(err) => {
                    warn!(parent: &self.span, entity_id = %entity_id, stage = "fetch", cause = %err, "calendar fetch failed");
                    summary.failed.push(EntityFailure {
                        entity_id,
                        stage: EntityStage::Fetch,
                        cause: err.to_string(),
                    });
                }
            }
        }

        self.store
            .update_next_event_dates(&summary.updated)
            .await
            .context("writing next event dates")?;
        info!(
            parent: &self.span,
            attempted = summary.attempted,
            updated = summary.updated.len(),
            no_event = summary.no_event.len(),
            failed = summary.failed.len(),
            "event calendar refresh finished"
        );
        Ok(summary)
    }

    /// Entity list, financial batch, prices, then event calendar.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!(parent: &self.span, "sync_run", %run_id);
        self.run_stages(run_id).instrument(span).await
    }

    async fn run_stages(&self, run_id: Uuid) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let mut stages = Vec::new();

        let list_path = self.config.workspace_root.join("entities.yaml");
        let entity_list = if list_path.exists() {
            let ingested = match load_entity_list(&list_path) {
                Ok(snapshot) => self.ingest_entity_list(&snapshot).await,
                Err(err) => Err(err),
            };
            match ingested {
                Ok(report) => {
                    stages.push(StageReport {
                        stage: "entity_list",
                        success: true,
                        detail: format!("{} inserted, {} updated", report.inserted, report.updated),
                    });
                    Some(report)
                }
                Err(err) => {
                    error!(error = %format!("{err:#}"), "entity list stage failed");
                    stages.push(StageReport {
                        stage: "entity_list",
                        success: false,
                        detail: format!("{err:#}"),
                    });
                    None
                }
            }
        } else {
            stages.push(StageReport {
                stage: "entity_list",
                success: true,
                detail: format!("skipped: {} not found", list_path.display()),
            });
            None
        };

        let entities = self
            .store
            .load_active_entities()
            .await
            .context("loading active entities")?;
        let worklist = evaluate_staleness(&entities, Utc::now(), &self.config.staleness);
        let calendar_worklist = check_earnings_last_update(&entities);
        info!(
            active = entities.len(),
            stale = worklist.len(),
            calendar_stale = calendar_worklist.len(),
            "evaluated staleness"
        );

        let batch = self
            .run_batch_in(run_id, &worklist, self.config.chunk_size)
            .await;
        stages.push(StageReport {
            stage: "financials",
            success: worklist.is_empty() || !batch.succeeded().is_empty(),
            detail: format!(
                "{} attempted, {} succeeded, {} failed, {} rows",
                batch.attempted(),
                batch.succeeded().len(),
                batch.failures().count(),
                batch.records_written()
            ),
        });

        let active_ids: Vec<EntityId> = entities.iter().map(|e| e.id.clone()).collect();
        let prices = match self.refresh_prices(&active_ids).await {
            Ok(summary) => {
                stages.push(StageReport {
                    stage: "prices",
                    success: summary.attempted == 0 || !summary.succeeded.is_empty(),
                    detail: format!(
                        "{} succeeded, {} failed, {} rows",
                        summary.succeeded.len(),
                        summary.failed.len(),
                        summary.records_written
                    ),
                });
                Some(summary)
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "price stage failed");
                stages.push(StageReport {
                    stage: "prices",
                    success: false,
                    detail: format!("{err:#}"),
                });
                None
            }
        };

        let mut calendar_targets = calendar_worklist;
        calendar_targets.extend(batch.succeeded());
        let calendar = match self.refresh_event_calendar(&calendar_targets).await {
            Ok(summary) => {
                stages.push(StageReport {
                    stage: "calendar",
                    success: true,
                    detail: format!(
                        "{} updated, {} without event, {} failed",
                        summary.updated.len(),
                        summary.no_event.len(),
                        summary.failed.len()
                    ),
                });
                Some(summary)
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "calendar stage failed");
                stages.push(StageReport {
                    stage: "calendar",
                    success: false,
                    detail: format!("{err:#}"),
                });
                None
            }
        };

        let finished_at = Utc::now();
        let reports_dir = self
            .config
            .workspace_root
            .join("reports")
            .join(run_id.to_string());
        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds(),
            stages,
            entity_list,
            worklist_len: worklist.len(),
            batch,
            prices,
            calendar,
            reports_dir: reports_dir.display().to_string(),
        };
        self.write_reports(&reports_dir, &summary).await?;

        info!(
            duration_ms = summary.duration_ms,
            stages_ok = summary.stages.iter().filter(|s| s.success).count(),
            stages = summary.stages.len(),
            "sync run finished"
        );
        Ok(summary)
    }

    async fn write_reports(&self, reports_dir: &Path, summary: &SyncRunSummary) -> Result<()> {
        fs::create_dir_all(reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(reports_dir.join("run_summary.json"), json)
            .await
            .context("writing run_summary.json")?;

        fs::write(reports_dir.join("run_brief.md"), render_brief(summary))
            .await
            .context("writing run_brief.md")?;
        Ok(())
    }

    /// Builds cron jobs running [`SyncPipeline::run_once`]; overlapping triggers are skipped.
    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in [&self.config.sync_cron_1, &self.config.sync_cron_2] {
            let pipeline = Arc::clone(&self);
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let pipeline = Arc::clone(&pipeline);
                Box::pin(async move {
                    let Ok(_guard) = pipeline.run_lock.try_lock() else {
                        warn!(parent: &pipeline.span, "previous sync still running; skipping trigger");
                        return;
                    };
                    match pipeline.run_once().await {
                        Ok(summary) => info!(
                            parent: &pipeline.span,
                            run_id = %summary.run_id,
                            reports = %summary.reports_dir,
                            "scheduled sync finished"
                        ),
                        Err(err) => error!(parent: &pipeline.span, error = %format!("{err:#}"), "scheduled sync failed"),
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }
}

pub fn render_brief(summary: &SyncRunSummary) -> String {
    let stages = summary
        .stages
        .iter()
        .map(|s| {
            format!(
                "- {}: {} ({})",
                s.stage,
                if s.success { "ok" } else { "FAILED" },
                s.detail
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    let failures = summary
        .batch
        .failures()
        .map(|f| format!("- {} [{}]: {}", f.entity_id, f.stage, f.cause))
        .collect::<Vec<_>>();
    let failures = if failures.is_empty() {
        "none".to_string()
    } else {
        failures.join("\n")
    };

    format!(
        "# Financial Sync Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Duration: {} ms\n- Stale entities: {}\n- Refreshed: {}\n- Rows written: {}\n\n## Stages\n{}\n\n## Entity Failures\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.duration_ms,
        summary.worklist_len,
        summary.batch.succeeded().len(),
        summary.batch.records_written(),
        stages,
        failures
    )
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::connect(config).await?;
    pipeline.run_once().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use finsync_adapters::{
        RawCalendar, RawPriceFrame, RawStatement, RawStatementSet, RawStatements, WideRow,
    };
    use finsync_core::PeriodType;
    use finsync_storage::TargetTable;
    use tempfile::TempDir;

    fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).single().expect("ts")
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("date")
    }

    fn entity(id: &str, next: Option<NaiveDate>, last: Option<DateTime<Utc>>) -> Entity {
        let mut e = Entity::new(id, id);
        e.next_expected_event_date = next;
        e.last_financial_update = last;
        e
    }

    #[test]
    fn never_updated_entities_are_stale() {
        let now = ts(2026, 3, 1);
        let entities = vec![
            entity("A", None, None),
            entity("B", Some(date(2026, 5, 1)), None),
        ];
        assert_eq!(
            evaluate_staleness(&entities, now, &StalenessPolicy::default()),
            vec!["A".to_string(), "B".to_string()]
        );
    }

    #[test]
    fn ceiling_applies_regardless_of_event_date() {
        let now = ts(2026, 3, 1);
        let old = now - chrono::Duration::days(731);
        let entities = vec![
            entity("OLD_FUTURE_EVENT", Some(date(2026, 6, 1)), Some(old)),
            entity("OLD_NO_EVENT", None, Some(old)),
            entity("RECENT_NO_EVENT", None, Some(now - chrono::Duration::days(30))),
        ];
        assert_eq!(
            evaluate_staleness(&entities, now, &StalenessPolicy::default()),
            vec!["OLD_FUTURE_EVENT".to_string(), "OLD_NO_EVENT".to_string()]
        );
    }

    #[test]
    fn refreshed_after_event_is_not_stale() {
        let d = date(2026, 1, 28);
        let last = start_of_day(d) + chrono::Duration::days(2);
        let now = start_of_day(d) + chrono::Duration::days(5);
        let refreshed = entity("AAPL", Some(d), Some(last));
        assert!(!needs_refresh(&refreshed, now, &StalenessPolicy::default()));

        let before_event = entity("MSFT", Some(d), Some(start_of_day(d) - chrono::Duration::days(10)));
        assert!(needs_refresh(&before_event, now, &StalenessPolicy::default()));

        // event has not yet cleared its grace day
        let early = start_of_day(d) + chrono::Duration::hours(12);
        assert!(!needs_refresh(&before_event, early, &StalenessPolicy::default()));
    }

    #[test]
    fn inactive_entities_are_never_in_the_worklist() {
        let mut e = entity("GONE", None, None);
        e.active = false;
        assert!(evaluate_staleness(&[e.clone()], ts(2026, 3, 1), &StalenessPolicy::default()).is_empty());
        assert!(check_earnings_last_update(&[e]).is_empty());
    }

    #[test]
    fn calendar_check_flags_event_dates_older_than_last_update() {
        let entities = vec![
            entity("STALE_EVENT", Some(date(2026, 1, 28)), Some(ts(2026, 2, 3))),
            entity("FRESH_EVENT", Some(date(2026, 4, 30)), Some(ts(2026, 2, 3))),
            entity("NO_EVENT", None, Some(ts(2026, 2, 3))),
            entity("NEVER_UPDATED", Some(date(2026, 1, 28)), None),
        ];
        assert_eq!(
            check_earnings_last_update(&entities),
            vec!["STALE_EVENT".to_string(), "NO_EVENT".to_string()]
        );
        // independent of the main rule: STALE_EVENT is not financially stale
        let main = evaluate_staleness(&entities, ts(2026, 2, 10), &StalenessPolicy::default());
        assert!(!main.contains(&"STALE_EVENT".to_string()));
    }

    #[test]
    fn calendar_check_treats_the_event_as_midnight() {
        // updated at noon on the event day itself: the event is already behind it
        let same_day = entity("X", Some(date(2026, 2, 3)), Some(ts(2026, 2, 3)));
        assert_eq!(check_earnings_last_update(&[same_day]), vec!["X".to_string()]);

        let at_midnight = entity("Y", Some(date(2026, 2, 3)), Some(start_of_day(date(2026, 2, 3))));
        assert!(check_earnings_last_update(&[at_midnight]).is_empty());
    }

    #[test]
    fn worklists_partition_into_contiguous_chunks() {
        let ids: Vec<EntityId> = (0..120).map(|i| format!("E{i:03}")).collect();
        let chunks = partition_worklist(&ids, 50);
        assert_eq!(chunks.iter().map(|c| c.len()).collect::<Vec<_>>(), vec![50, 50, 20]);
        assert_eq!(chunks[1][0], "E050");
        assert_eq!(partition_worklist(&ids[..3], 0).len(), 3);
        assert!(partition_worklist(&[], 50).is_empty());
    }

    struct OneRowFetcher;

    #[async_trait]
    impl MarketDataFetcher for OneRowFetcher {
        fn provider_id(&self) -> &'static str {
            "one-row"
        }

        async fn fetch_statements(
            &self,
            _ctx: &FetchContext,
            entity_id: &str,
        ) -> Result<RawStatements, FetchError> {
            if entity_id == "DOWN" {
                return Err(FetchError::NotFound {
                    entity_id: entity_id.to_string(),
                    what: "statements",
                });
            }
            Ok(RawStatements {
                entity_id: entity_id.to_string(),
                statements: vec![RawStatementSet {
                    kind: StatementKind::Income,
                    period: PeriodType::Annual,
                    table: RawStatement::Wide {
                        dates: vec!["2025-12-31".into()],
                        rows: vec![WideRow {
                            field: "Total Revenue".into(),
                            values: vec![Some(10.0)],
                        }],
                    },
                }],
            })
        }

        async fn fetch_prices(
            &self,
            _ctx: &FetchContext,
            _entity_id: &str,
            _range: PriceRange,
        ) -> Result<RawPriceFrame, FetchError> {
            Ok(RawPriceFrame::default())
        }

        async fn fetch_next_event_date(
            &self,
            _ctx: &FetchContext,
            _entity_id: &str,
        ) -> Result<Option<NaiveDate>, FetchError> {
            Ok(RawCalendar {
                event_dates: vec!["2026-04-30".into()],
            }
            .next_event_date())
        }
    }

    async fn pipeline(dir: &TempDir) -> SyncPipeline {
        let url = format!("sqlite://{}", dir.path().join("sync.db").display());
        let store = Store::connect(&url).await.expect("connect");
        store.migrate().await.expect("migrate");
        let config = SyncConfig {
            workspace_root: dir.path().to_path_buf(),
            ..Default::default()
        };
        SyncPipeline::new(config, store, Arc::new(OneRowFetcher)).expect("pipeline")
    }

    #[tokio::test]
    async fn fetch_failures_do_not_advance_metadata() {
        let dir = TempDir::new().expect("tempdir");
        let pipeline = pipeline(&dir).await;
        let snapshot: Vec<EntityUpsert> = ["UP", "DOWN"]
            .iter()
            .map(|id| EntityUpsert {
                id: id.to_string(),
                name: id.to_string(),
                sector: None,
                industry: None,
                group_weights: BTreeMap::new(),
            })
            .collect();
        pipeline.ingest_entity_list(&snapshot).await.expect("ingest");

        let worklist = pipeline.evaluate_staleness().await.expect("staleness");
        assert_eq!(worklist, vec!["DOWN".to_string(), "UP".to_string()]);

        let summary = pipeline.run_batch(&worklist, 50).await;
        assert_eq!(summary.succeeded(), vec!["UP".to_string()]);
        assert_eq!(summary.failure_counts().get(&EntityStage::Fetch), Some(&1));
        assert_eq!(summary.records_written(), 1);

        let store = pipeline.store();
        let up = store.load_entity("UP").await.expect("load").expect("UP");
        let down = store.load_entity("DOWN").await.expect("load").expect("DOWN");
        assert_eq!(up.last_financial_update, Some(summary.chunks[0].captured_at));
        assert_eq!(down.last_financial_update, None);
        assert_eq!(
            store.count_rows(TargetTable::Statement(StatementKind::Income)).await.expect("count"),
            1
        );

        // only the failed entity is retried
        let retry = pipeline.evaluate_staleness().await.expect("staleness");
        assert_eq!(retry, vec!["DOWN".to_string()]);
    }

    #[tokio::test]
    async fn run_once_writes_reports_and_refreshes_calendar() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(
            dir.path().join("entities.yaml"),
            "entities:\n  - id: brk.b\n    name: Berkshire\n    group_weights:\n      SPY: 1.7\n",
        )
        .expect("write entities");
        let pipeline = pipeline(&dir).await;

        let summary = pipeline.run_once().await.expect("run");
        assert_eq!(summary.worklist_len, 1);
        assert_eq!(summary.batch.succeeded(), vec!["BRK-B".to_string()]);
        assert!(summary.stages.iter().all(|s| s.success));
        assert!(!summary.all_entities_failed());

        let stored = pipeline
            .store()
            .load_entity("BRK-B")
            .await
            .expect("load")
            .expect("entity");
        assert_eq!(stored.next_expected_event_date, Some(date(2026, 4, 30)));
        assert_eq!(stored.group_weights.get("SPY"), Some(&1.7));

        let reports = PathBuf::from(&summary.reports_dir);
        assert!(reports.join("run_summary.json").exists());
        let brief = std::fs::read_to_string(reports.join("run_brief.md")).expect("brief");
        assert!(brief.contains("Refreshed: 1"));

        // second run: nothing stale, metadata untouched
        let again = pipeline.run_once().await.expect("run");
        assert_eq!(again.worklist_len, 0);
        assert_eq!(again.batch.attempted(), 0);
    }

    #[tokio::test]
    async fn scheduler_is_not_built_when_disabled() {
        let dir = TempDir::new().expect("tempdir");
        let pipeline = Arc::new(pipeline(&dir).await);
        assert!(pipeline.maybe_build_scheduler().await.expect("scheduler").is_none());
    }
}
