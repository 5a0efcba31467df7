//! Market-data fetcher contracts, fixture-first and HTTP fetchers, and the canonical
//! record normalizer that turns provider payloads into long-format rows.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use finsync_core::{
    clean_entity_id, EntityId, FinancialRecord, PeriodType, PriceRecord, StatementKind, Unit,
    DEFAULT_SOURCE,
};
use finsync_storage::PayloadArchive;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "finsync-adapters";

// ---------------------------------------------------------------------------
// Raw provider shapes
// ---------------------------------------------------------------------------

/// One statement table as delivered by the provider, in either orientation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "orientation", rename_all = "snake_case")]
pub enum RawStatement {
    /// Field names as the index, fiscal dates as columns.
    Wide {
        dates: Vec<String>,
        rows: Vec<WideRow>,
    },
    /// Fiscal dates as the index, field names as columns.
    DateIndexed { rows: Vec<DateIndexedRow> },
}

impl RawStatement {
    pub fn is_empty(&self) -> bool {
        match self {
            RawStatement::Wide { dates, rows } => dates.is_empty() || rows.is_empty(),
            RawStatement::DateIndexed { rows } => rows.iter().all(|r| r.fields.is_empty()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WideRow {
    pub field: String,
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateIndexedRow {
    pub date: String,
    pub fields: BTreeMap<String, Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawStatementSet {
    pub kind: StatementKind,
    pub period: PeriodType,
    pub table: RawStatement,
}

/// Every statement the provider returned for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawStatements {
    pub entity_id: EntityId,
    #[serde(default)]
    pub statements: Vec<RawStatementSet>,
}

/// Columnar OHLCV series keyed by a date index.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawPriceFrame {
    #[serde(default)]
    pub index: Vec<String>,
    #[serde(default)]
    pub columns: BTreeMap<String, Vec<Option<f64>>>,
}

impl RawPriceFrame {
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Keeps only index positions whose date is on or after `start`. Unparseable dates are
    /// kept so the normalizer can report them.
    pub fn retain_from(&mut self, start: NaiveDate) {
        let keep: Vec<bool> = self
            .index
            .iter()
            .map(|raw| parse_provider_date(raw).map_or(true, |d| d >= start))
            .collect();
        let mut flags = keep.iter();
        self.index.retain(|_| *flags.next().unwrap_or(&true));
        for values in self.columns.values_mut() {
            let mut flags = keep.iter();
            values.retain(|_| *flags.next().unwrap_or(&true));
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawCalendar {
    #[serde(default)]
    pub event_dates: Vec<String>,
}

impl RawCalendar {
    /// First parseable event date; providers list the upcoming event first.
    pub fn next_event_date(&self) -> Option<NaiveDate> {
        self.event_dates.iter().find_map(|raw| parse_provider_date(raw))
    }
}

/// Requested price history window. `start = None` asks for the full history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PriceRange {
    pub start: Option<NaiveDate>,
}

impl PriceRange {
    pub fn full() -> Self {
        Self { start: None }
    }

    pub fn starting(start: NaiveDate) -> Self {
        Self { start: Some(start) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchContext {
    pub run_id: Uuid,
    pub captured_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Fetcher contract
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("no {what} available for {entity_id}")]
    NotFound {
        entity_id: EntityId,
        what: &'static str,
    },
    #[error("fetch for {entity_id} timed out after {after:?}")]
    Timeout { entity_id: EntityId, after: Duration },
    #[error("decoding {what} for {entity_id}: {message}")]
    Decode {
        entity_id: EntityId,
        what: &'static str,
        message: String,
    },
    #[error("reading fixture {}: {source}", .path.display())]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("fetcher is shut down")]
    Closed,
}

#[async_trait]
pub trait MarketDataFetcher: Send + Sync {
    fn provider_id(&self) -> &'static str;

    async fn fetch_statements(
        &self,
        ctx: &FetchContext,
        entity_id: &str,
    ) -> Result<RawStatements, FetchError>;

    async fn fetch_prices(
        &self,
        ctx: &FetchContext,
        entity_id: &str,
        range: PriceRange,
    ) -> Result<RawPriceFrame, FetchError>;

    async fn fetch_next_event_date(
        &self,
        ctx: &FetchContext,
        entity_id: &str,
    ) -> Result<Option<NaiveDate>, FetchError>;
}

/// Runs `fut`, mapping an elapsed deadline to [`FetchError::Timeout`].
pub async fn with_timeout<T, F>(entity_id: &str, after: Duration, fut: F) -> Result<T, FetchError>
where
    F: std::future::Future<Output = Result<T, FetchError>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout {
            entity_id: entity_id.to_string(),
            after,
        }),
    }
}

/// Serves payloads from `<root>/<ENTITY>/{statements,prices,calendar}.json`.
#[derive(Debug, Clone)]
pub struct FixtureFetcher {
    root: PathBuf,
}

impl FixtureFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn read_fixture<T: DeserializeOwned>(
        &self,
        entity_id: &str,
        file: &str,
        what: &'static str,
    ) -> Result<T, FetchError> {
        let path = self.root.join(entity_id).join(file);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(FetchError::NotFound {
                    entity_id: entity_id.to_string(),
                    what,
                })
            }
            Err(source) => return Err(FetchError::Fixture { path, source }),
        };
        serde_json::from_str(&text).map_err(|err| FetchError::Decode {
            entity_id: entity_id.to_string(),
            what,
            message: err.to_string(),
        })
    }
}

#[async_trait]
impl MarketDataFetcher for FixtureFetcher {
    fn provider_id(&self) -> &'static str {
        "fixtures"
    }

    async fn fetch_statements(
        &self,
        _ctx: &FetchContext,
        entity_id: &str,
    ) -> Result<RawStatements, FetchError> {
        self.read_fixture(entity_id, "statements.json", "statements")
            .await
    }

    async fn fetch_prices(
        &self,
        _ctx: &FetchContext,
        entity_id: &str,
        range: PriceRange,
    ) -> Result<RawPriceFrame, FetchError> {
        let mut frame: RawPriceFrame = self.read_fixture(entity_id, "prices.json", "prices").await?;
        if let Some(start) = range.start {
            frame.retain_from(start);
        }
        Ok(frame)
    }

    async fn fetch_next_event_date(
        &self,
        _ctx: &FetchContext,
        entity_id: &str,
    ) -> Result<Option<NaiveDate>, FetchError> {
        let calendar: RawCalendar = self
            .read_fixture(entity_id, "calendar.json", "calendar")
            .await?;
        Ok(calendar.next_event_date())
    }
}

// ---------------------------------------------------------------------------
// HTTP provider
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8085".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// JSON market-data provider: `GET {base}/v1/{entity}/statements|prices|calendar`.
#[derive(Debug)]
pub struct HttpProviderFetcher {
    client: reqwest::Client,
    base_url: String,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
    archive: Option<PayloadArchive>,
}

impl HttpProviderFetcher {
    pub fn new(config: HttpProviderConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            backoff: config.backoff,
            archive: None,
        })
    }

    /// Archive every successful raw payload before decoding it.
    pub fn with_archive(mut self, archive: PayloadArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    fn entity_url(&self, entity_id: &str, dataset: &str) -> String {
        format!("{}/v1/{}/{}", self.base_url, entity_id, dataset)
    }

    async fn get_bytes(
        &self,
        entity_id: &str,
        what: &'static str,
        url: &str,
    ) -> Result<Vec<u8>, FetchError> {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;
        let mut attempt = 0usize;

        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }
                    if status == StatusCode::NOT_FOUND {
                        return Err(FetchError::NotFound {
                            entity_id: entity_id.to_string(),
                            what,
                        });
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, url, "retrying provider request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, url, "retrying provider request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        ctx: &FetchContext,
        entity_id: &str,
        what: &'static str,
        url: &str,
    ) -> Result<T, FetchError> {
        let span = info_span!("provider_fetch", run_id = %ctx.run_id, entity_id, what);
        let bytes = self.get_bytes(entity_id, what, url).instrument(span).await?;

        if let Some(archive) = &self.archive {
            if let Err(err) = archive
                .store_payload(ctx.captured_at, entity_id, what, &bytes)
                .await
            {
                warn!(entity_id, what, error = %err, "archiving raw payload failed");
            }
        }

        serde_json::from_slice(&bytes).map_err(|err| FetchError::Decode {
            entity_id: entity_id.to_string(),
            what,
            message: err.to_string(),
        })
    }
}

#[async_trait]
impl MarketDataFetcher for HttpProviderFetcher {
    fn provider_id(&self) -> &'static str {
        "http"
    }

    async fn fetch_statements(
        &self,
        ctx: &FetchContext,
        entity_id: &str,
    ) -> Result<RawStatements, FetchError> {
        let url = self.entity_url(entity_id, "statements");
        self.get_json(ctx, entity_id, "statements", &url).await
    }

    async fn fetch_prices(
        &self,
        ctx: &FetchContext,
        entity_id: &str,
        range: PriceRange,
    ) -> Result<RawPriceFrame, FetchError> {
        let mut url = self.entity_url(entity_id, "prices");
        if let Some(start) = range.start {
            url.push_str(&format!("?start={}", start.format("%Y-%m-%d")));
        }
        self.get_json(ctx, entity_id, "prices", &url).await
    }

    async fn fetch_next_event_date(
        &self,
        ctx: &FetchContext,
        entity_id: &str,
    ) -> Result<Option<NaiveDate>, FetchError> {
        let url = self.entity_url(entity_id, "calendar");
        let calendar: RawCalendar = self.get_json(ctx, entity_id, "calendar", &url).await?;
        Ok(calendar.next_event_date())
    }
}

// ---------------------------------------------------------------------------
// Normalizer
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Clone, PartialEq)]
pub enum NormalizationError {
    #[error("payload for {found} handed to the normalizer for {expected}")]
    EntityMismatch { expected: EntityId, found: EntityId },
    #[error("{entity_id}: unparseable date {raw:?}")]
    InvalidDate { entity_id: EntityId, raw: String },
    #[error("{entity_id} {kind} {period}: empty field name")]
    EmptyFieldName {
        entity_id: EntityId,
        kind: StatementKind,
        period: PeriodType,
    },
    #[error("{entity_id} {kind} {period}: row {field:?} has {found} values for {expected} dates")]
    RaggedRow {
        entity_id: EntityId,
        kind: StatementKind,
        period: PeriodType,
        field: String,
        expected: usize,
        found: usize,
    },
    #[error("{entity_id}: price frame has no {column} column")]
    MissingPriceColumn {
        entity_id: EntityId,
        column: &'static str,
    },
    #[error("{entity_id}: price column {column} has {found} values for {expected} index entries")]
    RaggedPriceColumn {
        entity_id: EntityId,
        column: String,
        expected: usize,
        found: usize,
    },
}

/// Accepts `YYYY-MM-DD`, `YYYY-MM-DD HH:MM:SS[.f]`, `YYYY-MM-DDTHH:MM:SS` and RFC 3339,
/// discarding the time of day.
pub fn parse_provider_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.date_naive());
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|ts| ts.date())
}

fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRule {
    pub contains_any: Vec<String>,
    pub unit: Unit,
}

const UNIT_RULES_VERSION: u32 = 1;

#[derive(Debug, Clone, Deserialize)]
struct UnitRulesFile {
    version: u32,
    #[serde(default)]
    exact: BTreeMap<String, Unit>,
    #[serde(default)]
    rules: Vec<UnitRule>,
}

/// Maps field names to units: exact names first, then substring rules in order,
/// falling back to currency.
#[derive(Debug, Clone)]
pub struct UnitClassifier {
    exact: BTreeMap<String, Unit>,
    rules: Vec<UnitRule>,
}

impl Default for UnitClassifier {
    fn default() -> Self {
        let rule = |needles: &[&str], unit| UnitRule {
            contains_any: needles.iter().map(|s| s.to_string()).collect(),
            unit,
        };
        Self {
            exact: BTreeMap::new(),
            rules: vec![
                rule(&["eps", "per share"], Unit::Currency),
                rule(&["shares", "share issued"], Unit::Shares),
                rule(&["rate", "ratio", "margin"], Unit::Ratio),
                rule(&["employees"], Unit::Count),
            ],
        }
    }
}

impl UnitClassifier {
    /// Layers a YAML rules file over the built-in rules; file entries take precedence.
    pub fn with_yaml_rules(mut self, yaml: &str) -> anyhow::Result<Self> {
        let file: UnitRulesFile = serde_yaml::from_str(yaml).context("parsing unit rules")?;
        if file.version != UNIT_RULES_VERSION {
            bail!(
                "unsupported unit rules version {} (expected {UNIT_RULES_VERSION})",
                file.version
            );
        }
        for (name, unit) in file.exact {
            self.exact.insert(name.trim().to_ascii_lowercase(), unit);
        }
        let mut rules = file.rules;
        rules.append(&mut self.rules);
        self.rules = rules;
        Ok(self)
    }

    /// Loads `<root>/rules/units.yaml` when present.
    pub fn from_workspace_root(root: &Path) -> anyhow::Result<Self> {
        let path = root.join("rules").join("units.yaml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::default().with_yaml_rules(&text)
    }

    pub fn classify(&self, field_name: &str) -> Unit {
        let lower = field_name.trim().to_ascii_lowercase();
        if let Some(unit) = self.exact.get(&lower) {
            return *unit;
        }
        self.rules
            .iter()
            .find(|rule| {
                rule.contains_any
                    .iter()
                    .any(|needle| lower.contains(&needle.to_ascii_lowercase()))
            })
            .map(|rule| rule.unit)
            .unwrap_or_default()
    }
}

/// A statement the provider returned empty (or not at all). Not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DatasetGap {
    pub kind: StatementKind,
    pub period: PeriodType,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NormalizedStatements {
    pub records: BTreeMap<StatementKind, Vec<FinancialRecord>>,
    pub gaps: Vec<DatasetGap>,
}

impl NormalizedStatements {
    pub fn record_count(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }
}

/// Wide-to-long pivot of one statement table. Every record shares `captured_at`.
pub fn normalize_statement(
    entity_id: &str,
    kind: StatementKind,
    period: PeriodType,
    raw: &RawStatement,
    captured_at: DateTime<Utc>,
    units: &UnitClassifier,
) -> Result<Vec<FinancialRecord>, NormalizationError> {
    let parse_date = |raw: &str| {
        parse_provider_date(raw).ok_or_else(|| NormalizationError::InvalidDate {
            entity_id: entity_id.to_string(),
            raw: raw.to_string(),
        })
    };
    let field_name = |raw: &str| {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            Err(NormalizationError::EmptyFieldName {
                entity_id: entity_id.to_string(),
                kind,
                period,
            })
        } else {
            Ok(trimmed.to_string())
        }
    };
    let record = |fiscal_date, field_name: String, value| FinancialRecord {
        entity_id: entity_id.to_string(),
        fiscal_date,
        unit: units.classify(&field_name),
        field_name,
        field_value: finite(value),
        source: DEFAULT_SOURCE.to_string(),
        period_type: period,
        captured_at,
    };

    let mut out = Vec::new();
    match raw {
        RawStatement::Wide { dates, rows } => {
            let dates = dates
                .iter()
                .map(|d| parse_date(d))
                .collect::<Result<Vec<_>, _>>()?;
            for row in rows {
                let name = field_name(&row.field)?;
                if row.values.len() != dates.len() {
                    return Err(NormalizationError::RaggedRow {
                        entity_id: entity_id.to_string(),
                        kind,
                        period,
                        field: name,
                        expected: dates.len(),
                        found: row.values.len(),
                    });
                }
                for (date, value) in dates.iter().zip(&row.values) {
                    out.push(record(*date, name.clone(), *value));
                }
            }
        }
        RawStatement::DateIndexed { rows } => {
            for row in rows {
                let date = parse_date(&row.date)?;
                for (field, value) in &row.fields {
                    out.push(record(date, field_name(field)?, *value));
                }
            }
        }
    }
    Ok(out)
}

/// Normalizes every statement in `raw`, recording empty or absent kind/period pairs as gaps.
pub fn normalize_statements(
    entity_id: &str,
    raw: &RawStatements,
    captured_at: DateTime<Utc>,
    units: &UnitClassifier,
) -> Result<NormalizedStatements, NormalizationError> {
    let found = clean_entity_id(&raw.entity_id);
    if found != entity_id {
        return Err(NormalizationError::EntityMismatch {
            expected: entity_id.to_string(),
            found,
        });
    }

    let mut normalized = NormalizedStatements::default();
    for kind in StatementKind::ALL {
        for period in PeriodType::ALL {
            let tables: Vec<&RawStatement> = raw
                .statements
                .iter()
                .filter(|s| s.kind == kind && s.period == period)
                .map(|s| &s.table)
                .collect();
            if tables.iter().all(|t| t.is_empty()) {
                warn!(entity_id, %kind, %period, "provider returned an empty dataset");
                normalized.gaps.push(DatasetGap { kind, period });
                continue;
            }
            for table in tables {
                let records =
                    normalize_statement(entity_id, kind, period, table, captured_at, units)?;
                normalized.records.entry(kind).or_default().extend(records);
            }
        }
    }
    Ok(normalized)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PriceColumn {
    Open,
    High,
    Low,
    Close,
    Volume,
}

fn price_column(name: &str) -> Option<PriceColumn> {
    let first_level = name.split('|').next().unwrap_or(name);
    match first_level.trim().to_ascii_lowercase().as_str() {
        "open" | "open_price" => Some(PriceColumn::Open),
        "high" | "high_price" => Some(PriceColumn::High),
        "low" | "low_price" => Some(PriceColumn::Low),
        "close" | "close_price" => Some(PriceColumn::Close),
        "volume" => Some(PriceColumn::Volume),
        _ => None,
    }
}

/// Flattens an OHLCV frame into one record per trading day.
///
/// Days missing any of open/high/low/close are skipped; a missing volume becomes 0.
pub fn normalize_prices(
    entity_id: &str,
    frame: &RawPriceFrame,
    captured_at: DateTime<Utc>,
) -> Result<Vec<PriceRecord>, NormalizationError> {
    if frame.is_empty() {
        return Ok(Vec::new());
    }

    let mut mapped: BTreeMap<&'static str, &Vec<Option<f64>>> = BTreeMap::new();
    for (name, values) in &frame.columns {
        let Some(column) = price_column(name) else {
            continue;
        };
        if values.len() != frame.index.len() {
            return Err(NormalizationError::RaggedPriceColumn {
                entity_id: entity_id.to_string(),
                column: name.clone(),
                expected: frame.index.len(),
                found: values.len(),
            });
        }
        let key = match column {
            PriceColumn::Open => "open",
            PriceColumn::High => "high",
            PriceColumn::Low => "low",
            PriceColumn::Close => "close",
            PriceColumn::Volume => "volume",
        };
        mapped.entry(key).or_insert(values);
    }

    let required = |column: &'static str| {
        mapped
            .get(column)
            .copied()
            .ok_or_else(|| NormalizationError::MissingPriceColumn {
                entity_id: entity_id.to_string(),
                column,
            })
    };
    let (open, high, low, close) = (
        required("open")?,
        required("high")?,
        required("low")?,
        required("close")?,
    );
    let volume = mapped.get("volume").copied();

    let mut out = Vec::with_capacity(frame.index.len());
    for (i, raw_date) in frame.index.iter().enumerate() {
        let trade_date =
            parse_provider_date(raw_date).ok_or_else(|| NormalizationError::InvalidDate {
                entity_id: entity_id.to_string(),
                raw: raw_date.clone(),
            })?;
        let (Some(o), Some(h), Some(l), Some(c)) = (
            finite(open[i]),
            finite(high[i]),
            finite(low[i]),
            finite(close[i]),
        ) else {
            debug!(entity_id, %trade_date, "skipping incomplete price bar");
            continue;
        };
        let volume = volume
            .and_then(|v| finite(v[i]))
            .filter(|v| *v >= 0.0)
            .map(|v| v.round() as i64)
            .unwrap_or(0);
        out.push(PriceRecord {
            entity_id: entity_id.to_string(),
            trade_date,
            open: o,
            close: c,
            high: h,
            low: l,
            volume,
            captured_at,
        });
    }
    Ok(out)
}
