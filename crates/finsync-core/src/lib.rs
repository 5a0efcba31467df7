//! Core domain model for the financial statement sync engine.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "finsync-core";

/// Provenance tag written on every canonical record produced by this engine.
pub const DEFAULT_SOURCE: &str = "yfinance";

pub type EntityId = String;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unrecognized {kind}: {value:?}")]
pub struct ParseDomainError {
    pub kind: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodType {
    Annual,
    Quarterly,
}

impl PeriodType {
    pub const ALL: [PeriodType; 2] = [PeriodType::Annual, PeriodType::Quarterly];

    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodType::Annual => "Annual",
            PeriodType::Quarterly => "Quarterly",
        }
    }
}

impl fmt::Display for PeriodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeriodType {
    type Err = ParseDomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "annual" | "yearly" => Ok(PeriodType::Annual),
            "quarterly" => Ok(PeriodType::Quarterly),
            _ => Err(ParseDomainError {
                kind: "period type",
                value: s.to_string(),
            }),
        }
    }
}

/// Statement families; each one is persisted in its own table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    Income,
    Balance,
    CashFlow,
}

impl StatementKind {
    pub const ALL: [StatementKind; 3] = [
        StatementKind::Income,
        StatementKind::Balance,
        StatementKind::CashFlow,
    ];

    pub fn table_name(&self) -> &'static str {
        match self {
            StatementKind::Income => "income_statement",
            StatementKind::Balance => "balance_sheet",
            StatementKind::CashFlow => "cashflow_statement",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StatementKind::Income => "Income Statement",
            StatementKind::Balance => "Balance Sheet",
            StatementKind::CashFlow => "Cash Flow",
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

impl FromStr for StatementKind {
    type Err = ParseDomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        match normalized.as_str() {
            "income" | "income_statement" | "income_stmt" => Ok(StatementKind::Income),
            "balance" | "balance_sheet" | "balancesheet" => Ok(StatementKind::Balance),
            "cash_flow" | "cashflow" | "cashflow_statement" | "cash_flow_statement" => {
                Ok(StatementKind::CashFlow)
            }
            _ => Err(ParseDomainError {
                kind: "statement kind",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    #[default]
    Currency,
    Shares,
    Ratio,
    Count,
}

impl Unit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Unit::Currency => "currency",
            Unit::Shares => "shares",
            Unit::Ratio => "ratio",
            Unit::Count => "count",
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Unit {
    type Err = ParseDomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "currency" => Ok(Unit::Currency),
            "shares" => Ok(Unit::Shares),
            "ratio" => Ok(Unit::Ratio),
            "count" => Ok(Unit::Count),
            _ => Err(ParseDomainError {
                kind: "unit",
                value: s.to_string(),
            }),
        }
    }
}

/// A tracked security as stored in the `companies` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    pub sector: Option<String>,
    pub industry: Option<String>,
    pub group_weights: BTreeMap<String, f64>,
    pub active: bool,
    pub next_expected_event_date: Option<NaiveDate>,
    pub last_financial_update: Option<DateTime<Utc>>,
}

impl Entity {
    /// Minimal active entity with no refresh history.
    pub fn new(id: impl Into<EntityId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            sector: None,
            industry: None,
            group_weights: BTreeMap::new(),
            active: true,
            next_expected_event_date: None,
            last_financial_update: None,
        }
    }
}

/// Descriptive entity fields handed over by the entity-list collaborator.
///
/// Refresh metadata is deliberately absent: only the sync engine writes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityUpsert {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub sector: Option<String>,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub group_weights: BTreeMap<String, f64>,
}

/// Normalizes a raw ticker symbol into the stored identifier form (`BRK.B` -> `BRK-B`).
pub fn clean_entity_id(raw: &str) -> EntityId {
    raw.trim().replace('.', "-").to_ascii_uppercase()
}

/// Natural key of a statement fact.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FinancialKey {
    pub entity_id: EntityId,
    pub fiscal_date: NaiveDate,
    pub field_name: String,
    pub period_type: PeriodType,
}

/// One long-format statement fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialRecord {
    pub entity_id: EntityId,
    pub fiscal_date: NaiveDate,
    pub field_name: String,
    pub field_value: Option<f64>,
    pub unit: Unit,
    pub source: String,
    pub period_type: PeriodType,
    pub captured_at: DateTime<Utc>,
}

impl FinancialRecord {
    pub fn key(&self) -> FinancialKey {
        FinancialKey {
            entity_id: self.entity_id.clone(),
            fiscal_date: self.fiscal_date,
            field_name: self.field_name.clone(),
            period_type: self.period_type,
        }
    }
}

/// Natural key of a daily price bar.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PriceKey {
    pub entity_id: EntityId,
    pub trade_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub entity_id: EntityId,
    pub trade_date: NaiveDate,
    pub open: f64,
    pub close: f64,
    pub high: f64,
    pub low: f64,
    pub volume: i64,
    pub captured_at: DateTime<Utc>,
}

impl PriceRecord {
    pub fn key(&self) -> PriceKey {
        PriceKey {
            entity_id: self.entity_id.clone(),
            trade_date: self.trade_date,
        }
    }
}

/// Pipeline stage at which an entity can fail during one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStage {
    Fetch,
    Normalize,
    Reconcile,
}

impl EntityStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStage::Fetch => "fetch",
            EntityStage::Normalize => "normalize",
            EntityStage::Reconcile => "reconcile",
        }
    }
}

impl fmt::Display for EntityStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-entity state within a single run.
///
/// Success path: `Pending -> Fetched -> Normalized -> Reconciled -> MetadataAdvanced`.
/// Any stage may move the entity to `Failed(stage)`, which is terminal for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "stage")]
pub enum EntityState {
    Pending,
    Fetched,
    Normalized,
    Reconciled,
    MetadataAdvanced,
    Failed(EntityStage),
}

impl EntityState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EntityState::MetadataAdvanced | EntityState::Failed(_))
    }

    /// Applies a transition, refusing anything that skips a step or leaves a terminal state.
    pub fn advance(self, next: EntityState) -> Result<EntityState, InvalidTransition> {
        use EntityState::*;
        let allowed = match (self, next) {
            (Pending, Fetched) | (Fetched, Normalized) | (Normalized, Reconciled) => true,
            (Reconciled, MetadataAdvanced) => true,
            (Pending, Failed(EntityStage::Fetch)) => true,
            (Fetched, Failed(EntityStage::Normalize)) => true,
            (Normalized, Failed(EntityStage::Reconcile)) => true,
            _ => false,
        };
        if allowed {
            Ok(next)
        } else {
            Err(InvalidTransition { from: self, to: next })
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("invalid entity state transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: EntityState,
    pub to: EntityState,
}
