use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use finsync_adapters::{
    FetchContext, FetchError, MarketDataFetcher, PriceRange, RawPriceFrame, RawStatement,
    RawStatementSet, RawStatements, WideRow,
};
use finsync_core::{EntityId, EntityStage, EntityUpsert, PeriodType, StatementKind};
use finsync_storage::{Store, TargetTable};
use finsync_sync::{SyncConfig, SyncPipeline};
use tempfile::TempDir;

/// Income for everyone, balance sheets for every tenth entity, fetch outage for E060.
struct ScriptedFetcher;

fn table(field: &str, value: f64) -> RawStatement {
    RawStatement::Wide {
        dates: vec!["2025-12-31".into()],
        rows: vec![WideRow {
            field: field.into(),
            values: vec![Some(value)],
        }],
    }
}

fn ordinal(entity_id: &str) -> u32 {
    entity_id[1..].parse().unwrap_or(0)
}

#[async_trait]
impl MarketDataFetcher for ScriptedFetcher {
    fn provider_id(&self) -> &'static str {
        "scripted"
    }

    async fn fetch_statements(
        &self,
        _ctx: &FetchContext,
        entity_id: &str,
    ) -> Result<RawStatements, FetchError> {
        if entity_id == "E060" {
            return Err(FetchError::HttpStatus {
                status: 503,
                url: format!("http://provider/v1/{entity_id}/statements"),
            });
        }
        let n = ordinal(entity_id);
        let mut statements = vec![RawStatementSet {
            kind: StatementKind::Income,
            period: PeriodType::Annual,
            table: table("Total Revenue", f64::from(n) * 1_000.0),
        }];
        if n % 10 == 0 {
            statements.push(RawStatementSet {
                kind: StatementKind::Balance,
                period: PeriodType::Annual,
                table: table("Total Assets", f64::from(n) * 5_000.0),
            });
        }
        Ok(RawStatements {
            entity_id: entity_id.to_string(),
            statements,
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
        Ok(None)
    }
}

async fn seeded_pipeline(dir: &TempDir) -> (SyncPipeline, Vec<EntityId>) {
    let url = format!("sqlite://{}", dir.path().join("batch.db").display());
    let store = Store::connect(&url).await.expect("connect");
    store.migrate().await.expect("migrate");

    let ids: Vec<EntityId> = (0..120).map(|i| format!("E{i:03}")).collect();
    let snapshot: Vec<EntityUpsert> = ids
        .iter()
        .map(|id| EntityUpsert {
            id: id.clone(),
            name: format!("Entity {id}"),
            sector: Some("Test".into()),
            industry: None,
            group_weights: BTreeMap::new(),
        })
        .collect();
    store.upsert_entities(&snapshot).await.expect("seed entities");

    let config = SyncConfig {
        workspace_root: dir.path().to_path_buf(),
        fetch_concurrency: 4,
        ..Default::default()
    };
    let pipeline =
        SyncPipeline::new(config, store, Arc::new(ScriptedFetcher)).expect("pipeline");
    (pipeline, ids)
}

#[tokio::test]
async fn failures_stay_isolated_to_their_entities() {
    let dir = TempDir::new().expect("tempdir");
    let (pipeline, ids) = seeded_pipeline(&dir).await;

    // E110's balance-sheet row is rejected; chunk 3's combined balance merge rolls back
    sqlx::query(
        "CREATE TRIGGER reject_e110 BEFORE INSERT ON balance_sheet \
         WHEN NEW.entity_id = 'E110' BEGIN SELECT RAISE(ABORT, 'rejected by test'); END",
    )
    .execute(pipeline.store().pool())
    .await
    .expect("trigger");

    let worklist = pipeline.evaluate_staleness().await.expect("staleness");
    assert_eq!(worklist, ids);

    let summary = pipeline.run_batch(&worklist, 50).await;
    let sizes: Vec<usize> = summary.chunks.iter().map(|c| c.attempted.len()).collect();
    assert_eq!(sizes, vec![50, 50, 20]);
    assert_eq!(summary.chunk_errors(), 0);

    let second = &summary.chunks[1];
    assert_eq!(second.succeeded.len(), 49);
    assert!(!second.succeeded.contains(&"E060".to_string()));
    assert_eq!(second.failed.len(), 1);
    assert_eq!(second.failed[0].entity_id, "E060");
    assert_eq!(second.failed[0].stage, EntityStage::Fetch);

    let third = &summary.chunks[2];
    let reconcile_failures: Vec<&str> = third
        .failed
        .iter()
        .filter(|f| f.stage == EntityStage::Reconcile)
        .map(|f| f.entity_id.as_str())
        .collect();
    assert_eq!(reconcile_failures, vec!["E110"]);
    assert_eq!(third.succeeded.len(), 19);
    assert!(third.succeeded.contains(&"E100".to_string()));

    let store = pipeline.store();
    let e060 = store.load_entity("E060").await.expect("load").expect("E060");
    let e061 = store.load_entity("E061").await.expect("load").expect("E061");
    let e100 = store.load_entity("E100").await.expect("load").expect("E100");
    let e110 = store.load_entity("E110").await.expect("load").expect("E110");
    assert_eq!(e060.last_financial_update, None);
    assert_eq!(e061.last_financial_update, Some(second.captured_at));
    assert_eq!(e100.last_financial_update, Some(third.captured_at));
    assert_eq!(e110.last_financial_update, None);

    // income merged for everyone fetched; only E110's balance row is missing
    assert_eq!(
        store
            .count_rows(TargetTable::Statement(StatementKind::Income))
            .await
            .expect("count"),
        119
    );
    assert_eq!(
        store
            .count_rows(TargetTable::Statement(StatementKind::Balance))
            .await
            .expect("count"),
        10
    );
    assert_eq!(
        store
            .load_statement_records(StatementKind::Balance, "E100")
            .await
            .expect("records")
            .len(),
        1
    );
    assert!(store
        .load_statement_records(StatementKind::Balance, "E110")
        .await
        .expect("records")
        .is_empty());

    // failed entities are simply re-eligible
    let retry = pipeline.evaluate_staleness().await.expect("staleness");
    assert_eq!(
        retry,
        vec!["E060".to_string(), "E110".to_string()]
    );

    sqlx::query("DROP TRIGGER reject_e110")
        .execute(store.pool())
        .await
        .expect("drop trigger");
    let rerun = pipeline.run_batch(&retry, 50).await;
    assert_eq!(rerun.succeeded(), vec!["E110".to_string()]);
    assert_eq!(rerun.failure_counts().get(&EntityStage::Fetch), Some(&1));
    assert_eq!(
        store
            .count_rows(TargetTable::Statement(StatementKind::Balance))
            .await
            .expect("count"),
        11
    );
}

#[tokio::test]
async fn rerunning_a_batch_is_idempotent() {
    let dir = TempDir::new().expect("tempdir");
    let (pipeline, ids) = seeded_pipeline(&dir).await;
    let worklist: Vec<EntityId> = ids.into_iter().take(30).collect();

    let first = pipeline.run_batch(&worklist, 7).await;
    assert_eq!(first.chunks.len(), 5);
    let income = TargetTable::Statement(StatementKind::Income);
    let after_first = pipeline.store().count_rows(income).await.expect("count");

    let second = pipeline.run_batch(&worklist, 7).await;
    let after_second = pipeline.store().count_rows(income).await.expect("count");
    assert_eq!(after_first, 30);
    assert_eq!(after_first, after_second);
    assert_eq!(first.succeeded(), second.succeeded());
}

#[tokio::test]
async fn a_rejected_entity_does_not_fail_its_table_neighbours() {
    let dir = TempDir::new().expect("tempdir");
    let (pipeline, _) = seeded_pipeline(&dir).await;
    let store = pipeline.store();
    let pair: Vec<EntityUpsert> = ["GOOD", "BAD"]
        .iter()
        .map(|id| EntityUpsert {
            id: id.to_string(),
            name: id.to_string(),
            sector: None,
            industry: None,
            group_weights: BTreeMap::new(),
        })
        .collect();
    store.upsert_entities(&pair).await.expect("seed pair");
    sqlx::query(
        "CREATE TRIGGER reject_bad BEFORE INSERT ON income_statement \
         WHEN NEW.entity_id = 'BAD' BEGIN SELECT RAISE(ABORT, 'rejected by test'); END",
    )
    .execute(store.pool())
    .await
    .expect("trigger");

    let worklist = vec!["GOOD".to_string(), "BAD".to_string()];
    let summary = pipeline.run_batch(&worklist, 50).await;

    assert_eq!(summary.succeeded(), vec!["GOOD".to_string()]);
    let failures: Vec<(&str, EntityStage)> = summary
        .failures()
        .map(|f| (f.entity_id.as_str(), f.stage))
        .collect();
    assert_eq!(failures, vec![("BAD", EntityStage::Reconcile)]);

    let good = store.load_entity("GOOD").await.expect("load").expect("GOOD");
    let bad = store.load_entity("BAD").await.expect("load").expect("BAD");
    assert_eq!(good.last_financial_update, Some(summary.chunks[0].captured_at));
    assert_eq!(bad.last_financial_update, None);
    assert_eq!(
        store
            .load_statement_records(StatementKind::Income, "GOOD")
            .await
            .expect("records")
            .len(),
        1
    );
    // GOOD's income row plus both balance rows, which merge cleanly
    assert_eq!(summary.records_written(), 3);
}
