//! Integration tests for the Postgres ledger store.
//! Requires a Postgres instance. Set DATABASE_TEST_URL or these tests are skipped.

use std::sync::Arc;

use chrono::{Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use vigil_common::{GeoPoint, Outcome, SubcategoryEntry, VoteDirection};
use vigil_ledger::store::migrate;
use vigil_ledger::{
    AccountStore, ClusterDisposition, IncidentLedger, LedgerDeps, LedgerStore, NoopNotifier,
    PgAccountStore, PgCatalog, PgLedgerStore, ReportInsert, ReportSubmission, SubcategoryCatalog,
    SubmitOutcome,
};

/// Get a test database pool, or skip if no test DB is available.
async fn test_pool() -> Option<PgPool> {
    let url = std::env::var("DATABASE_TEST_URL").ok()?;
    let pool = PgPool::connect(&url).await.ok()?;

    migrate(&pool).await.ok()?;
    Some(pool)
}

/// A subcategory code private to one test, so concurrent tests never match
/// each other's clusters.
fn unique_code() -> String {
    format!("crime.{}", Uuid::new_v4().simple())
}

async fn add_account(pool: &PgPool, credibility: f64) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO accounts (id, credibility) VALUES ($1, $2)")
        .bind(id)
        .bind(credibility)
        .execute(pool)
        .await
        .unwrap();
    id
}

async fn ledger(pool: &PgPool, code: &str) -> IncidentLedger {
    let catalog = PgCatalog::new(pool.clone());
    catalog
        .sync(&[SubcategoryEntry {
            code: code.to_string(),
            category: "crime".into(),
            match_radius_m: 250.0,
            default_duration_hours: 24.0,
        }])
        .await
        .unwrap();

    LedgerDeps::builder()
        .store(Arc::new(PgLedgerStore::new(pool.clone())))
        .accounts(Arc::new(PgAccountStore::new(pool.clone())))
        .notifier(Arc::new(NoopNotifier))
        .catalog(Arc::new(catalog))
        .build()
        .build()
}

fn report(code: &str, voter: Uuid, at: chrono::DateTime<Utc>) -> ReportSubmission {
    ReportSubmission::builder()
        .voter_id(voter)
        .subcategory(code)
        .location(GeoPoint::new(43.65, -79.38))
        .reported_at(at)
        .build()
}

#[tokio::test]
async fn catalog_sync_upserts() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let catalog = PgCatalog::new(pool.clone());

    let code = format!("traffic.{}", Uuid::new_v4().simple());
    let mut entry = SubcategoryEntry {
        code: code.clone(),
        category: "traffic".into(),
        match_radius_m: 100.0,
        default_duration_hours: 6.0,
    };
    catalog.sync(std::slice::from_ref(&entry)).await.unwrap();
    entry.match_radius_m = 150.0;
    catalog.sync(std::slice::from_ref(&entry)).await.unwrap();

    assert_eq!(
        catalog.match_radius_m(&code).await.unwrap(),
        Some(150.0)
    );
    assert!(catalog.rules("nope").await.unwrap().is_none());
}

#[tokio::test]
async fn create_then_vote_persists_tallies() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let code = unique_code();
    let ledger = ledger(&pool, &code).await;
    let x = add_account(&pool, 8.0).await;
    let y = add_account(&pool, 6.0).await;
    let t0 = Utc::now();

    let created = ledger.submit_report(report(&code, x, t0), t0).await.unwrap();
    let cluster_id = created.cluster_id().unwrap();

    let dispute = ReportSubmission::builder()
        .voter_id(y)
        .subcategory(code.as_str())
        .location(GeoPoint::new(43.65, -79.38))
        .reported_at(t0)
        .vote(VoteDirection::Dispute)
        .cluster_id(cluster_id)
        .build();
    assert!(matches!(
        ledger.submit_report(dispute.clone(), t0).await.unwrap(),
        SubmitOutcome::Joined { .. }
    ));
    assert_eq!(
        ledger.submit_report(dispute, t0).await.unwrap(),
        SubmitOutcome::AlreadyRecorded { cluster_id }
    );

    let cluster = ledger.cluster(cluster_id).await.unwrap().unwrap();
    assert_eq!(cluster.tallies.score_true, 12.0);
    assert_eq!(cluster.tallies.score_false, 8.0);
    assert!((ledger.cluster_credibility(cluster_id).await.unwrap().unwrap() - 6.0).abs() < 1e-9);
}

#[tokio::test]
async fn duplicate_insert_maps_to_duplicate() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let code = unique_code();
    let ledger = ledger(&pool, &code).await;
    let store = PgLedgerStore::new(pool.clone());
    let x = add_account(&pool, 5.0).await;

    let now = Utc::now();
    let created = ledger.submit_report(report(&code, x, now), now).await.unwrap();
    let cluster_id = created.cluster_id().unwrap();
    let existing = store.reports_for_cluster(cluster_id).await.unwrap().remove(0);

    let mut tx = store.begin().await.unwrap();
    let mut dup = existing.clone();
    dup.id = Uuid::new_v4();
    assert_eq!(tx.insert_report(&dup).await.unwrap(), ReportInsert::Duplicate);
}

#[tokio::test]
async fn expiration_settles_and_finalizes_once() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let code = unique_code();
    let ledger = ledger(&pool, &code).await;
    let accounts = PgAccountStore::new(pool.clone());
    let x = add_account(&pool, 8.0).await;
    let t0 = Utc::now() - Duration::hours(30);

    let created = ledger.submit_report(report(&code, x, t0), t0).await.unwrap();
    let cluster_id = created.cluster_id().unwrap();

    let first = ledger.run_expiration_pass(Utc::now()).await.unwrap();
    let second = ledger.run_expiration_pass(Utc::now()).await.unwrap();

    assert_eq!(
        first.disposition(cluster_id),
        Some(ClusterDisposition::Resolved(Outcome::Confirmed))
    );
    assert_eq!(first.voter_settlements, 1);
    assert_eq!(second.disposition(cluster_id), None);

    let (score, credibility): (f64, f64) =
        sqlx::query_as("SELECT score, credibility FROM accounts WHERE id = $1")
            .bind(x)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(score, 11.0);
    assert!((credibility - 8.5).abs() < 1e-9);
    assert_eq!(accounts.credibility(x).await.unwrap(), Some(credibility));

    let (settled,): (Option<String>,) =
        sqlx::query_as("SELECT settled_outcome FROM incident_reports WHERE cluster_id = $1")
            .bind(cluster_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(settled.as_deref(), Some("confirmed"));
}

#[tokio::test]
async fn adjust_unknown_account_errors() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let accounts = PgAccountStore::new(pool);
    assert!(accounts.adjust(Uuid::new_v4(), 1.0, 0.0).await.is_err());
}
