// Postgres persistence for clusters, reports, accounts and subcategory rules.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;
use uuid::Uuid;

use vigil_common::{
    GeoPoint, IncidentCluster, IncidentReport, Outcome, SubcategoryEntry, SubcategoryRules,
    Tallies, VoteDirection,
};

use crate::error::{LedgerError, Result};
use crate::traits::{AccountStore, LedgerStore, LedgerTx, ReportInsert, SubcategoryCatalog};

const CLUSTER_COLUMNS: &str = "id, category, subcategory, latitude, longitude, created_at, \
     start_time, end_time, score_true, score_false, credibility, vote_count, comment_count, \
     view_count, flag_count, is_active";

const REPORT_COLUMNS: &str = "id, cluster_id, voter_id, vote, latitude, longitude, reported_at, \
     settled_outcome, settled_at";

/// Run the embedded SQL migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
struct ClusterRow {
    id: Uuid,
    category: String,
    subcategory: String,
    latitude: f64,
    longitude: f64,
    created_at: DateTime<Utc>,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    score_true: f64,
    score_false: f64,
    credibility: Option<f64>,
    vote_count: i64,
    comment_count: i64,
    view_count: i64,
    flag_count: i64,
    is_active: bool,
}

impl From<ClusterRow> for IncidentCluster {
    fn from(row: ClusterRow) -> Self {
        IncidentCluster {
            id: row.id,
            category: row.category,
            subcategory: row.subcategory,
            centroid: GeoPoint::new(row.latitude, row.longitude),
            created_at: row.created_at,
            start_time: row.start_time,
            end_time: row.end_time,
            tallies: Tallies::new(row.score_true, row.score_false),
            credibility: row.credibility,
            vote_count: row.vote_count,
            comment_count: row.comment_count,
            view_count: row.view_count,
            flag_count: row.flag_count,
            is_active: row.is_active,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ReportRow {
    id: Uuid,
    cluster_id: Uuid,
    voter_id: Uuid,
    vote: Option<bool>,
    latitude: f64,
    longitude: f64,
    reported_at: DateTime<Utc>,
    settled_outcome: Option<String>,
    settled_at: Option<DateTime<Utc>>,
}

impl TryFrom<ReportRow> for IncidentReport {
    type Error = LedgerError;

    fn try_from(row: ReportRow) -> Result<Self> {
        let settled_outcome = row
            .settled_outcome
            .as_deref()
            .map(str::parse::<Outcome>)
            .transpose()
            .map_err(|e| LedgerError::CorruptRow(format!("report {}: {e}", row.id)))?;

        Ok(IncidentReport {
            id: row.id,
            cluster_id: row.cluster_id,
            voter_id: row.voter_id,
            vote: row.vote.map(VoteDirection::from_bool),
            location: GeoPoint::new(row.latitude, row.longitude),
            reported_at: row.reported_at,
            settled_outcome,
            settled_at: row.settled_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubcategoryRow {
    code: String,
    category: String,
    match_radius_m: f64,
    default_duration_hours: f64,
}

impl From<SubcategoryRow> for SubcategoryRules {
    fn from(row: SubcategoryRow) -> Self {
        SubcategoryRules {
            code: row.code,
            category: row.category,
            match_radius_m: row.match_radius_m,
            default_duration_hours: row.default_duration_hours,
        }
    }
}

// ---------------------------------------------------------------------------
// PgLedgerStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgLedgerTx { tx }))
    }

    async fn cluster(&self, id: Uuid) -> Result<Option<IncidentCluster>> {
        let row = sqlx::query_as::<_, ClusterRow>(&format!(
            "SELECT {CLUSTER_COLUMNS} FROM incident_clusters WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn expired_clusters(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<IncidentCluster>> {
        let rows = sqlx::query_as::<_, ClusterRow>(&format!(
            "SELECT {CLUSTER_COLUMNS} FROM incident_clusters \
             WHERE is_active AND end_time <= $1 \
             ORDER BY end_time ASC \
             LIMIT $2"
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn reports_for_cluster(&self, cluster_id: Uuid) -> Result<Vec<IncidentReport>> {
        let rows = sqlx::query_as::<_, ReportRow>(&format!(
            "SELECT {REPORT_COLUMNS} FROM incident_reports \
             WHERE cluster_id = $1 ORDER BY reported_at ASC"
        ))
        .bind(cluster_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(IncidentReport::try_from).collect()
    }

    async fn claim_settlement(
        &self,
        report_id: Uuid,
        outcome: Outcome,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE incident_reports
            SET settled_outcome = $2, settled_at = $3
            WHERE id = $1 AND settled_outcome IS NULL
            "#,
        )
        .bind(report_id)
        .bind(outcome.as_str())
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_settlement(&self, report_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE incident_reports SET settled_outcome = NULL, settled_at = NULL WHERE id = $1",
        )
        .bind(report_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn finalize_cluster(&self, cluster_id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE incident_clusters
            SET is_active = FALSE, resolved_at = $2
            WHERE id = $1 AND is_active
            "#,
        )
        .bind(cluster_id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

// ---------------------------------------------------------------------------
// PgLedgerTx
// ---------------------------------------------------------------------------

/// One intake transaction. Dropped without `commit`, sqlx rolls it back.
struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn open_clusters_since(
        &mut self,
        subcategory: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<IncidentCluster>> {
        let rows = sqlx::query_as::<_, ClusterRow>(&format!(
            "SELECT {CLUSTER_COLUMNS} FROM incident_clusters \
             WHERE subcategory = $1 AND is_active AND created_at >= $2"
        ))
        .bind(subcategory)
        .bind(since)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn lock_cluster(&mut self, id: Uuid) -> Result<Option<IncidentCluster>> {
        let row = sqlx::query_as::<_, ClusterRow>(&format!(
            "SELECT {CLUSTER_COLUMNS} FROM incident_clusters WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn has_report(&mut self, cluster_id: Uuid, voter_id: Uuid) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM incident_reports WHERE cluster_id = $1 AND voter_id = $2)",
        )
        .bind(cluster_id)
        .bind(voter_id)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(exists)
    }

    async fn insert_cluster(&mut self, c: &IncidentCluster) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO incident_clusters
                (id, category, subcategory, latitude, longitude, created_at, start_time,
                 end_time, score_true, score_false, credibility, vote_count, comment_count,
                 view_count, flag_count, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(c.id)
        .bind(&c.category)
        .bind(&c.subcategory)
        .bind(c.centroid.lat)
        .bind(c.centroid.lng)
        .bind(c.created_at)
        .bind(c.start_time)
        .bind(c.end_time)
        .bind(c.tallies.score_true)
        .bind(c.tallies.score_false)
        .bind(c.credibility)
        .bind(c.vote_count)
        .bind(c.comment_count)
        .bind(c.view_count)
        .bind(c.flag_count)
        .bind(c.is_active)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn update_cluster(&mut self, c: &IncidentCluster) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE incident_clusters
            SET latitude = $2, longitude = $3,
                score_true = $4, score_false = $5, credibility = $6,
                vote_count = $7
            WHERE id = $1
            "#,
        )
        .bind(c.id)
        .bind(c.centroid.lat)
        .bind(c.centroid.lng)
        .bind(c.tallies.score_true)
        .bind(c.tallies.score_false)
        .bind(c.credibility)
        .bind(c.vote_count)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn insert_report(&mut self, r: &IncidentReport) -> Result<ReportInsert> {
        let result = sqlx::query(
            r#"
            INSERT INTO incident_reports
                (id, cluster_id, voter_id, vote, latitude, longitude, reported_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(r.id)
        .bind(r.cluster_id)
        .bind(r.voter_id)
        .bind(r.vote.map(VoteDirection::as_bool))
        .bind(r.location.lat)
        .bind(r.location.lng)
        .bind(r.reported_at)
        .execute(&mut *self.tx)
        .await;

        // A concurrent insert won the (cluster_id, voter_id) slot. The
        // transaction is now aborted; the caller drops it.
        match result.map_err(LedgerError::from) {
            Ok(_) => Ok(ReportInsert::Inserted),
            Err(e) if e.is_unique_violation() => Ok(ReportInsert::Duplicate),
            Err(e) => Err(e),
        }
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PgAccountStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountStore for PgAccountStore {
    async fn credibility(&self, voter_id: Uuid) -> Result<Option<f64>> {
        let credibility =
            sqlx::query_scalar::<_, f64>("SELECT credibility FROM accounts WHERE id = $1")
                .bind(voter_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(credibility)
    }

    async fn adjust(
        &self,
        voter_id: Uuid,
        score_delta: f64,
        credibility_delta: f64,
    ) -> Result<()> {
        // Atomic increment; concurrent settlements never lose an update.
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET score = score + $2, credibility = credibility + $3, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(voter_id)
        .bind(score_delta)
        .bind(credibility_delta)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(format!("account {voter_id}")));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PgCatalog
// ---------------------------------------------------------------------------

/// Subcategory rules read from the `subcategories` table on every lookup,
/// so edits take effect without a restart.
#[derive(Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Upsert the given entries. Rows for codes not listed are left alone.
    pub async fn sync(&self, entries: &[SubcategoryEntry]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO subcategories (code, category, match_radius_m, default_duration_hours)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (code) DO UPDATE
                SET category = EXCLUDED.category,
                    match_radius_m = EXCLUDED.match_radius_m,
                    default_duration_hours = EXCLUDED.default_duration_hours
                "#,
            )
            .bind(&entry.code)
            .bind(&entry.category)
            .bind(entry.match_radius_m)
            .bind(entry.default_duration_hours)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        info!(count = entries.len(), "Subcategory catalog synced");
        Ok(entries.len())
    }
}

#[async_trait]
impl SubcategoryCatalog for PgCatalog {
    async fn rules(&self, code: &str) -> Result<Option<SubcategoryRules>> {
        let row = sqlx::query_as::<_, SubcategoryRow>(
            r#"
            SELECT code, category, match_radius_m, default_duration_hours
            FROM subcategories WHERE code = $1
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }
}
