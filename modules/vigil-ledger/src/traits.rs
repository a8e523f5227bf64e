// Capability traits for the ledger's collaborators.
//
// LedgerStore / LedgerTx: cluster and report persistence.
// AccountStore: voter credibility and score (owned by accounts).
// NotificationSink: fire-and-forget event delivery.
// SubcategoryCatalog: per-subcategory radius and duration rules.
//
// The Matcher, Coordinator and Resolver depend only on these, so tests run
// against the in-memory doubles in `testing`: no database, no Docker.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use vigil_common::{IncidentCluster, IncidentReport, Notification, Outcome, SubcategoryRules};
use vigil_events::{AppendEvent, EventStore};

use crate::error::Result;

// ---------------------------------------------------------------------------
// LedgerStore
// ---------------------------------------------------------------------------

/// Result of inserting a report row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportInsert {
    Inserted,
    /// The voter already has a report on this cluster.
    Duplicate,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open a transaction for one intake decision. Dropping the returned
    /// handle without `commit` rolls it back.
    async fn begin(&self) -> Result<Box<dyn LedgerTx>>;

    async fn cluster(&self, id: Uuid) -> Result<Option<IncidentCluster>>;

    /// Active clusters whose `end_time` is at or before `now`, oldest expiry first.
    async fn expired_clusters(&self, now: DateTime<Utc>, limit: i64)
        -> Result<Vec<IncidentCluster>>;

    async fn reports_for_cluster(&self, cluster_id: Uuid) -> Result<Vec<IncidentReport>>;

    /// Mark a report as settled. Returns false if it was already settled.
    async fn claim_settlement(
        &self,
        report_id: Uuid,
        outcome: Outcome,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Undo a claim whose account adjustment failed.
    async fn release_settlement(&self, report_id: Uuid) -> Result<()>;

    /// Flip `is_active` to false. Returns false if the cluster was already terminal.
    async fn finalize_cluster(&self, cluster_id: Uuid, at: DateTime<Utc>) -> Result<bool>;
}

/// Operations available inside one intake transaction.
#[async_trait]
pub trait LedgerTx: Send {
    /// Active clusters of a subcategory created at or after `since`.
    async fn open_clusters_since(
        &mut self,
        subcategory: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<IncidentCluster>>;

    /// Fetch a cluster and hold its row lock until commit/rollback.
    async fn lock_cluster(&mut self, id: Uuid) -> Result<Option<IncidentCluster>>;

    async fn has_report(&mut self, cluster_id: Uuid, voter_id: Uuid) -> Result<bool>;

    async fn insert_cluster(&mut self, cluster: &IncidentCluster) -> Result<()>;

    /// Write back centroid, tallies, credibility and vote count of a locked cluster.
    async fn update_cluster(&mut self, cluster: &IncidentCluster) -> Result<()>;

    async fn insert_report(&mut self, report: &IncidentReport) -> Result<ReportInsert>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// AccountStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// The voter's personal credibility, or `None` for an unknown voter.
    async fn credibility(&self, voter_id: Uuid) -> Result<Option<f64>>;

    /// Atomically add the deltas to the voter's score and credibility.
    async fn adjust(&self, voter_id: Uuid, score_delta: f64, credibility_delta: f64)
        -> Result<()>;
}

// ---------------------------------------------------------------------------
// NotificationSink
// ---------------------------------------------------------------------------

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn enqueue(&self, notification: &Notification) -> Result<()>;
}

#[async_trait]
impl NotificationSink for EventStore {
    async fn enqueue(&self, notification: &Notification) -> Result<()> {
        let event = AppendEvent::new(notification.kind.as_str(), notification.payload.clone())
            .with_actor(notification.voter_id.to_string())
            .with_subject(notification.cluster_id);
        self.append(event).await?;
        Ok(())
    }
}

/// Sink that drops everything. For deployments without delivery.
pub struct NoopNotifier;

#[async_trait]
impl NotificationSink for NoopNotifier {
    async fn enqueue(&self, _notification: &Notification) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SubcategoryCatalog
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SubcategoryCatalog: Send + Sync {
    async fn rules(&self, code: &str) -> Result<Option<SubcategoryRules>>;

    async fn match_radius_m(&self, code: &str) -> Result<Option<f64>> {
        Ok(self.rules(code).await?.map(|r| r.match_radius_m))
    }

    async fn default_duration_hours(&self, code: &str) -> Result<Option<f64>> {
        Ok(self.rules(code).await?.map(|r| r.default_duration_hours))
    }
}
