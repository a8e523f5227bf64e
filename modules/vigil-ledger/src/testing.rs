// Test doubles for the ledger's capability traits.
//
// - MockLedgerStore (LedgerStore / LedgerTx): in-memory clusters and reports
// - MockAccounts (AccountStore): voter score and credibility
// - RecordingNotifier (NotificationSink): captures every notification
//
// Each double supports failure injection so tests can exercise outage and
// partial-failure paths. Catalog fixtures use `FileCatalog::from_rules`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use vigil_common::{
    GeoPoint, IncidentCluster, IncidentReport, Notification, Outcome, Tallies, VoteDirection,
};

use crate::error::{LedgerError, Result};
use crate::traits::{AccountStore, LedgerStore, LedgerTx, NotificationSink, ReportInsert};

// ---------------------------------------------------------------------------
// Test constants
// ---------------------------------------------------------------------------

/// Toronto City Hall.
pub const CITY_HALL: (f64, f64) = (43.6534, -79.3841);

// ---------------------------------------------------------------------------
// MockLedgerStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct LedgerState {
    clusters: HashMap<Uuid, IncidentCluster>,
    reports: Vec<IncidentReport>,
    failing_clusters: HashSet<Uuid>,
}

/// Stateful in-memory store. A transaction holds the whole state lock and
/// works on a copy; `commit` swaps the copy in, dropping discards it.
pub struct MockLedgerStore {
    state: Arc<AsyncMutex<LedgerState>>,
    unavailable: Arc<AtomicBool>,
}

impl Default for MockLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLedgerStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AsyncMutex::new(LedgerState::default())),
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Every call fails with a pool timeout while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// `reports_for_cluster` fails for this cluster until cleared.
    pub async fn fail_cluster(&self, cluster_id: Uuid) {
        self.state.lock().await.failing_clusters.insert(cluster_id);
    }

    pub async fn clear_failures(&self) {
        self.state.lock().await.failing_clusters.clear();
    }

    pub async fn insert_clusters(&self, clusters: Vec<IncidentCluster>) {
        let mut state = self.state.lock().await;
        for c in clusters {
            state.clusters.insert(c.id, c);
        }
    }

    pub async fn insert_reports(&self, reports: Vec<IncidentReport>) {
        self.state.lock().await.reports.extend(reports);
    }

    pub async fn clusters(&self) -> Vec<IncidentCluster> {
        self.state.lock().await.clusters.values().cloned().collect()
    }

    pub async fn reports(&self) -> Vec<IncidentReport> {
        self.state.lock().await.reports.clone()
    }

    fn check(&self) -> Result<()> {
        check_available(&self.unavailable)
    }
}

fn check_available(flag: &AtomicBool) -> Result<()> {
    if flag.load(Ordering::SeqCst) {
        return Err(LedgerError::Database(sqlx::Error::PoolTimedOut));
    }
    Ok(())
}

#[async_trait]
impl LedgerStore for MockLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        self.check()?;
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MockTx {
            guard,
            working,
            unavailable: self.unavailable.clone(),
        }))
    }

    async fn cluster(&self, id: Uuid) -> Result<Option<IncidentCluster>> {
        self.check()?;
        Ok(self.state.lock().await.clusters.get(&id).cloned())
    }

    async fn expired_clusters(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<IncidentCluster>> {
        self.check()?;
        let state = self.state.lock().await;
        let mut expired: Vec<_> = state
            .clusters
            .values()
            .filter(|c| c.is_expired_at(now))
            .cloned()
            .collect();
        expired.sort_by_key(|c| c.end_time);
        expired.truncate(limit.max(0) as usize);
        Ok(expired)
    }

    async fn reports_for_cluster(&self, cluster_id: Uuid) -> Result<Vec<IncidentReport>> {
        self.check()?;
        let state = self.state.lock().await;
        if state.failing_clusters.contains(&cluster_id) {
            return Err(anyhow!("injected read failure for cluster {cluster_id}").into());
        }
        let mut reports: Vec<_> = state
            .reports
            .iter()
            .filter(|r| r.cluster_id == cluster_id)
            .cloned()
            .collect();
        reports.sort_by_key(|r| r.reported_at);
        Ok(reports)
    }

    async fn claim_settlement(
        &self,
        report_id: Uuid,
        outcome: Outcome,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        self.check()?;
        let mut state = self.state.lock().await;
        match state.reports.iter_mut().find(|r| r.id == report_id) {
            Some(r) if r.settled_outcome.is_none() => {
                r.settled_outcome = Some(outcome);
                r.settled_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_settlement(&self, report_id: Uuid) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock().await;
        if let Some(r) = state.reports.iter_mut().find(|r| r.id == report_id) {
            r.settled_outcome = None;
            r.settled_at = None;
        }
        Ok(())
    }

    async fn finalize_cluster(&self, cluster_id: Uuid, _at: DateTime<Utc>) -> Result<bool> {
        self.check()?;
        let mut state = self.state.lock().await;
        match state.clusters.get_mut(&cluster_id) {
            Some(c) if c.is_active => {
                c.is_active = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

struct MockTx {
    guard: OwnedMutexGuard<LedgerState>,
    working: LedgerState,
    unavailable: Arc<AtomicBool>,
}

#[async_trait]
impl LedgerTx for MockTx {
    async fn open_clusters_since(
        &mut self,
        subcategory: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<IncidentCluster>> {
        check_available(&self.unavailable)?;
        Ok(self
            .working
            .clusters
            .values()
            .filter(|c| c.subcategory == subcategory && c.is_active && c.created_at >= since)
            .cloned()
            .collect())
    }

    async fn lock_cluster(&mut self, id: Uuid) -> Result<Option<IncidentCluster>> {
        check_available(&self.unavailable)?;
        Ok(self.working.clusters.get(&id).cloned())
    }

    async fn has_report(&mut self, cluster_id: Uuid, voter_id: Uuid) -> Result<bool> {
        check_available(&self.unavailable)?;
        Ok(self
            .working
            .reports
            .iter()
            .any(|r| r.cluster_id == cluster_id && r.voter_id == voter_id))
    }

    async fn insert_cluster(&mut self, cluster: &IncidentCluster) -> Result<()> {
        check_available(&self.unavailable)?;
        self.working.clusters.insert(cluster.id, cluster.clone());
        Ok(())
    }

    async fn update_cluster(&mut self, cluster: &IncidentCluster) -> Result<()> {
        check_available(&self.unavailable)?;
        let Some(stored) = self.working.clusters.get_mut(&cluster.id) else {
            return Err(LedgerError::NotFound(format!("cluster {}", cluster.id)));
        };
        stored.centroid = cluster.centroid;
        stored.tallies = cluster.tallies;
        stored.credibility = cluster.credibility;
        stored.vote_count = cluster.vote_count;
        Ok(())
    }

    async fn insert_report(&mut self, report: &IncidentReport) -> Result<ReportInsert> {
        check_available(&self.unavailable)?;
        let duplicate = self
            .working
            .reports
            .iter()
            .any(|r| r.cluster_id == report.cluster_id && r.voter_id == report.voter_id);
        if duplicate {
            return Ok(ReportInsert::Duplicate);
        }
        self.working.reports.push(report.clone());
        Ok(ReportInsert::Inserted)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        check_available(&self.unavailable)?;
        let MockTx {
            mut guard, working, ..
        } = *self;
        *guard = working;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockAccounts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccountSnapshot {
    pub score: f64,
    pub credibility: f64,
}

/// Voter accounts keyed by id. `adjust` on an unknown voter errors.
#[derive(Default)]
pub struct MockAccounts {
    accounts: Mutex<HashMap<Uuid, AccountSnapshot>>,
    failing: Mutex<HashSet<Uuid>>,
    adjustments: Mutex<Vec<(Uuid, f64, f64)>>,
}

impl MockAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new voter with zero score. Returns their id.
    pub fn add_voter(&self, credibility: f64) -> Uuid {
        let id = Uuid::new_v4();
        self.insert(id, credibility);
        id
    }

    pub fn insert(&self, voter_id: Uuid, credibility: f64) {
        self.accounts.lock().unwrap().insert(
            voter_id,
            AccountSnapshot {
                score: 0.0,
                credibility,
            },
        );
    }

    pub fn account(&self, voter_id: Uuid) -> Option<AccountSnapshot> {
        self.accounts.lock().unwrap().get(&voter_id).copied()
    }

    /// Make every `adjust` for this voter fail until cleared.
    pub fn fail_adjust_for(&self, voter_id: Uuid) {
        self.failing.lock().unwrap().insert(voter_id);
    }

    pub fn clear_failures(&self) {
        self.failing.lock().unwrap().clear();
    }

    /// Successful adjustments, in call order.
    pub fn adjustments(&self) -> Vec<(Uuid, f64, f64)> {
        self.adjustments.lock().unwrap().clone()
    }
}

#[async_trait]
impl AccountStore for MockAccounts {
    async fn credibility(&self, voter_id: Uuid) -> Result<Option<f64>> {
        Ok(self.account(voter_id).map(|a| a.credibility))
    }

    async fn adjust(
        &self,
        voter_id: Uuid,
        score_delta: f64,
        credibility_delta: f64,
    ) -> Result<()> {
        if self.failing.lock().unwrap().contains(&voter_id) {
            return Err(anyhow!("injected adjust failure for voter {voter_id}").into());
        }
        let mut accounts = self.accounts.lock().unwrap();
        let Some(account) = accounts.get_mut(&voter_id) else {
            return Err(LedgerError::NotFound(format!("account {voter_id}")));
        };
        account.score += score_delta;
        account.credibility += credibility_delta;
        self.adjustments
            .lock()
            .unwrap()
            .push((voter_id, score_delta, credibility_delta));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingNotifier
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, voter_id: Uuid) -> Vec<Notification> {
        self.sent()
            .into_iter()
            .filter(|n| n.voter_id == voter_id)
            .collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn enqueue(&self, notification: &Notification) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(LedgerError::Notify("sink offline".into()));
        }
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// An open cluster with neutral 5/5 tallies, expiring 24h after `created_at`.
pub fn cluster_at(subcategory: &str, centroid: GeoPoint, created_at: DateTime<Utc>) -> IncidentCluster {
    let category = subcategory
        .split('.')
        .next()
        .unwrap_or(subcategory)
        .to_string();
    IncidentCluster {
        id: Uuid::new_v4(),
        category,
        subcategory: subcategory.to_string(),
        centroid,
        created_at,
        start_time: created_at,
        end_time: created_at + Duration::hours(24),
        tallies: Tallies::new(5.0, 5.0),
        credibility: Some(5.0),
        vote_count: 1,
        comment_count: 0,
        view_count: 0,
        flag_count: 0,
        is_active: true,
    }
}

/// An unsettled report on `cluster_id`.
pub fn report_on(cluster_id: Uuid, voter_id: Uuid, vote: Option<VoteDirection>) -> IncidentReport {
    IncidentReport {
        id: Uuid::new_v4(),
        cluster_id,
        voter_id,
        vote,
        location: GeoPoint::new(CITY_HALL.0, CITY_HALL.1),
        reported_at: Utc::now(),
        settled_outcome: None,
        settled_at: None,
    }
}
