//! Lifecycle resolver: the periodic expiration pass.
//!
//! Selects active clusters past their `end_time`, classifies each one from
//! its final credibility, settles every voter and retires the cluster.
//!
//! Each voter settlement and each cluster is an independent unit. A voter's
//! report is claimed before their account is adjusted and the claim is
//! released if the adjustment fails, so a retried cluster never pays the
//! same voter twice. A cluster is finalized only once all of its reports are
//! settled; otherwise it stays active and the next pass picks it up again.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use vigil_common::{
    IncidentCluster, IncidentReport, Notification, NotificationKind, Outcome, SettlementConfig,
    SettlementResult,
};

use crate::error::Result;
use crate::scoring;
use crate::traits::{AccountStore, LedgerStore, NotificationSink};

/// One voter's settled report.
#[derive(Debug, Clone, PartialEq)]
pub struct VoterSettlement {
    pub cluster_id: Uuid,
    pub report_id: Uuid,
    pub voter_id: Uuid,
    pub outcome: Outcome,
    pub result: SettlementResult,
    pub score_delta: f64,
    pub credibility_delta: f64,
}

/// A unit of work that did not complete. It is retried on the next pass.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitFailure {
    /// Reading the cluster's reports or finalizing it failed.
    Cluster { cluster_id: Uuid, error: String },
    /// Claiming or paying one voter failed.
    Settlement {
        cluster_id: Uuid,
        voter_id: Uuid,
        error: String,
    },
}

impl UnitFailure {
    pub fn cluster_id(&self) -> Uuid {
        match self {
            Self::Cluster { cluster_id, .. } | Self::Settlement { cluster_id, .. } => *cluster_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterDisposition {
    Resolved(Outcome),
    /// No evidence to adjudicate; closed with no settlements.
    ClosedWithoutEvidence,
    /// Some unit failed; the cluster stays active.
    Deferred,
    /// Another resolver finalized it first.
    AlreadyFinal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterResolution {
    pub cluster_id: Uuid,
    pub disposition: ClusterDisposition,
}

/// What one expiration pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpirationReport {
    pub clusters_selected: usize,
    pub clusters_resolved: usize,
    pub clusters_closed_without_evidence: usize,
    pub clusters_deferred: usize,
    pub voter_settlements: usize,
    pub resolutions: Vec<ClusterResolution>,
    pub settlements: Vec<VoterSettlement>,
    pub failures: Vec<UnitFailure>,
}

impl ExpirationReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn disposition(&self, cluster_id: Uuid) -> Option<ClusterDisposition> {
        self.resolutions
            .iter()
            .find(|r| r.cluster_id == cluster_id)
            .map(|r| r.disposition)
    }

    fn absorb(&mut self, pass: ClusterPass) {
        match pass.disposition {
            ClusterDisposition::Resolved(_) => self.clusters_resolved += 1,
            ClusterDisposition::ClosedWithoutEvidence => self.clusters_closed_without_evidence += 1,
            ClusterDisposition::Deferred => self.clusters_deferred += 1,
            ClusterDisposition::AlreadyFinal => {}
        }
        self.voter_settlements += pass.settlements.len();
        self.resolutions.push(ClusterResolution {
            cluster_id: pass.cluster_id,
            disposition: pass.disposition,
        });
        self.settlements.extend(pass.settlements);
        self.failures.extend(pass.failures);
    }
}

impl fmt::Display for ExpirationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "selected={} resolved={} closed_without_evidence={} deferred={} settlements={} failures={}",
            self.clusters_selected,
            self.clusters_resolved,
            self.clusters_closed_without_evidence,
            self.clusters_deferred,
            self.voter_settlements,
            self.failures.len(),
        )
    }
}

struct ClusterPass {
    cluster_id: Uuid,
    disposition: ClusterDisposition,
    settlements: Vec<VoterSettlement>,
    failures: Vec<UnitFailure>,
}

impl ClusterPass {
    fn new(cluster_id: Uuid, disposition: ClusterDisposition) -> Self {
        Self {
            cluster_id,
            disposition,
            settlements: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn failed(cluster_id: Uuid, error: impl fmt::Display) -> Self {
        let mut pass = Self::new(cluster_id, ClusterDisposition::Deferred);
        pass.failures.push(UnitFailure::Cluster {
            cluster_id,
            error: error.to_string(),
        });
        pass
    }
}

pub struct LifecycleResolver {
    store: Arc<dyn LedgerStore>,
    accounts: Arc<dyn AccountStore>,
    notifier: Arc<dyn NotificationSink>,
    policy: SettlementConfig,
    concurrency: usize,
    batch_limit: i64,
}

impl LifecycleResolver {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        accounts: Arc<dyn AccountStore>,
        notifier: Arc<dyn NotificationSink>,
        policy: SettlementConfig,
        concurrency: usize,
        batch_limit: i64,
    ) -> Self {
        Self {
            store,
            accounts,
            notifier,
            policy,
            concurrency: concurrency.max(1),
            batch_limit,
        }
    }

    /// Run one pass over clusters expired at `now`.
    ///
    /// Only the initial selection can fail the whole pass; every later
    /// failure is recorded in the report and the pass continues.
    pub async fn run_expiration_pass(&self, now: DateTime<Utc>) -> Result<ExpirationReport> {
        let expired = self.store.expired_clusters(now, self.batch_limit).await?;
        let mut report = ExpirationReport {
            clusters_selected: expired.len(),
            ..Default::default()
        };

        if expired.is_empty() {
            debug!("No expired clusters");
            return Ok(report);
        }

        let passes: Vec<ClusterPass> = stream::iter(expired)
            .map(|cluster| self.resolve_cluster(cluster, now))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for pass in passes {
            report.absorb(pass);
        }

        info!(%report, "Expiration pass complete");
        Ok(report)
    }

    async fn resolve_cluster(&self, cluster: IncidentCluster, now: DateTime<Utc>) -> ClusterPass {
        let cluster_id = cluster.id;

        let reports = match self.store.reports_for_cluster(cluster_id).await {
            Ok(reports) => reports,
            Err(e) => {
                warn!(error = %e, %cluster_id, "Failed to load reports, will retry");
                return ClusterPass::failed(cluster_id, e);
            }
        };

        let credibility = match cluster.credibility {
            Some(c) if !reports.is_empty() => c,
            _ => {
                return self
                    .finalize(cluster_id, now, ClusterDisposition::ClosedWithoutEvidence)
                    .await;
            }
        };

        let outcome = scoring::classify_outcome(credibility, self.policy.confirm_threshold);
        let mut settlements = Vec::new();
        let mut failures = Vec::new();

        for report in reports.iter().filter(|r| !r.is_settled()) {
            match self.settle_voter(&cluster, report, outcome, now).await {
                Ok(Some(settlement)) => settlements.push(settlement),
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, %cluster_id, voter_id = %report.voter_id, "Voter settlement failed, will retry");
                    failures.push(UnitFailure::Settlement {
                        cluster_id,
                        voter_id: report.voter_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        let mut pass = if failures.is_empty() {
            self.finalize(cluster_id, now, ClusterDisposition::Resolved(outcome))
                .await
        } else {
            ClusterPass::new(cluster_id, ClusterDisposition::Deferred)
        };

        if let ClusterDisposition::Resolved(_) = pass.disposition {
            info!(
                %cluster_id,
                %outcome,
                credibility,
                settled = settlements.len(),
                "Cluster resolved"
            );
        }

        pass.settlements = settlements;
        pass.failures.extend(failures);
        pass
    }

    /// Claim, pay and notify one voter. `Ok(None)` when the report was
    /// already claimed elsewhere.
    async fn settle_voter(
        &self,
        cluster: &IncidentCluster,
        report: &IncidentReport,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<Option<VoterSettlement>> {
        if !self.store.claim_settlement(report.id, outcome, now).await? {
            return Ok(None);
        }

        let vote = report.effective_vote();
        let owed = scoring::settle(vote, outcome, &self.policy);

        if let Err(e) = self
            .accounts
            .adjust(report.voter_id, owed.score_delta, owed.credibility_delta)
            .await
        {
            if let Err(release_err) = self.store.release_settlement(report.id).await {
                warn!(
                    error = %release_err,
                    report_id = %report.id,
                    "Failed to release settlement claim; voter will not be retried"
                );
            }
            return Err(e);
        }

        let kind = match owed.result {
            SettlementResult::Win => NotificationKind::VoteWon,
            SettlementResult::Loss => NotificationKind::VoteLost,
        };
        let notification = Notification::new(
            kind,
            report.voter_id,
            cluster.id,
            json!({
                "subcategory": cluster.subcategory,
                "outcome": outcome,
                "vote": vote,
                "score_delta": owed.score_delta,
                "credibility_delta": owed.credibility_delta,
            }),
        );
        if let Err(e) = self.notifier.enqueue(&notification).await {
            warn!(error = %e, cluster_id = %cluster.id, voter_id = %report.voter_id, "Settlement notification failed (non-fatal)");
        }

        debug!(
            cluster_id = %cluster.id,
            voter_id = %report.voter_id,
            result = %owed.result,
            "Voter settled"
        );

        Ok(Some(VoterSettlement {
            cluster_id: cluster.id,
            report_id: report.id,
            voter_id: report.voter_id,
            outcome,
            result: owed.result,
            score_delta: owed.score_delta,
            credibility_delta: owed.credibility_delta,
        }))
    }

    async fn finalize(
        &self,
        cluster_id: Uuid,
        now: DateTime<Utc>,
        disposition: ClusterDisposition,
    ) -> ClusterPass {
        match self.store.finalize_cluster(cluster_id, now).await {
            Ok(true) => {
                if disposition == ClusterDisposition::ClosedWithoutEvidence {
                    info!(%cluster_id, "Cluster closed without evidence");
                }
                ClusterPass::new(cluster_id, disposition)
            }
            Ok(false) => ClusterPass::new(cluster_id, ClusterDisposition::AlreadyFinal),
            Err(e) => {
                warn!(error = %e, %cluster_id, "Failed to finalize cluster, will retry");
                ClusterPass::failed(cluster_id, e)
            }
        }
    }
}
