//! Report intake: match-or-create a cluster, guard the one-report-per-voter
//! rule, apply the weighted vote and persist the evidence row.
//!
//! Every decision for one report runs inside a single `LedgerTx`. The cluster
//! row is locked before its tallies or centroid are read, so concurrent votes
//! on the same cluster serialize instead of losing updates. Two fresh reports
//! for the same new incident can still both miss and create two clusters;
//! that residual race is accepted.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use vigil_common::{
    GeoPoint, IncidentCluster, IncidentReport, IntakeConfig, Notification, NotificationKind,
    SubcategoryRules, VoteDirection,
};

use crate::error::Result;
use crate::matcher::{hours, ClusterMatcher, MatchCandidate};
use crate::scoring;
use crate::traits::{
    AccountStore, LedgerStore, LedgerTx, NotificationSink, ReportInsert, SubcategoryCatalog,
};

/// One inbound report as handed over by the transport layer.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ReportSubmission {
    pub voter_id: Uuid,
    #[builder(setter(into))]
    pub subcategory: String,
    pub location: GeoPoint,
    pub reported_at: DateTime<Utc>,
    /// Explicit vote. Absent on a fresh report (implicit confirmation) and on
    /// a location refinement.
    #[builder(default, setter(strip_option))]
    pub vote: Option<VoteDirection>,
    /// Set when the client is reinforcing a known cluster.
    #[builder(default, setter(strip_option))]
    pub cluster_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// No open cluster matched; a new one was created with this report.
    Created { cluster_id: Uuid, report_id: Uuid },
    /// The report was counted as a vote on an existing cluster.
    Joined { cluster_id: Uuid, report_id: Uuid },
    /// Only the centroid moved. No report row, no tally change.
    LocationRefined { cluster_id: Uuid },
    /// The voter already has a report on this cluster. Nothing changed.
    AlreadyRecorded { cluster_id: Uuid },
    Declined(Rejection),
}

impl SubmitOutcome {
    pub fn cluster_id(&self) -> Option<Uuid> {
        match self {
            Self::Created { cluster_id, .. }
            | Self::Joined { cluster_id, .. }
            | Self::LocationRefined { cluster_id }
            | Self::AlreadyRecorded { cluster_id } => Some(*cluster_id),
            Self::Declined(_) => None,
        }
    }

    pub fn report_id(&self) -> Option<Uuid> {
        match self {
            Self::Created { report_id, .. } | Self::Joined { report_id, .. } => Some(*report_id),
            _ => None,
        }
    }
}

/// Expected, user-facing reasons to turn a report away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("coordinates are not a valid WGS84 point")]
    MalformedCoordinates,
    #[error("unknown subcategory")]
    UnknownSubcategory,
    #[error("unknown voter")]
    UnknownVoter,
    #[error("cluster not found")]
    ClusterNotFound,
    #[error("cluster is no longer accepting votes")]
    ClusterClosed,
    #[error("no open cluster to dispute")]
    NoClusterToDispute,
}

pub struct IntakeCoordinator {
    store: Arc<dyn LedgerStore>,
    accounts: Arc<dyn AccountStore>,
    notifier: Arc<dyn NotificationSink>,
    catalog: Arc<dyn SubcategoryCatalog>,
    matcher: ClusterMatcher,
    config: IntakeConfig,
}

impl IntakeCoordinator {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        accounts: Arc<dyn AccountStore>,
        notifier: Arc<dyn NotificationSink>,
        catalog: Arc<dyn SubcategoryCatalog>,
        config: IntakeConfig,
    ) -> Self {
        Self {
            store,
            accounts,
            notifier,
            catalog,
            matcher: ClusterMatcher::new(config.match_window_hours),
            config,
        }
    }

    /// Process one report. `now` is the processing time: whether a cluster
    /// still accepts votes is decided against it, never against the
    /// client-supplied `reported_at`.
    pub async fn submit_report(
        &self,
        submission: ReportSubmission,
        now: DateTime<Utc>,
    ) -> Result<SubmitOutcome> {
        if !submission.location.is_valid() {
            return Ok(SubmitOutcome::Declined(Rejection::MalformedCoordinates));
        }

        let outcome = match (submission.cluster_id, submission.vote) {
            (Some(cluster_id), None) => self.refine_location(cluster_id, &submission, now).await?,
            (Some(cluster_id), Some(vote)) => {
                self.vote_on_cluster(cluster_id, vote, &submission, now).await?
            }
            (None, _) => self.submit_fresh(&submission, now).await?,
        };

        match outcome {
            SubmitOutcome::Created { cluster_id, .. } => {
                self.emit_side_effects(&submission, cluster_id, NotificationKind::NewCluster)
                    .await
            }
            SubmitOutcome::Joined { cluster_id, .. } => {
                self.emit_side_effects(&submission, cluster_id, NotificationKind::NewEvidence)
                    .await
            }
            SubmitOutcome::AlreadyRecorded { cluster_id } => {
                debug!(%cluster_id, voter_id = %submission.voter_id, "Duplicate vote ignored");
            }
            SubmitOutcome::Declined(reason) => {
                debug!(voter_id = %submission.voter_id, %reason, "Report declined");
            }
            SubmitOutcome::LocationRefined { .. } => {}
        }

        Ok(outcome)
    }

    /// Explicit cluster, no vote: move the centroid only.
    async fn refine_location(
        &self,
        cluster_id: Uuid,
        submission: &ReportSubmission,
        now: DateTime<Utc>,
    ) -> Result<SubmitOutcome> {
        let mut tx = self.store.begin().await?;
        let Some(mut cluster) = tx.lock_cluster(cluster_id).await? else {
            return Ok(SubmitOutcome::Declined(Rejection::ClusterNotFound));
        };
        if !cluster.accepts_votes_at(now) {
            return Ok(SubmitOutcome::Declined(Rejection::ClusterClosed));
        }

        cluster.centroid = cluster.centroid.averaged_with(&submission.location);
        tx.update_cluster(&cluster).await?;
        tx.commit().await?;

        debug!(%cluster_id, lat = cluster.centroid.lat, lng = cluster.centroid.lng, "Centroid refined");
        Ok(SubmitOutcome::LocationRefined { cluster_id })
    }

    /// Explicit cluster with a vote direction.
    async fn vote_on_cluster(
        &self,
        cluster_id: Uuid,
        vote: VoteDirection,
        submission: &ReportSubmission,
        now: DateTime<Utc>,
    ) -> Result<SubmitOutcome> {
        let Some(credibility) = self.accounts.credibility(submission.voter_id).await? else {
            return Ok(SubmitOutcome::Declined(Rejection::UnknownVoter));
        };

        let mut tx = self.store.begin().await?;
        let Some(cluster) = tx.lock_cluster(cluster_id).await? else {
            return Ok(SubmitOutcome::Declined(Rejection::ClusterNotFound));
        };
        if !cluster.accepts_votes_at(now) {
            return Ok(SubmitOutcome::Declined(Rejection::ClusterClosed));
        }

        self.join(tx, cluster, vote, credibility, submission).await
    }

    /// No cluster id: run the matcher, then join or create.
    async fn submit_fresh(
        &self,
        submission: &ReportSubmission,
        now: DateTime<Utc>,
    ) -> Result<SubmitOutcome> {
        let Some(rules) = self.catalog.rules(&submission.subcategory).await? else {
            return Ok(SubmitOutcome::Declined(Rejection::UnknownSubcategory));
        };
        let Some(credibility) = self.accounts.credibility(submission.voter_id).await? else {
            return Ok(SubmitOutcome::Declined(Rejection::UnknownVoter));
        };

        let mut tx = self.store.begin().await?;
        let candidate = MatchCandidate {
            subcategory: &submission.subcategory,
            location: submission.location,
            at: submission.reported_at,
        };

        if let Some(found) = self.matcher.find_match(tx.as_mut(), &rules, &candidate).await? {
            // Re-read under the row lock; it may have closed since the scan.
            if let Some(cluster) = tx.lock_cluster(found.cluster.id).await? {
                if cluster.accepts_votes_at(now) {
                    let vote = submission.vote.unwrap_or(VoteDirection::Confirm);
                    return self.join(tx, cluster, vote, credibility, submission).await;
                }
            }
        }

        if submission.vote == Some(VoteDirection::Dispute) {
            return Ok(SubmitOutcome::Declined(Rejection::NoClusterToDispute));
        }

        self.create(tx, &rules, credibility, submission, now).await
    }

    /// Count `vote` on a locked, open cluster and record the report.
    async fn join(
        &self,
        mut tx: Box<dyn LedgerTx>,
        mut cluster: IncidentCluster,
        vote: VoteDirection,
        voter_credibility: f64,
        submission: &ReportSubmission,
    ) -> Result<SubmitOutcome> {
        let cluster_id = cluster.id;
        if tx.has_report(cluster_id, submission.voter_id).await? {
            return Ok(SubmitOutcome::AlreadyRecorded { cluster_id });
        }

        let report = new_report(cluster_id, Some(vote), submission);
        if tx.insert_report(&report).await? == ReportInsert::Duplicate {
            return Ok(SubmitOutcome::AlreadyRecorded { cluster_id });
        }

        let weight = scoring::weight(voter_credibility);
        cluster.tallies = scoring::apply_vote(cluster.tallies, vote, weight);
        cluster.credibility = Some(scoring::derive_credibility(&cluster.tallies));
        cluster.centroid = cluster.centroid.averaged_with(&submission.location);
        cluster.vote_count += 1;

        tx.update_cluster(&cluster).await?;
        tx.commit().await?;

        debug!(
            %cluster_id,
            voter_id = %submission.voter_id,
            %vote,
            weight,
            score_true = cluster.tallies.score_true,
            score_false = cluster.tallies.score_false,
            credibility = cluster.credibility,
            "Vote applied"
        );

        Ok(SubmitOutcome::Joined {
            cluster_id,
            report_id: report.id,
        })
    }

    async fn create(
        &self,
        mut tx: Box<dyn LedgerTx>,
        rules: &SubcategoryRules,
        creator_credibility: f64,
        submission: &ReportSubmission,
        now: DateTime<Utc>,
    ) -> Result<SubmitOutcome> {
        let duration_hours = rules
            .default_duration_hours
            .max(self.config.min_duration_hours);
        let tallies = scoring::seed_tallies(creator_credibility);
        // The cluster's lifetime runs on processing time.
        let at = now;

        let cluster = IncidentCluster {
            id: Uuid::new_v4(),
            category: rules.category.clone(),
            subcategory: rules.code.clone(),
            centroid: submission.location,
            created_at: at,
            start_time: at,
            end_time: at + hours(duration_hours),
            tallies,
            credibility: Some(scoring::derive_credibility(&tallies)),
            vote_count: 1,
            comment_count: 0,
            view_count: 0,
            flag_count: 0,
            is_active: true,
        };
        tx.insert_cluster(&cluster).await?;

        let report = new_report(cluster.id, Some(VoteDirection::Confirm), submission);
        tx.insert_report(&report).await?;
        tx.commit().await?;

        info!(
            cluster_id = %cluster.id,
            subcategory = %cluster.subcategory,
            voter_id = %submission.voter_id,
            credibility = cluster.credibility,
            end_time = %cluster.end_time,
            "Cluster created"
        );

        Ok(SubmitOutcome::Created {
            cluster_id: cluster.id,
            report_id: report.id,
        })
    }

    /// Contribution reward and notification. Failures are logged, never
    /// propagated: the report is already committed.
    async fn emit_side_effects(
        &self,
        submission: &ReportSubmission,
        cluster_id: Uuid,
        kind: NotificationKind,
    ) {
        let voter_id = submission.voter_id;

        if self.config.contribution_reward != 0.0 {
            if let Err(e) = self
                .accounts
                .adjust(voter_id, self.config.contribution_reward, 0.0)
                .await
            {
                warn!(error = %e, %voter_id, %cluster_id, "Contribution reward failed (non-fatal)");
            }
        }

        let notification = Notification::new(
            kind,
            voter_id,
            cluster_id,
            json!({
                "subcategory": submission.subcategory,
                "lat": submission.location.lat,
                "lng": submission.location.lng,
                "vote": submission.vote,
            }),
        );
        if let Err(e) = self.notifier.enqueue(&notification).await {
            warn!(error = %e, %voter_id, %cluster_id, %kind, "Notification enqueue failed (non-fatal)");
        }
    }
}

fn new_report(
    cluster_id: Uuid,
    vote: Option<VoteDirection>,
    submission: &ReportSubmission,
) -> IncidentReport {
    IncidentReport {
        id: Uuid::new_v4(),
        cluster_id,
        voter_id: submission.voter_id,
        vote,
        location: submission.location,
        reported_at: submission.reported_at,
        settled_outcome: None,
        settled_at: None,
    }
}
