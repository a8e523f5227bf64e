use std::sync::Arc;

use chrono::{DateTime, Utc};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use vigil_common::{IncidentCluster, IntakeConfig, SettlementConfig};

use crate::error::Result;
use crate::intake::{IntakeCoordinator, ReportSubmission, SubmitOutcome};
use crate::resolver::{ExpirationReport, LifecycleResolver};
use crate::traits::{AccountStore, LedgerStore, NotificationSink, SubcategoryCatalog};

/// Shared dependency container for the ledger.
///
/// Holds the long-lived capability handles; `build()` wires them into the
/// intake coordinator and lifecycle resolver.
#[derive(Clone, TypedBuilder)]
pub struct LedgerDeps {
    pub store: Arc<dyn LedgerStore>,
    pub accounts: Arc<dyn AccountStore>,
    pub notifier: Arc<dyn NotificationSink>,
    pub catalog: Arc<dyn SubcategoryCatalog>,
    #[builder(default)]
    pub intake: IntakeConfig,
    #[builder(default)]
    pub settlement: SettlementConfig,
    #[builder(default = 4)]
    pub resolver_concurrency: usize,
    #[builder(default = 500)]
    pub resolver_batch_limit: i64,
}

impl LedgerDeps {
    pub fn build(self) -> IncidentLedger {
        let intake = IntakeCoordinator::new(
            self.store.clone(),
            self.accounts.clone(),
            self.notifier.clone(),
            self.catalog,
            self.intake,
        );
        let resolver = LifecycleResolver::new(
            self.store.clone(),
            self.accounts,
            self.notifier,
            self.settlement,
            self.resolver_concurrency,
            self.resolver_batch_limit,
        );
        IncidentLedger {
            store: self.store,
            intake,
            resolver,
        }
    }
}

/// The operations exposed to the transport layer and the scheduler.
pub struct IncidentLedger {
    store: Arc<dyn LedgerStore>,
    intake: IntakeCoordinator,
    resolver: LifecycleResolver,
}

impl IncidentLedger {
    pub async fn submit_report(
        &self,
        submission: ReportSubmission,
        now: DateTime<Utc>,
    ) -> Result<SubmitOutcome> {
        self.intake.submit_report(submission, now).await
    }

    pub async fn run_expiration_pass(&self, now: DateTime<Utc>) -> Result<ExpirationReport> {
        self.resolver.run_expiration_pass(now).await
    }

    /// Current credibility for display. `None` for an unknown cluster or one
    /// without evidence.
    pub async fn cluster_credibility(&self, cluster_id: Uuid) -> Result<Option<f64>> {
        Ok(self
            .store
            .cluster(cluster_id)
            .await?
            .and_then(|c| c.credibility))
    }

    pub async fn cluster(&self, cluster_id: Uuid) -> Result<Option<IncidentCluster>> {
        self.store.cluster(cluster_id).await
    }
}
