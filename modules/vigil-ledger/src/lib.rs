//! Incident ledger: clusters crowd reports, weighs votes by voter
//! credibility and settles voters when a cluster expires.

pub mod catalog;
pub mod error;
pub mod intake;
pub mod ledger;
pub mod matcher;
pub mod resolver;
pub mod scoring;
pub mod store;
pub mod traits;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use catalog::FileCatalog;
pub use error::{LedgerError, Result};
pub use intake::{IntakeCoordinator, Rejection, ReportSubmission, SubmitOutcome};
pub use ledger::{IncidentLedger, LedgerDeps};
pub use matcher::{ClusterMatch, ClusterMatcher, MatchCandidate};
pub use resolver::{
    ClusterDisposition, ExpirationReport, LifecycleResolver, UnitFailure, VoterSettlement,
};
pub use store::{PgAccountStore, PgCatalog, PgLedgerStore};
pub use traits::{
    AccountStore, LedgerStore, LedgerTx, NoopNotifier, NotificationSink, ReportInsert,
    SubcategoryCatalog,
};
