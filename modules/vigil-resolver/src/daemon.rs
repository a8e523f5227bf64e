use std::fmt;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use sqlx::PgPool;
use tracing::{error, info, warn};

use vigil_ledger::{ExpirationReport, IncidentLedger};

use crate::lock::{ResolverLock, RESOLVER_LOCK_KEY};

/// Running totals across ticks.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DaemonStats {
    pub ticks: u64,
    pub ticks_skipped: u64,
    pub passes_failed: u64,
    pub clusters_resolved: u64,
    pub clusters_closed_without_evidence: u64,
    pub voter_settlements: u64,
    pub unit_failures: u64,
}

impl DaemonStats {
    pub fn record(&mut self, report: &ExpirationReport) {
        self.clusters_resolved += report.clusters_resolved as u64;
        self.clusters_closed_without_evidence += report.clusters_closed_without_evidence as u64;
        self.voter_settlements += report.voter_settlements as u64;
        self.unit_failures += report.failures.len() as u64;
    }
}

impl fmt::Display for DaemonStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ticks={} skipped={} passes_failed={} resolved={} closed_without_evidence={} settlements={} unit_failures={}",
            self.ticks,
            self.ticks_skipped,
            self.passes_failed,
            self.clusters_resolved,
            self.clusters_closed_without_evidence,
            self.voter_settlements,
            self.unit_failures,
        )
    }
}

/// Outcome of a single tick.
#[derive(Debug)]
pub enum Tick {
    Ran(ExpirationReport),
    /// Another resolver held the lock.
    Skipped,
}

pub struct ResolverDaemon {
    pool: PgPool,
    ledger: IncidentLedger,
    interval: Duration,
    stats: DaemonStats,
}

impl ResolverDaemon {
    pub fn new(pool: PgPool, ledger: IncidentLedger, interval: Duration) -> Self {
        Self {
            pool,
            ledger,
            interval,
            stats: DaemonStats::default(),
        }
    }

    pub fn stats(&self) -> &DaemonStats {
        &self.stats
    }

    /// One expiration pass under the advisory lock.
    pub async fn tick(&mut self) -> Result<Tick> {
        self.stats.ticks += 1;

        let Some(lock) = ResolverLock::try_acquire(&self.pool, RESOLVER_LOCK_KEY).await? else {
            self.stats.ticks_skipped += 1;
            info!("Another resolver holds the lock, skipping tick");
            return Ok(Tick::Skipped);
        };

        let result = self.ledger.run_expiration_pass(Utc::now()).await;

        // Always release lock
        lock.release().await;

        let report = result.inspect_err(|_| self.stats.passes_failed += 1)?;
        self.stats.record(&report);

        for failure in &report.failures {
            warn!(?failure, "Unit left for next pass");
        }
        Ok(Tick::Ran(report))
    }

    /// Tick on the configured interval until ctrl-c.
    pub async fn run(mut self) -> DaemonStats {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(interval_secs = self.interval.as_secs(), "Resolver loop started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Expiration pass failed, retrying next tick");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_ledger::UnitFailure;

    #[test]
    fn stats_accumulate_across_reports() {
        let mut stats = DaemonStats::default();
        let report = ExpirationReport {
            clusters_selected: 3,
            clusters_resolved: 2,
            clusters_closed_without_evidence: 1,
            voter_settlements: 7,
            ..Default::default()
        };
        stats.record(&report);
        stats.record(&ExpirationReport {
            failures: vec![UnitFailure::Cluster {
                cluster_id: Default::default(),
                error: "timeout".into(),
            }],
            ..Default::default()
        });

        assert_eq!(stats.clusters_resolved, 2);
        assert_eq!(stats.clusters_closed_without_evidence, 1);
        assert_eq!(stats.voter_settlements, 7);
        assert_eq!(stats.unit_failures, 1);
        assert_eq!(
            stats.to_string(),
            "ticks=0 skipped=0 passes_failed=0 resolved=2 closed_without_evidence=1 settlements=7 unit_failures=1"
        );
    }
}
