use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vigil_common::file_config::load_config;
use vigil_common::Config;
use vigil_events::EventStore;
use vigil_ledger::store::migrate;
use vigil_ledger::{LedgerDeps, PgAccountStore, PgCatalog, PgLedgerStore};
use vigil_resolver::daemon::ResolverDaemon;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize logging
    let filter = EnvFilter::from_default_env().add_directive("vigil=info".parse()?);
    if config.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Vigil resolver starting...");
    config.log_redacted();

    let rules = load_config(&config.config_path)?;

    let pool = PgPoolOptions::new()
        .max_connections(config.resolver_concurrency as u32 + 2)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to Postgres")?;

    // Run migrations (idempotent)
    migrate(&pool).await.context("Failed to run migrations")?;

    let catalog = PgCatalog::new(pool.clone());
    catalog.sync(&rules.subcategories).await?;

    let ledger = LedgerDeps::builder()
        .store(Arc::new(PgLedgerStore::new(pool.clone())))
        .accounts(Arc::new(PgAccountStore::new(pool.clone())))
        .notifier(Arc::new(EventStore::new(pool.clone())))
        .catalog(Arc::new(catalog))
        .intake(rules.intake)
        .settlement(rules.settlement)
        .resolver_concurrency(config.resolver_concurrency)
        .resolver_batch_limit(config.resolver_batch_limit)
        .build()
        .build();

    let daemon = ResolverDaemon::new(
        pool,
        ledger,
        Duration::from_secs(config.resolver_interval_secs.max(1)),
    );
    let stats = daemon.run().await;

    info!("Resolver stopped. {stats}");
    Ok(())
}
