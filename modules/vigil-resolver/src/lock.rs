// Session advisory lock: at most one resolver runs a pass at a time.

use anyhow::Result;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tracing::warn;

/// Advisory lock key shared by every resolver process ("vigil_rs").
pub const RESOLVER_LOCK_KEY: i64 = 0x7669_6769_6c5f_7273;

/// A held advisory lock. Session locks belong to a connection, so the
/// connection is kept until `release`.
pub struct ResolverLock {
    conn: PoolConnection<Postgres>,
    key: i64,
}

impl ResolverLock {
    /// Try to take the lock without waiting. `None` if another session holds it.
    pub async fn try_acquire(pool: &PgPool, key: i64) -> Result<Option<Self>> {
        let mut conn = pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;

        Ok(acquired.then_some(Self { conn, key }))
    }

    pub async fn release(mut self) {
        let result = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(self.key)
            .fetch_one(&mut *self.conn)
            .await;

        match result {
            Ok(true) => {}
            Ok(false) => warn!(key = self.key, "Advisory lock was not held at release"),
            Err(e) => {
                // Closing the session drops the lock with it.
                warn!(error = %e, key = self.key, "Failed to release advisory lock");
                self.conn.close_on_drop();
            }
        }
    }
}
