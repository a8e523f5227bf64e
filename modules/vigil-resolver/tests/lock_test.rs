//! Advisory lock exclusivity. Requires a Postgres instance.
//! Set DATABASE_TEST_URL or these tests are skipped.

use sqlx::PgPool;
use vigil_resolver::lock::ResolverLock;

async fn test_pool() -> Option<PgPool> {
    let url = std::env::var("DATABASE_TEST_URL").ok()?;
    PgPool::connect(&url).await.ok()
}

#[tokio::test]
async fn second_holder_is_refused_until_release() {
    let Some(pool) = test_pool().await else {
        return;
    };
    // Private key so a running resolver does not interfere.
    let key = 0x7669_6769_6c5f_7465;

    let first = ResolverLock::try_acquire(&pool, key).await.unwrap();
    assert!(first.is_some());
    assert!(ResolverLock::try_acquire(&pool, key).await.unwrap().is_none());

    first.unwrap().release().await;

    let again = ResolverLock::try_acquire(&pool, key).await.unwrap();
    assert!(again.is_some());
    again.unwrap().release().await;
}
