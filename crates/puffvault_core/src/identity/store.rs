//! Durable identity persistence.
//!
//! Provisioned keys are upserted into the source database keyed by owner
//! reference, so re-runs converge on the same identity instead of minting a
//! new one (which would orphan everything already uploaded under the old
//! key).

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::PgPool;

use crate::error::Result;

/// A persisted identity row.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct StoredIdentity {
    /// Owner reference in the source table.
    pub user_id: i64,
    /// Hex-encoded secret key.
    pub secret_key: String,
    /// Derived decentralized identifier.
    pub did: String,
}

/// Repository abstraction over identity persistence.
///
/// `put` has upsert semantics: conflicting owner references overwrite the
/// prior key material and bump the updated timestamp.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn get(&self, owner_ref: i64) -> Result<Option<StoredIdentity>>;
    async fn put(&self, identity: &StoredIdentity) -> Result<()>;
    /// Number of identities currently persisted (for status reporting).
    async fn count(&self) -> Result<i64>;
}

/// Identity store backed by a `vault_identities` table in the source
/// database.
#[derive(Debug, Clone)]
pub struct PgIdentityStore {
    pool: PgPool,
}

impl PgIdentityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the identity table if it does not exist yet.
    pub async fn ensure_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vault_identities (
                id BIGSERIAL PRIMARY KEY,
                user_id BIGINT NOT NULL UNIQUE,
                secret_key TEXT NOT NULL,
                did TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        tracing::debug!("vault_identities table ready");
        Ok(())
    }
}

#[async_trait]
impl IdentityStore for PgIdentityStore {
    async fn get(&self, owner_ref: i64) -> Result<Option<StoredIdentity>> {
        let row = sqlx::query_as::<_, StoredIdentity>(
            "SELECT user_id, secret_key, did FROM vault_identities WHERE user_id = $1",
        )
        .bind(owner_ref)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn put(&self, identity: &StoredIdentity) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO vault_identities (user_id, secret_key, did)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE
            SET secret_key = EXCLUDED.secret_key,
                did = EXCLUDED.did,
                updated_at = NOW()
            "#,
        )
        .bind(identity.user_id)
        .bind(&identity.secret_key)
        .bind(&identity.did)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vault_identities")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

/// In-memory identity store for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    identities: DashMap<i64, StoredIdentity>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn get(&self, owner_ref: i64) -> Result<Option<StoredIdentity>> {
        Ok(self.identities.get(&owner_ref).map(|e| e.value().clone()))
    }

    async fn put(&self, identity: &StoredIdentity) -> Result<()> {
        self.identities.insert(identity.user_id, identity.clone());
        Ok(())
    }

    async fn count(&self) -> Result<i64> {
        Ok(self.identities.len() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_upsert_overwrites() {
        let store = MemoryIdentityStore::new();
        let first = StoredIdentity {
            user_id: 7,
            secret_key: "aa".into(),
            did: "did:nil:aa".into(),
        };
        let second = StoredIdentity {
            user_id: 7,
            secret_key: "bb".into(),
            did: "did:nil:bb".into(),
        };

        store.put(&first).await.unwrap();
        store.put(&second).await.unwrap();

        assert_eq!(store.get(7).await.unwrap(), Some(second));
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_get_missing() {
        let store = MemoryIdentityStore::new();
        assert_eq!(store.get(42).await.unwrap(), None);
    }
}
