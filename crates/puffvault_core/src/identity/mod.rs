//! Owner identity provisioning.
//!
//! Each owner reference in the source table gets exactly one cryptographic
//! identity. The provisioner checks an in-memory cache, then the durable
//! store, and only generates fresh key material when neither has the owner.
//! New keys are persisted *before* they enter the cache: no record is ever
//! uploaded under an identity whose key is unrecoverable.

mod keypair;
mod store;

pub use keypair::{DID_PREFIX, Keypair, verify_signature};
pub use store::{IdentityStore, MemoryIdentityStore, PgIdentityStore, StoredIdentity};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::error::{MigrationError, Result};

/// A provisioned identity for one owner reference.
#[derive(Debug, Clone)]
pub struct OwnerIdentity {
    /// Owner reference in the source table.
    pub owner_ref: i64,
    /// Keypair backing this identity.
    pub keypair: Keypair,
    /// Derived decentralized identifier.
    pub did: String,
}

/// Lazily provisions identities, at most once per owner reference.
pub struct IdentityProvisioner {
    store: Arc<dyn IdentityStore>,
    cache: DashMap<i64, Arc<OwnerIdentity>>,
    generated: AtomicU64,
}

impl IdentityProvisioner {
    pub fn new(store: Arc<dyn IdentityStore>) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            generated: AtomicU64::new(0),
        }
    }

    /// Get or create the identity for an owner reference.
    ///
    /// Idempotent within a run: repeated calls return the same cached
    /// `Arc`. Across runs the durable store wins, so a resumed migration
    /// reuses the keys its predecessor persisted.
    pub async fn identity_for(&self, owner_ref: i64) -> Result<Arc<OwnerIdentity>> {
        if let Some(cached) = self.cache.get(&owner_ref) {
            return Ok(cached.value().clone());
        }

        if let Some(stored) = self.store.get(owner_ref).await? {
            let keypair = Keypair::from_hex(&stored.secret_key)?;
            let identity = Arc::new(OwnerIdentity {
                owner_ref,
                did: keypair.did(),
                keypair,
            });
            tracing::debug!(owner_ref, did = %identity.did, "reusing persisted identity");
            return Ok(self
                .cache
                .entry(owner_ref)
                .or_insert(identity)
                .value()
                .clone());
        }

        let keypair = Keypair::generate();
        let did = keypair.did();
        let stored = StoredIdentity {
            user_id: owner_ref,
            secret_key: keypair.secret_hex(),
            did: did.clone(),
        };

        // Persist first. A cache entry must imply a durable key.
        self.store
            .put(&stored)
            .await
            .map_err(|e| MigrationError::IdentityPersistence {
                owner_ref,
                cause: e.to_string(),
            })?;

        let generated = self.generated.fetch_add(1, Ordering::Relaxed) + 1;
        if generated % 50 == 0 {
            tracing::info!(generated, "identities provisioned so far");
        }
        tracing::debug!(owner_ref, did = %did, "provisioned new identity");

        let identity = Arc::new(OwnerIdentity {
            owner_ref,
            keypair,
            did,
        });
        Ok(self
            .cache
            .entry(owner_ref)
            .or_insert(identity)
            .value()
            .clone())
    }

    /// Identities newly generated (and persisted) this run.
    pub fn provisioned_count(&self) -> u64 {
        self.generated.load(Ordering::Relaxed)
    }

    /// Identities held in the run cache.
    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;

    /// Store wrapper that counts writes and optionally fails them.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryIdentityStore,
        puts: AtomicU64,
        fail_puts: bool,
    }

    #[async_trait]
    impl IdentityStore for CountingStore {
        async fn get(&self, owner_ref: i64) -> Result<Option<StoredIdentity>> {
            self.inner.get(owner_ref).await
        }

        async fn put(&self, identity: &StoredIdentity) -> Result<()> {
            if self.fail_puts {
                return Err(MigrationError::config("store", "injected failure"));
            }
            self.puts.fetch_add(1, Ordering::SeqCst);
            self.inner.put(identity).await
        }

        async fn count(&self) -> Result<i64> {
            self.inner.count().await
        }
    }

    #[tokio::test]
    async fn test_identity_cached_after_first_call() {
        let store = Arc::new(CountingStore::default());
        let provisioner = IdentityProvisioner::new(store.clone());

        let first = provisioner.identity_for(7).await.unwrap();
        let second = provisioner.identity_for(7).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.did, second.did);
        assert_eq!(store.puts.load(Ordering::SeqCst), 1);
        assert_eq!(provisioner.provisioned_count(), 1);
    }

    #[tokio::test]
    async fn test_distinct_owners_get_distinct_identities() {
        let provisioner = IdentityProvisioner::new(Arc::new(MemoryIdentityStore::new()));

        let a = provisioner.identity_for(7).await.unwrap();
        let b = provisioner.identity_for(9).await.unwrap();

        assert_ne!(a.did, b.did);
        assert_eq!(provisioner.cached_count(), 2);
    }

    #[tokio::test]
    async fn test_persisted_identity_reused_across_runs() {
        let store = Arc::new(MemoryIdentityStore::new());

        let first_run = IdentityProvisioner::new(store.clone());
        let original = first_run.identity_for(7).await.unwrap();

        let second_run = IdentityProvisioner::new(store);
        let restored = second_run.identity_for(7).await.unwrap();

        assert_eq!(original.did, restored.did);
        // Nothing newly generated in the second run.
        assert_eq!(second_run.provisioned_count(), 0);
    }

    #[tokio::test]
    async fn test_persist_failure_never_caches() {
        let store = Arc::new(CountingStore {
            fail_puts: true,
            ..Default::default()
        });
        let provisioner = IdentityProvisioner::new(store);

        let result = provisioner.identity_for(7).await;
        assert!(matches!(
            result,
            Err(MigrationError::IdentityPersistence { owner_ref: 7, .. })
        ));
        assert_eq!(provisioner.cached_count(), 0);
    }
}
