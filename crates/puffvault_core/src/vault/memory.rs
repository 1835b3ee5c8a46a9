//! In-memory vault store for dry runs and tests.
//!
//! Behaves like the real store at the contract level: collections must
//! exist before writes, delegations are verified (signature, audience,
//! scope, expiry) at the boundary, and each accepted document gets a
//! created id.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use crate::delegation::{CREATE_DATA_COMMAND, DelegationToken, verify_delegation};
use crate::error::{MigrationError, Result, VaultErrorKind};
use crate::vault::{CollectionDescriptor, CreateDataRequest, DocumentOutcome, VaultStore};

/// A document as accepted by the in-memory store.
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub owner: String,
    pub acl_grantee: String,
    pub document: Value,
}

/// In-memory implementation of [`VaultStore`].
#[derive(Debug)]
pub struct MemoryVault {
    operator_did: String,
    collections: DashMap<Uuid, CollectionDescriptor>,
    documents: DashMap<Uuid, Vec<StoredDocument>>,
}

impl MemoryVault {
    /// `operator_did` is the issuer every presented delegation must verify
    /// against.
    pub fn new(operator_did: impl Into<String>) -> Self {
        Self {
            operator_did: operator_did.into(),
            collections: DashMap::new(),
            documents: DashMap::new(),
        }
    }

    /// Documents accepted into a collection so far.
    pub fn documents(&self, collection: Uuid) -> Vec<StoredDocument> {
        self.documents
            .get(&collection)
            .map(|docs| docs.value().clone())
            .unwrap_or_default()
    }

    pub fn collection(&self, id: Uuid) -> Option<CollectionDescriptor> {
        self.collections.get(&id).map(|c| c.value().clone())
    }
}

#[async_trait]
impl VaultStore for MemoryVault {
    async fn create_collection(&self, collection: &CollectionDescriptor) -> Result<()> {
        if self.collections.contains_key(&collection.id) {
            return Err(MigrationError::vault(
                VaultErrorKind::Validation,
                format!("collection {} already exists", collection.id),
            ));
        }
        self.collections.insert(collection.id, collection.clone());
        Ok(())
    }

    async fn has_collection(&self, id: Uuid) -> Result<bool> {
        Ok(self.collections.contains_key(&id))
    }

    async fn create_data(
        &self,
        token: &DelegationToken,
        request: &CreateDataRequest,
    ) -> Result<Vec<DocumentOutcome>> {
        // The store enforces the delegation contract: tokens issued for one
        // audience are invalid for any other presenter.
        verify_delegation(
            token,
            &self.operator_did,
            &request.owner,
            CREATE_DATA_COMMAND,
            chrono::Utc::now().timestamp(),
        )
        .map_err(|e| MigrationError::vault(VaultErrorKind::Authorization, e.to_string()))?;

        if !self.collections.contains_key(&request.collection) {
            return Err(MigrationError::vault(
                VaultErrorKind::Validation,
                format!("unknown collection {}", request.collection),
            ));
        }

        let mut outcomes = Vec::with_capacity(request.data.len());
        let mut stored = self.documents.entry(request.collection).or_default();
        for document in &request.data {
            match document.get("_id").and_then(Value::as_str) {
                Some(id) => {
                    stored.push(StoredDocument {
                        owner: request.owner.clone(),
                        acl_grantee: request.acl.grantee.clone(),
                        document: document.clone(),
                    });
                    outcomes.push(DocumentOutcome::Created { id: id.to_string() });
                }
                None => outcomes.push(DocumentOutcome::Rejected {
                    reason: "document missing _id".into(),
                }),
            }
        }
        Ok(outcomes)
    }

    async fn count_data(&self, collection: Uuid) -> Result<u64> {
        Ok(self
            .documents
            .get(&collection)
            .map(|docs| docs.len() as u64)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::delegation::DelegationAuthority;
    use crate::identity::Keypair;
    use crate::vault::AclEntry;

    fn setup() -> (DelegationAuthority, MemoryVault, Uuid) {
        let authority = DelegationAuthority::new(Keypair::generate(), 3600);
        let vault = MemoryVault::new(authority.operator_did());
        let collection = Uuid::new_v4();
        (authority, vault, collection)
    }

    async fn create_collection(vault: &MemoryVault, id: Uuid) {
        vault
            .create_collection(&CollectionDescriptor::owned(id, "test", json!({})))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_accepts_valid_delegation() {
        let (authority, vault, collection) = setup();
        create_collection(&vault, collection).await;

        let owner = Keypair::generate();
        let token = authority
            .delegate(CREATE_DATA_COMMAND, &owner.did())
            .unwrap();
        let request = CreateDataRequest {
            owner: owner.did(),
            acl: AclEntry::operator_read_execute(authority.operator_did()),
            collection,
            data: vec![json!({"_id": "doc-1"})],
        };

        let outcomes = vault.create_data(&token, &request).await.unwrap();
        assert_eq!(
            outcomes,
            vec![DocumentOutcome::Created { id: "doc-1".into() }]
        );
        assert_eq!(vault.count_data(collection).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rejects_token_for_other_identity() {
        let (authority, vault, collection) = setup();
        create_collection(&vault, collection).await;

        let owner = Keypair::generate();
        let impostor = Keypair::generate();
        let token = authority
            .delegate(CREATE_DATA_COMMAND, &owner.did())
            .unwrap();
        let request = CreateDataRequest {
            owner: impostor.did(),
            acl: AclEntry::operator_read_execute(authority.operator_did()),
            collection,
            data: vec![json!({"_id": "doc-1"})],
        };

        let result = vault.create_data(&token, &request).await;
        assert!(matches!(
            result,
            Err(MigrationError::Vault {
                kind: VaultErrorKind::Authorization,
                ..
            })
        ));
        assert_eq!(vault.count_data(collection).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_collection_rejected() {
        let (_, vault, collection) = setup();
        create_collection(&vault, collection).await;

        let result = vault
            .create_collection(&CollectionDescriptor::owned(collection, "dup", json!({})))
            .await;
        assert!(result.is_err());
    }
}
