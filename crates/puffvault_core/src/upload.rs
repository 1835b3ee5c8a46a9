//! Batched document upload.
//!
//! Documents are grouped per owner and submitted in calls of up to
//! `docs_per_call` documents: the write path amortizes per-call overhead, so
//! one call with two hundred documents beats two hundred calls with one.
//! Upload failures never escape as errors; they become failure counts the
//! batch loop aggregates.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::delegation::{CREATE_DATA_COMMAND, DelegationAuthority, DelegationToken};
use crate::error::{MigrationError, Result, VaultErrorKind};
use crate::identity::OwnerIdentity;
use crate::progress::UploadLogEntry;
use crate::retry::{RetryPolicy, retry_with};
use crate::transform::VaultDocument;
use crate::vault::{AclEntry, CreateDataRequest, DocumentOutcome, VaultStore};

/// Result of uploading one owner's pending documents.
#[derive(Debug, Default)]
pub struct OwnerUploadOutcome {
    pub uploaded: Vec<UploadLogEntry>,
    pub failed: u64,
}

/// Submits transformed documents to the vault store under their owner
/// identities.
pub struct Uploader {
    vault: Arc<dyn VaultStore>,
    authority: Arc<DelegationAuthority>,
    retry: RetryPolicy,
    docs_per_call: usize,
}

impl Uploader {
    pub fn new(
        vault: Arc<dyn VaultStore>,
        authority: Arc<DelegationAuthority>,
        retry: RetryPolicy,
        docs_per_call: usize,
    ) -> Self {
        Self {
            vault,
            authority,
            retry,
            docs_per_call: docs_per_call.clamp(1, 200),
        }
    }

    /// Upload all of one owner's documents for the current batch, chunked
    /// to `docs_per_call`. A fresh delegation covers the whole cycle; an
    /// authorization failure re-delegates once before counting the chunk
    /// failed.
    pub async fn upload_for_owner(
        &self,
        identity: &OwnerIdentity,
        collection: Uuid,
        documents: &[VaultDocument],
    ) -> OwnerUploadOutcome {
        let mut outcome = OwnerUploadOutcome::default();

        let mut token = match self.authority.delegate(CREATE_DATA_COMMAND, &identity.did) {
            Ok(token) => token,
            Err(e) => {
                tracing::error!(
                    owner_ref = identity.owner_ref,
                    error = %e,
                    "delegation failed, owner's documents skipped"
                );
                outcome.failed += documents.len() as u64;
                return outcome;
            }
        };

        for chunk in documents.chunks(self.docs_per_call) {
            let wire: Vec<Value> = chunk.iter().map(VaultDocument::to_wire).collect();
            let request = CreateDataRequest {
                owner: identity.did.clone(),
                acl: AclEntry::operator_read_execute(self.authority.operator_did()),
                collection,
                data: wire,
            };

            let result = self.submit(&mut token, identity, &request).await;
            match result {
                Ok(outcomes) => self.tally(identity, collection, chunk, outcomes, &mut outcome),
                Err(e) => {
                    tracing::warn!(
                        owner_ref = identity.owner_ref,
                        documents = chunk.len(),
                        error = %e,
                        "upload chunk failed"
                    );
                    outcome.failed += chunk.len() as u64;
                }
            }
        }

        outcome
    }

    /// One chunk submission: transient failures go through the retry
    /// policy; an authorization failure gets exactly one fresh delegation.
    async fn submit(
        &self,
        token: &mut DelegationToken,
        identity: &OwnerIdentity,
        request: &CreateDataRequest,
    ) -> Result<Vec<DocumentOutcome>> {
        let attempt = {
            let token: &DelegationToken = token;
            retry_with(&self.retry, "upload", move || async move {
                self.vault.create_data(token, request).await
            })
            .await
        };

        match attempt {
            Err(MigrationError::Vault {
                kind: VaultErrorKind::Authorization,
                message,
            }) => {
                tracing::debug!(
                    owner_ref = identity.owner_ref,
                    %message,
                    "delegation rejected, re-issuing once"
                );
                *token = self.authority.delegate(CREATE_DATA_COMMAND, &identity.did)?;
                let token: &DelegationToken = token;
                retry_with(&self.retry, "upload-redelegated", move || async move {
                    self.vault.create_data(token, request).await
                })
                .await
            }
            other => other,
        }
    }

    fn tally(
        &self,
        identity: &OwnerIdentity,
        collection: Uuid,
        chunk: &[VaultDocument],
        outcomes: Vec<DocumentOutcome>,
        outcome: &mut OwnerUploadOutcome,
    ) {
        let mut created = 0usize;
        let mut rejected = 0usize;
        for document_outcome in outcomes {
            match document_outcome {
                DocumentOutcome::Created { id } => {
                    created += 1;
                    outcome.uploaded.push(UploadLogEntry {
                        owner_ref: identity.owner_ref,
                        owner_did: identity.did.clone(),
                        collection_id: collection,
                        document_id: id,
                    });
                }
                DocumentOutcome::Rejected { reason } => {
                    // Validation failure: the record is dropped and logged.
                    tracing::warn!(
                        owner_ref = identity.owner_ref,
                        %reason,
                        "document rejected by vault store"
                    );
                    rejected += 1;
                }
            }
        }
        outcome.failed += rejected as u64;
        // The store answered for fewer documents than we sent; the missing
        // ones count as failed rather than silently vanishing.
        if created + rejected < chunk.len() {
            outcome.failed += (chunk.len() - created - rejected) as u64;
        }
    }
}
