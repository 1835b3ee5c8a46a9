//! Target vault-store API.
//!
//! The sharded document store is an opaque write/read surface behind the
//! [`VaultStore`] trait: an HTTP client for the real network, an in-memory
//! store for dry runs and tests. Replication and consensus across nodes are
//! the store's problem, not this pipeline's.

mod http;
mod memory;

pub use http::HttpVaultClient;
pub use memory::MemoryVault;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::delegation::DelegationToken;
use crate::error::Result;

/// Target collection descriptor. Created once per run (or reused when an id
/// is supplied) and immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionDescriptor {
    #[serde(rename = "_id")]
    pub id: Uuid,
    /// Ownership mode; always "owned" here (each uploading identity owns
    /// its documents).
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub schema: Value,
}

impl CollectionDescriptor {
    pub fn owned(id: Uuid, name: impl Into<String>, schema: Value) -> Self {
        Self {
            id,
            kind: "owned".into(),
            name: name.into(),
            schema,
        }
    }
}

/// Access-control entry attached to uploaded documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    pub grantee: String,
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl AclEntry {
    /// The operator may read and execute over uploaded documents, never
    /// write.
    pub fn operator_read_execute(grantee: impl Into<String>) -> Self {
        Self {
            grantee: grantee.into(),
            read: true,
            write: false,
            execute: true,
        }
    }
}

/// One `createData` call: documents uploaded under `owner`, readable by the
/// ACL grantee.
#[derive(Debug, Clone, Serialize)]
pub struct CreateDataRequest {
    pub owner: String,
    pub acl: AclEntry,
    pub collection: Uuid,
    pub data: Vec<Value>,
}

/// Per-document upload outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentOutcome {
    Created { id: String },
    Rejected { reason: String },
}

/// The opaque target-store API.
#[async_trait]
pub trait VaultStore: Send + Sync {
    /// Create the target collection. Fails if it already exists.
    async fn create_collection(&self, collection: &CollectionDescriptor) -> Result<()>;

    /// Whether a collection id is usable for uploads.
    async fn has_collection(&self, id: Uuid) -> Result<bool>;

    /// Submit documents under the owner identity named in the request,
    /// authorized by `token`. Returns one outcome per document.
    async fn create_data(
        &self,
        token: &DelegationToken,
        request: &CreateDataRequest,
    ) -> Result<Vec<DocumentOutcome>>;

    /// Number of documents in a collection (status reporting; the full read
    /// API belongs to the dashboard, not this pipeline).
    async fn count_data(&self, collection: Uuid) -> Result<u64>;
}
