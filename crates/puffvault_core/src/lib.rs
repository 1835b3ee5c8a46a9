//! Puffvault Core - PostgreSQL to private-vault bulk migration
//!
//! This crate migrates puff telemetry rows out of a relational source of
//! truth into a sharded, privacy-preserving document store. Every owner in
//! the source gets its own cryptographic identity; the operator delegates
//! narrowly-scoped write capability to each identity, and documents land
//! with their sensitive fields tagged for field-level encryption.
//!
//! The pipeline, leaf to root:
//!
//! - [`source`]: cursor-paginated reads over the source table
//! - [`transform`]: row to document mapping with the private/public split
//! - [`identity`]: per-owner keypair provisioning, cached and persisted
//! - [`delegation`]: short-lived scoped write capabilities
//! - [`upload`]: per-owner batched document submission
//! - [`progress`]: resumable cursor state and run artifacts
//! - [`migration`]: the orchestrating batch loop
//!
//! The run is a bounded batch job, not a service: it processes the cursor
//! window to completion, reports a summary, and exits.

pub mod config;
pub mod delegation;
pub mod error;
pub mod identity;
pub mod migration;
pub mod progress;
pub mod retry;
pub mod source;
pub mod transform;
pub mod upload;
pub mod vault;

pub use config::{MigrationConfig, RunConfig, SourceConfig, VaultConfig};
pub use delegation::{
    CREATE_DATA_COMMAND, DelegationAuthority, DelegationToken, TokenClaims, verify_delegation,
};
pub use error::{MigrationError, Result, VaultErrorKind};
pub use identity::{
    IdentityProvisioner, IdentityStore, Keypair, MemoryIdentityStore, OwnerIdentity,
    PgIdentityStore, StoredIdentity,
};
pub use migration::{Migrator, RunPhase};
pub use progress::{MigrationSummary, ProgressState, ProgressTracker, RunLog, UploadLogEntry};
pub use retry::{RetryPolicy, retry_with};
pub use source::{RecordSource, SourceDb, SourceRecord};
pub use transform::{
    ALLOT_MARKER, DocumentIdMode, FieldPolicy, Transformer, VaultDocument, collection_schema,
};
pub use upload::{OwnerUploadOutcome, Uploader};
pub use vault::{
    AclEntry, CollectionDescriptor, CreateDataRequest, DocumentOutcome, HttpVaultClient,
    MemoryVault, VaultStore,
};
