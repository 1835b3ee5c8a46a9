//! Error types for puffvault_core.

use miette::Diagnostic;
use thiserror::Error;

/// Result type for migration operations.
pub type Result<T> = std::result::Result<T, MigrationError>;

/// Classification of vault-store failures.
///
/// The uploader treats these differently: authorization failures get one
/// fresh delegation before giving up, transient failures go through the
/// retry policy, validation failures drop the offending documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultErrorKind {
    /// Expired or invalid delegation. Not retryable without re-delegating.
    Authorization,
    /// Network or service failure. Retryable with backoff.
    Transient,
    /// Malformed or oversized document. Never retryable.
    Validation,
}

impl std::fmt::Display for VaultErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VaultErrorKind::Authorization => write!(f, "authorization"),
            VaultErrorKind::Transient => write!(f, "transient"),
            VaultErrorKind::Validation => write!(f, "validation"),
        }
    }
}

/// Errors that can occur during a migration run.
#[derive(Debug, Error, Diagnostic)]
pub enum MigrationError {
    /// Source database error from sqlx.
    #[error("Source database error: {0}")]
    #[diagnostic(
        code(puffvault_core::source),
        help("Check the source connection parameters and that the database is reachable")
    )]
    Source(#[from] sqlx::Error),

    /// Vault store rejected or failed a request.
    #[error("Vault store {kind} failure: {message}")]
    #[diagnostic(code(puffvault_core::vault))]
    Vault {
        kind: VaultErrorKind,
        message: String,
    },

    /// HTTP transport failure talking to the vault nodes.
    #[error("Vault transport error: {0}")]
    #[diagnostic(
        code(puffvault_core::transport),
        help("Check the configured vault node endpoints")
    )]
    Transport(#[from] reqwest::Error),

    /// Identity could not be persisted. Fatal for that owner's records:
    /// nothing may be uploaded under a key that cannot be recovered.
    #[error("Failed to persist identity for owner {owner_ref}: {cause}")]
    #[diagnostic(
        code(puffvault_core::identity_persistence),
        help("The owner's records are skipped; re-run after the identity store recovers")
    )]
    IdentityPersistence { owner_ref: i64, cause: String },

    /// Key material could not be parsed or generated.
    #[error("Invalid key material: {0}")]
    #[diagnostic(code(puffvault_core::invalid_key))]
    InvalidKey(String),

    /// Delegation token failed to build or verify.
    #[error("Invalid delegation token: {0}")]
    #[diagnostic(code(puffvault_core::invalid_delegation))]
    InvalidDelegation(String),

    /// Configuration error.
    #[error("Configuration error for '{field}': {reason}")]
    #[diagnostic(
        code(puffvault_core::configuration),
        help("Check the TOML config file and environment overrides")
    )]
    Configuration { field: String, reason: String },

    /// IO error (state file, run log).
    #[error("IO error: {0}")]
    #[diagnostic(code(puffvault_core::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(puffvault_core::serde))]
    Serde(#[from] serde_json::Error),

    /// A retryable operation kept failing until the policy gave up.
    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    #[diagnostic(code(puffvault_core::retries_exhausted))]
    RetriesExhausted { attempts: u8, last_error: String },
}

impl MigrationError {
    /// Shorthand for vault failures.
    pub fn vault(kind: VaultErrorKind, message: impl Into<String>) -> Self {
        MigrationError::Vault {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for configuration failures.
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        MigrationError::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Whether the retry policy may re-attempt the failed operation.
    ///
    /// Connectivity failures (source and vault) are retryable; authorization,
    /// validation, persistence and configuration failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            MigrationError::Source(e) => !matches!(e, sqlx::Error::RowNotFound),
            MigrationError::Vault { kind, .. } => *kind == VaultErrorKind::Transient,
            MigrationError::Transport(_) => true,
            _ => false,
        }
    }
}
