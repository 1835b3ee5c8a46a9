//! Configuration for a migration run.
//!
//! Loaded from a TOML file, then overridden by environment variables (the
//! env names match the original deployment scripts, so existing `.env`
//! files keep working). Validation is separate from loading: dry runs only
//! need a subset of the surface.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MigrationError, Result};
use crate::retry::RetryPolicy;
use crate::transform::{DocumentIdMode, FieldPolicy};

/// Source database connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    /// Source table name. Interpolated into queries, so it is validated to
    /// be a plain identifier.
    pub table: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 5432,
            database: "app".into(),
            user: String::new(),
            password: String::new(),
            table: "Puff".into(),
        }
    }
}

/// Target vault-store parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Vault node endpoints. Writes fan out to every node.
    pub nodes: Vec<String>,
    pub auth_url: String,
    pub chain_url: String,
    /// Operator root credential (hex secret key).
    pub operator_key: String,
    /// Reuse an existing collection instead of creating one.
    pub collection_id: Option<Uuid>,
    pub collection_name: String,
    /// Documents per createData call, 1..=200.
    pub docs_per_call: usize,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            nodes: vec![
                "https://nildb-stg-n1.nillion.network".into(),
                "https://nildb-stg-n2.nillion.network".into(),
                "https://nildb-stg-n3.nillion.network".into(),
            ],
            auth_url: "https://nilauth.sandbox.app-cluster.sandbox.nilogy.xyz".into(),
            chain_url: "http://rpc.testnet.nilchain-rpc-proxy.nilogy.xyz".into(),
            operator_key: String::new(),
            collection_id: None,
            collection_name: "Puff Migration Collection".into(),
            docs_per_call: 200,
        }
    }
}

/// Run-shape parameters: batching, cursor bounds, backpressure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub batch_size: i64,
    /// Sleep between batches (backpressure against the target store).
    pub sleep_ms: u64,
    /// Cursor start; ignored when the state file already has one.
    pub start_cursor: i64,
    /// Optional exclusive upper bound on source ids.
    pub stop_cursor: Option<i64>,
    pub delegation_ttl_secs: i64,
    /// Concurrent per-owner upload calls within a batch.
    pub upload_concurrency: usize,
    pub id_mode: DocumentIdMode,
    /// Escalate any batch error to a run abort.
    pub fail_fast: bool,
    pub state_file: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub retry: RetryPolicy,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            batch_size: 50_000,
            sleep_ms: 1000,
            start_cursor: 0,
            stop_cursor: None,
            delegation_ttl_secs: 3600,
            upload_concurrency: 4,
            id_mode: DocumentIdMode::default(),
            fail_fast: false,
            state_file: Some(PathBuf::from("migration_state.json")),
            log_dir: Some(PathBuf::from("migration_log")),
            retry: RetryPolicy::default(),
        }
    }
}

/// Full configuration surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    pub source: SourceConfig,
    pub vault: VaultConfig,
    pub run: RunConfig,
    pub fields: FieldPolicy,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl MigrationConfig {
    /// Load from TOML (when a path is given) and apply env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)?;
                toml::from_str(&contents)
                    .map_err(|e| MigrationError::config("config", e.to_string()))?
            }
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Environment overrides, named after the original deployment scripts.
    pub fn apply_env(&mut self) {
        if let Some(host) = env_var("POSTGRES_HOST") {
            self.source.host = host;
        }
        if let Some(port) = env_var("POSTGRES_PORT").and_then(|v| v.parse().ok()) {
            self.source.port = port;
        }
        if let Some(database) = env_var("POSTGRES_DB") {
            self.source.database = database;
        }
        if let Some(user) = env_var("POSTGRES_USER") {
            self.source.user = user;
        }
        if let Some(password) = env_var("POSTGRES_PASSWORD") {
            self.source.password = password;
        }
        if let Some(table) = env_var("SOURCE_TABLE") {
            self.source.table = table;
        }

        if let Some(nodes) = env_var("NILDB_NODES") {
            self.vault.nodes = nodes.split(',').map(|n| n.trim().to_string()).collect();
        }
        if let Some(auth_url) = env_var("NILAUTH_URL") {
            self.vault.auth_url = auth_url;
        }
        if let Some(chain_url) = env_var("NILCHAIN_URL") {
            self.vault.chain_url = chain_url;
        }
        if let Some(key) = env_var("NIL_BUILDER_PRIVATE_KEY") {
            self.vault.operator_key = key;
        }
        if let Some(id) = env_var("NIL_COLLECTION_ID") {
            match id.parse() {
                Ok(id) => self.vault.collection_id = Some(id),
                Err(e) => tracing::warn!(%id, error = %e, "ignoring malformed NIL_COLLECTION_ID"),
            }
        }

        if let Some(batch_size) = env_var("BATCH_SIZE").and_then(|v| v.parse().ok()) {
            self.run.batch_size = batch_size;
        }
        if let Some(sleep_ms) = env_var("BATCH_SLEEP_MS").and_then(|v| v.parse().ok()) {
            self.run.sleep_ms = sleep_ms;
        }
        if let Some(start) = env_var("LAST_PROCESSED").and_then(|v| v.parse().ok()) {
            self.run.start_cursor = start;
        }
        if let Some(stop) = env_var("MAX_PROCESSED").and_then(|v| v.parse().ok()) {
            self.run.stop_cursor = Some(stop);
        }
        if let Some(ttl) = env_var("DELEGATION_TTL").and_then(|v| v.parse().ok()) {
            self.run.delegation_ttl_secs = ttl;
        }
        if let Some(concurrency) = env_var("UPLOAD_CONCURRENCY").and_then(|v| v.parse().ok()) {
            self.run.upload_concurrency = concurrency;
        }
    }

    /// Validate everything a real (non-dry) run needs up front, so setup
    /// failures surface before any work starts.
    pub fn validate(&self) -> Result<()> {
        if self.vault.operator_key.is_empty() {
            return Err(MigrationError::config(
                "vault.operator_key",
                "operator root credential is required (NIL_BUILDER_PRIVATE_KEY)",
            ));
        }
        if self.vault.nodes.is_empty() {
            return Err(MigrationError::config("vault.nodes", "no nodes configured"));
        }
        if !(1..=200).contains(&self.vault.docs_per_call) {
            return Err(MigrationError::config(
                "vault.docs_per_call",
                "must be between 1 and 200",
            ));
        }
        if self.run.batch_size < 1 {
            return Err(MigrationError::config("run.batch_size", "must be at least 1"));
        }
        if self.source.table.is_empty()
            || !self
                .source
                .table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(MigrationError::config(
                "source.table",
                "table name must be a plain identifier",
            ));
        }
        Ok(())
    }
}
