//! Source-of-truth access: cursor-paginated reads over the puff table.
//!
//! Pagination is cursor-based (`WHERE id > $cursor ORDER BY id LIMIT $n`),
//! never offset-based: offset cost grows with position and skews under
//! concurrent writes to the source.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};

use crate::config::SourceConfig;
use crate::error::Result;

/// One row of the source table, restricted to the columns the migration
/// consumes. Identifying columns the privacy review dropped (`pod_id`,
/// `raw_data`, `ua`, `nonce`, `ble_mac`, `session_id`, `ble_id`,
/// `lease_metadata`, `request_data`) are never selected.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SourceRecord {
    pub id: i64,
    pub user_id: i64,
    pub vape_id: Option<String>,
    pub pod_type: Option<String>,
    pub pod_flavour: Option<String>,
    pub pod_remaining: Option<i32>,
    pub pod_nicotine_level: Option<String>,
    pub puff_duration: Option<i32>,
    pub timestamp: Option<DateTime<Utc>>,
    pub ip: Option<String>,
    pub nft_token_id: Option<i64>,
    pub ble_name: Option<String>,
    pub app_version: Option<String>,
    pub valid: Option<bool>,
    pub nft_tier: Option<i32>,
    pub local_datetime: Option<String>,
    pub source: Option<String>,
    pub uploaded_at: Option<DateTime<Utc>>,
    pub is_settled: Option<bool>,
    pub settled_metadata: Option<serde_json::Value>,
    pub is_delayed_upload: Option<bool>,
    pub flag: Option<String>,
    pub lease_id: Option<i64>,
    pub count: Option<i32>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SourceRecord {
    /// A record with every nullable column absent. Fallbacks fill the rest.
    pub fn new(id: i64, user_id: i64) -> Self {
        Self {
            id,
            user_id,
            vape_id: None,
            pod_type: None,
            pod_flavour: None,
            pod_remaining: None,
            pod_nicotine_level: None,
            puff_duration: None,
            timestamp: None,
            ip: None,
            nft_token_id: None,
            ble_name: None,
            app_version: None,
            valid: None,
            nft_tier: None,
            local_datetime: None,
            source: None,
            uploaded_at: None,
            is_settled: None,
            settled_metadata: None,
            is_delayed_upload: None,
            flag: None,
            lease_id: None,
            count: None,
            created_at: None,
            updated_at: None,
        }
    }
}

const SOURCE_COLUMNS: &str = r#"id, user_id, vape_id, pod_type, pod_flavour, pod_remaining,
    pod_nicotine_level, puff_duration, "timestamp", ip, nft_token_id, ble_name, app_version,
    valid, nft_tier, local_datetime, source, uploaded_at, is_settled, settled_metadata,
    is_delayed_upload, flag, lease_id, "count", created_at, updated_at"#;

/// Read access to the record stream, abstracted so tests can inject an
/// in-memory source.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Fetch up to `limit` records with `id > after_id` (and `id <
    /// upper_bound` when set), strictly ascending by id. An empty batch
    /// signals end of stream.
    async fn fetch_batch(
        &self,
        after_id: i64,
        limit: i64,
        upper_bound: Option<i64>,
    ) -> Result<Vec<SourceRecord>>;

    /// Records remaining in the cursor window, for progress reporting.
    async fn count_remaining(&self, after_id: i64, upper_bound: Option<i64>) -> Result<i64>;
}

/// PostgreSQL-backed record source.
#[derive(Debug, Clone)]
pub struct SourceDb {
    pool: PgPool,
    table: String,
}

impl SourceDb {
    /// Connect to the source database and verify connectivity.
    pub async fn connect(config: &SourceConfig) -> Result<Self> {
        tracing::info!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            table = %config.table,
            "connecting to source database"
        );

        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.user)
            .password(&config.password);

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect_with(options)
            .await?;

        let db = Self {
            pool,
            table: config.table.clone(),
        };
        db.health_check().await?;
        tracing::debug!("source database connection established");
        Ok(db)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Total rows in the source table.
    pub async fn count_total(&self) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar(&format!(r#"SELECT COUNT(*) FROM "{}""#, self.table))
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

#[async_trait]
impl RecordSource for SourceDb {
    async fn fetch_batch(
        &self,
        after_id: i64,
        limit: i64,
        upper_bound: Option<i64>,
    ) -> Result<Vec<SourceRecord>> {
        let records = match upper_bound {
            Some(upper) => {
                sqlx::query_as::<_, SourceRecord>(&format!(
                    r#"SELECT {SOURCE_COLUMNS} FROM "{}" WHERE id > $1 AND id < $2 ORDER BY id LIMIT $3"#,
                    self.table
                ))
                .bind(after_id)
                .bind(upper)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, SourceRecord>(&format!(
                    r#"SELECT {SOURCE_COLUMNS} FROM "{}" WHERE id > $1 ORDER BY id LIMIT $2"#,
                    self.table
                ))
                .bind(after_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(records)
    }

    async fn count_remaining(&self, after_id: i64, upper_bound: Option<i64>) -> Result<i64> {
        let count: i64 = match upper_bound {
            Some(upper) => {
                sqlx::query_scalar(&format!(
                    r#"SELECT COUNT(*) FROM "{}" WHERE id > $1 AND id < $2"#,
                    self.table
                ))
                .bind(after_id)
                .bind(upper)
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar(&format!(
                    r#"SELECT COUNT(*) FROM "{}" WHERE id > $1"#,
                    self.table
                ))
                .bind(after_id)
                .fetch_one(&self.pool)
                .await?
            }
        };
        Ok(count)
    }
}
