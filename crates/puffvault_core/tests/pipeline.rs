//! End-to-end pipeline tests over in-memory fakes.
//!
//! These exercise the orchestrator against an in-memory record source,
//! identity store and vault store: exactly-once processing, cursor
//! behavior, per-owner grouping, failure isolation and crash-resume.

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use puffvault_core::{
    CollectionDescriptor, CreateDataRequest, DelegationToken, DocumentOutcome, IdentityStore,
    Keypair, MemoryIdentityStore, MemoryVault, MigrationConfig, MigrationError, Migrator,
    RecordSource,
    Result, SourceRecord, VaultErrorKind, VaultStore,
};

/// In-memory record source with cursor-pagination semantics.
struct MemorySource {
    records: Mutex<Vec<SourceRecord>>,
    fetch_cursors: Mutex<Vec<i64>>,
}

impl MemorySource {
    fn new(records: Vec<SourceRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            fetch_cursors: Mutex::new(Vec::new()),
        }
    }

    fn push(&self, record: SourceRecord) {
        self.records.lock().unwrap().push(record);
    }

    fn fetch_cursors(&self) -> Vec<i64> {
        self.fetch_cursors.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordSource for MemorySource {
    async fn fetch_batch(
        &self,
        after_id: i64,
        limit: i64,
        upper_bound: Option<i64>,
    ) -> Result<Vec<SourceRecord>> {
        self.fetch_cursors.lock().unwrap().push(after_id);
        let mut matching: Vec<SourceRecord> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.id > after_id && upper_bound.map_or(true, |upper| r.id < upper))
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.id);
        matching.truncate(limit as usize);
        Ok(matching)
    }

    async fn count_remaining(&self, after_id: i64, upper_bound: Option<i64>) -> Result<i64> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.id > after_id && upper_bound.map_or(true, |upper| r.id < upper))
            .count() as i64)
    }
}

/// Vault wrapper that rejects uploads for one owner reference with an
/// authorization failure, simulating an expired/invalid delegation.
struct RejectOwnerVault {
    inner: MemoryVault,
    rejected_owner_ref: i64,
}

#[async_trait]
impl VaultStore for RejectOwnerVault {
    async fn create_collection(&self, collection: &CollectionDescriptor) -> Result<()> {
        self.inner.create_collection(collection).await
    }

    async fn has_collection(&self, id: Uuid) -> Result<bool> {
        self.inner.has_collection(id).await
    }

    async fn create_data(
        &self,
        token: &DelegationToken,
        request: &CreateDataRequest,
    ) -> Result<Vec<DocumentOutcome>> {
        let rejected = request
            .data
            .iter()
            .any(|doc| doc["user_id"] == json!(self.rejected_owner_ref));
        if rejected {
            return Err(MigrationError::Vault {
                kind: VaultErrorKind::Authorization,
                message: "delegation rejected".into(),
            });
        }
        self.inner.create_data(token, request).await
    }

    async fn count_data(&self, collection: Uuid) -> Result<u64> {
        self.inner.count_data(collection).await
    }
}

fn test_config() -> MigrationConfig {
    let mut config = MigrationConfig::default();
    config.vault.operator_key = Keypair::generate().secret_hex();
    config.run.batch_size = 10;
    config.run.sleep_ms = 0;
    config.run.state_file = None;
    config.run.log_dir = None;
    // Keep failure-path tests fast.
    config.run.retry.max_attempts = 2;
    config.run.retry.base_backoff_ms = 1;
    config.run.retry.jitter_ms = 0;
    config
}

fn operator_did(config: &MigrationConfig) -> String {
    Keypair::from_hex(&config.vault.operator_key).unwrap().did()
}

fn records_for_two_owners() -> Vec<SourceRecord> {
    vec![
        SourceRecord::new(101, 7),
        SourceRecord::new(102, 7),
        SourceRecord::new(103, 7),
        SourceRecord::new(104, 9),
        SourceRecord::new(105, 9),
    ]
}

#[tokio::test]
async fn test_single_batch_two_owners() {
    let config = test_config();
    let source = Arc::new(MemorySource::new(records_for_two_owners()));
    let vault = Arc::new(MemoryVault::new(operator_did(&config)));
    let identities = Arc::new(MemoryIdentityStore::new());

    let migrator =
        Migrator::new(config.clone(), source, vault.clone(), identities.clone()).unwrap();
    let summary = migrator.run().await.unwrap();

    assert_eq!(summary.processed, 5);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.final_cursor, 105);
    assert_eq!(summary.owners_seen, 2);
    assert_eq!(summary.identities_provisioned, 2);
    assert_eq!(summary.batches_completed, 1);
    assert_eq!(identities.count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_exactly_once_across_batches() {
    let mut config = test_config();
    config.run.batch_size = 3;
    config.vault.collection_id = Some(Uuid::new_v4());

    let records: Vec<SourceRecord> = (1..=10)
        .map(|id| SourceRecord::new(id, 7 + (id % 2)))
        .collect();
    let source = Arc::new(MemorySource::new(records));
    let vault = Arc::new(MemoryVault::new(operator_did(&config)));
    let collection = config.vault.collection_id.unwrap();
    vault
        .create_collection(&CollectionDescriptor::owned(collection, "test", json!({})))
        .await
        .unwrap();

    let migrator = Migrator::new(
        config,
        source,
        vault.clone(),
        Arc::new(MemoryIdentityStore::new()),
    )
    .unwrap();
    let summary = migrator.run().await.unwrap();

    assert_eq!(summary.processed, 10);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.final_cursor, 10);
    assert_eq!(summary.batches_completed, 4); // 3 + 3 + 3 + 1

    // No duplicates, no omissions.
    let stored = vault.documents(collection);
    assert_eq!(stored.len(), 10);
    let mut source_ids: Vec<i64> = stored
        .iter()
        .map(|doc| doc.document["id"].as_i64().unwrap())
        .collect();
    source_ids.sort();
    assert_eq!(source_ids, (1..=10).collect::<Vec<i64>>());
}

#[tokio::test]
async fn test_private_fields_tagged_in_stored_documents() {
    let mut config = test_config();
    config.vault.collection_id = Some(Uuid::new_v4());
    let collection = config.vault.collection_id.unwrap();

    let mut record = SourceRecord::new(101, 7);
    record.vape_id = Some("VAPE-01".into());
    record.ble_name = Some("device-a".into());
    let source = Arc::new(MemorySource::new(vec![record]));
    let vault = Arc::new(MemoryVault::new(operator_did(&config)));
    vault
        .create_collection(&CollectionDescriptor::owned(collection, "test", json!({})))
        .await
        .unwrap();

    let migrator = Migrator::new(
        config.clone(),
        source,
        vault.clone(),
        Arc::new(MemoryIdentityStore::new()),
    )
    .unwrap();
    migrator.run().await.unwrap();

    let stored = vault.documents(collection);
    assert_eq!(stored.len(), 1);
    let doc = &stored[0].document;
    assert_eq!(doc["vape_id"], json!({"%allot": "VAPE-01"}));
    assert_eq!(doc["ble_name"], json!("device-a"));
    assert_eq!(doc["id"], json!(101));
    // The operator holds read + execute, never write.
    assert_eq!(stored[0].acl_grantee, operator_did(&config));
}

#[tokio::test]
async fn test_malformed_nested_object_still_migrates() {
    let mut config = test_config();
    config.vault.collection_id = Some(Uuid::new_v4());
    let collection = config.vault.collection_id.unwrap();

    let mut record = SourceRecord::new(106, 7);
    record.settled_metadata = Some(json!("not an object"));
    let source = Arc::new(MemorySource::new(vec![record]));
    let vault = Arc::new(MemoryVault::new(operator_did(&config)));
    vault
        .create_collection(&CollectionDescriptor::owned(collection, "test", json!({})))
        .await
        .unwrap();

    let migrator = Migrator::new(
        config,
        source,
        vault.clone(),
        Arc::new(MemoryIdentityStore::new()),
    )
    .unwrap();
    let summary = migrator.run().await.unwrap();

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.failed, 0);
    let stored = vault.documents(collection);
    assert_eq!(stored[0].document["settled_metadata"], json!({}));
}

#[tokio::test]
async fn test_owner_failure_does_not_poison_batch() {
    let config = test_config();
    let source = Arc::new(MemorySource::new(records_for_two_owners()));
    let vault = Arc::new(RejectOwnerVault {
        inner: MemoryVault::new(operator_did(&config)),
        rejected_owner_ref: 9,
    });

    let migrator = Migrator::new(
        config,
        source,
        vault,
        Arc::new(MemoryIdentityStore::new()),
    )
    .unwrap();
    let summary = migrator.run().await.unwrap();

    // Owner 7's records land, owner 9's fail, the batch still resolves and
    // the cursor covers every attempted record.
    assert_eq!(summary.processed, 3);
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.final_cursor, 105);
    assert_eq!(summary.batches_completed, 1);
}

#[tokio::test]
async fn test_resume_skips_committed_records() {
    let state_dir = tempfile::tempdir().unwrap();
    let state_file = state_dir.path().join("state.json");

    let mut config = test_config();
    config.run.state_file = Some(state_file.clone());
    config.vault.collection_id = Some(Uuid::new_v4());
    let collection = config.vault.collection_id.unwrap();

    let source = Arc::new(MemorySource::new(
        (1..=5).map(|id| SourceRecord::new(id, 7)).collect(),
    ));
    let vault = Arc::new(MemoryVault::new(operator_did(&config)));
    vault
        .create_collection(&CollectionDescriptor::owned(collection, "test", json!({})))
        .await
        .unwrap();
    let identities = Arc::new(MemoryIdentityStore::new());

    let first = Migrator::new(
        config.clone(),
        source.clone(),
        vault.clone(),
        identities.clone(),
    )
    .unwrap();
    let summary = first.run().await.unwrap();
    assert_eq!(summary.processed, 5);
    assert_eq!(summary.final_cursor, 5);

    // New records arrive; a resumed run must not reprocess ids <= 5.
    for id in 6..=8 {
        source.push(SourceRecord::new(id, 7));
    }
    let second = Migrator::new(config, source.clone(), vault.clone(), identities).unwrap();
    let summary = second.run().await.unwrap();

    assert_eq!(summary.processed, 8); // cumulative state: 5 prior + 3 new
    assert_eq!(summary.final_cursor, 8);
    // Every fetch in the resumed run started at or beyond the persisted
    // cursor.
    let resumed_cursors: Vec<i64> = source
        .fetch_cursors()
        .into_iter()
        .skip_while(|c| *c < 5)
        .collect();
    assert!(resumed_cursors.iter().all(|c| *c >= 5));
    assert_eq!(vault.count_data(collection).await.unwrap(), 8);
}

#[tokio::test]
async fn test_stop_cursor_bounds_the_window() {
    let mut config = test_config();
    config.run.stop_cursor = Some(104);
    config.vault.collection_id = Some(Uuid::new_v4());
    let collection = config.vault.collection_id.unwrap();

    let source = Arc::new(MemorySource::new(records_for_two_owners()));
    let vault = Arc::new(MemoryVault::new(operator_did(&config)));
    vault
        .create_collection(&CollectionDescriptor::owned(collection, "test", json!({})))
        .await
        .unwrap();

    let migrator = Migrator::new(
        config,
        source,
        vault.clone(),
        Arc::new(MemoryIdentityStore::new()),
    )
    .unwrap();
    let summary = migrator.run().await.unwrap();

    // Exclusive upper bound: ids 101..=103 only.
    assert_eq!(summary.processed, 3);
    assert_eq!(summary.final_cursor, 103);
}

#[tokio::test]
async fn test_run_log_records_uploads() {
    let log_dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.run.log_dir = Some(log_dir.path().join("migration_log"));

    let source = Arc::new(MemorySource::new(records_for_two_owners()));
    let vault = Arc::new(MemoryVault::new(operator_did(&config)));

    let migrator = Migrator::new(
        config,
        source,
        vault,
        Arc::new(MemoryIdentityStore::new()),
    )
    .unwrap();
    migrator.run().await.unwrap();

    let log = std::fs::read_to_string(log_dir.path().join("migration_log/batch_1_log.txt")).unwrap();
    assert_eq!(log.lines().count(), 5);
    assert!(log.lines().all(|line| line.contains("did:nil:")));
}
