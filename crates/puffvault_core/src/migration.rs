//! Migration orchestration.
//!
//! A single logical worker drives a strictly sequential batch loop: fetch,
//! provision and transform per record, upload grouped by owner, advance the
//! cursor, sleep. Owners within a batch are independent, so their
//! upload calls run concurrently up to a bounded width; the identity cache
//! is the only shared state and it only ever grows, after durable
//! persistence.
//!
//! Record-level failures become failure counts, batch-level failures skip
//! the batch, and only setup failures (unreachable source/target, missing
//! configuration) abort the run.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use futures::stream;
use uuid::Uuid;

use crate::config::MigrationConfig;
use crate::delegation::{CREATE_DATA_COMMAND, DelegationAuthority};
use crate::error::{MigrationError, Result};
use crate::identity::{IdentityProvisioner, IdentityStore, Keypair, OwnerIdentity};
use crate::progress::{MigrationSummary, ProgressTracker, RunLog, UploadLogEntry};
use crate::retry::retry_with;
use crate::source::{RecordSource, SourceRecord};
use crate::transform::{Transformer, VaultDocument, collection_schema};
use crate::upload::Uploader;
use crate::vault::{CollectionDescriptor, VaultStore};

/// Phases of a migration run, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Init,
    Connecting,
    EnsureCollection,
    Streaming,
    Draining,
    Done,
}

/// Drives the migration pipeline end to end.
pub struct Migrator {
    source: Arc<dyn RecordSource>,
    vault: Arc<dyn VaultStore>,
    provisioner: IdentityProvisioner,
    uploader: Uploader,
    config: MigrationConfig,
}

impl Migrator {
    /// Wire up the pipeline. All collaborators are injected so tests can
    /// run against in-memory fakes.
    pub fn new(
        config: MigrationConfig,
        source: Arc<dyn RecordSource>,
        vault: Arc<dyn VaultStore>,
        identity_store: Arc<dyn IdentityStore>,
    ) -> Result<Self> {
        let operator = Keypair::from_hex(&config.vault.operator_key)?;
        let authority = DelegationAuthority::new(operator, config.run.delegation_ttl_secs);
        // Refresh the root credential: every delegation derives from it.
        let root = authority.delegate(CREATE_DATA_COMMAND, &authority.operator_did())?;
        let authority = Arc::new(authority.with_root_token(root.as_str()));

        let uploader = Uploader::new(
            vault.clone(),
            authority,
            config.run.retry.clone(),
            config.vault.docs_per_call,
        );

        Ok(Self {
            source,
            vault,
            provisioner: IdentityProvisioner::new(identity_store),
            uploader,
            config,
        })
    }

    /// Run to completion: pull batches until the source drains, then report.
    pub async fn run(&self) -> Result<MigrationSummary> {
        let started = Instant::now();
        tracing::info!(phase = ?RunPhase::Init, "starting migration run");

        let mut progress = match &self.config.run.state_file {
            Some(path) => ProgressTracker::resume(path, self.config.run.start_cursor)?,
            None => ProgressTracker::new(self.config.run.start_cursor),
        };
        let run_log = match &self.config.run.log_dir {
            Some(dir) => Some(RunLog::new(dir)?),
            None => None,
        };

        tracing::info!(phase = ?RunPhase::Connecting, cursor = progress.current(), "counting records in window");
        let start_cursor = progress.current();
        let stop_cursor = self.config.run.stop_cursor;
        let remaining = retry_with(&self.config.run.retry, "count", move || async move {
            self.source.count_remaining(start_cursor, stop_cursor).await
        })
        .await?;
        tracing::info!(
            remaining,
            batch_size = self.config.run.batch_size,
            stop_cursor = ?self.config.run.stop_cursor,
            "records to migrate"
        );

        tracing::info!(phase = ?RunPhase::EnsureCollection, "ensuring target collection");
        let collection_id = self.ensure_collection().await?;
        let transformer = Transformer::new(
            self.config.fields.clone(),
            self.config.run.id_mode,
            collection_id,
        );

        tracing::info!(phase = ?RunPhase::Streaming, collection = %collection_id, "entering batch loop");
        let mut batch_num = 0u64;
        let batch_size = self.config.run.batch_size;
        loop {
            let cursor = progress.current();
            let records = retry_with(&self.config.run.retry, "fetch", move || async move {
                self.source.fetch_batch(cursor, batch_size, stop_cursor).await
            })
            .await?;

            if records.is_empty() {
                tracing::info!(phase = ?RunPhase::Draining, "source drained");
                break;
            }

            batch_num += 1;
            let batch_max = records.iter().map(|r| r.id).max().unwrap_or(cursor);
            tracing::info!(batch = batch_num, records = records.len(), cursor, "processing batch");

            match self
                .process_batch(&records, collection_id, &transformer, &mut progress)
                .await
            {
                Ok(entries) => {
                    if let Some(log) = &run_log {
                        log.append_batch(batch_num, &entries)?;
                    }
                }
                Err(e) if self.config.run.fail_fast => return Err(e),
                Err(e) => {
                    // Batch abandoned terminally: its records count as failed
                    // and the cursor moves past it, otherwise the loop would
                    // refetch the same poisoned batch forever.
                    tracing::error!(batch = batch_num, error = %e, "batch failed, skipping");
                    progress.record_failed(records.len() as u64);
                }
            }

            progress.set_identities_provisioned(self.provisioner.provisioned_count());
            progress.advance(batch_max)?;
            tracing::info!(
                batch = batch_num,
                cursor = progress.current(),
                processed = progress.state().processed,
                failed = progress.state().failed,
                owners = progress.state().owners_seen,
                "batch resolved"
            );

            if self.config.run.sleep_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.run.sleep_ms)).await;
            }
        }

        let summary = progress.summary(started.elapsed());
        tracing::info!(
            phase = ?RunPhase::Done,
            processed = summary.processed,
            failed = summary.failed,
            owners = summary.owners_seen,
            elapsed_secs = summary.elapsed_secs,
            "migration complete"
        );
        Ok(summary)
    }

    /// Create the target collection, or validate a supplied id.
    async fn ensure_collection(&self) -> Result<Uuid> {
        match self.config.vault.collection_id {
            Some(id) => {
                if !self.vault.has_collection(id).await? {
                    return Err(MigrationError::config(
                        "vault.collection_id",
                        format!("collection {id} not found in the target store"),
                    ));
                }
                tracing::info!(collection = %id, "using existing collection");
                Ok(id)
            }
            None => {
                let id = Uuid::new_v4();
                let descriptor = CollectionDescriptor::owned(
                    id,
                    self.config.vault.collection_name.clone(),
                    collection_schema(&self.config.fields),
                );
                self.vault.create_collection(&descriptor).await?;
                tracing::info!(collection = %id, "created collection; set NIL_COLLECTION_ID to reuse it");
                Ok(id)
            }
        }
    }

    /// One batch: provision + transform per record, then upload per-owner
    /// groups concurrently. Returns the upload log entries; failures inside
    /// the batch become counters, not errors (unless `fail_fast`).
    async fn process_batch(
        &self,
        records: &[SourceRecord],
        collection: Uuid,
        transformer: &Transformer,
        progress: &mut ProgressTracker,
    ) -> Result<Vec<UploadLogEntry>> {
        let mut groups: BTreeMap<i64, (Arc<OwnerIdentity>, Vec<VaultDocument>)> = BTreeMap::new();

        for record in records {
            progress.record_owner(record.user_id);
            let identity = match self.provisioner.identity_for(record.user_id).await {
                Ok(identity) => identity,
                Err(e) if self.config.run.fail_fast => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        record_id = record.id,
                        owner_ref = record.user_id,
                        error = %e,
                        "skipping record, identity unavailable"
                    );
                    progress.record_failed(1);
                    continue;
                }
            };
            let document = transformer.transform(record);
            groups
                .entry(record.user_id)
                .or_insert_with(|| (identity, Vec::new()))
                .1
                .push(document);
        }

        let uploader = &self.uploader;
        let outcomes = stream::iter(groups.into_values().map(move |(identity, documents)| {
            async move {
                uploader
                    .upload_for_owner(&identity, collection, &documents)
                    .await
            }
        }))
        .buffer_unordered(self.config.run.upload_concurrency.max(1))
        .collect::<Vec<_>>()
        .await;

        let mut entries = Vec::new();
        for outcome in outcomes {
            progress.record_processed(outcome.uploaded.len() as u64);
            progress.record_failed(outcome.failed);
            entries.extend(outcome.uploaded);
        }
        Ok(entries)
    }
}
