//! Batch manager
//!
//! Owns batches and their files. Every file change re-reads the file
//! counters and re-evaluates the batch state machine while holding a
//! batch-scoped lock, so concurrent updates to the same batch never lose
//! counter writes.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::BatchConfig;
use crate::error::{Error, Result};
use crate::events::EventLogger;
use crate::processing::{QueueManager, WorkerTier};
use crate::providers::{object_key, sha256_hex, ObjectStore, StoredObject};
use crate::storage::{FileAggregates, IngestDb};
use crate::types::{
    Batch, BatchFile, BatchLimits, BatchProgress, BatchStatus, DuplicatePolicy,
    NewBatch, NewBatchFile, NewQueueItem, ProcessingStatus, QueueItem, QueueType, ScanStatus,
    UploadSessionStatus, UploadStatus, ValidationStatus,
};

use super::validation::{extension_of, normalize_extension, sanitize_filename, validate_sha256};

/// Options for starting a batch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartBatchOptions {
    /// Batches that must complete before this one runs
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    /// Earliest time the batch may run
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// Sent when a batch reaches a terminal status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchCompletion {
    pub tenant_id: Uuid,
    pub batch_id: Uuid,
    pub status: BatchStatus,
}

/// Manager for batches and batch files
pub struct BatchManager {
    db: IngestDb,
    config: BatchConfig,
    default_priority: u8,
    tier: WorkerTier,
    queue: Arc<QueueManager>,
    store: Arc<dyn ObjectStore>,
    events: Arc<dyn EventLogger>,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    completions: RwLock<Option<mpsc::UnboundedSender<BatchCompletion>>>,
}

impl BatchManager {
    pub fn new(
        db: IngestDb,
        config: BatchConfig,
        tier: WorkerTier,
        queue: Arc<QueueManager>,
        store: Arc<dyn ObjectStore>,
        events: Arc<dyn EventLogger>,
    ) -> Self {
        let default_priority = queue.config().default_priority;
        Self {
            db,
            config,
            default_priority,
            tier,
            queue,
            store,
            events,
            locks: DashMap::new(),
            completions: RwLock::new(None),
        }
    }

    /// Receive a message whenever a batch reaches a terminal status
    pub fn subscribe_completions(&self) -> mpsc::UnboundedReceiver<BatchCompletion> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.completions.write() = Some(tx);
        rx
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    // ==================== Batch lifecycle ====================

    /// Create a pending batch within the tenant's ceilings
    pub fn create_batch(&self, tenant_id: Uuid, request: NewBatch) -> Result<Batch> {
        let name = request.name.trim().to_string();
        if name.is_empty() || name.len() > 255 {
            return Err(Error::validation("Batch name must be 1 to 255 bytes"));
        }

        let tenant = self.tenant_limits(tenant_id)?;
        let limits = narrow_limits(&tenant.limits, &request)?;

        let priority = request.priority.unwrap_or(self.default_priority);
        if !(1..=10).contains(&priority) {
            return Err(Error::validation(format!(
                "Priority must be between 1 and 10, got {}",
                priority
            )));
        }

        let now = Utc::now();
        let mut batch = Batch {
            id: Uuid::new_v4(),
            tenant_id,
            name,
            batch_number: 0,
            status: BatchStatus::Pending,
            total_files: 0,
            uploaded_files: 0,
            processed_files: 0,
            failed_files: 0,
            skipped_files: 0,
            total_bytes: 0,
            uploaded_bytes: 0,
            processed_bytes: 0,
            progress: 0.0,
            limits,
            duplicate_policy: request.duplicate_policy,
            concurrency_mode: request.concurrency_mode,
            priority,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            deleted_at: None,
        };
        let active = self.db.insert_batch_below(&mut batch, tenant.max_active_batches)?;
        if active >= tenant.max_active_batches {
            return Err(Error::capacity_with_retry(
                format!(
                    "Tenant already has {} active batches (limit {})",
                    active, tenant.max_active_batches
                ),
                self.config.active_quota_retry_secs,
            ));
        }

        self.events.info(
            Some(tenant_id),
            "batch.created",
            &format!("Batch {} '{}' created", batch.batch_number, batch.name),
            json!({
                "batch_id": batch.id,
                "batch_number": batch.batch_number,
                "max_files": batch.limits.max_files,
                "max_total_bytes": batch.limits.max_total_bytes,
                "duplicate_policy": batch.duplicate_policy,
                "concurrency_mode": batch.concurrency_mode,
            }),
        );
        Ok(batch)
    }

    /// Add files to a pending batch; all or nothing
    pub fn add_files(
        &self,
        tenant_id: Uuid,
        batch_id: Uuid,
        files: Vec<NewBatchFile>,
    ) -> Result<Vec<BatchFile>> {
        if files.is_empty() {
            return Err(Error::validation("No files given"));
        }

        let lock = self.batch_lock(batch_id);
        let _guard = lock.lock();

        let batch = self.owned_batch(tenant_id, batch_id)?;
        if batch.status != BatchStatus::Pending {
            return Err(Error::invalid_state(format!(
                "Files can only be added to pending batches, batch {} is {}",
                batch.batch_number, batch.status
            )));
        }

        let current = self.db.file_aggregates(batch_id)?;
        let incoming_bytes: u64 = files.iter().map(|f| f.size_bytes).sum();

        if current.total_files as usize + files.len() > batch.limits.max_files as usize {
            return Err(Error::capacity(format!(
                "Adding {} files would exceed the batch limit of {} files ({} already present)",
                files.len(),
                batch.limits.max_files,
                current.total_files
            )));
        }
        if current.total_bytes + incoming_bytes > batch.limits.max_total_bytes {
            return Err(Error::capacity(format!(
                "Adding {} bytes would exceed the batch limit of {} bytes ({} already present)",
                incoming_bytes, batch.limits.max_total_bytes, current.total_bytes
            )));
        }

        let now = Utc::now();
        let mut order = self.db.next_processing_order(batch_id)?;
        let mut prepared = Vec::with_capacity(files.len());

        for request in files {
            let sanitized = sanitize_filename(&request.filename)?;
            let extension = extension_of(&sanitized);
            if !batch.limits.allows_extension(&extension) {
                return Err(Error::validation(format!(
                    "File type '.{}' of '{}' is not allowed",
                    extension, request.filename
                )));
            }
            if request.size_bytes == 0 {
                return Err(Error::validation(format!("'{}' is empty", request.filename)));
            }
            if request.size_bytes > batch.limits.max_file_size {
                return Err(Error::validation(format!(
                    "'{}' is {} bytes, the limit is {}",
                    request.filename, request.size_bytes, batch.limits.max_file_size
                )));
            }
            let declared_hash = request.declared_hash.as_deref().map(validate_sha256).transpose()?;
            let priority = request.priority.unwrap_or(batch.priority);
            if !(1..=10).contains(&priority) {
                return Err(Error::validation(format!(
                    "Priority of '{}' must be between 1 and 10",
                    request.filename
                )));
            }
            let content_type = request.content_type.unwrap_or_else(|| {
                mime_guess::from_path(&sanitized)
                    .first_or_octet_stream()
                    .to_string()
            });

            prepared.push(BatchFile {
                id: Uuid::new_v4(),
                batch_id,
                tenant_id,
                original_filename: request.filename,
                sanitized_filename: sanitized,
                extension,
                size_bytes: request.size_bytes,
                content_type,
                content_hash: None,
                declared_hash,
                is_duplicate: false,
                duplicate_of: None,
                processing_order: order,
                priority,
                upload_status: UploadStatus::Pending,
                processing_status: ProcessingStatus::Pending,
                validation_status: ValidationStatus::Valid,
                scan_status: ScanStatus::Pending,
                uploaded_bytes: 0,
                error_count: 0,
                last_error: None,
                needs_review: false,
                storage_path: None,
                metadata: request.metadata,
                created_at: now,
                updated_at: now,
                processed_at: None,
            });
            order += 1;
        }

        self.db.insert_batch_files(&prepared)?;
        self.recompute_locked(&batch)?;

        self.events.info(
            Some(tenant_id),
            "batch.files_added",
            &format!("{} files added to batch {}", prepared.len(), batch.batch_number),
            json!({
                "batch_id": batch_id,
                "files": prepared.len(),
                "bytes": incoming_bytes,
            }),
        );
        Ok(prepared)
    }

    /// Validate and enqueue a pending batch
    pub fn start_batch(
        &self,
        tenant_id: Uuid,
        batch_id: Uuid,
        options: StartBatchOptions,
    ) -> Result<QueueItem> {
        let lock = self.batch_lock(batch_id);
        let _guard = lock.lock();

        let batch = self.owned_batch(tenant_id, batch_id)?;
        if batch.status != BatchStatus::Pending {
            return Err(Error::invalid_state(format!(
                "Only pending batches can be started, batch {} is {}",
                batch.batch_number, batch.status
            )));
        }

        let files = self.db.list_batch_files(batch_id)?;
        if files.is_empty() {
            return Err(Error::validation(format!(
                "Batch {} has no files",
                batch.batch_number
            )));
        }

        let now = Utc::now();
        if !self
            .db
            .transition_batch(batch_id, &[BatchStatus::Pending], BatchStatus::Validating, None, now)?
        {
            return Err(Error::Conflict(format!("Batch {} changed while starting", batch_id)));
        }

        // Re-check the invariants enforced at add time against current limits
        let invalid = files.iter().find(|f| {
            !batch.limits.allows_extension(&f.extension) || f.size_bytes > batch.limits.max_file_size
        });
        if let Some(bad) = invalid {
            let message = format!("File '{}' no longer passes validation", bad.original_filename);
            self.db.transition_batch(
                batch_id,
                &[BatchStatus::Validating],
                BatchStatus::Pending,
                Some(&message),
                Utc::now(),
            )?;
            return Err(Error::validation(message));
        }

        self.db
            .transition_batch(batch_id, &[BatchStatus::Validating], BatchStatus::Uploading, None, Utc::now())?;

        let total_bytes: u64 = files.iter().map(|f| f.size_bytes).sum();
        let file_types: BTreeSet<String> = files
            .iter()
            .filter(|f| !f.extension.is_empty())
            .map(|f| f.extension.clone())
            .collect();

        let request = NewQueueItem {
            tenant_id,
            batch_id,
            queue_type: QueueType::Processing,
            priority: batch.priority,
            worker_type: self.tier.classify(total_bytes),
            required_file_types: file_types.into_iter().collect(),
            resources: self.tier.estimate(total_bytes),
            dependencies: options.dependencies,
            scheduled_at: options.scheduled_at,
        };

        let item = match self.queue.enqueue(request) {
            Ok(item) => item,
            Err(e) => {
                self.db.transition_batch(
                    batch_id,
                    &[BatchStatus::Uploading],
                    BatchStatus::Pending,
                    Some(&e.to_string()),
                    Utc::now(),
                )?;
                return Err(e);
            }
        };

        let batch = self.reload(batch_id)?;
        self.recompute_locked(&batch)?;

        self.events.info(
            Some(tenant_id),
            "batch.started",
            &format!(
                "Batch {} started: {} files, {} bytes, {} worker",
                batch.batch_number,
                files.len(),
                total_bytes,
                item.worker_type
            ),
            json!({
                "batch_id": batch_id,
                "queue_item_id": item.id,
                "worker_type": item.worker_type,
                "memory_mb": item.resources.memory_mb,
                "cpu_cores": item.resources.cpu_cores,
                "disk_mb": item.resources.disk_mb,
            }),
        );
        Ok(item)
    }

    /// Cancel a batch, its queue item, open chunk sessions and open files
    pub fn cancel_batch(&self, tenant_id: Uuid, batch_id: Uuid, reason: &str) -> Result<Batch> {
        let lock = self.batch_lock(batch_id);
        let _guard = lock.lock();

        let batch = self.owned_batch(tenant_id, batch_id)?;
        if batch.status == BatchStatus::Cancelled {
            return Ok(batch);
        }
        if batch.status.is_terminal() {
            return Err(Error::invalid_state(format!(
                "Batch {} already finished as {}",
                batch.batch_number, batch.status
            )));
        }

        let now = Utc::now();
        let live = [
            BatchStatus::Pending,
            BatchStatus::Validating,
            BatchStatus::Uploading,
            BatchStatus::Processing,
        ];
        if !self
            .db
            .transition_batch(batch_id, &live, BatchStatus::Cancelled, Some(reason), now)?
        {
            return Err(Error::Conflict(format!("Batch {} changed while cancelling", batch_id)));
        }

        let cancelled_item = self.queue.cancel_for_batch(batch_id, reason)?;

        // Already-written chunks stay; only the sessions close
        let mut sessions_cancelled = 0;
        for session in self.db.list_open_sessions_for_batch(batch_id)? {
            let open = [
                UploadSessionStatus::Pending,
                UploadSessionStatus::Uploading,
                UploadSessionStatus::Assembling,
            ];
            if self.db.transition_upload_session(
                session.id,
                &open,
                UploadSessionStatus::Cancelled,
                Some(reason),
                now,
            )? {
                self.db.cancel_open_chunks(session.id)?;
                sessions_cancelled += 1;
            }
        }

        let files_cancelled = self.db.cancel_open_files(batch_id, now)?;
        let batch = self.reload(batch_id)?;
        self.recompute_locked(&batch)?;

        self.events.info(
            Some(tenant_id),
            "batch.cancelled",
            &format!("Batch {} cancelled: {}", batch.batch_number, reason),
            json!({
                "batch_id": batch_id,
                "queue_item_id": cancelled_item.as_ref().map(|i| i.id),
                "upload_sessions_cancelled": sessions_cancelled,
                "files_cancelled": files_cancelled,
            }),
        );
        self.notify_terminal(&batch, BatchStatus::Cancelled);
        self.reload(batch_id)
    }

    /// Soft delete a finished batch
    pub fn delete_batch(&self, tenant_id: Uuid, batch_id: Uuid) -> Result<()> {
        let lock = self.batch_lock(batch_id);
        let _guard = lock.lock();

        let batch = self.owned_batch(tenant_id, batch_id)?;
        if !batch.status.is_terminal() {
            return Err(Error::invalid_state(format!(
                "Batch {} is {}, only finished batches can be deleted",
                batch.batch_number, batch.status
            )));
        }
        self.db.soft_delete_batch(batch_id, Utc::now())?;
        self.locks.remove(&batch_id);

        self.events.info(
            Some(tenant_id),
            "batch.deleted",
            &format!("Batch {} deleted", batch.batch_number),
            json!({ "batch_id": batch_id }),
        );
        Ok(())
    }

    // ==================== Queries ====================

    pub fn get_batch(&self, tenant_id: Uuid, batch_id: Uuid) -> Result<Batch> {
        self.owned_batch(tenant_id, batch_id)
    }

    pub fn list_batches(&self, tenant_id: Uuid) -> Result<Vec<Batch>> {
        self.db.list_batches(tenant_id)
    }

    pub fn list_files(&self, tenant_id: Uuid, batch_id: Uuid) -> Result<Vec<BatchFile>> {
        self.owned_batch(tenant_id, batch_id)?;
        self.db.list_batch_files(batch_id)
    }

    pub fn get_file(&self, tenant_id: Uuid, file_id: Uuid) -> Result<BatchFile> {
        self.db
            .get_batch_file(file_id)?
            .filter(|f| f.tenant_id == tenant_id)
            .ok_or_else(|| Error::not_found("file", file_id))
    }

    /// Counts, bytes and percentage, straight from the file rows
    pub fn get_batch_progress(&self, tenant_id: Uuid, batch_id: Uuid) -> Result<BatchProgress> {
        let batch = self.owned_batch(tenant_id, batch_id)?;
        let agg = self.db.file_aggregates(batch_id)?;

        Ok(BatchProgress {
            batch_id,
            batch_number: batch.batch_number,
            status: batch.status,
            total_files: agg.total_files,
            uploaded_files: agg.uploaded_files,
            completed_files: agg.completed_files,
            failed_files: agg.failed_files,
            skipped_files: agg.skipped_files,
            pending_files: agg.total_files - agg.finished_files(),
            total_bytes: agg.total_bytes,
            uploaded_bytes: agg.uploaded_bytes,
            processed_bytes: agg.processed_bytes,
            percent_complete: progress_percent(&agg),
            files_needing_review: agg.needs_review,
            updated_at: batch.updated_at,
        })
    }

    // ==================== File updates ====================

    /// Record bytes received for a file still uploading
    pub fn update_file_upload_progress(
        &self,
        tenant_id: Uuid,
        file_id: Uuid,
        uploaded_bytes: u64,
    ) -> Result<BatchFile> {
        let file = self.get_file(tenant_id, file_id)?;
        self.with_file(file.batch_id, file_id, |file| {
            match file.upload_status {
                UploadStatus::Completed => return Ok(false),
                UploadStatus::Failed | UploadStatus::Cancelled => {
                    return Err(Error::invalid_state(format!(
                        "Upload of '{}' is {}",
                        file.sanitized_filename, file.upload_status
                    )))
                }
                UploadStatus::Pending | UploadStatus::Uploading => {}
            }
            if uploaded_bytes > file.size_bytes {
                return Err(Error::validation(format!(
                    "{} bytes reported for a {} byte file",
                    uploaded_bytes, file.size_bytes
                )));
            }
            file.upload_status = UploadStatus::Uploading;
            file.uploaded_bytes = uploaded_bytes.max(file.uploaded_bytes);
            Ok(true)
        })
    }

    /// Direct upload of a whole file
    pub async fn store_file_content(
        &self,
        tenant_id: Uuid,
        file_id: Uuid,
        data: Bytes,
    ) -> Result<BatchFile> {
        let file = self.get_file(tenant_id, file_id)?;
        let batch = self.owned_batch(tenant_id, file.batch_id)?;
        if batch.status.is_terminal() {
            return Err(Error::invalid_state(format!(
                "Batch {} is {}",
                batch.batch_number, batch.status
            )));
        }

        let hash = sha256_hex(&data);
        if file.upload_status == UploadStatus::Completed {
            if file.content_hash.as_deref() == Some(hash.as_str()) {
                return Ok(file);
            }
            return Err(Error::Conflict(format!(
                "'{}' was already uploaded with different content",
                file.sanitized_filename
            )));
        }
        if matches!(file.upload_status, UploadStatus::Failed | UploadStatus::Cancelled) {
            return Err(Error::invalid_state(format!(
                "Upload of '{}' is {}",
                file.sanitized_filename, file.upload_status
            )));
        }
        if data.len() as u64 != file.size_bytes {
            return Err(Error::validation(format!(
                "'{}' was declared as {} bytes but {} arrived",
                file.sanitized_filename,
                file.size_bytes,
                data.len()
            )));
        }
        if let Some(declared) = &file.declared_hash {
            if *declared != hash {
                let message = format!(
                    "Content hash of '{}' does not match the declared hash",
                    file.sanitized_filename
                );
                self.fail_upload(&file, &message)?;
                return Err(Error::integrity(message));
            }
        }

        let stored = self
            .store
            .put(&object_key(&tenant_id, &file_id, &file.extension), &data)
            .await
            .map_err(|e| Error::Transient(format!("Failed to store '{}': {}", file.sanitized_filename, e)))?;

        self.attach_uploaded_object(tenant_id, file_id, &stored)
    }

    /// Point a file at content already in the object store
    pub fn attach_uploaded_object(
        &self,
        tenant_id: Uuid,
        file_id: Uuid,
        stored: &StoredObject,
    ) -> Result<BatchFile> {
        let file = self.get_file(tenant_id, file_id)?;

        if stored.size != file.size_bytes {
            let message = format!(
                "'{}' was declared as {} bytes but the stored object has {}",
                file.sanitized_filename, file.size_bytes, stored.size
            );
            self.fail_upload(&file, &message)?;
            return Err(Error::integrity(message));
        }
        if let Some(declared) = &file.declared_hash {
            if *declared != stored.sha256 {
                let message = format!(
                    "Stored content of '{}' does not match the declared hash",
                    file.sanitized_filename
                );
                self.fail_upload(&file, &message)?;
                return Err(Error::integrity(message));
            }
        }

        let updated = self.with_file(file.batch_id, file_id, |file| {
            if file.upload_status == UploadStatus::Completed {
                return Ok(false);
            }
            if matches!(file.upload_status, UploadStatus::Failed | UploadStatus::Cancelled) {
                return Err(Error::invalid_state(format!(
                    "Upload of '{}' is {}",
                    file.sanitized_filename, file.upload_status
                )));
            }
            file.upload_status = UploadStatus::Completed;
            file.uploaded_bytes = file.size_bytes;
            file.content_hash = Some(stored.sha256.clone());
            file.storage_path = Some(stored.uri.clone());
            file.validation_status = ValidationStatus::Valid;
            Ok(true)
        })?;

        self.events.info(
            Some(tenant_id),
            "batch.file_uploaded",
            &format!("'{}' uploaded ({} bytes)", updated.sanitized_filename, stored.size),
            json!({ "batch_id": updated.batch_id, "file_id": file_id, "sha256": stored.sha256 }),
        );
        Ok(updated)
    }

    /// Worker picked the file up
    pub fn mark_file_processing(&self, file_id: Uuid) -> Result<BatchFile> {
        let file = self.file(file_id)?;
        self.with_file(file.batch_id, file_id, |file| {
            if !matches!(file.processing_status, ProcessingStatus::Pending | ProcessingStatus::Queued) {
                return Ok(false);
            }
            file.processing_status = ProcessingStatus::Processing;
            Ok(true)
        })
    }

    /// Finish a file, applying the batch's duplicate policy
    pub fn complete_file(
        &self,
        file_id: Uuid,
        content_hash: &str,
        scan_status: ScanStatus,
    ) -> Result<BatchFile> {
        let file = self.file(file_id)?;
        let batch = self.reload(file.batch_id)?;
        let existing = self
            .db
            .find_completed_by_hash(file.tenant_id, content_hash, file_id)?;

        let updated = self.with_file(file.batch_id, file_id, |file| {
            if matches!(
                file.processing_status,
                ProcessingStatus::Completed | ProcessingStatus::Skipped | ProcessingStatus::Failed
            ) {
                return Ok(false);
            }
            file.content_hash = Some(content_hash.to_string());
            file.scan_status = scan_status;
            file.processed_at = Some(Utc::now());
            file.processing_status = ProcessingStatus::Completed;

            if let Some(original) = &existing {
                file.is_duplicate = true;
                file.duplicate_of = Some(original.id);
                match batch.duplicate_policy {
                    DuplicatePolicy::Skip => file.processing_status = ProcessingStatus::Skipped,
                    DuplicatePolicy::Flag => file.needs_review = true,
                    DuplicatePolicy::KeepBoth => {}
                }
            }
            Ok(true)
        })?;

        match (&existing, updated.processing_status) {
            (Some(original), status) => self.events.info(
                Some(updated.tenant_id),
                "batch.file_duplicate",
                &format!(
                    "'{}' duplicates '{}' ({} policy, {})",
                    updated.sanitized_filename,
                    original.sanitized_filename,
                    batch.duplicate_policy,
                    status
                ),
                json!({
                    "batch_id": updated.batch_id,
                    "file_id": file_id,
                    "duplicate_of": original.id,
                    "policy": batch.duplicate_policy,
                }),
            ),
            (None, _) => self.events.info(
                Some(updated.tenant_id),
                "batch.file_completed",
                &format!("'{}' processed", updated.sanitized_filename),
                json!({ "batch_id": updated.batch_id, "file_id": file_id }),
            ),
        }
        Ok(updated)
    }

    /// Count a failure; the file stays retryable until the retry budget is spent
    pub fn fail_file(&self, file_id: Uuid, error: &str) -> Result<BatchFile> {
        let file = self.file(file_id)?;
        let max_retries = self.config.max_file_retries;

        let updated = self.with_file(file.batch_id, file_id, |file| {
            if file.is_terminal() {
                return Ok(false);
            }
            file.error_count += 1;
            file.last_error = Some(error.to_string());
            file.processing_status = if file.error_count < max_retries {
                ProcessingStatus::Pending
            } else {
                ProcessingStatus::Failed
            };
            Ok(true)
        })?;

        let terminal = updated.processing_status == ProcessingStatus::Failed;
        self.events.log(
            Some(updated.tenant_id),
            "batch.file_failed",
            if terminal {
                crate::events::EventLevel::Error
            } else {
                crate::events::EventLevel::Warning
            },
            &format!(
                "'{}' failed (attempt {} of {}): {}",
                updated.sanitized_filename, updated.error_count, max_retries, error
            ),
            json!({
                "batch_id": updated.batch_id,
                "file_id": file_id,
                "error_count": updated.error_count,
                "terminal": terminal,
            }),
        );
        Ok(updated)
    }

    /// Fail a file without retry (integrity, infected, upload never arrived)
    pub fn fail_file_terminal(
        &self,
        file_id: Uuid,
        error: &str,
        scan_status: Option<ScanStatus>,
    ) -> Result<BatchFile> {
        let file = self.file(file_id)?;
        let updated = self.with_file(file.batch_id, file_id, |file| {
            if file.is_terminal() {
                return Ok(false);
            }
            file.error_count += 1;
            file.last_error = Some(error.to_string());
            file.processing_status = ProcessingStatus::Failed;
            if file.upload_status != UploadStatus::Completed {
                file.upload_status = UploadStatus::Failed;
            }
            if let Some(scan) = scan_status {
                file.scan_status = scan;
                file.needs_review = scan == ScanStatus::Infected;
            }
            Ok(true)
        })?;

        self.events.error(
            Some(updated.tenant_id),
            "batch.file_failed",
            &format!("'{}' failed permanently: {}", updated.sanitized_filename, error),
            json!({
                "batch_id": updated.batch_id,
                "file_id": file_id,
                "scan_status": updated.scan_status,
                "terminal": true,
            }),
        );
        Ok(updated)
    }

    /// Recompute aggregates and status of one batch
    pub fn recompute(&self, batch_id: Uuid) -> Result<Batch> {
        let lock = self.batch_lock(batch_id);
        let _guard = lock.lock();
        let batch = self.reload(batch_id)?;
        self.recompute_locked(&batch)
    }

    // ==================== Internals ====================

    fn fail_upload(&self, file: &BatchFile, message: &str) -> Result<()> {
        self.with_file(file.batch_id, file.id, |file| {
            if file.is_terminal() {
                return Ok(false);
            }
            file.upload_status = UploadStatus::Failed;
            file.validation_status = ValidationStatus::Invalid;
            file.error_count += 1;
            file.last_error = Some(message.to_string());
            Ok(true)
        })?;
        self.events.error(
            Some(file.tenant_id),
            "batch.file_integrity_failed",
            message,
            json!({ "batch_id": file.batch_id, "file_id": file.id }),
        );
        Ok(())
    }

    /// Apply `change` to a file under its batch lock and recompute when it
    /// reports a modification
    fn with_file<F>(&self, batch_id: Uuid, file_id: Uuid, change: F) -> Result<BatchFile>
    where
        F: FnOnce(&mut BatchFile) -> Result<bool>,
    {
        let lock = self.batch_lock(batch_id);
        let _guard = lock.lock();

        let mut file = self.file(file_id)?;
        if change(&mut file)? {
            file.updated_at = Utc::now();
            self.db.update_batch_file(&file)?;
            let batch = self.reload(batch_id)?;
            self.recompute_locked(&batch)?;
        }
        Ok(file)
    }

    /// Caller holds the batch lock
    fn recompute_locked(&self, batch: &Batch) -> Result<Batch> {
        let agg = self.db.file_aggregates(batch.id)?;
        let status = next_status(batch.status, &agg);
        let progress = progress_percent(&agg);
        let now = Utc::now();

        self.db
            .write_batch_aggregates(batch.id, &agg, status, progress, now)?;

        if status != batch.status {
            self.events.info(
                Some(batch.tenant_id),
                "batch.status_changed",
                &format!("Batch {}: {} -> {}", batch.batch_number, batch.status, status),
                json!({
                    "batch_id": batch.id,
                    "from": batch.status,
                    "to": status,
                    "completed": agg.completed_files,
                    "failed": agg.failed_files,
                    "skipped": agg.skipped_files,
                }),
            );
            if status.is_terminal() {
                self.notify_terminal(batch, status);
            }
        }

        self.reload(batch.id)
    }

    fn notify_terminal(&self, batch: &Batch, status: BatchStatus) {
        if status == BatchStatus::Completed {
            // Dependents may have become ready
            self.queue.wake();
        }
        if let Some(tx) = self.completions.read().as_ref() {
            let _ = tx.send(BatchCompletion {
                tenant_id: batch.tenant_id,
                batch_id: batch.id,
                status,
            });
        }
    }

    fn batch_lock(&self, batch_id: Uuid) -> Arc<Mutex<()>> {
        self.locks.entry(batch_id).or_default().clone()
    }

    fn owned_batch(&self, tenant_id: Uuid, batch_id: Uuid) -> Result<Batch> {
        self.db
            .get_batch(batch_id)?
            .filter(|b| b.tenant_id == tenant_id && b.deleted_at.is_none())
            .ok_or_else(|| Error::not_found("batch", batch_id))
    }

    fn reload(&self, batch_id: Uuid) -> Result<Batch> {
        self.db
            .get_batch(batch_id)?
            .ok_or_else(|| Error::not_found("batch", batch_id))
    }

    fn file(&self, file_id: Uuid) -> Result<BatchFile> {
        self.db
            .get_batch_file(file_id)?
            .ok_or_else(|| Error::not_found("file", file_id))
    }

    fn tenant_limits(&self, tenant_id: Uuid) -> Result<TenantLimits> {
        let settings = self.db.get_tenant_settings(tenant_id)?.unwrap_or_default();
        Ok(TenantLimits {
            limits: BatchLimits {
                max_files: settings
                    .max_files_per_batch
                    .unwrap_or(self.config.max_files_per_batch),
                max_total_bytes: settings.max_batch_bytes.unwrap_or(self.config.max_batch_bytes),
                max_file_size: settings.max_file_size.unwrap_or(self.config.max_file_size),
                allowed_extensions: settings
                    .allowed_extensions
                    .unwrap_or_else(|| self.config.allowed_extensions.clone())
                    .iter()
                    .map(|e| normalize_extension(e))
                    .collect(),
            },
            max_active_batches: settings
                .max_active_batches
                .unwrap_or(self.config.max_active_batches),
        })
    }
}

struct TenantLimits {
    limits: BatchLimits,
    max_active_batches: u32,
}

/// Apply a request's optional limits, which may only tighten the tenant's
fn narrow_limits(tenant: &BatchLimits, request: &NewBatch) -> Result<BatchLimits> {
    let mut limits = tenant.clone();

    if let Some(max_files) = request.max_files {
        if max_files == 0 || max_files > tenant.max_files {
            return Err(Error::validation(format!(
                "max_files must be between 1 and {}",
                tenant.max_files
            )));
        }
        limits.max_files = max_files;
    }
    if let Some(max_bytes) = request.max_total_bytes {
        if max_bytes == 0 || max_bytes > tenant.max_total_bytes {
            return Err(Error::validation(format!(
                "max_total_bytes must be between 1 and {}",
                tenant.max_total_bytes
            )));
        }
        limits.max_total_bytes = max_bytes;
        limits.max_file_size = limits.max_file_size.min(max_bytes);
    }
    if let Some(extensions) = &request.allowed_extensions {
        let mut narrowed: Vec<String> = extensions.iter().map(|e| normalize_extension(e)).collect();
        narrowed.sort();
        narrowed.dedup();
        if narrowed.is_empty() {
            return Err(Error::validation("allowed_extensions must not be empty"));
        }
        if let Some(extra) = narrowed.iter().find(|e| !tenant.allows_extension(e)) {
            return Err(Error::validation(format!(
                "Extension '.{}' is not allowed for this tenant",
                extra
            )));
        }
        limits.allowed_extensions = narrowed;
    }
    Ok(limits)
}

/// Batch status implied by its file counters.
///
/// Only uploading and processing batches move. A batch whose files are all
/// finished is completed when none failed, failed when all failed and
/// partially completed otherwise; skipped files count as success. A
/// processing batch never moves back to uploading.
pub fn next_status(current: BatchStatus, agg: &FileAggregates) -> BatchStatus {
    if !matches!(current, BatchStatus::Uploading | BatchStatus::Processing) || agg.total_files == 0 {
        return current;
    }

    if agg.finished_files() >= agg.total_files {
        return if agg.failed_files == 0 {
            BatchStatus::Completed
        } else if agg.failed_files >= agg.total_files {
            BatchStatus::Failed
        } else {
            BatchStatus::PartiallyCompleted
        };
    }

    let started = agg.in_progress_files > 0 || agg.finished_files() > 0;
    if current == BatchStatus::Processing || started || agg.uploaded_files == agg.total_files {
        BatchStatus::Processing
    } else {
        BatchStatus::Uploading
    }
}

/// Finished share of files, two decimals
pub fn progress_percent(agg: &FileAggregates) -> f64 {
    if agg.total_files == 0 {
        return 0.0;
    }
    let raw = agg.finished_files() as f64 / agg.total_files as f64 * 100.0;
    (raw * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestConfig;
    use crate::providers::LocalObjectStore;
    use crate::testing;
    use crate::types::{ConcurrencyMode, QueueItemStatus, TenantSettings};

    struct Fixture {
        _dir: tempfile::TempDir,
        db: IngestDb,
        queue: Arc<QueueManager>,
        batches: BatchManager,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = IngestConfig::default();
        let db = testing::db();
        let queue = Arc::new(QueueManager::new(db.clone(), config.queue.clone(), testing::events()));
        let store = Arc::new(LocalObjectStore::new(dir.path().join("objects")).unwrap());
        let batches = BatchManager::new(
            db.clone(),
            config.batch.clone(),
            WorkerTier::new(&config.workers),
            queue.clone(),
            store,
            testing::events(),
        );
        Fixture {
            _dir: dir,
            db,
            queue,
            batches,
        }
    }

    fn limited(max_files: u32, max_bytes: u64) -> NewBatch {
        let mut request = NewBatch::named("Årsstämma 2024");
        request.max_files = Some(max_files);
        request.max_total_bytes = Some(max_bytes);
        request
    }

    fn files(count: usize, size: u64) -> Vec<NewBatchFile> {
        (0..count)
            .map(|i| NewBatchFile::new(format!("protokoll-{}.pdf", i), size))
            .collect()
    }

    fn agg(total: u32, uploaded: u32, completed: u32, failed: u32, skipped: u32, in_progress: u32) -> FileAggregates {
        FileAggregates {
            total_files: total,
            uploaded_files: uploaded,
            completed_files: completed,
            failed_files: failed,
            skipped_files: skipped,
            in_progress_files: in_progress,
            ..Default::default()
        }
    }

    #[test]
    fn test_next_status_rules() {
        use BatchStatus::*;
        assert_eq!(next_status(Pending, &agg(2, 2, 2, 0, 0, 0)), Pending);
        assert_eq!(next_status(Cancelled, &agg(2, 2, 2, 0, 0, 0)), Cancelled);
        assert_eq!(next_status(Uploading, &agg(2, 0, 0, 0, 0, 0)), Uploading);
        assert_eq!(next_status(Uploading, &agg(2, 2, 0, 0, 0, 0)), Processing);
        assert_eq!(next_status(Uploading, &agg(2, 1, 0, 0, 0, 1)), Processing);
        assert_eq!(next_status(Processing, &agg(2, 1, 0, 0, 0, 0)), Processing);
        assert_eq!(next_status(Processing, &agg(2, 2, 1, 0, 1, 0)), Completed);
        assert_eq!(next_status(Processing, &agg(2, 2, 1, 1, 0, 0)), PartiallyCompleted);
        assert_eq!(next_status(Processing, &agg(2, 0, 0, 2, 0, 0)), Failed);
    }

    #[test]
    fn test_progress_rounding() {
        assert_eq!(progress_percent(&agg(0, 0, 0, 0, 0, 0)), 0.0);
        assert_eq!(progress_percent(&agg(3, 3, 1, 0, 0, 0)), 33.33);
        assert_eq!(progress_percent(&agg(3, 3, 2, 1, 0, 0)), 100.0);
    }

    #[test]
    fn test_batch_numbers_and_limit_narrowing() {
        let f = fixture();
        let tenant = Uuid::new_v4();

        let first = f.batches.create_batch(tenant, NewBatch::named("a")).unwrap();
        let second = f.batches.create_batch(tenant, limited(10, 100 * 1024 * 1024)).unwrap();
        assert_eq!(first.batch_number, 1);
        assert_eq!(second.batch_number, 2);
        assert_eq!(second.limits.max_files, 10);

        let too_many = f.batches.create_batch(tenant, limited(5000, 1024));
        assert!(matches!(too_many, Err(Error::Validation(_))));

        let mut bad_ext = NewBatch::named("exe");
        bad_ext.allowed_extensions = Some(vec!["exe".to_string()]);
        assert!(matches!(f.batches.create_batch(tenant, bad_ext), Err(Error::Validation(_))));
    }

    #[test]
    fn test_active_batch_quota_is_capacity_error() {
        let f = fixture();
        let tenant = Uuid::new_v4();
        f.db.put_tenant_settings(&TenantSettings {
            tenant_id: tenant,
            max_active_batches: Some(1),
            ..Default::default()
        })
        .unwrap();

        f.batches.create_batch(tenant, NewBatch::named("one")).unwrap();
        let err = f.batches.create_batch(tenant, NewBatch::named("two")).unwrap_err();
        assert_eq!(err.kind().as_str(), "capacity_exceeded");
        assert_eq!(err.retry_after(), Some(60));
    }

    #[test]
    fn test_concurrent_creates_respect_active_ceiling() {
        let f = fixture();
        let tenant = Uuid::new_v4();
        f.db.put_tenant_settings(&TenantSettings {
            tenant_id: tenant,
            max_active_batches: Some(2),
            ..Default::default()
        })
        .unwrap();

        let results: Vec<Result<Batch>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let batches = &f.batches;
                    scope.spawn(move || batches.create_batch(tenant, NewBatch::named(format!("racer {}", i))))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let created = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(created, 2);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, Error::Capacity { .. })));
        assert_eq!(f.db.count_active_batches(tenant).unwrap(), 2);
    }

    #[test]
    fn test_add_files_over_capacity_rejected_atomically() {
        let f = fixture();
        let tenant = Uuid::new_v4();
        let batch = f.batches.create_batch(tenant, limited(10, 100 * 1024 * 1024)).unwrap();

        let err = f.batches.add_files(tenant, batch.id, files(11, 1024)).unwrap_err();
        assert!(matches!(err, Error::Capacity { .. }));

        let batch = f.batches.get_batch(tenant, batch.id).unwrap();
        assert_eq!(batch.status, BatchStatus::Pending);
        assert_eq!(batch.total_files, 0);

        let mut mixed = files(2, 1024);
        mixed.push(NewBatchFile::new("virus.exe", 10));
        assert!(matches!(
            f.batches.add_files(tenant, batch.id, mixed),
            Err(Error::Validation(_))
        ));
        assert!(f.batches.list_files(tenant, batch.id).unwrap().is_empty());

        let added = f.batches.add_files(tenant, batch.id, files(3, 1024)).unwrap();
        assert_eq!(added.iter().map(|f| f.processing_order).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(added[0].content_type, "application/pdf");
        let batch = f.batches.get_batch(tenant, batch.id).unwrap();
        assert_eq!(batch.total_files, 3);
        assert_eq!(batch.total_bytes, 3072);
    }

    #[test]
    fn test_other_tenant_sees_not_found() {
        let f = fixture();
        let batch = f.batches.create_batch(Uuid::new_v4(), NewBatch::named("mine")).unwrap();
        assert!(matches!(
            f.batches.get_batch(Uuid::new_v4(), batch.id),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_start_batch_enqueues_with_estimates() {
        let f = fixture();
        let tenant = Uuid::new_v4();
        let batch = f.batches.create_batch(tenant, NewBatch::named("b")).unwrap();

        assert!(matches!(
            f.batches.start_batch(tenant, batch.id, StartBatchOptions::default()),
            Err(Error::Validation(_))
        ));

        f.batches.add_files(tenant, batch.id, files(2, 2048)).unwrap();
        let item = f
            .batches
            .start_batch(tenant, batch.id, StartBatchOptions::default())
            .unwrap();
        assert_eq!(item.worker_type, crate::types::WorkerType::Fast);
        assert_eq!(item.required_file_types, vec!["pdf".to_string()]);
        assert_eq!(item.status, QueueItemStatus::Queued);

        let batch = f.batches.get_batch(tenant, batch.id).unwrap();
        assert_eq!(batch.status, BatchStatus::Uploading);
        assert!(batch.started_at.is_some());

        assert!(matches!(
            f.batches.add_files(tenant, batch.id, files(1, 10)),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_failed_dependency_enqueue_returns_batch_to_pending() {
        let f = fixture();
        let tenant = Uuid::new_v4();
        let batch = f.batches.create_batch(tenant, NewBatch::named("b")).unwrap();
        f.batches.add_files(tenant, batch.id, files(1, 10)).unwrap();

        let options = StartBatchOptions {
            dependencies: vec![Uuid::new_v4()],
            scheduled_at: None,
        };
        assert!(f.batches.start_batch(tenant, batch.id, options).is_err());
        assert_eq!(
            f.batches.get_batch(tenant, batch.id).unwrap().status,
            BatchStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_file_lifecycle_drives_batch_status() {
        let f = fixture();
        let tenant = Uuid::new_v4();
        let batch = f.batches.create_batch(tenant, NewBatch::named("b")).unwrap();
        let added = f
            .batches
            .add_files(
                tenant,
                batch.id,
                vec![NewBatchFile::new("a.txt", 5), NewBatchFile::new("b.txt", 5)],
            )
            .unwrap();
        f.batches.start_batch(tenant, batch.id, StartBatchOptions::default()).unwrap();

        f.batches
            .update_file_upload_progress(tenant, added[0].id, 3)
            .unwrap();
        let stored = f
            .batches
            .store_file_content(tenant, added[0].id, Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert_eq!(stored.upload_status, UploadStatus::Completed);

        // Same bytes again are accepted, different bytes are not
        f.batches
            .store_file_content(tenant, added[0].id, Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert!(matches!(
            f.batches
                .store_file_content(tenant, added[0].id, Bytes::from_static(b"world"))
                .await,
            Err(Error::Conflict(_))
        ));

        f.batches.mark_file_processing(added[0].id).unwrap();
        assert_eq!(
            f.batches.get_batch(tenant, batch.id).unwrap().status,
            BatchStatus::Processing
        );

        let hash = sha256_hex(b"hello");
        f.batches.complete_file(added[0].id, &hash, ScanStatus::Clean).unwrap();
        // Idempotent
        f.batches.complete_file(added[0].id, &hash, ScanStatus::Clean).unwrap();

        for _ in 0..3 {
            f.batches.fail_file(added[1].id, "parser crashed").unwrap();
        }
        let failed = f.batches.get_file(tenant, added[1].id).unwrap();
        assert_eq!(failed.processing_status, ProcessingStatus::Failed);
        assert_eq!(failed.error_count, 3);

        let progress = f.batches.get_batch_progress(tenant, batch.id).unwrap();
        assert_eq!(progress.status, BatchStatus::PartiallyCompleted);
        assert_eq!(progress.completed_files + progress.failed_files + progress.skipped_files, 2);
        assert_eq!(progress.percent_complete, 100.0);
    }

    #[tokio::test]
    async fn test_declared_hash_mismatch_is_integrity_error() {
        let f = fixture();
        let tenant = Uuid::new_v4();
        let batch = f.batches.create_batch(tenant, NewBatch::named("b")).unwrap();
        let mut request = NewBatchFile::new("a.txt", 5);
        request.declared_hash = Some(sha256_hex(b"other"));
        let file = f.batches.add_files(tenant, batch.id, vec![request]).unwrap().remove(0);
        f.batches.start_batch(tenant, batch.id, StartBatchOptions::default()).unwrap();

        let err = f
            .batches
            .store_file_content(tenant, file.id, Bytes::from_static(b"hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));

        let file = f.batches.get_file(tenant, file.id).unwrap();
        assert_eq!(file.upload_status, UploadStatus::Failed);
        assert_eq!(f.batches.get_batch(tenant, batch.id).unwrap().status, BatchStatus::Failed);
    }

    #[test]
    fn test_duplicate_policies() {
        let f = fixture();
        let tenant = Uuid::new_v4();
        let hash = sha256_hex(b"same");

        let mut outcomes = Vec::new();
        for policy in [DuplicatePolicy::Skip, DuplicatePolicy::Flag, DuplicatePolicy::KeepBoth] {
            let mut request = NewBatch::named(format!("{}", policy));
            request.duplicate_policy = policy;
            request.concurrency_mode = ConcurrencyMode::Sequential;
            let batch = f.batches.create_batch(tenant, request).unwrap();
            let file = f
                .batches
                .add_files(tenant, batch.id, files(1, 4))
                .unwrap()
                .remove(0);
            f.batches.start_batch(tenant, batch.id, StartBatchOptions::default()).unwrap();
            outcomes.push(f.batches.complete_file(file.id, &hash, ScanStatus::Clean).unwrap());
        }

        // The first batch's file is the original; nothing to skip yet
        assert_eq!(outcomes[0].processing_status, ProcessingStatus::Completed);
        assert!(!outcomes[0].is_duplicate);

        assert!(outcomes[1].is_duplicate && outcomes[1].needs_review);
        assert_eq!(outcomes[1].duplicate_of, Some(outcomes[0].id));
        assert!(outcomes[2].is_duplicate && !outcomes[2].needs_review);

        let mut request = NewBatch::named("skip again");
        request.duplicate_policy = DuplicatePolicy::Skip;
        let batch = f.batches.create_batch(tenant, request).unwrap();
        let file = f.batches.add_files(tenant, batch.id, files(1, 4)).unwrap().remove(0);
        f.batches.start_batch(tenant, batch.id, StartBatchOptions::default()).unwrap();
        let skipped = f.batches.complete_file(file.id, &hash, ScanStatus::Clean).unwrap();
        assert_eq!(skipped.processing_status, ProcessingStatus::Skipped);
        assert_eq!(
            f.batches.get_batch(tenant, batch.id).unwrap().status,
            BatchStatus::Completed
        );
    }

    #[test]
    fn test_cancel_propagates_to_queue_and_files() {
        let f = fixture();
        let tenant = Uuid::new_v4();
        let batch = f.batches.create_batch(tenant, NewBatch::named("b")).unwrap();
        f.batches.add_files(tenant, batch.id, files(2, 10)).unwrap();
        let item = f
            .batches
            .start_batch(tenant, batch.id, StartBatchOptions::default())
            .unwrap();

        let mut completions = f.batches.subscribe_completions();
        let cancelled = f.batches.cancel_batch(tenant, batch.id, "user request").unwrap();
        assert_eq!(cancelled.status, BatchStatus::Cancelled);
        assert_eq!(cancelled.skipped_files, 2);
        assert_eq!(f.queue.get(item.id).unwrap().status, QueueItemStatus::Cancelled);
        assert_eq!(completions.try_recv().unwrap().status, BatchStatus::Cancelled);

        // Idempotent, and deletion is allowed once terminal
        f.batches.cancel_batch(tenant, batch.id, "again").unwrap();
        f.batches.delete_batch(tenant, batch.id).unwrap();
        assert!(matches!(
            f.batches.get_batch(tenant, batch.id),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_delete_requires_terminal_batch() {
        let f = fixture();
        let tenant = Uuid::new_v4();
        let batch = f.batches.create_batch(tenant, NewBatch::named("b")).unwrap();
        assert!(matches!(
            f.batches.delete_batch(tenant, batch.id),
            Err(Error::InvalidState(_))
        ));
    }
}
