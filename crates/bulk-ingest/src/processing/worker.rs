//! In-process worker for batch processing items

use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::timeout;

use crate::batch::BatchManager;
use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::providers::{hash_file, sha256_hex, ObjectStore, SecurityScanner};
use crate::types::{
    BatchFile, ConcurrencyMode, FailureOutcome, ProcessingStatus, QueueItem, ScanStatus,
    UploadStatus, Worker, WorkerCapacity, WorkerHealth, WorkerRegistration, WorkerType,
};

use super::dispatcher::Assignment;
use super::queue::QueueManager;
use super::registry::WorkerRegistry;

/// Shared services a worker reports into
#[derive(Clone)]
pub struct WorkerContext {
    pub batches: Arc<BatchManager>,
    pub queue: Arc<QueueManager>,
    pub registry: Arc<WorkerRegistry>,
    pub store: Arc<dyn ObjectStore>,
    pub scanner: Arc<dyn SecurityScanner>,
}

/// Registration for the `index`-th local worker
pub fn local_registration(config: &WorkerConfig, index: usize, parallel_files: usize) -> WorkerRegistration {
    WorkerRegistration {
        name: format!("local-{}", index),
        worker_type: WorkerType::Default,
        capacity: WorkerCapacity {
            max_concurrent_batches: config.worker_max_batches.max(1),
            max_concurrent_files: parallel_files as u32,
            memory_mb: config.worker_memory_mb,
            cpu_cores: config.worker_cpu_cores(),
            supported_file_types: vec![],
        },
    }
}

/// Outcome of one pass over a batch
#[derive(Debug, Default)]
struct BatchPass {
    processed: usize,
    /// Files that were not terminal when the pass ended
    open: Vec<BatchFile>,
    /// Batch was cancelled or finished before the pass
    stale: bool,
}

/// Worker for processing batches in the background
pub struct ProcessingWorker {
    worker: Worker,
    ctx: WorkerContext,
    parallel_files: usize,
    file_timeout: Duration,
    heartbeat_interval: Duration,
}

impl ProcessingWorker {
    /// Create a worker for an already registered worker row
    pub fn new(worker: Worker, ctx: WorkerContext, config: &WorkerConfig, parallel_files: usize) -> Self {
        let parallel_files = parallel_files
            .min(worker.capacity.max_concurrent_files.max(1) as usize)
            .max(1);

        tracing::info!(
            "Worker '{}' configured: {} parallel files, {}s file timeout",
            worker.name,
            parallel_files,
            config.file_timeout_secs
        );

        Self {
            worker,
            ctx,
            parallel_files,
            file_timeout: Duration::from_secs(config.file_timeout_secs.max(1)),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs.max(1)),
        }
    }

    pub fn id(&self) -> uuid::Uuid {
        self.worker.id
    }

    /// Receive assignments until shutdown, heartbeating in between
    pub async fn run(
        self: Arc<Self>,
        mut receiver: mpsc::Receiver<Assignment>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!("Processing worker '{}' started", self.worker.name);
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);

        loop {
            tokio::select! {
                assignment = receiver.recv() => {
                    let Some(assignment) = assignment else { break };
                    let worker = self.clone();
                    tokio::spawn(async move {
                        worker.process_assignment(assignment).await;
                    });
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = self.ctx.registry.heartbeat(self.worker.id, WorkerHealth::Healthy) {
                        tracing::warn!("Heartbeat for '{}' failed: {}", self.worker.name, e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.ctx.registry.drain(self.worker.id) {
            tracing::warn!("Failed to drain '{}': {}", self.worker.name, e);
        }
        tracing::info!("Processing worker '{}' stopped", self.worker.name);
    }

    /// Process one assigned item, report the outcome and return capacity
    pub async fn process_assignment(&self, assignment: Assignment) {
        let item = assignment.item;
        let start = Instant::now();
        tracing::info!(
            "Worker '{}' processing batch {} (item {})",
            self.worker.name,
            item.batch_id,
            item.id
        );

        let result = self.process_batch(&item).await;
        if let Err(e) = self.report(&item, result) {
            tracing::error!("Failed to report item {}: {}", item.id, e);
        }

        if let Err(e) = self.ctx.registry.release(self.worker.id, &item.resources) {
            tracing::error!("Failed to release capacity of '{}': {}", self.worker.name, e);
        }
        self.ctx.queue.wake();

        tracing::info!(
            "Worker '{}' finished item {} in {:.1}s",
            self.worker.name,
            item.id,
            start.elapsed().as_secs_f64()
        );
    }

    fn report(&self, item: &QueueItem, result: Result<BatchPass>) -> Result<()> {
        let (message, open) = match result {
            Ok(pass) if pass.stale || pass.open.is_empty() => {
                if !pass.stale {
                    tracing::info!("Batch {}: {} files processed", item.batch_id, pass.processed);
                }
                return self.settle_quietly(self.ctx.queue.complete(item.id, self.worker.id));
            }
            Ok(pass) => (format!("{} files not finished", pass.open.len()), pass.open),
            Err(e) => {
                tracing::error!("Batch {} pass failed: {}", item.batch_id, e);
                (e.public_message(), self.open_files(item))
            }
        };

        let outcome = match self.ctx.queue.fail(item.id, &message) {
            Ok(outcome) => outcome,
            Err(e) => return self.settle_quietly::<()>(Err(e)),
        };

        if let FailureOutcome::Failed { retry_count } = outcome {
            let reason = format!("Not processed after {} retries: {}", retry_count, message);
            for file in &open {
                self.ctx.batches.fail_file_terminal(file.id, &reason, None)?;
            }
        }
        Ok(())
    }

    fn open_files(&self, item: &QueueItem) -> Vec<BatchFile> {
        match self.ctx.batches.list_files(item.tenant_id, item.batch_id) {
            Ok(files) => files.into_iter().filter(|f| !f.is_terminal()).collect(),
            Err(e) => {
                tracing::warn!("Could not list files of batch {}: {}", item.batch_id, e);
                Vec::new()
            }
        }
    }

    /// The item may have been cancelled or reaped while we worked
    fn settle_quietly<T>(&self, result: Result<T>) -> Result<()> {
        match result {
            Ok(_) => Ok(()),
            Err(e @ (Error::Conflict(_) | Error::InvalidState(_))) => {
                tracing::warn!("Worker '{}' result discarded: {}", self.worker.name, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn process_batch(&self, item: &QueueItem) -> Result<BatchPass> {
        let batches = &self.ctx.batches;
        let batch = batches.get_batch(item.tenant_id, item.batch_id)?;
        if batch.status.is_terminal() {
            return Ok(BatchPass {
                stale: true,
                ..Default::default()
            });
        }

        let mut ready: Vec<BatchFile> = batches
            .list_files(item.tenant_id, item.batch_id)?
            .into_iter()
            .filter(|f| {
                f.upload_status == UploadStatus::Completed
                    && matches!(f.processing_status, ProcessingStatus::Pending | ProcessingStatus::Queued)
            })
            .collect();
        ready.sort_by_key(|f| (f.processing_order, f.id));

        let processed = ready.len();
        match batch.concurrency_mode {
            ConcurrencyMode::Sequential => {
                for file in ready {
                    self.process_file_guarded(file).await;
                }
            }
            ConcurrencyMode::Parallel => {
                let semaphore = Arc::new(Semaphore::new(self.parallel_files));
                let futures: Vec<_> = ready
                    .into_iter()
                    .map(|file| {
                        let sem = semaphore.clone();
                        async move {
                            let _permit = match sem.acquire().await {
                                Ok(permit) => permit,
                                Err(_) => return,
                            };
                            self.process_file_guarded(file).await;
                        }
                    })
                    .collect();
                join_all(futures).await;
            }
        }

        let open = batches
            .list_files(item.tenant_id, item.batch_id)?
            .into_iter()
            .filter(|f| !f.is_terminal())
            .collect();

        Ok(BatchPass {
            processed,
            open,
            stale: false,
        })
    }

    /// Failures stay on the file; siblings are unaffected
    async fn process_file_guarded(&self, file: BatchFile) {
        let file_id = file.id;
        let name = file.sanitized_filename.clone();

        let outcome = match timeout(self.file_timeout, self.process_file(file)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Transient(format!(
                "Processing timeout after {}s",
                self.file_timeout.as_secs()
            ))),
        };

        if let Err(e) = outcome {
            tracing::error!("Failed to process '{}': {}", name, e);
            let recorded = match e {
                Error::Integrity(_) => self.ctx.batches.fail_file_terminal(file_id, &e.to_string(), None),
                _ => self.ctx.batches.fail_file(file_id, &e.public_message()),
            };
            if let Err(e) = recorded {
                tracing::error!("Failed to record failure of '{}': {}", name, e);
            }
        }
    }

    async fn process_file(&self, file: BatchFile) -> Result<()> {
        let batches = &self.ctx.batches;
        batches.mark_file_processing(file.id)?;

        let uri = file.storage_path.clone().ok_or_else(|| {
            Error::invalid_state(format!("'{}' has no stored content", file.sanitized_filename))
        })?;

        let (hash, size, scan_status) = match self.ctx.store.local_path(&uri) {
            Some(path) => {
                let report = self.ctx.scanner.scan(&path).await?;
                if !report.clean {
                    let reason = format!("Threats found: {}", report.threats.join(", "));
                    tracing::warn!(
                        "'{}' rejected by {}: {}",
                        file.sanitized_filename,
                        self.ctx.scanner.name(),
                        reason
                    );
                    batches.fail_file_terminal(file.id, &reason, Some(ScanStatus::Infected))?;
                    return Ok(());
                }
                let (hash, size) = hash_file(&path).await?;
                (hash, size, ScanStatus::Clean)
            }
            None => {
                // Scanners need a local file; remote content is only hashed
                let data = self.ctx.store.read(&uri).await?;
                (sha256_hex(&data), data.len() as u64, ScanStatus::Skipped)
            }
        };

        if size != file.size_bytes {
            return Err(Error::integrity(format!(
                "'{}' has {} bytes in storage, {} declared",
                file.sanitized_filename, size, file.size_bytes
            )));
        }
        if let Some(recorded) = &file.content_hash {
            if *recorded != hash {
                return Err(Error::integrity(format!(
                    "Stored content of '{}' changed since upload",
                    file.sanitized_filename
                )));
            }
        }

        batches.complete_file(file.id, &hash, scan_status)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::StartBatchOptions;
    use crate::config::IngestConfig;
    use crate::providers::{LocalObjectStore, NoopScanner, ScanReport};
    use crate::storage::IngestDb;
    use crate::testing;
    use crate::types::{BatchStatus, NewBatch, NewBatchFile, QueueItemStatus};
    use crate::processing::WorkerTier;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::path::Path;
    use uuid::Uuid;

    struct EicarScanner;

    #[async_trait]
    impl SecurityScanner for EicarScanner {
        async fn scan(&self, path: &Path) -> Result<ScanReport> {
            let data = tokio::fs::read(path).await?;
            if data.starts_with(b"EICAR") {
                Ok(ScanReport::infected(vec!["Eicar-Test-Signature".to_string()]))
            } else {
                Ok(ScanReport::clean())
            }
        }

        fn name(&self) -> &str {
            "eicar"
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        ctx: WorkerContext,
        worker: ProcessingWorker,
    }

    fn fixture(config: IngestConfig, scanner: Arc<dyn SecurityScanner>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db: IngestDb = testing::db();
        let queue = Arc::new(QueueManager::new(db.clone(), config.queue.clone(), testing::events()));
        let registry = Arc::new(WorkerRegistry::new(
            db.clone(),
            config.workers.clone(),
            testing::events(),
        ));
        let store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(dir.path().join("objects")).unwrap());
        let batches = Arc::new(BatchManager::new(
            db,
            config.batch.clone(),
            WorkerTier::new(&config.workers),
            queue.clone(),
            store.clone(),
            testing::events(),
        ));
        let ctx = WorkerContext {
            batches,
            queue,
            registry: registry.clone(),
            store,
            scanner,
        };
        let row = registry
            .register(local_registration(&config.workers, 0, 2))
            .unwrap();
        let worker = ProcessingWorker::new(row, ctx.clone(), &config.workers, 2);
        Fixture {
            _dir: dir,
            ctx,
            worker,
        }
    }

    /// Create, fill and start a batch; upload the given contents
    async fn started_batch(f: &Fixture, contents: &[Option<&'static [u8]>]) -> (Uuid, QueueItem) {
        let tenant = Uuid::new_v4();
        let batches = &f.ctx.batches;
        let batch = batches.create_batch(tenant, NewBatch::named("worker")).unwrap();
        let requests = contents
            .iter()
            .enumerate()
            .map(|(i, c)| NewBatchFile::new(format!("doc-{}.txt", i), c.map_or(5, |c| c.len() as u64)))
            .collect();
        let files = batches.add_files(tenant, batch.id, requests).unwrap();
        let item = batches
            .start_batch(tenant, batch.id, StartBatchOptions::default())
            .unwrap();
        for (file, content) in files.iter().zip(contents) {
            if let Some(content) = content {
                batches
                    .store_file_content(tenant, file.id, Bytes::from_static(content))
                    .await
                    .unwrap();
            }
        }
        (tenant, item)
    }

    fn assign(f: &Fixture, item: &QueueItem) -> Assignment {
        assert!(f.ctx.registry.reserve(f.worker.id(), &item.resources).unwrap());
        let item = f.ctx.queue.assign(item.id, f.worker.id()).unwrap();
        Assignment {
            item,
            worker_id: f.worker.id(),
        }
    }

    #[tokio::test]
    async fn test_processes_uploaded_batch() {
        let f = fixture(IngestConfig::default(), Arc::new(NoopScanner));
        let (tenant, item) = started_batch(&f, &[Some(b"alpha"), Some(b"bravo")]).await;

        f.worker.process_assignment(assign(&f, &item)).await;

        let batch = f.ctx.batches.get_batch(tenant, item.batch_id).unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.processed_files, 2);
        assert_eq!(f.ctx.queue.get(item.id).unwrap().status, QueueItemStatus::Completed);
        assert_eq!(f.ctx.registry.get(f.worker.id()).unwrap().load.current_batches, 0);
    }

    #[tokio::test]
    async fn test_missing_upload_requeues_then_fails_file() {
        let mut config = IngestConfig::default();
        config.queue.max_retries = 1;
        let f = fixture(config, Arc::new(NoopScanner));
        let (tenant, item) = started_batch(&f, &[Some(b"alpha"), None]).await;

        f.worker.process_assignment(assign(&f, &item)).await;
        let requeued = f.ctx.queue.get(item.id).unwrap();
        assert_eq!(requeued.status, QueueItemStatus::Queued);
        assert_eq!(requeued.retry_count, 1);
        assert_eq!(
            f.ctx.batches.get_batch(tenant, item.batch_id).unwrap().status,
            BatchStatus::Processing
        );

        // Second attempt exhausts the budget
        f.worker.process_assignment(assign(&f, &item)).await;
        assert_eq!(f.ctx.queue.get(item.id).unwrap().status, QueueItemStatus::Failed);
        let batch = f.ctx.batches.get_batch(tenant, item.batch_id).unwrap();
        assert_eq!(batch.status, BatchStatus::PartiallyCompleted);
        assert_eq!(batch.failed_files, 1);
        assert_eq!(batch.processed_files, 1);
    }

    #[tokio::test]
    async fn test_infected_file_is_rejected_for_review() {
        let f = fixture(IngestConfig::default(), Arc::new(EicarScanner));
        let (tenant, item) = started_batch(&f, &[Some(b"EICAR-bad"), Some(b"clean")]).await;

        f.worker.process_assignment(assign(&f, &item)).await;

        let files = f.ctx.batches.list_files(tenant, item.batch_id).unwrap();
        let infected = files.iter().find(|f| f.processing_order == 1).unwrap();
        assert_eq!(infected.scan_status, ScanStatus::Infected);
        assert_eq!(infected.processing_status, ProcessingStatus::Failed);
        assert!(infected.needs_review);

        let batch = f.ctx.batches.get_batch(tenant, item.batch_id).unwrap();
        assert_eq!(batch.status, BatchStatus::PartiallyCompleted);
    }
}
