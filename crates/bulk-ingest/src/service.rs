//! Tenant-scoped service facade
//!
//! Wires the components together, applies rate limits in front of the
//! client-facing operations and runs the background tasks (dispatcher,
//! local workers, detection on batch completion, maintenance).

use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::batch::{BatchCompletion, BatchManager, StartBatchOptions};
use crate::config::{IngestConfig, RateLimitRule};
use crate::dedup::DuplicateDetector;
use crate::error::{Error, Result};
use crate::events::{DbEventLog, EventLogger, EventRecord};
use crate::processing::{
    local_registration, Dispatcher, ProcessingWorker, QueueManager, WorkerContext,
    WorkerRegistry, WorkerTier,
};
use crate::providers::{
    ContentAnalyzer, LocalObjectStore, NoopScanner, ObjectStore, PlainTextAnalyzer,
    SecurityScanner,
};
use crate::rate_limit::RateLimiter;
use crate::storage::IngestDb;
use crate::types::{
    Batch, BatchFile, BatchProgress, ChunkUploadOutcome, DetectionOptions, DetectionScope,
    DetectionSession, DuplicateGroup, DuplicateRecord, NewBatch, NewBatchFile, NewUploadSession,
    QueueItem, QueueStats, RateLimitDecision, ResolutionAction, ResumeInfo, TenantSettings, UploadSession,
    Worker, WorkerHealth, WorkerRegistration,
};
use crate::upload::{ChunkStaging, ChunkedUploadManager};

/// Rate-limited operation names
pub mod operations {
    pub const CREATE_BATCH: &str = "create_batch";
    pub const ADD_FILES: &str = "add_files";
    pub const UPLOAD_FILE: &str = "upload_file";
    pub const CHUNK_UPLOAD: &str = "chunk_upload";
    pub const START_DETECTION: &str = "start_detection";
}

/// Interval of the maintenance task
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Queue depth of a local worker's assignment channel
const ASSIGNMENT_BUFFER: usize = 16;

/// Caller identity attached to every request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub tenant_id: Uuid,
    pub client_ip: Option<String>,
}

impl RequestContext {
    pub fn new(tenant_id: Uuid) -> Self {
        Self {
            tenant_id,
            client_ip: None,
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }
}

/// Bulk ingest service
#[derive(Clone)]
pub struct IngestService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    config: IngestConfig,
    db: IngestDb,
    events: Arc<dyn EventLogger>,
    store: Arc<dyn ObjectStore>,
    scanner: Arc<dyn SecurityScanner>,
    rate_limiter: RateLimiter,
    queue: Arc<QueueManager>,
    registry: Arc<WorkerRegistry>,
    dispatcher: Arc<Dispatcher>,
    batches: Arc<BatchManager>,
    uploads: ChunkedUploadManager,
    detector: Arc<DuplicateDetector>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl IngestService {
    /// Open storage from the configuration with local providers
    pub fn new(config: IngestConfig) -> Result<Self> {
        config.validate()?;
        let db = IngestDb::new(&config.storage.database_path)?;
        let store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(&config.storage.objects_dir)?);
        Self::with_providers(
            config,
            db,
            store,
            Arc::new(NoopScanner),
            Arc::new(PlainTextAnalyzer::default()),
        )
    }

    /// Build with explicit storage and collaborators
    pub fn with_providers(
        config: IngestConfig,
        db: IngestDb,
        store: Arc<dyn ObjectStore>,
        scanner: Arc<dyn SecurityScanner>,
        analyzer: Arc<dyn ContentAnalyzer>,
    ) -> Result<Self> {
        let events: Arc<dyn EventLogger> = Arc::new(DbEventLog::new(db.clone()));

        let queue = Arc::new(QueueManager::new(db.clone(), config.queue.clone(), events.clone()));
        let registry = Arc::new(WorkerRegistry::new(
            db.clone(),
            config.workers.clone(),
            events.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(queue.clone(), registry.clone()));

        let batches = Arc::new(BatchManager::new(
            db.clone(),
            config.batch.clone(),
            WorkerTier::new(&config.workers),
            queue.clone(),
            store.clone(),
            events.clone(),
        ));
        let uploads = ChunkedUploadManager::new(
            db.clone(),
            config.uploads.clone(),
            ChunkStaging::new(&config.storage.staging_dir)?,
            store.clone(),
            batches.clone(),
            events.clone(),
        );
        let detector = Arc::new(DuplicateDetector::new(
            db.clone(),
            config.dedup.clone(),
            store.clone(),
            analyzer,
            events.clone(),
        ));
        let rate_limiter = RateLimiter::new(db.clone(), config.rate_limit.clone());
        let (shutdown, _) = watch::channel(false);

        tracing::info!(
            "Ingest service initialized (objects: {}, scanner: {})",
            store.name(),
            scanner.name()
        );

        Ok(Self {
            inner: Arc::new(ServiceInner {
                config,
                db,
                events,
                store,
                scanner,
                rate_limiter,
                queue,
                registry,
                dispatcher,
                batches,
                uploads,
                detector,
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn config(&self) -> &IngestConfig {
        &self.inner.config
    }

    /// Spawn the dispatcher, local workers and background tasks
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let mut tasks = inner.tasks.lock();
        if !tasks.is_empty() {
            return Err(Error::invalid_state("Ingest service already started"));
        }

        let parallel_files = inner.config.batch.parallel_files();
        let ctx = WorkerContext {
            batches: inner.batches.clone(),
            queue: inner.queue.clone(),
            registry: inner.registry.clone(),
            store: inner.store.clone(),
            scanner: inner.scanner.clone(),
        };

        for index in 0..inner.config.workers.local_workers {
            let worker = inner
                .registry
                .register(local_registration(&inner.config.workers, index, parallel_files))?;
            let (tx, rx) = mpsc::channel(ASSIGNMENT_BUFFER);
            inner.dispatcher.attach(worker.id, tx);

            let worker = Arc::new(ProcessingWorker::new(
                worker,
                ctx.clone(),
                &inner.config.workers,
                parallel_files,
            ));
            tasks.push(tokio::spawn(worker.run(rx, inner.shutdown.subscribe())));
        }

        tasks.push(tokio::spawn(
            inner.dispatcher.clone().run(inner.shutdown.subscribe()),
        ));

        let completions = inner.batches.subscribe_completions();
        tasks.push(tokio::spawn(completion_listener(
            self.inner.clone(),
            completions,
            inner.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(maintenance_loop(
            self.inner.clone(),
            inner.shutdown.subscribe(),
        )));

        tracing::info!(
            "Ingest service started with {} local workers",
            inner.config.workers.local_workers
        );
        Ok(())
    }

    /// Stop background tasks and wait for them
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Background task ended abnormally: {}", e);
            }
        }
        tracing::info!("Ingest service stopped");
    }

    // ==================== Batches ====================

    pub fn create_batch(&self, ctx: &RequestContext, request: NewBatch) -> Result<Batch> {
        self.admit(ctx, operations::CREATE_BATCH)?;
        self.inner.batches.create_batch(ctx.tenant_id, request)
    }

    pub fn add_files(
        &self,
        ctx: &RequestContext,
        batch_id: Uuid,
        files: Vec<NewBatchFile>,
    ) -> Result<Vec<BatchFile>> {
        self.admit(ctx, operations::ADD_FILES)?;
        self.inner.batches.add_files(ctx.tenant_id, batch_id, files)
    }

    pub fn start_batch(
        &self,
        ctx: &RequestContext,
        batch_id: Uuid,
        options: StartBatchOptions,
    ) -> Result<QueueItem> {
        self.inner.batches.start_batch(ctx.tenant_id, batch_id, options)
    }

    pub fn get_batch(&self, ctx: &RequestContext, batch_id: Uuid) -> Result<Batch> {
        self.inner.batches.get_batch(ctx.tenant_id, batch_id)
    }

    pub fn list_batches(&self, ctx: &RequestContext) -> Result<Vec<Batch>> {
        self.inner.batches.list_batches(ctx.tenant_id)
    }

    pub fn list_files(&self, ctx: &RequestContext, batch_id: Uuid) -> Result<Vec<BatchFile>> {
        self.inner.batches.list_files(ctx.tenant_id, batch_id)
    }

    pub fn get_batch_progress(&self, ctx: &RequestContext, batch_id: Uuid) -> Result<BatchProgress> {
        self.inner.batches.get_batch_progress(ctx.tenant_id, batch_id)
    }

    pub fn cancel_batch(&self, ctx: &RequestContext, batch_id: Uuid, reason: &str) -> Result<Batch> {
        self.inner.batches.cancel_batch(ctx.tenant_id, batch_id, reason)
    }

    pub fn delete_batch(&self, ctx: &RequestContext, batch_id: Uuid) -> Result<()> {
        self.inner.batches.delete_batch(ctx.tenant_id, batch_id)
    }

    /// Direct upload of a whole file
    pub async fn upload_file(
        &self,
        ctx: &RequestContext,
        file_id: Uuid,
        data: Bytes,
    ) -> Result<BatchFile> {
        self.admit(ctx, operations::UPLOAD_FILE)?;
        self.inner
            .batches
            .store_file_content(ctx.tenant_id, file_id, data)
            .await
    }

    // ==================== Chunked uploads ====================

    pub fn create_chunked_session(
        &self,
        ctx: &RequestContext,
        request: NewUploadSession,
    ) -> Result<UploadSession> {
        self.inner.uploads.create_session(ctx.tenant_id, request)
    }

    pub async fn upload_chunk(
        &self,
        ctx: &RequestContext,
        session_id: Uuid,
        chunk_index: u32,
        data: Bytes,
        chunk_hash: Option<&str>,
    ) -> Result<ChunkUploadOutcome> {
        self.admit(ctx, operations::CHUNK_UPLOAD)?;
        self.inner
            .uploads
            .upload_chunk(ctx.tenant_id, session_id, chunk_index, data, chunk_hash)
            .await
    }

    pub fn get_chunked_session(&self, ctx: &RequestContext, session_id: Uuid) -> Result<UploadSession> {
        self.inner.uploads.get_session(ctx.tenant_id, session_id)
    }

    pub fn resume_session(&self, ctx: &RequestContext, session_id: Uuid) -> Result<ResumeInfo> {
        self.inner.uploads.resume(ctx.tenant_id, session_id)
    }

    pub async fn cancel_session(
        &self,
        ctx: &RequestContext,
        session_id: Uuid,
        reason: &str,
    ) -> Result<UploadSession> {
        self.inner.uploads.cancel(ctx.tenant_id, session_id, reason).await
    }

    // ==================== Duplicates ====================

    pub async fn start_detection_session(
        &self,
        ctx: &RequestContext,
        scope: DetectionScope,
        options: DetectionOptions,
    ) -> Result<DetectionSession> {
        self.admit(ctx, operations::START_DETECTION)?;
        self.inner.detector.detect(ctx.tenant_id, scope, options).await
    }

    pub fn get_detection_session(
        &self,
        ctx: &RequestContext,
        session_id: Uuid,
    ) -> Result<DetectionSession> {
        self.inner.detector.get_session(ctx.tenant_id, session_id)
    }

    pub fn list_duplicate_records(
        &self,
        ctx: &RequestContext,
        session_id: Uuid,
    ) -> Result<Vec<DuplicateRecord>> {
        self.inner.detector.list_records(ctx.tenant_id, session_id)
    }

    pub fn list_duplicate_groups(
        &self,
        ctx: &RequestContext,
        session_id: Option<Uuid>,
        include_resolved: bool,
    ) -> Result<Vec<DuplicateGroup>> {
        self.inner
            .detector
            .list_groups(ctx.tenant_id, session_id, include_resolved)
    }

    pub fn resolve_duplicate(
        &self,
        ctx: &RequestContext,
        record_id: Uuid,
        action: ResolutionAction,
        actor: &str,
    ) -> Result<DuplicateRecord> {
        self.inner
            .detector
            .resolve(ctx.tenant_id, record_id, action, actor)
    }

    pub fn resolve_duplicate_group(
        &self,
        ctx: &RequestContext,
        group_id: Uuid,
        action: ResolutionAction,
        actor: &str,
    ) -> Result<DuplicateGroup> {
        self.inner
            .detector
            .resolve_group(ctx.tenant_id, group_id, action, actor)
    }

    pub fn auto_resolve_duplicates(&self, ctx: &RequestContext, session_id: Option<Uuid>) -> Result<usize> {
        self.inner.detector.auto_resolve(ctx.tenant_id, session_id)
    }

    // ==================== Rate limits and tenants ====================

    pub fn check_rate_limit(&self, ctx: &RequestContext, operation: &str) -> Result<RateLimitDecision> {
        self.inner
            .rate_limiter
            .check(Some(ctx.tenant_id), ctx.client_ip.as_deref(), operation)
    }

    pub fn set_rate_limit_override(
        &self,
        tenant_id: Uuid,
        operation: &str,
        rule: RateLimitRule,
    ) -> Result<()> {
        self.inner.rate_limiter.set_override(tenant_id, operation, rule)
    }

    pub fn set_tenant_settings(&self, settings: TenantSettings) -> Result<()> {
        for value in [settings.max_files_per_batch.map(u64::from), settings.max_batch_bytes, settings.max_file_size]
            .into_iter()
            .flatten()
        {
            if value == 0 {
                return Err(Error::validation("Tenant limits must be positive"));
            }
        }
        self.inner.db.put_tenant_settings(&settings)?;
        self.inner.events.info(
            Some(settings.tenant_id),
            "tenant.settings_updated",
            "Tenant batch limits updated",
            serde_json::to_value(&settings)?,
        );
        Ok(())
    }

    pub fn list_events(&self, ctx: &RequestContext, limit: usize) -> Result<Vec<EventRecord>> {
        self.inner.db.list_events(ctx.tenant_id, limit)
    }

    // ==================== Workers and queue ====================

    /// Register a remote worker; it polls its assignments itself
    pub fn register_worker(&self, registration: WorkerRegistration) -> Result<Worker> {
        let worker = self.inner.registry.register(registration)?;
        self.inner.queue.wake();
        Ok(worker)
    }

    pub fn worker_heartbeat(&self, worker_id: Uuid, health: WorkerHealth) -> Result<Worker> {
        self.inner.registry.heartbeat(worker_id, health)
    }

    /// Items currently assigned to a worker, for workers that poll
    pub fn worker_assignments(&self, worker_id: Uuid) -> Result<Vec<QueueItem>> {
        self.inner.registry.get(worker_id)?;
        self.inner.queue.assigned_to(worker_id)
    }

    pub fn drain_worker(&self, worker_id: Uuid) -> Result<()> {
        self.inner.registry.drain(worker_id)
    }

    pub fn list_workers(&self) -> Result<Vec<Worker>> {
        self.inner.registry.list()
    }

    pub fn queue_stats(&self) -> Result<QueueStats> {
        self.inner.queue.stats()
    }

    /// One dispatcher pass, for callers driving the queue themselves
    pub fn dispatch_now(&self) -> Result<crate::processing::DispatchReport> {
        self.inner.dispatcher.dispatch_once(Utc::now())
    }

    /// One maintenance pass
    pub async fn run_maintenance(&self) -> Result<()> {
        run_maintenance(&self.inner).await
    }

    fn admit(&self, ctx: &RequestContext, operation: &str) -> Result<RateLimitDecision> {
        self.inner
            .rate_limiter
            .admit(Some(ctx.tenant_id), ctx.client_ip.as_deref(), operation)
    }
}

/// Run detection for batches as they complete
async fn completion_listener(
    inner: Arc<ServiceInner>,
    mut completions: mpsc::UnboundedReceiver<BatchCompletion>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            completion = completions.recv() => {
                let Some(completion) = completion else { break };
                if !inner.config.dedup.detect_on_batch_complete {
                    continue;
                }
                if !matches!(
                    completion.status,
                    crate::types::BatchStatus::Completed | crate::types::BatchStatus::PartiallyCompleted
                ) {
                    continue;
                }
                let result = inner
                    .detector
                    .detect(
                        completion.tenant_id,
                        DetectionScope::Batch(completion.batch_id),
                        DetectionOptions::default(),
                    )
                    .await;
                if let Err(e) = result {
                    tracing::error!(
                        "Detection for completed batch {} failed: {}",
                        completion.batch_id,
                        e
                    );
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn maintenance_loop(inner: Arc<ServiceInner>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = run_maintenance(&inner).await {
                    tracing::error!("Maintenance pass failed: {}", e);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn run_maintenance(inner: &ServiceInner) -> Result<()> {
    let now = Utc::now();
    inner.rate_limiter.cleanup(now)?;
    inner
        .db
        .prune_events(now - ChronoDuration::days(inner.config.storage.event_retention_days))?;
    inner.queue.cleanup(now)?;

    let expired = inner.uploads.expire_sessions(now)?;
    if expired > 0 {
        tracing::info!("Expired {} upload sessions", expired);
    }
    inner.uploads.cleanup_artifacts().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn service(dir: &std::path::Path) -> IngestService {
        let mut config = testing::config(dir);
        config
            .rate_limit
            .rules
            .insert(operations::CREATE_BATCH.to_string(), RateLimitRule::new(3600, 2, None));
        IngestService::new(config).unwrap()
    }

    #[test]
    fn test_create_batch_is_rate_limited() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let ctx = RequestContext::new(Uuid::new_v4()).with_ip("10.0.0.1");

        service.create_batch(&ctx, NewBatch::named("a")).unwrap();
        service.create_batch(&ctx, NewBatch::named("b")).unwrap();
        let err = service.create_batch(&ctx, NewBatch::named("c")).unwrap_err();
        assert!(matches!(err, Error::RateLimited { .. }));
        assert!(err.retry_after().unwrap() > 0);

        let decision = service.check_rate_limit(&ctx, operations::CREATE_BATCH).unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);

        // Another tenant behind a different address is unaffected
        let other = RequestContext::new(Uuid::new_v4()).with_ip("10.0.0.2");
        service.create_batch(&other, NewBatch::named("a")).unwrap();
    }

    #[tokio::test]
    async fn test_events_are_recorded_per_tenant() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let ctx = RequestContext::new(Uuid::new_v4());

        service.create_batch(&ctx, NewBatch::named("styrelsen")).unwrap();
        let events = service.list_events(&ctx, 10).unwrap();
        assert!(events.iter().any(|e| e.event_type == "batch.created"));

        let other = RequestContext::new(Uuid::new_v4());
        assert!(service.list_events(&other, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected_and_shutdown_joins() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        service.start().unwrap();
        assert!(matches!(service.start(), Err(Error::InvalidState(_))));
        assert_eq!(
            service.list_workers().unwrap().len(),
            service.config().workers.local_workers
        );
        service.shutdown().await;
    }
}
