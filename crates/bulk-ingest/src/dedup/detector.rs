//! Duplicate detection sessions, grouping and resolution
//!
//! A session compares processed files pairwise with the selected algorithms,
//! records at most one match per pair (tenant-wide), clusters the new
//! records into groups and optionally resolves the unambiguous ones.

use chrono::Utc;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::DedupConfig;
use crate::error::{Error, Result};
use crate::events::EventLogger;
use crate::providers::{ContentAnalyzer, ObjectStore};
use crate::storage::IngestDb;
use crate::types::{
    AlgorithmScore, BatchFile, ComparisonMetrics, Confidence, DetectionAlgorithm,
    DetectionOptions, DetectionScope, DetectionSession, DetectionStatus, DuplicateGroup,
    DuplicateRecord, DuplicateStatus, FileFamily, GroupMember, ProcessingStatus,
    RecommendedAction, ResolutionAction, ResolutionStrategy,
};

use super::algorithms::{self, classify, Candidate};
use super::cluster::cluster_pairs;
use super::quality::{choose_master, QualityInput};

/// Actor recorded for automatic resolutions
pub const SYSTEM_ACTOR: &str = "system";

/// Outcome of comparing one pair
#[derive(Debug, Clone)]
pub struct PairMatch {
    pub algorithm: DetectionAlgorithm,
    pub similarity: f64,
    pub confidence: Confidence,
    pub recommended_action: RecommendedAction,
    pub auto_resolvable: bool,
    pub metrics: ComparisonMetrics,
}

/// Multi-algorithm duplicate detector
pub struct DuplicateDetector {
    db: IngestDb,
    config: DedupConfig,
    store: Arc<dyn ObjectStore>,
    analyzer: Arc<dyn ContentAnalyzer>,
    events: Arc<dyn EventLogger>,
}

impl DuplicateDetector {
    pub fn new(
        db: IngestDb,
        config: DedupConfig,
        store: Arc<dyn ObjectStore>,
        analyzer: Arc<dyn ContentAnalyzer>,
        events: Arc<dyn EventLogger>,
    ) -> Self {
        Self {
            db,
            config,
            store,
            analyzer,
            events,
        }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Run a detection session to completion
    pub async fn detect(
        &self,
        tenant_id: Uuid,
        scope: DetectionScope,
        options: DetectionOptions,
    ) -> Result<DetectionSession> {
        let algorithms = self.algorithms(&options)?;
        if let Some(batch_id) = scope.batch_id() {
            self.db
                .get_batch(batch_id)?
                .filter(|b| b.tenant_id == tenant_id && b.deleted_at.is_none())
                .ok_or_else(|| Error::not_found("batch", batch_id))?;
        }

        let mut session = DetectionSession {
            id: Uuid::new_v4(),
            tenant_id,
            scope,
            status: DetectionStatus::Running,
            algorithms: algorithms.clone(),
            files_considered: 0,
            pairs_compared: 0,
            matches_found: 0,
            groups_created: 0,
            errors: 0,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        self.db.insert_detection_session(&session)?;

        tracing::info!(
            "Detection session {} started for tenant {} ({:?})",
            session.id,
            tenant_id,
            scope
        );

        let outcome = self.run_session(&mut session, &algorithms).await;

        session.completed_at = Some(Utc::now());
        match &outcome {
            Ok(()) => session.status = DetectionStatus::Completed,
            Err(e) => {
                session.status = DetectionStatus::Failed;
                session.error = Some(e.public_message());
            }
        }
        self.db.update_detection_session(&session)?;
        outcome?;

        self.events.info(
            Some(tenant_id),
            "dedup.session_completed",
            &format!(
                "Detection compared {} pairs of {} files: {} matches in {} groups",
                session.pairs_compared,
                session.files_considered,
                session.matches_found,
                session.groups_created
            ),
            json!({
                "session_id": session.id,
                "batch_id": scope.batch_id(),
                "errors": session.errors,
            }),
        );

        if options.auto_resolve {
            let resolved = self.auto_resolve(tenant_id, Some(session.id))?;
            if resolved > 0 {
                tracing::info!("Auto-resolved {} groups of session {}", resolved, session.id);
            }
        }

        Ok(session)
    }

    pub fn get_session(&self, tenant_id: Uuid, session_id: Uuid) -> Result<DetectionSession> {
        self.db
            .get_detection_session(session_id)?
            .filter(|s| s.tenant_id == tenant_id)
            .ok_or_else(|| Error::not_found("detection session", session_id))
    }

    pub fn list_records(&self, tenant_id: Uuid, session_id: Uuid) -> Result<Vec<DuplicateRecord>> {
        self.get_session(tenant_id, session_id)?;
        self.db.list_session_records(session_id)
    }

    pub fn list_groups(
        &self,
        tenant_id: Uuid,
        session_id: Option<Uuid>,
        include_resolved: bool,
    ) -> Result<Vec<DuplicateGroup>> {
        self.db.list_duplicate_groups(tenant_id, session_id, include_resolved)
    }

    pub fn get_group(&self, tenant_id: Uuid, group_id: Uuid) -> Result<DuplicateGroup> {
        self.db
            .get_duplicate_group(group_id)?
            .filter(|g| g.tenant_id == tenant_id)
            .ok_or_else(|| Error::not_found("duplicate group", group_id))
    }

    /// Resolve one record; a resolved record is never resolved again
    pub fn resolve(
        &self,
        tenant_id: Uuid,
        record_id: Uuid,
        action: ResolutionAction,
        actor: &str,
    ) -> Result<DuplicateRecord> {
        let record = self
            .db
            .get_duplicate_record(record_id)?
            .filter(|r| r.tenant_id == tenant_id)
            .ok_or_else(|| Error::not_found("duplicate record", record_id))?;
        if record.status == DuplicateStatus::Resolved {
            return Err(Error::invalid_state(format!(
                "Duplicate record {} is already resolved",
                record_id
            )));
        }

        let master = match (action, record.group_id) {
            (ResolutionAction::MarkDuplicate, Some(group_id)) => {
                Some(self.get_group(tenant_id, group_id)?.master_file_id)
            }
            (ResolutionAction::MarkDuplicate, None) => {
                return Err(Error::validation(
                    "mark_duplicate needs a record that belongs to a group",
                ))
            }
            _ => None,
        };

        if !self
            .db
            .resolve_duplicate_record(record_id, action, actor, Utc::now())?
        {
            return Err(Error::invalid_state(format!(
                "Duplicate record {} is already resolved",
                record_id
            )));
        }

        self.apply_resolution(&record, action, master)?;
        if let Some(group_id) = record.group_id {
            self.db.close_group_if_settled(group_id)?;
        }

        self.events.info(
            Some(tenant_id),
            "dedup.resolved",
            &format!("Duplicate record {} resolved as {} by {}", record_id, action, actor),
            json!({
                "record_id": record_id,
                "file_a": record.file_a,
                "file_b": record.file_b,
                "group_id": record.group_id,
            }),
        );

        self.db
            .get_duplicate_record(record_id)?
            .ok_or_else(|| Error::not_found("duplicate record", record_id))
    }

    /// Resolve every open record of a group with the same action
    pub fn resolve_group(
        &self,
        tenant_id: Uuid,
        group_id: Uuid,
        action: ResolutionAction,
        actor: &str,
    ) -> Result<DuplicateGroup> {
        let group = self.get_group(tenant_id, group_id)?;
        if group.resolved {
            return Err(Error::invalid_state(format!(
                "Duplicate group {} is already resolved",
                group_id
            )));
        }

        let mut resolved = 0;
        for record in self.db.list_group_records(group_id)? {
            if record.status == DuplicateStatus::Resolved {
                continue;
            }
            match self.resolve(tenant_id, record.id, action, actor) {
                Ok(_) => resolved += 1,
                // Resolved concurrently
                Err(Error::InvalidState(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.db.close_group_if_settled(group_id)?;

        tracing::info!(
            "Group {} resolved as {} by {} ({} records)",
            group_id,
            action,
            actor,
            resolved
        );
        self.get_group(tenant_id, group_id)
    }

    /// Resolve auto-resolvable open groups as the system actor
    pub fn auto_resolve(&self, tenant_id: Uuid, session_id: Option<Uuid>) -> Result<usize> {
        let mut count = 0;
        for group in self.db.list_duplicate_groups(tenant_id, session_id, false)? {
            if !group.auto_resolvable {
                continue;
            }
            match self.resolve_group(tenant_id, group.id, ResolutionAction::MarkDuplicate, SYSTEM_ACTOR) {
                Ok(_) => count += 1,
                Err(Error::InvalidState(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(count)
    }

    /// Compare one pair with the given algorithms (priority ordered)
    pub fn compare(
        &self,
        algorithms: &[DetectionAlgorithm],
        a: &Candidate,
        b: &Candidate,
    ) -> Option<PairMatch> {
        let scores: Vec<AlgorithmScore> = algorithms
            .iter()
            .filter_map(|&algorithm| {
                let score = algorithms::score(algorithm, a, b, &self.config)?;
                Some(AlgorithmScore {
                    algorithm,
                    score,
                    confidence: classify(score, self.config.thresholds(algorithm)),
                })
            })
            .collect();

        // Strictly greater keeps the higher-priority algorithm on ties
        let mut best: Option<(AlgorithmScore, Confidence)> = None;
        for s in &scores {
            if let Some(confidence) = s.confidence {
                if best.map_or(true, |(b, _)| s.score > b.score) {
                    best = Some((*s, confidence));
                }
            }
        }
        let (best, confidence) = best?;

        let domain_signals = a.signals.compare(&b.signals);
        let conflict = domain_signals.iter().any(|s| !s.agrees);
        let agreement = domain_signals.iter().any(|s| s.agrees);

        let metrics = ComparisonMetrics {
            scores,
            domain_signals,
            size_ratio: algorithms::size_ratio(&a.file, &b.file),
            filename_similarity: algorithms::filename_similarity(
                &a.file.sanitized_filename,
                &b.file.sanitized_filename,
            ),
        };

        if best.algorithm == DetectionAlgorithm::ContentHash {
            return Some(PairMatch {
                algorithm: best.algorithm,
                similarity: best.score,
                confidence: Confidence::High,
                recommended_action: RecommendedAction::DeleteDuplicate,
                auto_resolvable: true,
                metrics,
            });
        }

        let confidence = if conflict {
            confidence.downgrade()
        } else if agreement {
            confidence.upgrade()
        } else {
            confidence
        };

        let recommended_action = if conflict || confidence == Confidence::Low {
            RecommendedAction::ManualReview
        } else if a.file.size_bytes != b.file.size_bytes {
            RecommendedAction::KeepLargest
        } else {
            RecommendedAction::KeepNewest
        };

        Some(PairMatch {
            algorithm: best.algorithm,
            similarity: best.score,
            confidence,
            recommended_action,
            auto_resolvable: !self.config.auto_resolve_hash_only
                && !conflict
                && confidence == Confidence::High,
            metrics,
        })
    }

    fn algorithms(&self, options: &DetectionOptions) -> Result<Vec<DetectionAlgorithm>> {
        match &options.algorithms {
            Some(requested) => {
                let mut algorithms: Vec<DetectionAlgorithm> = Vec::new();
                for algorithm in requested {
                    if !algorithms.contains(algorithm) {
                        algorithms.push(*algorithm);
                    }
                }
                if algorithms.is_empty() {
                    return Err(Error::validation("At least one detection algorithm is required"));
                }
                algorithms.sort_by_key(|a| a.priority());
                Ok(algorithms)
            }
            None => self.config.parsed_algorithms(),
        }
    }

    async fn run_session(
        &self,
        session: &mut DetectionSession,
        algorithms: &[DetectionAlgorithm],
    ) -> Result<()> {
        let tenant_id = session.tenant_id;
        let (files, focus) = self.select_files(tenant_id, session.scope)?;
        session.files_considered = files.len() as u32;

        let mut candidates: BTreeMap<Uuid, Candidate> = BTreeMap::new();
        for file in files {
            let id = file.id;
            let candidate = self.analyze(file, algorithms, &mut session.errors).await;
            candidates.insert(id, candidate);
        }

        let mut recorded = self.db.recorded_pairs(tenant_id)?;
        let ids: Vec<Uuid> = candidates.keys().copied().collect();

        for (i, &a) in ids.iter().enumerate() {
            for &b in &ids[i + 1..] {
                // Batch scope: at least one side must be from the batch
                if let Some(focus) = &focus {
                    if !focus.contains(&a) && !focus.contains(&b) {
                        continue;
                    }
                }
                if recorded.contains(&(a, b)) {
                    continue;
                }
                session.pairs_compared += 1;

                let (Some(ca), Some(cb)) = (candidates.get(&a), candidates.get(&b)) else {
                    continue;
                };
                let Some(found) = self.compare(algorithms, ca, cb) else {
                    continue;
                };

                let record = DuplicateRecord {
                    id: Uuid::new_v4(),
                    tenant_id,
                    session_id: session.id,
                    file_a: a,
                    file_b: b,
                    algorithm: found.algorithm,
                    similarity: found.similarity,
                    confidence: found.confidence,
                    recommended_action: found.recommended_action,
                    auto_resolvable: found.auto_resolvable,
                    metrics: found.metrics,
                    status: DuplicateStatus::Pending,
                    group_id: None,
                    resolution: None,
                    resolved_by: None,
                    resolved_at: None,
                    created_at: Utc::now(),
                };
                match self.db.insert_duplicate_record(&record) {
                    Ok(true) => {
                        session.matches_found += 1;
                        recorded.insert((a, b));
                    }
                    // Recorded by a concurrent session
                    Ok(false) => {}
                    Err(e) => {
                        session.errors += 1;
                        tracing::warn!("Failed to record pair {}/{}: {}", a, b, e);
                    }
                }
            }
        }

        session.groups_created = self.build_groups(session, &candidates)? as u32;
        Ok(())
    }

    /// Files to compare plus, for batch scope, the ids of the batch's files
    fn select_files(
        &self,
        tenant_id: Uuid,
        scope: DetectionScope,
    ) -> Result<(Vec<BatchFile>, Option<HashSet<Uuid>>)> {
        let limit = self.config.max_files_per_session.max(2);
        let corpus = self.db.list_processed_files(tenant_id, limit)?;

        match scope {
            DetectionScope::Tenant => Ok((corpus, None)),
            DetectionScope::Batch(batch_id) => {
                let batch_files: Vec<BatchFile> = self
                    .db
                    .list_batch_files(batch_id)?
                    .into_iter()
                    .filter(|f| {
                        matches!(
                            f.processing_status,
                            ProcessingStatus::Completed | ProcessingStatus::Skipped
                        ) && f.content_hash.is_some()
                    })
                    .collect();
                let focus: HashSet<Uuid> = batch_files.iter().map(|f| f.id).collect();

                let mut files = batch_files;
                files.extend(corpus.into_iter().filter(|f| !focus.contains(&f.id)));
                files.truncate(limit.max(focus.len()));
                Ok((files, Some(focus)))
            }
        }
    }

    /// Gather text and perceptual hash; analyzer failures only disable
    /// the affected algorithm for this file
    async fn analyze(
        &self,
        file: BatchFile,
        algorithms: &[DetectionAlgorithm],
        errors: &mut u32,
    ) -> Candidate {
        let wants_text = algorithms.contains(&DetectionAlgorithm::Text);
        let wants_image =
            algorithms.contains(&DetectionAlgorithm::Perceptual) && file.family() == FileFamily::Image;

        let path = file
            .storage_path
            .as_deref()
            .and_then(|uri| self.store.local_path(uri));
        let family = file.family();
        let file_id = file.id;
        let mut candidate = Candidate::new(file);

        let Some(path) = path else {
            return candidate;
        };

        if wants_text {
            match self.analyzer.extract_text(&path, family).await {
                Ok(Some(text)) => candidate = candidate.with_text(&text, self.config.text_max_chars),
                Ok(None) => {}
                Err(e) => {
                    *errors += 1;
                    tracing::warn!("Text extraction failed for file {}: {}", file_id, e);
                }
            }
        }
        if wants_image {
            match self.analyzer.perceptual_hash(&path, family).await {
                Ok(hash) => candidate.perceptual_hash = hash,
                Err(e) => {
                    *errors += 1;
                    tracing::warn!("Perceptual hash failed for file {}: {}", file_id, e);
                }
            }
        }
        candidate
    }

    fn build_groups(
        &self,
        session: &DetectionSession,
        candidates: &BTreeMap<Uuid, Candidate>,
    ) -> Result<usize> {
        let records = self.db.list_session_records(session.id)?;
        let pairs: Vec<(Uuid, Uuid)> = records.iter().map(|r| (r.file_a, r.file_b)).collect();

        let mut created = 0;
        for component in cluster_pairs(&pairs) {
            let members: Vec<&Candidate> = component.iter().filter_map(|id| candidates.get(id)).collect();
            if members.len() < 2 {
                continue;
            }
            let in_group: HashSet<Uuid> = component.iter().copied().collect();
            let group_records: Vec<&DuplicateRecord> = records
                .iter()
                .filter(|r| in_group.contains(&r.file_a))
                .collect();

            let inputs: Vec<QualityInput> = members
                .iter()
                .map(|c| QualityInput {
                    file_id: c.file.id,
                    size_bytes: c.file.size_bytes,
                    filename: c.file.sanitized_filename.clone(),
                    created_at: c.file.created_at,
                })
                .collect();
            let Some(choice) = choose_master(&inputs) else {
                continue;
            };

            let all_hash = group_records
                .iter()
                .all(|r| r.algorithm == DetectionAlgorithm::ContentHash);
            let ambiguous = group_records.iter().any(|r| {
                r.confidence == Confidence::Low
                    || r.recommended_action == RecommendedAction::ManualReview
            }) || (!all_hash && choice.margin < self.config.ambiguity_epsilon);

            let largest = members.iter().map(|c| c.file.size_bytes).max().unwrap_or(0);
            let master_size = members
                .iter()
                .find(|c| c.file.id == choice.master)
                .map(|c| c.file.size_bytes)
                .unwrap_or(0);

            let strategy = if ambiguous {
                ResolutionStrategy::ManualReview
            } else if master_size >= largest {
                ResolutionStrategy::KeepLargest
            } else {
                ResolutionStrategy::KeepNewest
            };

            let members_out: Vec<GroupMember> = members
                .iter()
                .zip(&choice.scores)
                .map(|(c, &score)| GroupMember {
                    file_id: c.file.id,
                    is_master: c.file.id == choice.master,
                    quality_score: score,
                    size_bytes: c.file.size_bytes,
                })
                .collect();
            let master_score = members_out
                .iter()
                .find(|m| m.is_master)
                .map(|m| m.quality_score)
                .unwrap_or(0.0);
            let confidence_score = if group_records.is_empty() {
                0.0
            } else {
                group_records.iter().map(|r| r.similarity).sum::<f64>() / group_records.len() as f64
            };

            let group = DuplicateGroup {
                id: Uuid::new_v4(),
                tenant_id: session.tenant_id,
                session_id: session.id,
                master_file_id: choice.master,
                total_size: members.iter().map(|c| c.file.size_bytes).sum(),
                members: members_out,
                strategy,
                auto_resolvable: !ambiguous && group_records.iter().all(|r| r.auto_resolvable),
                quality_score: master_score,
                confidence_score,
                resolved: false,
                created_at: Utc::now(),
            };
            self.db.insert_duplicate_group(&group)?;
            let record_ids: Vec<Uuid> = group_records.iter().map(|r| r.id).collect();
            self.db.set_record_group(&record_ids, group.id)?;
            created += 1;

            self.events.info(
                Some(session.tenant_id),
                "dedup.group_created",
                &format!(
                    "Duplicate group of {} files, strategy {}",
                    group.members.len(),
                    group.strategy
                ),
                json!({
                    "group_id": group.id,
                    "session_id": session.id,
                    "master_file_id": group.master_file_id,
                    "auto_resolvable": group.auto_resolvable,
                }),
            );
        }
        Ok(created)
    }

    /// Flag the losing side of a resolved record
    fn apply_resolution(
        &self,
        record: &DuplicateRecord,
        action: ResolutionAction,
        master: Option<Uuid>,
    ) -> Result<()> {
        let now = Utc::now();
        let marks: Vec<(Uuid, Uuid)> = match action {
            ResolutionAction::KeepBoth => vec![],
            ResolutionAction::KeepFirst => vec![(record.file_b, record.file_a)],
            ResolutionAction::KeepSecond => vec![(record.file_a, record.file_b)],
            ResolutionAction::MarkDuplicate => {
                let Some(master) = master else {
                    return Ok(());
                };
                [record.file_a, record.file_b]
                    .into_iter()
                    .filter(|&f| f != master)
                    .map(|f| (f, master))
                    .collect()
            }
        };

        let mut seen = HashMap::new();
        for (loser, kept) in marks {
            if seen.insert(loser, kept).is_none() {
                self.db.mark_file_duplicate(loser, kept, now)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{object_key, sha256_hex, LocalObjectStore, PlainTextAnalyzer};
    use crate::testing;
    use chrono::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        db: IngestDb,
        store: Arc<dyn ObjectStore>,
        detector: DuplicateDetector,
        tenant: Uuid,
        batch_id: Uuid,
    }

    fn fixture_with(config: DedupConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = testing::db();
        let store: Arc<dyn ObjectStore> =
            Arc::new(LocalObjectStore::new(dir.path().join("objects")).unwrap());
        let detector = DuplicateDetector::new(
            db.clone(),
            config,
            store.clone(),
            Arc::new(PlainTextAnalyzer::default()),
            testing::events(),
        );
        let tenant = Uuid::new_v4();
        let mut batch = testing::batch(tenant);
        db.insert_batch(&mut batch).unwrap();
        Fixture {
            _dir: dir,
            db,
            store,
            detector,
            tenant,
            batch_id: batch.id,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(DedupConfig::default())
    }

    /// Store a processed file with the given content
    async fn processed(f: &Fixture, name: &str, content: &[u8], age_days: i64) -> BatchFile {
        let mut file = testing::file(f.batch_id, name, content.len() as u64);
        file.tenant_id = f.tenant;
        let stored = f
            .store
            .put(&object_key(&f.tenant, &file.id, &file.extension), content)
            .await
            .unwrap();
        file.content_hash = Some(sha256_hex(content));
        file.storage_path = Some(stored.uri);
        file.processing_status = ProcessingStatus::Completed;
        file.created_at = Utc::now() - Duration::days(age_days);
        file.processed_at = Some(file.created_at);
        f.db.insert_batch_files(std::slice::from_ref(&file)).unwrap();
        file
    }

    #[tokio::test]
    async fn test_identical_hashes_give_one_auto_resolvable_record() {
        let f = fixture();
        let a = processed(&f, "protokoll.pdf", b"%PDF same bytes", 0).await;
        let b = processed(&f, "protokoll (1).pdf", b"%PDF same bytes", 0).await;

        let session = f
            .detector
            .detect(f.tenant, DetectionScope::Batch(f.batch_id), DetectionOptions::default())
            .await
            .unwrap();
        assert_eq!(session.status, DetectionStatus::Completed);
        assert_eq!(session.matches_found, 1);
        assert_eq!(session.groups_created, 1);

        let records = f.detector.list_records(f.tenant, session.id).unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.similarity, 1.0);
        assert_eq!(record.confidence, Confidence::High);
        assert!(record.auto_resolvable);
        assert_eq!(record.algorithm, DetectionAlgorithm::ContentHash);
        assert_eq!((record.file_a, record.file_b), (a.id.min(b.id), a.id.max(b.id)));

        let groups = f.detector.list_groups(f.tenant, Some(session.id), false).unwrap();
        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.members.iter().filter(|m| m.is_master).count(), 1);
        assert!(group.members.iter().any(|m| m.file_id == group.master_file_id));
        assert!(group.auto_resolvable);

        // A second session does not record the pair again
        let again = f
            .detector
            .detect(f.tenant, DetectionScope::Tenant, DetectionOptions::default())
            .await
            .unwrap();
        assert_eq!(again.matches_found, 0);
    }

    #[tokio::test]
    async fn test_skipped_duplicate_is_still_detected() {
        let f = fixture();
        let original = processed(&f, "stadgar.pdf", b"%PDF stadgar 2021", 1).await;
        let mut skipped = processed(&f, "stadgar kopia.pdf", b"%PDF stadgar 2021", 0).await;
        skipped.processing_status = ProcessingStatus::Skipped;
        skipped.is_duplicate = true;
        skipped.duplicate_of = Some(original.id);
        f.db.update_batch_file(&skipped).unwrap();

        let session = f
            .detector
            .detect(f.tenant, DetectionScope::Batch(f.batch_id), DetectionOptions::default())
            .await
            .unwrap();
        assert_eq!(session.matches_found, 1);

        let record = f.detector.list_records(f.tenant, session.id).unwrap().remove(0);
        assert_eq!(record.algorithm, DetectionAlgorithm::ContentHash);
        let pair = [record.file_a, record.file_b];
        assert!(pair.contains(&original.id) && pair.contains(&skipped.id));
    }

    #[tokio::test]
    async fn test_text_similarity_and_domain_conflict() {
        let f = fixture();
        let base = "Protokoll fört vid ordinarie föreningsstämma i Brf Solgläntan. \
                    Närvarande medlemmar enligt röstlängd. Stämman beslutade att \
                    fastställa resultat- och balansräkningen samt bevilja ansvarsfrihet.";
        processed(&f, "stämma lgh 1102.txt", base.as_bytes(), 2).await;
        processed(&f, "stämma lgh 1102 kopia.txt", format!("{} ", base).as_bytes(), 1).await;
        processed(&f, "stämma lgh 2201.txt", format!("{}.", base).as_bytes(), 0).await;

        let options = DetectionOptions {
            algorithms: Some(vec![DetectionAlgorithm::Text]),
            auto_resolve: false,
        };
        let session = f
            .detector
            .detect(f.tenant, DetectionScope::Tenant, options)
            .await
            .unwrap();
        assert_eq!(session.matches_found, 3);

        let records = f.detector.list_records(f.tenant, session.id).unwrap();
        assert!(records.iter().all(|r| r.algorithm == DetectionAlgorithm::Text));
        // Pairs with different apartment numbers go to manual review
        let conflicts = records
            .iter()
            .filter(|r| r.recommended_action == RecommendedAction::ManualReview)
            .count();
        assert_eq!(conflicts, 2);

        let groups = f.detector.list_groups(f.tenant, Some(session.id), false).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].strategy, ResolutionStrategy::ManualReview);
        assert!(!groups[0].auto_resolvable);
    }

    #[tokio::test]
    async fn test_resolution_is_one_way() {
        let f = fixture();
        processed(&f, "faktura.pdf", b"invoice", 1).await;
        processed(&f, "faktura kopia.pdf", b"invoice", 0).await;

        let session = f
            .detector
            .detect(f.tenant, DetectionScope::Tenant, DetectionOptions::default())
            .await
            .unwrap();
        let record = f.detector.list_records(f.tenant, session.id).unwrap().remove(0);

        let resolved = f
            .detector
            .resolve(f.tenant, record.id, ResolutionAction::KeepFirst, "styrelsen")
            .unwrap();
        assert_eq!(resolved.status, DuplicateStatus::Resolved);
        assert_eq!(resolved.resolved_by.as_deref(), Some("styrelsen"));

        let loser = f.db.get_batch_file(record.file_b).unwrap().unwrap();
        assert!(loser.is_duplicate);
        assert_eq!(loser.duplicate_of, Some(record.file_a));

        assert!(matches!(
            f.detector
                .resolve(f.tenant, record.id, ResolutionAction::KeepBoth, "styrelsen"),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            f.detector
                .resolve(Uuid::new_v4(), record.id, ResolutionAction::KeepBoth, "x"),
            Err(Error::NotFound { .. })
        ));

        // The group closed with its only record
        let group = f.detector.get_group(f.tenant, record.group_id.unwrap()).unwrap();
        assert!(group.resolved);
    }

    #[tokio::test]
    async fn test_auto_resolve_marks_non_masters() {
        let f = fixture();
        processed(&f, "scan.pdf", b"same", 3).await;
        processed(&f, "scan1.pdf", b"same", 2).await;
        processed(&f, "Årsredovisning 2023.pdf", b"same", 1).await;

        let options = DetectionOptions {
            algorithms: None,
            auto_resolve: true,
        };
        let session = f
            .detector
            .detect(f.tenant, DetectionScope::Tenant, options)
            .await
            .unwrap();
        assert_eq!(session.matches_found, 3);

        let groups = f.detector.list_groups(f.tenant, Some(session.id), true).unwrap();
        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert!(group.resolved);

        for member in &group.members {
            let file = f.db.get_batch_file(member.file_id).unwrap().unwrap();
            if member.is_master {
                assert!(!file.is_duplicate);
                assert_eq!(file.sanitized_filename, "Årsredovisning 2023.pdf");
            } else {
                assert_eq!(file.duplicate_of, Some(group.master_file_id));
            }
        }
        for record in f.detector.list_records(f.tenant, session.id).unwrap() {
            assert_eq!(record.resolved_by.as_deref(), Some(SYSTEM_ACTOR));
        }
    }

    #[tokio::test]
    async fn test_batch_scope_of_other_tenant_is_not_found() {
        let f = fixture();
        let err = f
            .detector
            .detect(Uuid::new_v4(), DetectionScope::Batch(f.batch_id), DetectionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
