//! The main database handle.
//!
//! [`PulseDb`] owns the storage engine, the embedding service, one pair of
//! vector indexes per collective (experiences and insights) and the watch
//! registry. It is `Send + Sync`; share it across threads with `Arc`.
//!
//! # Write path
//!
//! Every mutation follows the same discipline: take the process-local
//! writer lock, run one KV transaction (rows, secondary indexes,
//! changelog, CSN), then mutate the in-memory vector index, then fan out
//! watch events. Lock order is file lock → KV writer → index writer →
//! watch registry, never reversed. A crash between the commit and the
//! index mutation is healed on the next open by replaying the changelog
//! from the index's `built_at_csn`.
//!
//! # Read path
//!
//! Reads take an MVCC snapshot and never block writers. The composite
//! [`get_context_candidates`](PulseDb::get_context_candidates) runs all of
//! its sub-queries against a single snapshot.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::activity::{validate_new_activity, Activity, NewActivity};
use crate::collective::{validate_collective_name, Collective, CollectiveStats};
use crate::config::{Config, Metric};
use crate::context::{ContextCandidates, ContextRequest};
use crate::embedding::{create_embedding_service, EmbeddingService};
use crate::error::{NotFoundError, PulseError, Result, StorageError, ValidationError};
use crate::experience::{
    check_finite_vector, validate_experience_update, validate_new_experience, Experience,
    ExperienceUpdate, NewExperience,
};
use crate::filter::SearchFilter;
use crate::insight::{validate_new_insight, DerivedInsight, NewInsight};
use crate::lock::FileLock;
use crate::relation::{
    validate_new_relation, ExperienceRelation, NewRelation, RelationDirection,
};
use crate::storage::{
    open_storage, ChangeEntity, ChangeKind, DatabaseMetadata, ScanDeadline, StorageEngine,
    StorageSnapshot,
};
use crate::types::{
    AgentId, CollectiveId, Csn, Embedding, ExperienceId, InsightId, RelationId, Timestamp,
};
use crate::vector::HnswIndex;
use crate::watch::{WatchEvent, WatchEventKind, WatchFilter, WatchRegistry, WatchSubscription};

/// Hard upper bound on `k` for similarity queries.
const MAX_SEARCH_K: usize = 1000;

/// Upper bound on events returned by one `poll_changes` call.
const MAX_POLL_EVENTS: usize = 10_000;

/// The experience and insight indexes of one collective.
#[derive(Clone)]
struct CollectiveIndexes {
    experiences: Arc<HnswIndex>,
    insights: Arc<HnswIndex>,
}

/// Concurrent-read gate enforcing `limits.max_read_txns`.
struct ReadGate {
    active: AtomicUsize,
    max: usize,
}

struct ReadPermit<'a>(&'a ReadGate);

impl ReadGate {
    fn acquire(&self) -> Result<ReadPermit<'_>> {
        let prev = self.active.fetch_add(1, Ordering::SeqCst);
        if prev >= self.max {
            self.active.fetch_sub(1, Ordering::SeqCst);
            return Err(PulseError::ResourceLimit {
                resource: "max_read_txns",
                limit: self.max as u64,
            });
        }
        Ok(ReadPermit(self))
    }
}

impl Drop for ReadPermit<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The PulseDB database handle.
pub struct PulseDb {
    storage: Box<dyn StorageEngine>,
    embedding: Box<dyn EmbeddingService>,
    config: Config,

    /// Per-collective vector indexes. The outer lock guards the map; each
    /// index has its own reader-writer lock inside.
    indexes: RwLock<HashMap<CollectiveId, CollectiveIndexes>>,

    watch: WatchRegistry,

    /// Process-local writer serialization.
    writer: Mutex<()>,

    reads: ReadGate,

    /// Commits since the vector indexes were last persisted.
    commits_since_persist: AtomicU64,

    /// Set when corruption was detected; the handle then refuses writes
    /// until reopened.
    poisoned: AtomicBool,

    /// Held for the lifetime of the handle.
    _file_lock: FileLock,
}

impl std::fmt::Debug for PulseDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PulseDb")
            .field("csn", &self.storage.csn())
            .field("collectives", &self.indexes.read().len())
            .field("poisoned", &self.poisoned.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl PulseDb {
    /// Opens or creates a database at `path` (e.g. `./pulse.db`).
    ///
    /// Acquires the advisory `<path>.lock` file lock, opens the KV store
    /// (running schema migrations if needed), and loads or rebuilds the
    /// vector indexes of every collective.
    ///
    /// # Errors
    ///
    /// - [`PulseError::Config`] / validation errors for a bad `config`
    /// - [`PulseError::LockTimeout`] when another process holds the lock
    /// - [`StorageError::SchemaVersionMismatch`] for a newer database file
    /// - dimension mismatch unless `config.infer_per_collective` is set
    pub fn open(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        info!(path = %path.display(), "opening PulseDB");

        let mut lock_path = path.as_os_str().to_owned();
        lock_path.push(".lock");
        let file_lock = FileLock::acquire(
            Path::new(&lock_path),
            config.limits.file_lock_timeout_ms,
        )?;

        let storage = open_storage(path, &config)?;
        let embedding = create_embedding_service(&config)?;

        let hnsw_dir = Self::hnsw_dir_for(path);
        let mut indexes = HashMap::new();
        for collective in storage.list_collectives()? {
            let pair = Self::load_or_rebuild_indexes(&*storage, &config, &hnsw_dir, &collective)?;
            indexes.insert(collective.id, pair);
        }

        info!(
            collectives = indexes.len(),
            csn = storage.csn().0,
            "PulseDB opened"
        );

        Ok(Self {
            storage,
            embedding,
            watch: WatchRegistry::new(config.watch.buffer_size, config.watch.in_process),
            reads: ReadGate {
                active: AtomicUsize::new(0),
                max: config.limits.max_read_txns,
            },
            config,
            indexes: RwLock::new(indexes),
            writer: Mutex::new(()),
            commits_since_persist: AtomicU64::new(0),
            poisoned: AtomicBool::new(false),
            _file_lock: file_lock,
        })
    }

    /// Closes the database, persisting the vector indexes and flushing
    /// storage. Consumes the handle.
    pub fn close(self) -> Result<()> {
        info!("closing PulseDB");
        self.persist_indexes();
        self.storage.close()?;
        Ok(())
    }

    /// The configuration this handle was opened with.
    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Database metadata (schema version, default dimension, timestamps).
    #[inline]
    pub fn metadata(&self) -> DatabaseMetadata {
        self.storage.metadata()
    }

    /// The current change sequence number.
    #[inline]
    pub fn csn(&self) -> Csn {
        self.storage.csn()
    }

    /// Approximate stored payload bytes (content plus embeddings).
    pub fn total_bytes(&self) -> Result<u64> {
        self.storage.total_bytes()
    }

    // =======================================================================
    // Collectives
    // =======================================================================

    /// Creates a collective, freezing the database's default embedding
    /// dimension into it.
    pub fn create_collective(&self, name: &str) -> Result<CollectiveId> {
        self.create_collective_inner(name, None)
    }

    /// Creates a collective with an owner for multi-tenant filtering.
    pub fn create_collective_with_owner(
        &self,
        name: &str,
        owner_id: &str,
    ) -> Result<CollectiveId> {
        if owner_id.is_empty() {
            return Err(ValidationError::required_field("owner_id").into());
        }
        self.create_collective_inner(name, Some(owner_id))
    }

    fn create_collective_inner(&self, name: &str, owner: Option<&str>) -> Result<CollectiveId> {
        self.check_writable()?;
        validate_collective_name(name)?;

        let dimension = self.config.dimension() as u16;
        let collective = match owner {
            Some(owner) => Collective::with_owner(name, owner, dimension),
            None => Collective::new(name, dimension),
        };
        let id = collective.id;

        let _guard = self.write_guard()?;
        self.guard_err(self.storage.insert_collective(&collective))?;

        self.indexes.write().insert(
            id,
            CollectiveIndexes {
                experiences: Arc::new(HnswIndex::new(dimension as usize, &self.config.hnsw)),
                insights: Arc::new(HnswIndex::new(dimension as usize, &self.config.hnsw)),
            },
        );

        info!(collective = %id, name, "collective created");
        Ok(id)
    }

    /// Reads a collective, or `None` when absent.
    pub fn get_collective(&self, id: CollectiveId) -> Result<Option<Collective>> {
        let _permit = self.reads.acquire()?;
        self.storage.get_collective(id)
    }

    /// Lists every collective.
    pub fn list_collectives(&self) -> Result<Vec<Collective>> {
        let _permit = self.reads.acquire()?;
        self.storage.list_collectives()
    }

    /// Lists collectives whose owner matches.
    pub fn list_collectives_by_owner(&self, owner_id: &str) -> Result<Vec<Collective>> {
        Ok(self
            .list_collectives()?
            .into_iter()
            .filter(|c| c.owner_id.as_deref() == Some(owner_id))
            .collect())
    }

    /// Aggregate statistics for a collective.
    pub fn get_collective_stats(&self, id: CollectiveId) -> Result<CollectiveStats> {
        let _permit = self.reads.acquire()?;
        let collective = self
            .storage
            .get_collective(id)?
            .ok_or_else(|| NotFoundError::collective(id))?;

        let now = Timestamp::now();
        let threshold = self.config.limits.stale_agent_threshold_ms;
        let active = self
            .storage
            .activities(id)?
            .iter()
            .filter(|a| a.is_live(now, threshold))
            .count() as u64;

        Ok(CollectiveStats {
            experience_count: collective.experience_count,
            insight_count: self.storage.count_insights(id)?,
            active_agent_count: active,
        })
    }

    /// Deletes a collective and everything it owns: experiences,
    /// embeddings, relations, insights, activities and the index files.
    pub fn delete_collective(&self, id: CollectiveId) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_guard()?;

        let removed = self
            .guard_err(self.storage.delete_collective(id))?
            .ok_or_else(|| NotFoundError::collective(id))?;

        self.indexes.write().remove(&id);
        if let Some(dir) = self.hnsw_dir() {
            HnswIndex::remove_files(&Self::experience_index_path(&dir, id))?;
            HnswIndex::remove_files(&Self::insight_index_path(&dir, id))?;
        }

        info!(collective = %id, experiences = removed, "collective deleted");
        Ok(())
    }

    // =======================================================================
    // Experiences
    // =======================================================================

    /// Records a new experience and returns its id.
    ///
    /// Validates the input, resolves the embedding (generated from the
    /// content when the provider supports it, otherwise required from the
    /// caller), writes all rows atomically, inserts into the collective's
    /// vector index and publishes a `Created` watch event.
    pub fn record_experience(&self, new: NewExperience) -> Result<ExperienceId> {
        self.check_writable()?;
        let _guard = self.write_guard()?;

        let collective = self
            .storage
            .get_collective(new.collective_id)?
            .ok_or_else(|| NotFoundError::collective(new.collective_id))?;

        let embedding_required = self.config.embedding_provider.is_external();
        validate_new_experience(&new, collective.dimension(), embedding_required)?;

        let limit = self.config.limits.max_experiences_per_collective;
        if limit > 0 && collective.experience_count >= limit {
            return Err(PulseError::ResourceLimit {
                resource: "max_experiences_per_collective",
                limit,
            });
        }

        let embedding: Embedding = match new.embedding {
            Some(embedding) => embedding,
            None => {
                let generated = self.embedding.embed(&new.content)?;
                if generated.len() != collective.dimension() {
                    return Err(ValidationError::dimension_mismatch(
                        collective.dimension(),
                        generated.len(),
                    )
                    .into());
                }
                check_finite_vector("embedding", &generated)?;
                generated
            }
        };

        let byte_limit = self.config.limits.max_total_bytes;
        if byte_limit > 0 {
            let incoming = (new.content.len() + embedding.len() * 4) as u64;
            if self.storage.total_bytes()?.saturating_add(incoming) > byte_limit {
                return Err(PulseError::ResourceLimit {
                    resource: "max_total_bytes",
                    limit: byte_limit,
                });
            }
        }

        let now = Timestamp::now();
        let experience = Experience {
            id: ExperienceId::new(),
            collective_id: new.collective_id,
            content: new.content,
            embedding,
            experience_type: new.experience_type,
            importance: new.importance,
            confidence: new.confidence,
            application_count: 0,
            domain_tags: new.domain_tags,
            source_files: new.source_files,
            source_agent: new.source_agent,
            source_task: new.source_task,
            created_at: now,
            updated_at: now,
            archived: false,
        };
        let id = experience.id;

        let csn = self.guard_err(self.storage.insert_experience(&experience))?;

        let indexes = self.indexes_for(new.collective_id)?;
        indexes
            .experiences
            .insert(*id.as_bytes(), &experience.embedding)?;

        self.publish(WatchEventKind::Created, &experience, csn);
        self.after_commit();

        debug!(experience = %id, csn = csn.0, "experience recorded");
        Ok(id)
    }

    /// Reads an experience by id, embedding included. `None` when absent.
    pub fn get_experience(&self, id: ExperienceId) -> Result<Option<Experience>> {
        let _permit = self.reads.acquire()?;
        self.storage.get_experience(id)
    }

    /// Patches the mutable fields of an experience (importance,
    /// confidence, tags, source files, archived flag). Content and
    /// embedding are immutable.
    pub fn update_experience(&self, id: ExperienceId, update: ExperienceUpdate) -> Result<()> {
        self.check_writable()?;
        validate_experience_update(&update)?;

        let _guard = self.write_guard()?;
        let outcome = self
            .guard_err(self.storage.update_experience(id, &update))?
            .ok_or_else(|| NotFoundError::experience(id))?;

        let indexes = self.indexes_for(outcome.experience.collective_id)?;
        let kind = match (outcome.was_archived, outcome.experience.archived) {
            (false, true) => {
                indexes.experiences.remove(id.as_bytes());
                WatchEventKind::Archived
            }
            (true, false) => {
                indexes
                    .experiences
                    .insert(*id.as_bytes(), &outcome.experience.embedding)?;
                WatchEventKind::Updated
            }
            _ => WatchEventKind::Updated,
        };

        self.publish(kind, &outcome.experience, outcome.csn);
        self.after_commit();
        Ok(())
    }

    /// Archives an experience: it stays in storage but leaves the vector
    /// index and default query results. Idempotent.
    pub fn archive_experience(&self, id: ExperienceId) -> Result<()> {
        self.update_experience(
            id,
            ExperienceUpdate {
                archived: Some(true),
                ..Default::default()
            },
        )
    }

    /// Restores an archived experience into the vector index. Idempotent.
    pub fn unarchive_experience(&self, id: ExperienceId) -> Result<()> {
        self.update_experience(
            id,
            ExperienceUpdate {
                archived: Some(false),
                ..Default::default()
            },
        )
    }

    /// Permanently deletes an experience, cascading to its relations and
    /// tombstoning its vector.
    pub fn delete_experience(&self, id: ExperienceId) -> Result<()> {
        self.check_writable()?;

        let _guard = self.write_guard()?;
        let outcome = self
            .guard_err(self.storage.delete_experience(id))?
            .ok_or_else(|| NotFoundError::experience(id))?;

        if let Ok(indexes) = self.indexes_for(outcome.experience.collective_id) {
            indexes.experiences.remove(id.as_bytes());
        }

        self.publish(WatchEventKind::Deleted, &outcome.experience, outcome.csn);
        self.after_commit();

        debug!(
            experience = %id,
            relations = outcome.relations_removed,
            "experience deleted"
        );
        Ok(())
    }

    /// Atomically increments an experience's application counter and
    /// returns the new count.
    pub fn reinforce_experience(&self, id: ExperienceId) -> Result<u32> {
        self.check_writable()?;

        let _guard = self.write_guard()?;
        let (count, csn) = self
            .guard_err(self.storage.reinforce_experience(id))?
            .ok_or_else(|| NotFoundError::experience(id))?;

        if let Some(experience) = self.storage.get_experience(id)? {
            self.publish(WatchEventKind::Updated, &experience, csn);
        }
        self.after_commit();
        Ok(count)
    }

    // =======================================================================
    // Search
    // =======================================================================

    /// k-NN over a collective's experiences.
    ///
    /// Returns `(experience, similarity)` pairs, similarity
    /// non-increasing. For cosine, similarity is `1 - distance`; for L2
    /// it is the negated squared distance. Ties break on `created_at`
    /// descending, then id ascending.
    pub fn search_similar(
        &self,
        collective_id: CollectiveId,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<(Experience, f32)>> {
        self.search_similar_filtered(collective_id, query, k, &SearchFilter::default())
    }

    /// [`search_similar`](Self::search_similar) with an explicit filter,
    /// applied during graph traversal.
    pub fn search_similar_filtered(
        &self,
        collective_id: CollectiveId,
        query: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<(Experience, f32)>> {
        let _permit = self.reads.acquire()?;
        let snapshot = self.storage.snapshot()?;
        self.search_similar_on(&*snapshot, collective_id, query, k, filter)
    }

    fn search_similar_on(
        &self,
        snapshot: &dyn StorageSnapshot,
        collective_id: CollectiveId,
        query: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<(Experience, f32)>> {
        let collective = snapshot
            .get_collective(collective_id)?
            .ok_or_else(|| NotFoundError::collective(collective_id))?;
        Self::validate_k(k)?;
        Self::validate_query(query, collective.dimension())?;

        let indexes = self.indexes_for(collective_id)?;
        let fetch = k.max(self.config.hnsw.ef_search);

        let accept = |id: &[u8; 16]| -> bool {
            let exp_id = ExperienceId::from_bytes(*id);
            match snapshot.experience_row(exp_id) {
                Ok(Some(row)) => filter.matches(&row),
                _ => false,
            }
        };

        let hits = indexes.experiences.search(query, fetch, fetch, Some(&accept))?;

        let mut scored: Vec<(Experience, f32)> = Vec::with_capacity(hits.len().min(k));
        let mut with_distance: Vec<(Experience, f32)> = Vec::with_capacity(hits.len());
        for (id_bytes, distance) in hits {
            let exp_id = ExperienceId::from_bytes(id_bytes);
            if let Some(experience) = snapshot.get_experience(exp_id)? {
                with_distance.push((experience, distance));
            }
        }

        // Distance ascending; ties newest-first, then id ascending.
        with_distance.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.0.created_at.cmp(&a.0.created_at))
                .then_with(|| a.0.id.cmp(&b.0.id))
        });
        with_distance.truncate(k);

        let metric = self.config.hnsw.metric;
        for (experience, distance) in with_distance {
            let similarity = match metric {
                Metric::Cosine => 1.0 - distance,
                Metric::L2 => -distance,
            };
            scored.push((experience, similarity));
        }
        Ok(scored)
    }

    /// The newest experiences of a collective, optionally filtered.
    pub fn get_recent_experiences(
        &self,
        collective_id: CollectiveId,
        limit: usize,
    ) -> Result<Vec<Experience>> {
        self.get_recent_experiences_filtered(collective_id, limit, &SearchFilter::default())
    }

    /// [`get_recent_experiences`](Self::get_recent_experiences) with an
    /// explicit filter, applied per row during the reverse index scan.
    pub fn get_recent_experiences_filtered(
        &self,
        collective_id: CollectiveId,
        limit: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<Experience>> {
        let _permit = self.reads.acquire()?;
        let snapshot = self.storage.snapshot()?;
        snapshot
            .get_collective(collective_id)?
            .ok_or_else(|| NotFoundError::collective(collective_id))?;
        snapshot.recent_experiences(
            collective_id,
            limit,
            filter,
            ScanDeadline::start(self.config.limits.query_timeout_ms),
        )
    }

    /// The composite context query: similar + recent + insights + active
    /// agents + relations, all from one read snapshot.
    pub fn get_context_candidates(&self, request: ContextRequest) -> Result<ContextCandidates> {
        let _permit = self.reads.acquire()?;
        let snapshot = self.storage.snapshot()?;
        let snapshot_csn = snapshot.csn();

        let collective = snapshot
            .get_collective(request.collective_id)?
            .ok_or_else(|| NotFoundError::collective(request.collective_id))?;
        Self::validate_query(&request.query, collective.dimension())?;

        let similar = if request.max_similar > 0 {
            self.search_similar_on(
                &*snapshot,
                request.collective_id,
                &request.query,
                request.max_similar.min(MAX_SEARCH_K),
                &request.filter,
            )?
        } else {
            Vec::new()
        };

        let recent = snapshot.recent_experiences(
            request.collective_id,
            request.max_recent,
            &request.filter,
            ScanDeadline::start(self.config.limits.query_timeout_ms),
        )?;

        let insights = if request.include_insights && request.max_insights > 0 {
            self.insights_on(&*snapshot, request.collective_id, &request.query, request.max_insights)?
        } else {
            Vec::new()
        };

        let active_agents = if request.include_active_agents {
            let now = Timestamp::now();
            let threshold = self.config.limits.stale_agent_threshold_ms;
            snapshot
                .activities(request.collective_id)?
                .into_iter()
                .filter(|a| a.is_live(now, threshold))
                .collect()
        } else {
            Vec::new()
        };

        let relations = if request.include_relations {
            let mut seen_relations: HashSet<RelationId> = HashSet::new();
            let mut relations = Vec::new();
            let member_ids: Vec<ExperienceId> = similar
                .iter()
                .map(|(e, _)| e.id)
                .chain(recent.iter().map(|e| e.id))
                .collect();
            for id in member_ids {
                for relation in snapshot.relations_for(id, RelationDirection::Both)? {
                    if seen_relations.insert(relation.id) {
                        relations.push(relation);
                    }
                }
            }
            relations
        } else {
            Vec::new()
        };

        Ok(ContextCandidates {
            similar,
            recent,
            insights,
            active_agents,
            relations,
            snapshot_csn,
        })
    }

    // =======================================================================
    // Relations
    // =======================================================================

    /// Stores a typed relation between two experiences of the same
    /// collective. Duplicate `(source, target, type)` triples are
    /// rejected.
    pub fn store_relation(&self, new: NewRelation) -> Result<RelationId> {
        self.check_writable()?;
        let _guard = self.write_guard()?;
        validate_new_relation(&new)?;

        let source = self
            .storage
            .get_experience(new.source_id)?
            .ok_or_else(|| NotFoundError::experience(new.source_id))?;
        let target = self
            .storage
            .get_experience(new.target_id)?
            .ok_or_else(|| NotFoundError::experience(new.target_id))?;
        if source.collective_id != target.collective_id {
            return Err(ValidationError::invalid_field(
                "target_id",
                "relations cannot span collectives",
            )
            .into());
        }
        if self
            .storage
            .relation_exists(new.source_id, new.target_id, new.relation_type)?
        {
            return Err(ValidationError::invalid_field(
                "relation_type",
                "an identical relation between these experiences already exists",
            )
            .into());
        }

        let relation = ExperienceRelation {
            id: RelationId::new(),
            source_id: new.source_id,
            target_id: new.target_id,
            relation_type: new.relation_type,
            strength: new.strength,
            metadata: new.metadata,
            created_at: Timestamp::now(),
        };
        let id = relation.id;

        self.guard_err(self.storage.insert_relation(&relation))?;
        self.after_commit();
        Ok(id)
    }

    /// Reads a relation, or `None` when absent.
    pub fn get_relation(&self, id: RelationId) -> Result<Option<ExperienceRelation>> {
        let _permit = self.reads.acquire()?;
        self.storage.get_relation(id)
    }

    /// Relations touching an experience, with the opposite endpoint
    /// joined in.
    pub fn get_related_experiences(
        &self,
        id: ExperienceId,
        direction: RelationDirection,
    ) -> Result<Vec<(ExperienceRelation, Experience)>> {
        let _permit = self.reads.acquire()?;
        let snapshot = self.storage.snapshot()?;
        snapshot
            .experience_row(id)?
            .ok_or_else(|| NotFoundError::experience(id))?;

        let mut out = Vec::new();
        for relation in snapshot.relations_for(id, direction)? {
            let other_id = if relation.source_id == id {
                relation.target_id
            } else {
                relation.source_id
            };
            if let Some(other) = snapshot.get_experience(other_id)? {
                out.push((relation, other));
            }
        }
        Ok(out)
    }

    /// Deletes a relation.
    pub fn delete_relation(&self, id: RelationId) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_guard()?;
        if !self.guard_err(self.storage.delete_relation(id))? {
            return Err(NotFoundError::relation(id).into());
        }
        self.after_commit();
        Ok(())
    }

    // =======================================================================
    // Insights
    // =======================================================================

    /// Stores a derived insight, indexed in the collective's insight
    /// vector index.
    pub fn store_insight(&self, new: NewInsight) -> Result<InsightId> {
        self.check_writable()?;
        let _guard = self.write_guard()?;

        let collective = self
            .storage
            .get_collective(new.collective_id)?
            .ok_or_else(|| NotFoundError::collective(new.collective_id))?;

        let embedding_required = self.config.embedding_provider.is_external();
        validate_new_insight(&new, collective.dimension(), embedding_required)?;

        let embedding = match new.embedding {
            Some(embedding) => embedding,
            None => {
                let generated = self.embedding.embed(&new.content)?;
                if generated.len() != collective.dimension() {
                    return Err(ValidationError::dimension_mismatch(
                        collective.dimension(),
                        generated.len(),
                    )
                    .into());
                }
                check_finite_vector("embedding", &generated)?;
                generated
            }
        };

        let insight = DerivedInsight {
            id: InsightId::new(),
            collective_id: new.collective_id,
            content: new.content,
            embedding,
            source_experience_ids: new.source_experience_ids,
            insight_type: new.insight_type,
            confidence: new.confidence,
            domain_tags: new.domain_tags,
            created_at: Timestamp::now(),
        };
        let id = insight.id;

        self.guard_err(self.storage.insert_insight(&insight))?;

        let indexes = self.indexes_for(new.collective_id)?;
        indexes.insights.insert(*id.as_bytes(), &insight.embedding)?;

        self.after_commit();
        debug!(insight = %id, "insight stored");
        Ok(id)
    }

    /// Reads an insight, or `None` when absent.
    pub fn get_insight(&self, id: InsightId) -> Result<Option<DerivedInsight>> {
        let _permit = self.reads.acquire()?;
        self.storage.get_insight(id)
    }

    /// k-NN over a collective's insights.
    pub fn get_insights(
        &self,
        collective_id: CollectiveId,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<(DerivedInsight, f32)>> {
        let _permit = self.reads.acquire()?;
        let snapshot = self.storage.snapshot()?;
        snapshot
            .get_collective(collective_id)?
            .ok_or_else(|| NotFoundError::collective(collective_id))?;
        Self::validate_k(k)?;
        self.insights_on(&*snapshot, collective_id, query, k)
    }

    fn insights_on(
        &self,
        snapshot: &dyn StorageSnapshot,
        collective_id: CollectiveId,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<(DerivedInsight, f32)>> {
        let collective = snapshot
            .get_collective(collective_id)?
            .ok_or_else(|| NotFoundError::collective(collective_id))?;
        Self::validate_query(query, collective.dimension())?;

        let indexes = self.indexes_for(collective_id)?;
        let fetch = k.max(self.config.hnsw.ef_search);
        let hits = indexes.insights.search(query, fetch, fetch, None)?;

        let metric = self.config.hnsw.metric;
        let mut out = Vec::with_capacity(hits.len().min(k));
        for (id_bytes, distance) in hits.into_iter().take(k) {
            let insight_id = InsightId::from_bytes(id_bytes);
            if let Some(insight) = snapshot.get_insight(insight_id)? {
                let similarity = match metric {
                    Metric::Cosine => 1.0 - distance,
                    Metric::L2 => -distance,
                };
                out.push((insight, similarity));
            }
        }
        Ok(out)
    }

    /// Deletes an insight and tombstones its vector.
    pub fn delete_insight(&self, id: InsightId) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_guard()?;
        let (insight, _csn) = self
            .guard_err(self.storage.delete_insight(id))?
            .ok_or_else(|| NotFoundError::insight(id))?;

        if let Ok(indexes) = self.indexes_for(insight.collective_id) {
            indexes.insights.remove(id.as_bytes());
        }
        self.after_commit();
        Ok(())
    }

    // =======================================================================
    // Activities
    // =======================================================================

    /// Registers (or replaces) an agent's presence in a collective.
    pub fn register_activity(&self, new: NewActivity) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_guard()?;
        validate_new_activity(&new)?;
        self.storage
            .get_collective(new.collective_id)?
            .ok_or_else(|| NotFoundError::collective(new.collective_id))?;

        let now = Timestamp::now();
        let activity = Activity {
            agent_id: new.agent_id,
            collective_id: new.collective_id,
            current_task: new.current_task,
            context_summary: new.context_summary,
            started_at: now,
            last_heartbeat: now,
        };

        self.guard_err(self.storage.upsert_activity(&activity))?;
        self.after_commit();
        Ok(())
    }

    /// Refreshes an agent's heartbeat.
    pub fn update_heartbeat(&self, collective_id: CollectiveId, agent: &AgentId) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_guard()?;
        if !self.guard_err(self.storage.touch_activity(
            collective_id,
            agent,
            Timestamp::now(),
        ))? {
            return Err(
                NotFoundError::activity(format!("{collective_id}/{agent}")).into(),
            );
        }
        self.after_commit();
        Ok(())
    }

    /// Ends an agent's activity, removing its row.
    pub fn end_activity(&self, collective_id: CollectiveId, agent: &AgentId) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_guard()?;
        if !self.guard_err(self.storage.remove_activity(collective_id, agent))? {
            return Err(
                NotFoundError::activity(format!("{collective_id}/{agent}")).into(),
            );
        }
        self.after_commit();
        Ok(())
    }

    /// Agents whose last heartbeat is within the stale threshold.
    pub fn get_active_agents(&self, collective_id: CollectiveId) -> Result<Vec<Activity>> {
        let _permit = self.reads.acquire()?;
        self.storage
            .get_collective(collective_id)?
            .ok_or_else(|| NotFoundError::collective(collective_id))?;

        let now = Timestamp::now();
        let threshold = self.config.limits.stale_agent_threshold_ms;
        Ok(self
            .storage
            .activities(collective_id)?
            .into_iter()
            .filter(|a| a.is_live(now, threshold))
            .collect())
    }

    // =======================================================================
    // Watch
    // =======================================================================

    /// Subscribes to a collective's experience events, optionally
    /// filtered. Dropping the subscription unsubscribes.
    pub fn subscribe(
        &self,
        collective_id: CollectiveId,
        filter: Option<WatchFilter>,
    ) -> Result<WatchSubscription> {
        self.storage
            .get_collective(collective_id)?
            .ok_or_else(|| NotFoundError::collective(collective_id))?;
        Ok(self.watch.subscribe(collective_id, filter))
    }

    /// Poll-style change feed: events for a collective with CSN in
    /// `(since_csn, current]`, reconstructed from the changelog, plus the
    /// current CSN to poll from next.
    ///
    /// The changelog keeps a bounded window; polling from far behind
    /// returns only the events still covered by it.
    pub fn poll_changes(
        &self,
        collective_id: CollectiveId,
        since_csn: Csn,
    ) -> Result<(Vec<WatchEvent>, Csn)> {
        let _permit = self.reads.acquire()?;
        let changes = self.storage.changes_since(since_csn, MAX_POLL_EVENTS)?;
        let mut events = Vec::new();
        for (csn, change) in changes {
            if change.collective_id != collective_id {
                continue;
            }
            let ChangeEntity::Experience(experience_id) = change.entity else {
                continue;
            };
            let kind = match change.kind {
                ChangeKind::Created => WatchEventKind::Created,
                ChangeKind::Updated | ChangeKind::Unarchived => WatchEventKind::Updated,
                ChangeKind::Archived => WatchEventKind::Archived,
                ChangeKind::Deleted => WatchEventKind::Deleted,
                ChangeKind::InsightStored | ChangeKind::InsightDeleted => continue,
            };
            events.push(WatchEvent {
                experience_id,
                collective_id,
                kind,
                csn,
                timestamp: change.timestamp,
            });
        }
        Ok((events, self.storage.csn()))
    }

    // =======================================================================
    // Internals
    // =======================================================================

    fn check_writable(&self) -> Result<()> {
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(StorageError::corrupted(
                "database is in read-only safe mode after a corruption signal; reopen to recover",
            )
            .into());
        }
        Ok(())
    }

    fn write_guard(&self) -> Result<MutexGuard<'_, ()>> {
        let timeout = Duration::from_millis(self.config.limits.write_lock_timeout_ms);
        self.writer.try_lock_for(timeout).ok_or(PulseError::LockTimeout {
            waited_ms: self.config.limits.write_lock_timeout_ms,
        })
    }

    /// Flags the handle read-only when `result` carries a corruption
    /// error, then passes the result through.
    fn guard_err<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(ref e) = result {
            if e.is_corruption() {
                warn!(error = %e, "corruption detected, entering read-only safe mode");
                self.poisoned.store(true, Ordering::SeqCst);
            }
        }
        result
    }

    fn indexes_for(&self, collective_id: CollectiveId) -> Result<CollectiveIndexes> {
        self.indexes
            .read()
            .get(&collective_id)
            .cloned()
            .ok_or_else(|| NotFoundError::collective(collective_id).into())
    }

    fn publish(&self, kind: WatchEventKind, experience: &Experience, csn: Csn) {
        self.watch.publish(
            &WatchEvent {
                experience_id: experience.id,
                collective_id: experience.collective_id,
                kind,
                csn,
                timestamp: Timestamp::now(),
            },
            experience,
        );
    }

    /// Counts a commit and persists the vector indexes when the cadence
    /// comes due. Called with the writer lock held.
    fn after_commit(&self) {
        let interval = self.config.hnsw.persist_interval;
        if interval == 0 {
            return;
        }
        let count = self.commits_since_persist.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= interval {
            self.commits_since_persist.store(0, Ordering::SeqCst);
            self.persist_indexes();
        }
    }

    /// Saves every collective's indexes, rebuilding ones whose tombstone
    /// ratio crossed the threshold. Failures are non-fatal: a stale or
    /// missing sidecar is rebuilt on the next open.
    fn persist_indexes(&self) {
        let Some(dir) = self.hnsw_dir() else {
            return;
        };
        let csn = self.storage.csn();

        let entries: Vec<(CollectiveId, CollectiveIndexes)> = self
            .indexes
            .read()
            .iter()
            .map(|(id, pair)| (*id, pair.clone()))
            .collect();

        for (collective_id, pair) in entries {
            let rebuilt = self.maybe_compact(collective_id, &pair);
            let pair = rebuilt.unwrap_or(pair);

            if let Err(e) = pair
                .experiences
                .save(&Self::experience_index_path(&dir, collective_id), csn)
            {
                warn!(collective = %collective_id, error = %e, "failed to save experience index");
            }
            if let Err(e) = pair
                .insights
                .save(&Self::insight_index_path(&dir, collective_id), csn)
            {
                warn!(collective = %collective_id, error = %e, "failed to save insight index");
            }
        }
    }

    /// Rebuilds indexes whose tombstone ratio crossed the threshold.
    fn maybe_compact(
        &self,
        collective_id: CollectiveId,
        pair: &CollectiveIndexes,
    ) -> Option<CollectiveIndexes> {
        if !pair.experiences.wants_rebuild() && !pair.insights.wants_rebuild() {
            return None;
        }
        debug!(collective = %collective_id, "compacting vector indexes");
        match self.rebuild_pair(collective_id) {
            Ok(rebuilt) => {
                self.indexes.write().insert(collective_id, rebuilt.clone());
                Some(rebuilt)
            }
            Err(e) => {
                warn!(collective = %collective_id, error = %e, "index compaction failed");
                None
            }
        }
    }

    fn rebuild_pair(&self, collective_id: CollectiveId) -> Result<CollectiveIndexes> {
        let collective = self
            .storage
            .get_collective(collective_id)?
            .ok_or_else(|| NotFoundError::collective(collective_id))?;
        let dimension = collective.dimension();

        let experiences = HnswIndex::build(
            dimension,
            &self.config.hnsw,
            self.storage
                .live_embeddings(collective_id)?
                .into_iter()
                .map(|(id, v)| (*id.as_bytes(), v))
                .collect(),
        )?;
        let insights = HnswIndex::build(
            dimension,
            &self.config.hnsw,
            self.storage
                .insight_embeddings(collective_id)?
                .into_iter()
                .map(|(id, v)| (*id.as_bytes(), v))
                .collect(),
        )?;
        Ok(CollectiveIndexes {
            experiences: Arc::new(experiences),
            insights: Arc::new(insights),
        })
    }

    fn hnsw_dir(&self) -> Option<PathBuf> {
        self.storage.path().map(Self::hnsw_dir_for)
    }

    fn hnsw_dir_for(db_path: &Path) -> PathBuf {
        let mut os = db_path.as_os_str().to_owned();
        os.push(".hnsw");
        PathBuf::from(os)
    }

    fn experience_index_path(dir: &Path, collective_id: CollectiveId) -> PathBuf {
        dir.join(format!("{collective_id}.hnsw"))
    }

    fn insight_index_path(dir: &Path, collective_id: CollectiveId) -> PathBuf {
        dir.join(format!("{collective_id}_insights.hnsw"))
    }

    fn validate_k(k: usize) -> Result<()> {
        if k == 0 || k > MAX_SEARCH_K {
            return Err(ValidationError::invalid_field(
                "k",
                format!("must be between 1 and {MAX_SEARCH_K}, got {k}"),
            )
            .into());
        }
        Ok(())
    }

    fn validate_query(query: &[f32], dimension: usize) -> Result<()> {
        if query.len() != dimension {
            return Err(ValidationError::dimension_mismatch(dimension, query.len()).into());
        }
        check_finite_vector("query", query)
    }

    /// Loads a collective's index pair from disk, replaying the changelog
    /// to catch up a slightly stale image, or rebuilds from stored
    /// embeddings when the image is missing, corrupt or too far behind.
    fn load_or_rebuild_indexes(
        storage: &dyn StorageEngine,
        config: &Config,
        hnsw_dir: &Path,
        collective: &Collective,
    ) -> Result<CollectiveIndexes> {
        let dimension = collective.dimension();
        let current_csn = storage.csn();

        let exp_path = Self::experience_index_path(hnsw_dir, collective.id);
        let ins_path = Self::insight_index_path(hnsw_dir, collective.id);

        let loaded = Self::try_load_pair(config, dimension, &exp_path, &ins_path);

        let pair = match loaded {
            Some((pair, built_at)) if built_at == current_csn => Some(pair),
            Some((pair, built_at)) if built_at < current_csn => {
                match Self::replay_changes(storage, collective.id, &pair, built_at) {
                    Ok(()) => {
                        debug!(
                            collective = %collective.id,
                            from = built_at.0,
                            to = current_csn.0,
                            "caught up vector indexes from changelog"
                        );
                        Some(pair)
                    }
                    Err(e) => {
                        debug!(collective = %collective.id, error = %e, "changelog replay unavailable, rebuilding");
                        None
                    }
                }
            }
            // An index from the future can only mean mismatched files.
            Some(_) => None,
            None => None,
        };

        match pair {
            Some(pair) => Ok(pair),
            None => {
                let start = std::time::Instant::now();
                let experiences = HnswIndex::build(
                    dimension,
                    &config.hnsw,
                    storage
                        .live_embeddings(collective.id)?
                        .into_iter()
                        .map(|(id, v)| (*id.as_bytes(), v))
                        .collect(),
                )?;
                let insights = HnswIndex::build(
                    dimension,
                    &config.hnsw,
                    storage
                        .insight_embeddings(collective.id)?
                        .into_iter()
                        .map(|(id, v)| (*id.as_bytes(), v))
                        .collect(),
                )?;
                info!(
                    collective = %collective.id,
                    vectors = experiences.len(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "rebuilt vector indexes from stored embeddings"
                );
                Ok(CollectiveIndexes {
                    experiences: Arc::new(experiences),
                    insights: Arc::new(insights),
                })
            }
        }
    }

    /// Loads both sidecar files; any failure falls back to a rebuild.
    /// Returns the pair and the older of the two `built_at_csn` marks.
    fn try_load_pair(
        config: &Config,
        dimension: usize,
        exp_path: &Path,
        ins_path: &Path,
    ) -> Option<(CollectiveIndexes, Csn)> {
        let (experiences, exp_meta) = match HnswIndex::load(exp_path, dimension, &config.hnsw) {
            Ok(Some(loaded)) => loaded,
            Ok(None) => return None,
            Err(e) => {
                warn!(path = %exp_path.display(), error = %e, "unreadable experience index, will rebuild");
                return None;
            }
        };
        // The pair is saved together; one file missing means the save was
        // interrupted, so trust neither.
        let (insights, ins_meta) = match HnswIndex::load(ins_path, dimension, &config.hnsw) {
            Ok(Some(loaded)) => loaded,
            Ok(None) => return None,
            Err(e) => {
                warn!(path = %ins_path.display(), error = %e, "unreadable insight index, will rebuild");
                return None;
            }
        };
        let built_at = Csn(exp_meta.built_at_csn.min(ins_meta.built_at_csn));
        Some((
            CollectiveIndexes {
                experiences: Arc::new(experiences),
                insights: Arc::new(insights),
            },
            built_at,
        ))
    }

    /// Replays changelog entries in `(built_at, now]` into the loaded
    /// indexes. Fails when the changelog window no longer covers the gap,
    /// in which case the caller rebuilds.
    fn replay_changes(
        storage: &dyn StorageEngine,
        collective_id: CollectiveId,
        pair: &CollectiveIndexes,
        built_at: Csn,
    ) -> Result<()> {
        if let Some(oldest) = storage.oldest_change_csn()? {
            if oldest.0 > built_at.0 + 1 && built_at.0 + 1 < storage.csn().0 {
                return Err(PulseError::vector(format!(
                    "changelog window starts at {} but the index is built at {}",
                    oldest.0, built_at.0
                )));
            }
        }

        for (_, change) in storage.changes_since(built_at, usize::MAX)? {
            if change.collective_id != collective_id {
                continue;
            }
            match (change.entity, change.kind) {
                (
                    ChangeEntity::Experience(id),
                    ChangeKind::Created | ChangeKind::Unarchived,
                ) => {
                    if let Some(embedding) = storage.get_embedding(id)? {
                        pair.experiences.insert(*id.as_bytes(), &embedding)?;
                    }
                }
                (ChangeEntity::Experience(id), ChangeKind::Archived | ChangeKind::Deleted) => {
                    pair.experiences.remove(id.as_bytes());
                }
                (ChangeEntity::Experience(_), ChangeKind::Updated) => {}
                (ChangeEntity::Experience(_), ChangeKind::InsightStored | ChangeKind::InsightDeleted) => {}
                (ChangeEntity::Insight(id), ChangeKind::InsightStored) => {
                    if let Some(insight) = storage.get_insight(id)? {
                        pair.insights.insert(*id.as_bytes(), &insight.embedding)?;
                    }
                }
                (ChangeEntity::Insight(id), ChangeKind::InsightDeleted) => {
                    pair.insights.remove(id.as_bytes());
                }
                (ChangeEntity::Insight(_), _) => {}
            }
        }
        Ok(())
    }
}

static_assertions::assert_impl_all!(PulseDb: Send, Sync);
