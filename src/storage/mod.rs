//! Storage layer.
//!
//! [`StorageEngine`] is the capability set the rest of the engine needs
//! from a transactional KV backend: point CRUD for every entity, the
//! secondary-index scans behind recency and relation queries, snapshot
//! reads, the CSN, and the changelog. [`RedbStorage`] is the production
//! implementation, selected at open time.
//!
//! Every mutating call runs in exactly one write transaction that also
//! appends the changelog row (where applicable) and bumps the CSN, so a
//! commit is atomic across primary rows, secondary indexes and the change
//! counter.

pub mod redb;
pub(crate) mod schema;

pub use self::redb::RedbStorage;
pub use schema::{ChangeEntity, ChangeKind, ChangeRecord, DatabaseMetadata, SCHEMA_VERSION};

use std::path::Path;
use std::time::Instant;

use crate::activity::Activity;
use crate::collective::Collective;
use crate::config::Config;
use crate::error::{PulseError, Result};
use crate::experience::{Experience, ExperienceUpdate};
use crate::filter::SearchFilter;
use crate::insight::DerivedInsight;
use crate::relation::{ExperienceRelation, RelationDirection, RelationType};
use crate::types::{AgentId, CollectiveId, Csn, Embedding, ExperienceId, InsightId, RelationId, Timestamp};

/// Outcome of a successful experience update.
#[derive(Debug)]
pub struct UpdateOutcome {
    /// The experience after the patch, embedding included.
    pub experience: Experience,
    /// Archived flag before the patch.
    pub was_archived: bool,
    /// CSN of the commit.
    pub csn: Csn,
}

/// Outcome of a successful experience delete.
#[derive(Debug)]
pub struct DeleteOutcome {
    /// The experience as it was before deletion (embedding included).
    pub experience: Experience,
    /// How many relations were cascade-deleted with it.
    pub relations_removed: u64,
    /// CSN of the commit.
    pub csn: Csn,
}

/// Deadline enforcement for long read scans.
///
/// Checked periodically mid-scan; an expired deadline aborts the scan with
/// [`PulseError::QueryTimeout`] and releases the snapshot.
#[derive(Clone, Copy, Debug)]
pub struct ScanDeadline {
    started: Instant,
    budget_ms: u64,
}

impl ScanDeadline {
    /// A deadline of `budget_ms` from now; `None` when the budget is 0.
    pub fn start(budget_ms: u64) -> Option<Self> {
        (budget_ms > 0).then(|| Self {
            started: Instant::now(),
            budget_ms,
        })
    }

    /// Errors once the budget is exhausted.
    pub fn check(&self) -> Result<()> {
        if self.started.elapsed().as_millis() as u64 > self.budget_ms {
            return Err(PulseError::QueryTimeout {
                deadline_ms: self.budget_ms,
            });
        }
        Ok(())
    }
}

/// A consistent read snapshot (MVCC). Never blocks writers or other
/// readers; holds the view it was created with until dropped.
pub trait StorageSnapshot: Send {
    /// CSN the snapshot was taken at.
    fn csn(&self) -> Csn;

    /// Reads a collective row.
    fn get_collective(&self, id: CollectiveId) -> Result<Option<Collective>>;

    /// Reads an experience row without its embedding (cheap form used by
    /// traversal predicates).
    fn experience_row(&self, id: ExperienceId) -> Result<Option<Experience>>;

    /// Reads an experience with its embedding joined in.
    fn get_experience(&self, id: ExperienceId) -> Result<Option<Experience>>;

    /// Newest-first filtered scan of a collective's experiences.
    fn recent_experiences(
        &self,
        collective: CollectiveId,
        limit: usize,
        filter: &SearchFilter,
        deadline: Option<ScanDeadline>,
    ) -> Result<Vec<Experience>>;

    /// Relations where `id` is the source, the target, or either.
    fn relations_for(
        &self,
        id: ExperienceId,
        direction: RelationDirection,
    ) -> Result<Vec<ExperienceRelation>>;

    /// Reads an insight row.
    fn get_insight(&self, id: InsightId) -> Result<Option<DerivedInsight>>;

    /// All activity rows of a collective.
    fn activities(&self, collective: CollectiveId) -> Result<Vec<Activity>>;
}

/// Capability set of the transactional KV backend.
pub trait StorageEngine: Send + Sync {
    /// Database metadata as read at open time.
    fn metadata(&self) -> DatabaseMetadata;

    /// Current change sequence number.
    fn csn(&self) -> Csn;

    /// Path of the main database file, when file-backed.
    fn path(&self) -> Option<&Path>;

    /// Flushes and closes the backend, consuming it.
    fn close(self: Box<Self>) -> Result<()>;

    /// Opens an MVCC read snapshot.
    fn snapshot(&self) -> Result<Box<dyn StorageSnapshot>>;

    // -- collectives --------------------------------------------------------

    /// Persists a new collective row.
    fn insert_collective(&self, collective: &Collective) -> Result<Csn>;

    /// Reads a collective row.
    fn get_collective(&self, id: CollectiveId) -> Result<Option<Collective>>;

    /// Lists all collectives.
    fn list_collectives(&self) -> Result<Vec<Collective>>;

    /// Deletes a collective and everything it owns in one transaction.
    /// Returns the number of experiences removed, or `None` if the
    /// collective did not exist.
    fn delete_collective(&self, id: CollectiveId) -> Result<Option<u64>>;

    /// Number of insights stored for a collective.
    fn count_insights(&self, collective: CollectiveId) -> Result<u64>;

    // -- experiences --------------------------------------------------------

    /// Persists a fully-formed experience (row, embedding, both secondary
    /// indexes, changelog, CSN, collective counter) atomically.
    fn insert_experience(&self, experience: &Experience) -> Result<Csn>;

    /// Reads an experience with its embedding.
    fn get_experience(&self, id: ExperienceId) -> Result<Option<Experience>>;

    /// Reads just the embedding bytes of an experience.
    fn get_embedding(&self, id: ExperienceId) -> Result<Option<Embedding>>;

    /// Applies a patch to the mutable fields. `None` when the id is
    /// unknown.
    fn update_experience(
        &self,
        id: ExperienceId,
        update: &ExperienceUpdate,
    ) -> Result<Option<UpdateOutcome>>;

    /// Deletes an experience, cascading to relations. `None` when the id
    /// is unknown.
    fn delete_experience(&self, id: ExperienceId) -> Result<Option<DeleteOutcome>>;

    /// Atomically increments the application counter. `None` when the id
    /// is unknown.
    fn reinforce_experience(&self, id: ExperienceId) -> Result<Option<(u32, Csn)>>;

    /// Every live `(id, embedding)` pair of a collective, for index
    /// rebuilds. Archived experiences are excluded.
    fn live_embeddings(&self, collective: CollectiveId)
        -> Result<Vec<(ExperienceId, Embedding)>>;

    // -- relations ----------------------------------------------------------

    /// Persists a relation and its two index entries.
    fn insert_relation(&self, relation: &ExperienceRelation) -> Result<Csn>;

    /// Reads a relation row.
    fn get_relation(&self, id: RelationId) -> Result<Option<ExperienceRelation>>;

    /// Deletes a relation and its index entries. False when unknown.
    fn delete_relation(&self, id: RelationId) -> Result<bool>;

    /// True when a `(source, target, type)` relation already exists.
    fn relation_exists(
        &self,
        source: ExperienceId,
        target: ExperienceId,
        relation_type: RelationType,
    ) -> Result<bool>;

    /// Relations touching `id` in the given direction.
    fn relations_for(
        &self,
        id: ExperienceId,
        direction: RelationDirection,
    ) -> Result<Vec<ExperienceRelation>>;

    // -- insights -----------------------------------------------------------

    /// Persists an insight (row, collective index, changelog, CSN).
    fn insert_insight(&self, insight: &DerivedInsight) -> Result<Csn>;

    /// Reads an insight row.
    fn get_insight(&self, id: InsightId) -> Result<Option<DerivedInsight>>;

    /// Deletes an insight. Returns the removed row, or `None` when
    /// unknown.
    fn delete_insight(&self, id: InsightId) -> Result<Option<(DerivedInsight, Csn)>>;

    /// Every `(id, embedding)` pair of a collective's insights.
    fn insight_embeddings(&self, collective: CollectiveId)
        -> Result<Vec<(InsightId, Embedding)>>;

    // -- activities ---------------------------------------------------------

    /// Inserts or replaces the activity row for its (collective, agent).
    fn upsert_activity(&self, activity: &Activity) -> Result<Csn>;

    /// Updates only `last_heartbeat`. False when no row exists.
    fn touch_activity(
        &self,
        collective: CollectiveId,
        agent: &AgentId,
        now: Timestamp,
    ) -> Result<bool>;

    /// Removes the activity row. False when no row exists.
    fn remove_activity(&self, collective: CollectiveId, agent: &AgentId) -> Result<bool>;

    /// All activity rows of a collective.
    fn activities(&self, collective: CollectiveId) -> Result<Vec<Activity>>;

    // -- changelog ----------------------------------------------------------

    /// Changelog rows with CSN strictly greater than `since`, oldest
    /// first, up to `limit`.
    fn changes_since(&self, since: Csn, limit: usize) -> Result<Vec<(Csn, ChangeRecord)>>;

    /// The smallest CSN still present in the changelog window.
    fn oldest_change_csn(&self) -> Result<Option<Csn>>;

    // -- accounting ---------------------------------------------------------

    /// Approximate stored payload bytes (content + embeddings).
    fn total_bytes(&self) -> Result<u64>;
}

/// Opens the production storage backend.
pub fn open_storage(path: impl AsRef<Path>, config: &Config) -> Result<Box<dyn StorageEngine>> {
    let storage = RedbStorage::open(path, config)?;
    Ok(Box::new(storage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingDimension;
    use tempfile::tempdir;

    #[test]
    fn test_open_storage() {
        let dir = tempdir().unwrap();
        let storage = open_storage(dir.path().join("pulse.db"), &Config::default()).unwrap();
        assert_eq!(
            storage.metadata().default_dimension,
            EmbeddingDimension::D384
        );
        assert_eq!(storage.csn(), Csn::ZERO);
        storage.close().unwrap();
    }

    #[test]
    fn test_scan_deadline() {
        assert!(ScanDeadline::start(0).is_none());

        let deadline = ScanDeadline::start(10_000).unwrap();
        assert!(deadline.check().is_ok());

        let expired = ScanDeadline {
            started: Instant::now() - std::time::Duration::from_millis(50),
            budget_ms: 10,
        };
        assert!(matches!(
            expired.check(),
            Err(PulseError::QueryTimeout { deadline_ms: 10 })
        ));
    }
}
