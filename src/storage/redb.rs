//! redb storage engine.
//!
//! redb gives us ACID transactions, MVCC snapshot reads and a single
//! writer, all in pure Rust. This module layers the PulseDB schema on top:
//! primary rows, the secondary indexes, the changelog and the CSN, all
//! written inside one transaction per logical change.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use ::redb::{Database, Durability, ReadTransaction, ReadableTable, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::schema::{
    activity_key, activity_prefix_end, migration_from, pair_bounds, pair_key,
    pair_key_second, recency_bounds, recency_key, recency_key_experience, type_key, ChangeEntity,
    ChangeKind, ChangeRecord, DatabaseMetadata, ACTIVITIES, CHANGELOG_WINDOW, CHANGES,
    COLLECTIVES, EMBEDDINGS, EXPERIENCES, EXP_BY_COLLECTIVE, EXP_BY_TYPE, INSIGHTS,
    INSIGHTS_BY_COLLECTIVE, METADATA, META_KEY_CSN, META_KEY_DATABASE, META_KEY_TOTAL_BYTES,
    RELATIONS, RELATIONS_BY_SOURCE, RELATIONS_BY_TARGET, SCHEMA_VERSION,
};
use super::{DeleteOutcome, ScanDeadline, StorageEngine, StorageSnapshot, UpdateOutcome};
use crate::activity::Activity;
use crate::collective::Collective;
use crate::config::{Config, SyncMode};
use crate::error::{PulseError, Result, StorageError, ValidationError};
use crate::experience::{Experience, ExperienceUpdate};
use crate::filter::SearchFilter;
use crate::insight::DerivedInsight;
use crate::relation::{ExperienceRelation, RelationDirection, RelationType};
use crate::types::{
    AgentId, CollectiveId, Csn, Embedding, ExperienceId, InsightId, RelationId, Timestamp,
};

/// How often scans re-check their deadline, in rows.
const DEADLINE_CHECK_EVERY: usize = 64;

fn ser<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StorageError::serialization(e.to_string()).into())
}

/// Deserializes a stored row. Failure here means the bytes on disk are not
/// what we wrote, which is corruption, not a caller error.
fn de<T: DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T> {
    bincode::deserialize(bytes)
        .map_err(|e| StorageError::corrupted(format!("undecodable {what} row: {e}")).into())
}

fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for v in embedding {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn embedding_from_bytes(bytes: &[u8]) -> Result<Embedding> {
    if bytes.len() % 4 != 0 {
        return Err(StorageError::corrupted(format!(
            "embedding blob of {} bytes is not a multiple of 4",
            bytes.len()
        ))
        .into());
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// The redb-backed storage engine.
pub struct RedbStorage {
    db: Database,
    metadata: DatabaseMetadata,
    /// Cached CSN; authoritative copy lives in the metadata table.
    csn: AtomicU64,
    sync_mode: SyncMode,
    path: PathBuf,
}

impl std::fmt::Debug for RedbStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStorage")
            .field("path", &self.path)
            .field("csn", &self.csn.load(Ordering::SeqCst))
            .field("sync_mode", &self.sync_mode)
            .finish_non_exhaustive()
    }
}

impl RedbStorage {
    /// Opens or creates the database file at `path`.
    pub fn open(path: impl AsRef<Path>, config: &Config) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let existed = path.exists();

        let db = Database::builder()
            .set_cache_size(config.cache_size_bytes)
            .create(&path)
            .map_err(StorageError::from)?;

        if existed {
            Self::open_existing(db, path, config)
        } else {
            Self::initialize(db, path, config)
        }
    }

    fn initialize(db: Database, path: PathBuf, config: &Config) -> Result<Self> {
        info!(path = %path.display(), "initializing new database");

        let metadata = DatabaseMetadata::new(config.embedding_dimension);

        let txn = db.begin_write().map_err(StorageError::from)?;
        {
            let mut meta = txn.open_table(METADATA)?;
            meta.insert(META_KEY_DATABASE, ser(&metadata)?.as_slice())?;
            meta.insert(META_KEY_CSN, Csn::ZERO.to_be_bytes().as_slice())?;
            meta.insert(META_KEY_TOTAL_BYTES, 0u64.to_be_bytes().as_slice())?;

            // Touch every table so later read transactions never see a
            // missing table.
            txn.open_table(COLLECTIVES)?;
            txn.open_table(EXPERIENCES)?;
            txn.open_table(EMBEDDINGS)?;
            txn.open_table(EXP_BY_COLLECTIVE)?;
            txn.open_table(EXP_BY_TYPE)?;
            txn.open_table(RELATIONS)?;
            txn.open_table(RELATIONS_BY_SOURCE)?;
            txn.open_table(RELATIONS_BY_TARGET)?;
            txn.open_table(INSIGHTS)?;
            txn.open_table(INSIGHTS_BY_COLLECTIVE)?;
            txn.open_table(ACTIVITIES)?;
            txn.open_table(CHANGES)?;
        }
        txn.commit().map_err(StorageError::from)?;

        info!(schema_version = SCHEMA_VERSION, "database initialized");

        Ok(Self {
            db,
            metadata,
            csn: AtomicU64::new(0),
            sync_mode: config.sync_mode,
            path,
        })
    }

    fn open_existing(db: Database, path: PathBuf, config: &Config) -> Result<Self> {
        debug!(path = %path.display(), "opening existing database");

        let (mut metadata, csn) = {
            let txn = db.begin_read().map_err(StorageError::from)?;
            let meta = txn
                .open_table(METADATA)
                .map_err(|e| StorageError::corrupted(format!("missing metadata table: {e}")))?;

            let metadata_bytes = meta
                .get(META_KEY_DATABASE)?
                .ok_or_else(|| StorageError::corrupted("missing database metadata"))?;
            let metadata: DatabaseMetadata = de(metadata_bytes.value(), "metadata")?;

            let csn_bytes = meta
                .get(META_KEY_CSN)?
                .ok_or_else(|| StorageError::corrupted("missing CSN"))?;
            let raw = csn_bytes.value();
            if raw.len() != 8 {
                return Err(StorageError::corrupted("malformed CSN").into());
            }
            let mut buf = [0u8; 8];
            buf.copy_from_slice(raw);
            (metadata, u64::from_be_bytes(buf))
        };

        if metadata.schema_version > SCHEMA_VERSION {
            return Err(StorageError::SchemaVersionMismatch {
                stored: metadata.schema_version,
                supported: SCHEMA_VERSION,
            }
            .into());
        }

        // Forward migrations, one transaction per step.
        while metadata.schema_version < SCHEMA_VERSION {
            let migration = migration_from(metadata.schema_version)?;
            info!(
                from = migration.from,
                to = migration.to,
                name = migration.name,
                "running schema migration"
            );
            let txn = db.begin_write().map_err(StorageError::from)?;
            (migration.run)(&txn)?;
            metadata.schema_version = migration.to;
            {
                let mut meta = txn.open_table(METADATA)?;
                meta.insert(META_KEY_DATABASE, ser(&metadata)?.as_slice())?;
            }
            txn.commit().map_err(StorageError::from)?;
        }

        if !config.infer_per_collective && metadata.default_dimension != config.embedding_dimension
        {
            return Err(PulseError::Validation(ValidationError::dimension_mismatch(
                config.embedding_dimension.size(),
                metadata.default_dimension.size(),
            )));
        }

        metadata.touch();
        let txn = db.begin_write().map_err(StorageError::from)?;
        {
            let mut meta = txn.open_table(METADATA)?;
            meta.insert(META_KEY_DATABASE, ser(&metadata)?.as_slice())?;
        }
        txn.commit().map_err(StorageError::from)?;

        info!(
            schema_version = metadata.schema_version,
            csn = csn,
            "database opened"
        );

        Ok(Self {
            db,
            metadata,
            csn: AtomicU64::new(csn),
            sync_mode: config.sync_mode,
            path,
        })
    }

    fn begin_write(&self) -> Result<WriteTransaction> {
        let mut txn = self.db.begin_write().map_err(StorageError::from)?;
        match self.sync_mode {
            SyncMode::Normal => txn.set_durability(Durability::Immediate),
            SyncMode::Fast => txn.set_durability(Durability::Eventual),
            SyncMode::Paranoid => {
                txn.set_durability(Durability::Immediate);
                txn.set_two_phase_commit(true);
            }
        }
        Ok(txn)
    }

    fn begin_read(&self) -> Result<ReadTransaction> {
        Ok(self.db.begin_read().map_err(StorageError::from)?)
    }

    /// Writes `csn + 1` into the metadata table and returns it. The atomic
    /// cache is updated by [`commit`](Self::commit) after the transaction
    /// lands.
    fn bump_csn(&self, txn: &WriteTransaction) -> Result<Csn> {
        let next = Csn(self.csn.load(Ordering::SeqCst)).next();
        let mut meta = txn.open_table(METADATA)?;
        meta.insert(META_KEY_CSN, next.to_be_bytes().as_slice())?;
        Ok(next)
    }

    /// Appends a changelog row at `csn` and prunes entries that fell out
    /// of the retention window.
    fn append_change(
        &self,
        txn: &WriteTransaction,
        csn: Csn,
        record: &ChangeRecord,
    ) -> Result<()> {
        let mut changes = txn.open_table(CHANGES)?;
        changes.insert(&csn.to_be_bytes(), ser(record)?.as_slice())?;

        let cutoff = csn.0.saturating_sub(CHANGELOG_WINDOW);
        loop {
            let oldest = match changes.first()? {
                Some((key, _)) => {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(key.value());
                    u64::from_be_bytes(buf)
                }
                None => break,
            };
            if oldest > cutoff {
                break;
            }
            changes.remove(&oldest.to_be_bytes())?;
        }
        Ok(())
    }

    fn adjust_total_bytes(&self, txn: &WriteTransaction, delta: i64) -> Result<()> {
        let mut meta = txn.open_table(METADATA)?;
        let current = match meta.get(META_KEY_TOTAL_BYTES)? {
            Some(guard) => {
                let raw = guard.value();
                let mut buf = [0u8; 8];
                if raw.len() == 8 {
                    buf.copy_from_slice(raw);
                }
                u64::from_be_bytes(buf)
            }
            None => 0,
        };
        let updated = if delta >= 0 {
            current.saturating_add(delta as u64)
        } else {
            current.saturating_sub(delta.unsigned_abs())
        };
        meta.insert(META_KEY_TOTAL_BYTES, updated.to_be_bytes().as_slice())?;
        Ok(())
    }

    fn commit(&self, txn: WriteTransaction, csn: Option<Csn>) -> Result<()> {
        txn.commit().map_err(StorageError::from)?;
        if let Some(csn) = csn {
            self.csn.store(csn.0, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Removes a relation row plus both index entries inside `txn`.
    /// Returns false when the relation row is absent.
    fn remove_relation_in_txn(txn: &WriteTransaction, id: RelationId) -> Result<bool> {
        let relation = {
            let mut relations = txn.open_table(RELATIONS)?;
            let result = match relations.remove(id.as_bytes())? {
                Some(guard) => de::<ExperienceRelation>(guard.value(), "relation")?,
                None => return Ok(false),
            };
            result
        };
        let mut by_source = txn.open_table(RELATIONS_BY_SOURCE)?;
        by_source.remove(&pair_key(relation.source_id.as_bytes(), id.as_bytes()))?;
        let mut by_target = txn.open_table(RELATIONS_BY_TARGET)?;
        by_target.remove(&pair_key(relation.target_id.as_bytes(), id.as_bytes()))?;
        Ok(true)
    }

    /// Relation ids referencing `id` from the given side.
    fn relation_ids_in_txn<T: ReadableTable<&'static [u8; 32], ()>>(
        index: &T,
        id: ExperienceId,
    ) -> Result<Vec<RelationId>> {
        let (low, high) = pair_bounds(id.as_bytes());
        let mut ids = Vec::new();
        for item in index.range::<&[u8; 32]>(&low..=&high)? {
            let (key, _) = item?;
            ids.push(RelationId::from_bytes(pair_key_second(key.value())));
        }
        Ok(ids)
    }
}

impl StorageEngine for RedbStorage {
    fn metadata(&self) -> DatabaseMetadata {
        self.metadata.clone()
    }

    fn csn(&self) -> Csn {
        Csn(self.csn.load(Ordering::SeqCst))
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn close(self: Box<Self>) -> Result<()> {
        // Under Fast mode commits are not fsynced; force one durable
        // checkpoint so a clean close loses nothing.
        if matches!(self.sync_mode, SyncMode::Fast) {
            let mut txn = self.db.begin_write().map_err(StorageError::from)?;
            txn.set_durability(Durability::Immediate);
            txn.commit().map_err(StorageError::from)?;
        }
        drop(self.db);
        debug!(path = %self.path.display(), "storage closed");
        Ok(())
    }

    fn snapshot(&self) -> Result<Box<dyn StorageSnapshot>> {
        let txn = self.begin_read()?;
        let csn = {
            let meta = txn.open_table(METADATA)?;
            match meta.get(META_KEY_CSN)? {
                Some(guard) => {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(guard.value());
                    Csn(u64::from_be_bytes(buf))
                }
                None => Csn::ZERO,
            }
        };
        Ok(Box::new(RedbSnapshot { txn, csn }))
    }

    // -- collectives --------------------------------------------------------

    fn insert_collective(&self, collective: &Collective) -> Result<Csn> {
        let txn = self.begin_write()?;
        let csn;
        {
            let mut table = txn.open_table(COLLECTIVES)?;
            table.insert(collective.id.as_bytes(), ser(collective)?.as_slice())?;
            csn = self.bump_csn(&txn)?;
        }
        self.commit(txn, Some(csn))?;
        Ok(csn)
    }

    fn get_collective(&self, id: CollectiveId) -> Result<Option<Collective>> {
        self.snapshot()?.get_collective(id)
    }

    fn list_collectives(&self) -> Result<Vec<Collective>> {
        let txn = self.begin_read()?;
        let table = txn.open_table(COLLECTIVES)?;
        let mut collectives = Vec::new();
        for item in table.iter()? {
            let (_, value) = item?;
            collectives.push(de::<Collective>(value.value(), "collective")?);
        }
        Ok(collectives)
    }

    fn delete_collective(&self, id: CollectiveId) -> Result<Option<u64>> {
        let txn = self.begin_write()?;
        let mut removed_experiences = 0u64;
        let mut bytes_freed = 0i64;
        let csn;
        {
            {
                let mut collectives = txn.open_table(COLLECTIVES)?;
                if collectives.remove(id.as_bytes())?.is_none() {
                    return Ok(None);
                }
            }

            // Experiences and their embeddings, via the recency index.
            let experience_ids: Vec<ExperienceId> = {
                let index = txn.open_table(EXP_BY_COLLECTIVE)?;
                let (low, high) = recency_bounds(&id);
                let mut ids = Vec::new();
                for item in index.range::<&[u8; 40]>(&low..=&high)? {
                    let (key, _) = item?;
                    ids.push(recency_key_experience(key.value()));
                }
                ids
            };

            {
                let mut experiences = txn.open_table(EXPERIENCES)?;
                let mut embeddings = txn.open_table(EMBEDDINGS)?;
                let mut by_type = txn.open_table(EXP_BY_TYPE)?;
                for exp_id in &experience_ids {
                    if let Some(guard) = experiences.remove(exp_id.as_bytes())? {
                        let row = de::<Experience>(guard.value(), "experience")?;
                        drop(guard);
                        bytes_freed += row.content.len() as i64;
                        by_type.remove(&type_key(&id, row.experience_type.tag(), exp_id))?;
                        removed_experiences += 1;
                    }
                    if let Some(guard) = embeddings.remove(exp_id.as_bytes())? {
                        bytes_freed += guard.value().len() as i64;
                    }
                }
            }
            {
                let mut index = txn.open_table(EXP_BY_COLLECTIVE)?;
                let (low, high) = recency_bounds(&id);
                let keys: Vec<[u8; 40]> = {
                    let mut keys = Vec::new();
                    for item in index.range::<&[u8; 40]>(&low..=&high)? {
                        let (key, _) = item?;
                        keys.push(*key.value());
                    }
                    keys
                };
                for key in keys {
                    index.remove(&key)?;
                }
            }

            // Relations touching the removed experiences.
            for exp_id in &experience_ids {
                let relation_ids = {
                    let by_source = txn.open_table(RELATIONS_BY_SOURCE)?;
                    let mut ids = Self::relation_ids_in_txn(&by_source, *exp_id)?;
                    let by_target = txn.open_table(RELATIONS_BY_TARGET)?;
                    ids.extend(Self::relation_ids_in_txn(&by_target, *exp_id)?);
                    ids
                };
                for rel_id in relation_ids {
                    Self::remove_relation_in_txn(&txn, rel_id)?;
                }
            }

            // Insights.
            let insight_ids: Vec<InsightId> = {
                let index = txn.open_table(INSIGHTS_BY_COLLECTIVE)?;
                let (low, high) = pair_bounds(id.as_bytes());
                let mut ids = Vec::new();
                for item in index.range::<&[u8; 32]>(&low..=&high)? {
                    let (key, _) = item?;
                    ids.push(InsightId::from_bytes(pair_key_second(key.value())));
                }
                ids
            };
            {
                let mut insights = txn.open_table(INSIGHTS)?;
                let mut index = txn.open_table(INSIGHTS_BY_COLLECTIVE)?;
                for ins_id in &insight_ids {
                    if let Some(guard) = insights.remove(ins_id.as_bytes())? {
                        let row = de::<DerivedInsight>(guard.value(), "insight")?;
                        drop(guard);
                        bytes_freed += row.content.len() as i64 + (row.embedding.len() * 4) as i64;
                    }
                    index.remove(&pair_key(id.as_bytes(), ins_id.as_bytes()))?;
                }
            }

            // Activities.
            {
                let mut activities = txn.open_table(ACTIVITIES)?;
                let low = activity_key(&id, "");
                let high = activity_prefix_end(&id);
                let keys: Vec<Vec<u8>> = {
                    let mut keys = Vec::new();
                    for item in activities.range(low.as_slice()..high.as_slice())? {
                        let (key, _) = item?;
                        keys.push(key.value().to_vec());
                    }
                    keys
                };
                for key in keys {
                    activities.remove(key.as_slice())?;
                }
            }

            self.adjust_total_bytes(&txn, -bytes_freed)?;
            csn = self.bump_csn(&txn)?;
        }
        self.commit(txn, Some(csn))?;
        info!(collective = %id, experiences = removed_experiences, "collective deleted");
        Ok(Some(removed_experiences))
    }

    fn count_insights(&self, collective: CollectiveId) -> Result<u64> {
        let txn = self.begin_read()?;
        let index = txn.open_table(INSIGHTS_BY_COLLECTIVE)?;
        let (low, high) = pair_bounds(collective.as_bytes());
        let mut count = 0;
        for item in index.range::<&[u8; 32]>(&low..=&high)? {
            item?;
            count += 1;
        }
        Ok(count)
    }

    // -- experiences --------------------------------------------------------

    fn insert_experience(&self, experience: &Experience) -> Result<Csn> {
        let emb_bytes = embedding_to_bytes(&experience.embedding);
        let txn = self.begin_write()?;
        let csn;
        {
            {
                let mut experiences = txn.open_table(EXPERIENCES)?;
                experiences.insert(experience.id.as_bytes(), ser(experience)?.as_slice())?;
            }
            {
                let mut embeddings = txn.open_table(EMBEDDINGS)?;
                embeddings.insert(experience.id.as_bytes(), emb_bytes.as_slice())?;
            }
            {
                let mut recency = txn.open_table(EXP_BY_COLLECTIVE)?;
                recency.insert(
                    &recency_key(
                        &experience.collective_id,
                        experience.created_at,
                        &experience.id,
                    ),
                    (),
                )?;
            }
            {
                let mut by_type = txn.open_table(EXP_BY_TYPE)?;
                by_type.insert(
                    &type_key(
                        &experience.collective_id,
                        experience.experience_type.tag(),
                        &experience.id,
                    ),
                    (),
                )?;
            }
            {
                let mut collectives = txn.open_table(COLLECTIVES)?;
                let row = match collectives.get(experience.collective_id.as_bytes())? {
                    Some(guard) => {
                        let mut row = de::<Collective>(guard.value(), "collective")?;
                        drop(guard);
                        row.experience_count += 1;
                        row.updated_at = Timestamp::now();
                        Some(row)
                    }
                    None => None,
                };
                if let Some(row) = row {
                    collectives.insert(row.id.as_bytes(), ser(&row)?.as_slice())?;
                }
            }

            self.adjust_total_bytes(
                &txn,
                experience.content.len() as i64 + emb_bytes.len() as i64,
            )?;
            csn = self.bump_csn(&txn)?;
            self.append_change(
                &txn,
                csn,
                &ChangeRecord {
                    collective_id: experience.collective_id,
                    entity: ChangeEntity::Experience(experience.id),
                    kind: ChangeKind::Created,
                    timestamp: Timestamp::now(),
                },
            )?;
        }
        self.commit(txn, Some(csn))?;
        Ok(csn)
    }

    fn get_experience(&self, id: ExperienceId) -> Result<Option<Experience>> {
        self.snapshot()?.get_experience(id)
    }

    fn get_embedding(&self, id: ExperienceId) -> Result<Option<Embedding>> {
        let txn = self.begin_read()?;
        let embeddings = txn.open_table(EMBEDDINGS)?;
        match embeddings.get(id.as_bytes())? {
            Some(guard) => Ok(Some(embedding_from_bytes(guard.value())?)),
            None => Ok(None),
        }
    }

    fn update_experience(
        &self,
        id: ExperienceId,
        update: &ExperienceUpdate,
    ) -> Result<Option<UpdateOutcome>> {
        let txn = self.begin_write()?;
        let csn;
        let mut experience;
        let was_archived;
        {
            {
                let mut experiences = txn.open_table(EXPERIENCES)?;
                experience = match experiences.get(id.as_bytes())? {
                    Some(guard) => de::<Experience>(guard.value(), "experience")?,
                    None => return Ok(None),
                };
                was_archived = experience.archived;

                if let Some(importance) = update.importance {
                    experience.importance = importance;
                }
                if let Some(confidence) = update.confidence {
                    experience.confidence = confidence;
                }
                if let Some(ref tags) = update.domain_tags {
                    experience.domain_tags = tags.clone();
                }
                if let Some(ref files) = update.source_files {
                    experience.source_files = files.clone();
                }
                if let Some(archived) = update.archived {
                    experience.archived = archived;
                }
                experience.updated_at = Timestamp::now();

                experiences.insert(id.as_bytes(), ser(&experience)?.as_slice())?;
            }

            let kind = match (was_archived, experience.archived) {
                (false, true) => ChangeKind::Archived,
                (true, false) => ChangeKind::Unarchived,
                _ => ChangeKind::Updated,
            };
            csn = self.bump_csn(&txn)?;
            self.append_change(
                &txn,
                csn,
                &ChangeRecord {
                    collective_id: experience.collective_id,
                    entity: ChangeEntity::Experience(id),
                    kind,
                    timestamp: Timestamp::now(),
                },
            )?;
        }
        self.commit(txn, Some(csn))?;

        // Join the embedding back in for the caller (index toggling on
        // unarchive needs it).
        if let Some(embedding) = self.get_embedding(id)? {
            experience.embedding = embedding;
        }
        Ok(Some(UpdateOutcome {
            experience,
            was_archived,
            csn,
        }))
    }

    fn delete_experience(&self, id: ExperienceId) -> Result<Option<DeleteOutcome>> {
        let txn = self.begin_write()?;
        let csn;
        let mut experience;
        let mut relations_removed = 0u64;
        {
            {
                let mut experiences = txn.open_table(EXPERIENCES)?;
                experience = match experiences.remove(id.as_bytes())? {
                    Some(guard) => de::<Experience>(guard.value(), "experience")?,
                    None => return Ok(None),
                };
            }
            let mut bytes_freed = experience.content.len() as i64;
            {
                let mut embeddings = txn.open_table(EMBEDDINGS)?;
                if let Some(guard) = embeddings.remove(id.as_bytes())? {
                    bytes_freed += guard.value().len() as i64;
                    experience.embedding = embedding_from_bytes(guard.value())?;
                };
            }
            {
                let mut recency = txn.open_table(EXP_BY_COLLECTIVE)?;
                recency.remove(&recency_key(
                    &experience.collective_id,
                    experience.created_at,
                    &id,
                ))?;
            }
            {
                let mut by_type = txn.open_table(EXP_BY_TYPE)?;
                by_type.remove(&type_key(
                    &experience.collective_id,
                    experience.experience_type.tag(),
                    &id,
                ))?;
            }

            let relation_ids = {
                let by_source = txn.open_table(RELATIONS_BY_SOURCE)?;
                let mut ids = Self::relation_ids_in_txn(&by_source, id)?;
                let by_target = txn.open_table(RELATIONS_BY_TARGET)?;
                ids.extend(Self::relation_ids_in_txn(&by_target, id)?);
                ids
            };
            for rel_id in relation_ids {
                if Self::remove_relation_in_txn(&txn, rel_id)? {
                    relations_removed += 1;
                }
            }

            {
                let mut collectives = txn.open_table(COLLECTIVES)?;
                let row = match collectives.get(experience.collective_id.as_bytes())? {
                    Some(guard) => {
                        let mut row = de::<Collective>(guard.value(), "collective")?;
                        drop(guard);
                        row.experience_count = row.experience_count.saturating_sub(1);
                        row.updated_at = Timestamp::now();
                        Some(row)
                    }
                    None => None,
                };
                if let Some(row) = row {
                    collectives.insert(row.id.as_bytes(), ser(&row)?.as_slice())?;
                }
            }

            self.adjust_total_bytes(&txn, -bytes_freed)?;
            csn = self.bump_csn(&txn)?;
            self.append_change(
                &txn,
                csn,
                &ChangeRecord {
                    collective_id: experience.collective_id,
                    entity: ChangeEntity::Experience(id),
                    kind: ChangeKind::Deleted,
                    timestamp: Timestamp::now(),
                },
            )?;
        }
        self.commit(txn, Some(csn))?;
        Ok(Some(DeleteOutcome {
            experience,
            relations_removed,
            csn,
        }))
    }

    fn reinforce_experience(&self, id: ExperienceId) -> Result<Option<(u32, Csn)>> {
        let txn = self.begin_write()?;
        let csn;
        let new_count;
        {
            let collective_id;
            {
                let mut experiences = txn.open_table(EXPERIENCES)?;
                let mut experience = match experiences.get(id.as_bytes())? {
                    Some(guard) => de::<Experience>(guard.value(), "experience")?,
                    None => return Ok(None),
                };
                experience.application_count = experience.application_count.saturating_add(1);
                experience.updated_at = Timestamp::now();
                new_count = experience.application_count;
                collective_id = experience.collective_id;
                experiences.insert(id.as_bytes(), ser(&experience)?.as_slice())?;
            }
            csn = self.bump_csn(&txn)?;
            self.append_change(
                &txn,
                csn,
                &ChangeRecord {
                    collective_id,
                    entity: ChangeEntity::Experience(id),
                    kind: ChangeKind::Updated,
                    timestamp: Timestamp::now(),
                },
            )?;
        }
        self.commit(txn, Some(csn))?;
        Ok(Some((new_count, csn)))
    }

    fn live_embeddings(
        &self,
        collective: CollectiveId,
    ) -> Result<Vec<(ExperienceId, Embedding)>> {
        let txn = self.begin_read()?;
        let index = txn.open_table(EXP_BY_COLLECTIVE)?;
        let experiences = txn.open_table(EXPERIENCES)?;
        let embeddings = txn.open_table(EMBEDDINGS)?;

        let (low, high) = recency_bounds(&collective);
        let mut out = Vec::new();
        for item in index.range::<&[u8; 40]>(&low..=&high)? {
            let (key, _) = item?;
            let exp_id = recency_key_experience(key.value());
            let archived = match experiences.get(exp_id.as_bytes())? {
                Some(guard) => de::<Experience>(guard.value(), "experience")?.archived,
                None => continue,
            };
            if archived {
                continue;
            }
            if let Some(guard) = embeddings.get(exp_id.as_bytes())? {
                out.push((exp_id, embedding_from_bytes(guard.value())?));
            }
        }
        Ok(out)
    }

    // -- relations ----------------------------------------------------------

    fn insert_relation(&self, relation: &ExperienceRelation) -> Result<Csn> {
        let txn = self.begin_write()?;
        let csn;
        {
            {
                let mut relations = txn.open_table(RELATIONS)?;
                relations.insert(relation.id.as_bytes(), ser(relation)?.as_slice())?;
            }
            {
                let mut by_source = txn.open_table(RELATIONS_BY_SOURCE)?;
                by_source.insert(
                    &pair_key(relation.source_id.as_bytes(), relation.id.as_bytes()),
                    (),
                )?;
            }
            {
                let mut by_target = txn.open_table(RELATIONS_BY_TARGET)?;
                by_target.insert(
                    &pair_key(relation.target_id.as_bytes(), relation.id.as_bytes()),
                    (),
                )?;
            }
            csn = self.bump_csn(&txn)?;
        }
        self.commit(txn, Some(csn))?;
        Ok(csn)
    }

    fn get_relation(&self, id: RelationId) -> Result<Option<ExperienceRelation>> {
        let txn = self.begin_read()?;
        let relations = txn.open_table(RELATIONS)?;
        match relations.get(id.as_bytes())? {
            Some(guard) => Ok(Some(de(guard.value(), "relation")?)),
            None => Ok(None),
        }
    }

    fn delete_relation(&self, id: RelationId) -> Result<bool> {
        let txn = self.begin_write()?;
        let removed = Self::remove_relation_in_txn(&txn, id)?;
        if !removed {
            return Ok(false);
        }
        let csn = self.bump_csn(&txn)?;
        self.commit(txn, Some(csn))?;
        Ok(true)
    }

    fn relation_exists(
        &self,
        source: ExperienceId,
        target: ExperienceId,
        relation_type: RelationType,
    ) -> Result<bool> {
        let txn = self.begin_read()?;
        let by_source = txn.open_table(RELATIONS_BY_SOURCE)?;
        let relations = txn.open_table(RELATIONS)?;
        for rel_id in Self::relation_ids_in_txn(&by_source, source)? {
            if let Some(guard) = relations.get(rel_id.as_bytes())? {
                let relation = de::<ExperienceRelation>(guard.value(), "relation")?;
                if relation.target_id == target && relation.relation_type == relation_type {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn relations_for(
        &self,
        id: ExperienceId,
        direction: RelationDirection,
    ) -> Result<Vec<ExperienceRelation>> {
        let snapshot = self.snapshot()?;
        snapshot.relations_for(id, direction)
    }

    // -- insights -----------------------------------------------------------

    fn insert_insight(&self, insight: &DerivedInsight) -> Result<Csn> {
        let txn = self.begin_write()?;
        let csn;
        {
            {
                let mut insights = txn.open_table(INSIGHTS)?;
                insights.insert(insight.id.as_bytes(), ser(insight)?.as_slice())?;
            }
            {
                let mut index = txn.open_table(INSIGHTS_BY_COLLECTIVE)?;
                index.insert(
                    &pair_key(insight.collective_id.as_bytes(), insight.id.as_bytes()),
                    (),
                )?;
            }
            self.adjust_total_bytes(
                &txn,
                insight.content.len() as i64 + (insight.embedding.len() * 4) as i64,
            )?;
            csn = self.bump_csn(&txn)?;
            self.append_change(
                &txn,
                csn,
                &ChangeRecord {
                    collective_id: insight.collective_id,
                    entity: ChangeEntity::Insight(insight.id),
                    kind: ChangeKind::InsightStored,
                    timestamp: Timestamp::now(),
                },
            )?;
        }
        self.commit(txn, Some(csn))?;
        Ok(csn)
    }

    fn get_insight(&self, id: InsightId) -> Result<Option<DerivedInsight>> {
        self.snapshot()?.get_insight(id)
    }

    fn delete_insight(&self, id: InsightId) -> Result<Option<(DerivedInsight, Csn)>> {
        let txn = self.begin_write()?;
        let csn;
        let insight;
        {
            {
                let mut insights = txn.open_table(INSIGHTS)?;
                insight = match insights.remove(id.as_bytes())? {
                    Some(guard) => de::<DerivedInsight>(guard.value(), "insight")?,
                    None => return Ok(None),
                };
            }
            {
                let mut index = txn.open_table(INSIGHTS_BY_COLLECTIVE)?;
                index.remove(&pair_key(insight.collective_id.as_bytes(), id.as_bytes()))?;
            }
            self.adjust_total_bytes(
                &txn,
                -(insight.content.len() as i64 + (insight.embedding.len() * 4) as i64),
            )?;
            csn = self.bump_csn(&txn)?;
            self.append_change(
                &txn,
                csn,
                &ChangeRecord {
                    collective_id: insight.collective_id,
                    entity: ChangeEntity::Insight(id),
                    kind: ChangeKind::InsightDeleted,
                    timestamp: Timestamp::now(),
                },
            )?;
        }
        self.commit(txn, Some(csn))?;
        Ok(Some((insight, csn)))
    }

    fn insight_embeddings(
        &self,
        collective: CollectiveId,
    ) -> Result<Vec<(InsightId, Embedding)>> {
        let txn = self.begin_read()?;
        let index = txn.open_table(INSIGHTS_BY_COLLECTIVE)?;
        let insights = txn.open_table(INSIGHTS)?;
        let (low, high) = pair_bounds(collective.as_bytes());
        let mut out = Vec::new();
        for item in index.range::<&[u8; 32]>(&low..=&high)? {
            let (key, _) = item?;
            let ins_id = InsightId::from_bytes(pair_key_second(key.value()));
            if let Some(guard) = insights.get(ins_id.as_bytes())? {
                let row = de::<DerivedInsight>(guard.value(), "insight")?;
                out.push((ins_id, row.embedding));
            }
        }
        Ok(out)
    }

    // -- activities ---------------------------------------------------------

    fn upsert_activity(&self, activity: &Activity) -> Result<Csn> {
        let txn = self.begin_write()?;
        let csn;
        {
            let mut activities = txn.open_table(ACTIVITIES)?;
            let key = activity_key(&activity.collective_id, activity.agent_id.as_str());
            activities.insert(key.as_slice(), ser(activity)?.as_slice())?;
            csn = self.bump_csn(&txn)?;
        }
        self.commit(txn, Some(csn))?;
        Ok(csn)
    }

    fn touch_activity(
        &self,
        collective: CollectiveId,
        agent: &AgentId,
        now: Timestamp,
    ) -> Result<bool> {
        let txn = self.begin_write()?;
        let csn;
        {
            let mut activities = txn.open_table(ACTIVITIES)?;
            let key = activity_key(&collective, agent.as_str());
            let mut activity = match activities.get(key.as_slice())? {
                Some(guard) => de::<Activity>(guard.value(), "activity")?,
                None => return Ok(false),
            };
            activity.last_heartbeat = now;
            activities.insert(key.as_slice(), ser(&activity)?.as_slice())?;
            csn = self.bump_csn(&txn)?;
        }
        self.commit(txn, Some(csn))?;
        Ok(true)
    }

    fn remove_activity(&self, collective: CollectiveId, agent: &AgentId) -> Result<bool> {
        let txn = self.begin_write()?;
        let csn;
        {
            let mut activities = txn.open_table(ACTIVITIES)?;
            let key = activity_key(&collective, agent.as_str());
            if activities.remove(key.as_slice())?.is_none() {
                return Ok(false);
            }
            csn = self.bump_csn(&txn)?;
        }
        self.commit(txn, Some(csn))?;
        Ok(true)
    }

    fn activities(&self, collective: CollectiveId) -> Result<Vec<Activity>> {
        self.snapshot()?.activities(collective)
    }

    // -- changelog ----------------------------------------------------------

    fn changes_since(&self, since: Csn, limit: usize) -> Result<Vec<(Csn, ChangeRecord)>> {
        let txn = self.begin_read()?;
        let changes = txn.open_table(CHANGES)?;
        let start = Csn(since.0 + 1).to_be_bytes();
        let mut out = Vec::new();
        for item in changes.range::<&[u8; 8]>(&start..)? {
            if out.len() >= limit {
                break;
            }
            let (key, value) = item?;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(key.value());
            out.push((
                Csn(u64::from_be_bytes(buf)),
                de::<ChangeRecord>(value.value(), "change")?,
            ));
        }
        Ok(out)
    }

    fn oldest_change_csn(&self) -> Result<Option<Csn>> {
        let txn = self.begin_read()?;
        let changes = txn.open_table(CHANGES)?;
        let result = match changes.first()? {
            Some((key, _)) => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(key.value());
                Ok(Some(Csn(u64::from_be_bytes(buf))))
            }
            None => Ok(None),
        };
        result
    }

    fn total_bytes(&self) -> Result<u64> {
        let txn = self.begin_read()?;
        let meta = txn.open_table(METADATA)?;
        match meta.get(META_KEY_TOTAL_BYTES)? {
            Some(guard) => {
                let raw = guard.value();
                let mut buf = [0u8; 8];
                if raw.len() == 8 {
                    buf.copy_from_slice(raw);
                }
                Ok(u64::from_be_bytes(buf))
            }
            None => Ok(0),
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

struct RedbSnapshot {
    txn: ReadTransaction,
    csn: Csn,
}

impl StorageSnapshot for RedbSnapshot {
    fn csn(&self) -> Csn {
        self.csn
    }

    fn get_collective(&self, id: CollectiveId) -> Result<Option<Collective>> {
        let table = self.txn.open_table(COLLECTIVES)?;
        match table.get(id.as_bytes())? {
            Some(guard) => Ok(Some(de(guard.value(), "collective")?)),
            None => Ok(None),
        }
    }

    fn experience_row(&self, id: ExperienceId) -> Result<Option<Experience>> {
        let table = self.txn.open_table(EXPERIENCES)?;
        match table.get(id.as_bytes())? {
            Some(guard) => Ok(Some(de(guard.value(), "experience")?)),
            None => Ok(None),
        }
    }

    fn get_experience(&self, id: ExperienceId) -> Result<Option<Experience>> {
        let mut experience = match self.experience_row(id)? {
            Some(row) => row,
            None => return Ok(None),
        };
        let embeddings = self.txn.open_table(EMBEDDINGS)?;
        if let Some(guard) = embeddings.get(id.as_bytes())? {
            experience.embedding = embedding_from_bytes(guard.value())?;
        }
        Ok(Some(experience))
    }

    fn recent_experiences(
        &self,
        collective: CollectiveId,
        limit: usize,
        filter: &SearchFilter,
        deadline: Option<ScanDeadline>,
    ) -> Result<Vec<Experience>> {
        let index = self.txn.open_table(EXP_BY_COLLECTIVE)?;
        let experiences = self.txn.open_table(EXPERIENCES)?;
        let embeddings = self.txn.open_table(EMBEDDINGS)?;

        let (low, high) = recency_bounds(&collective);
        let mut out = Vec::with_capacity(limit.min(64));
        for (scanned, item) in index.range::<&[u8; 40]>(&low..=&high)?.rev().enumerate() {
            if out.len() >= limit {
                break;
            }
            if scanned % DEADLINE_CHECK_EVERY == 0 {
                if let Some(ref deadline) = deadline {
                    deadline.check()?;
                }
            }
            let (key, _) = item?;
            let exp_id = recency_key_experience(key.value());
            let mut experience = match experiences.get(exp_id.as_bytes())? {
                Some(guard) => de::<Experience>(guard.value(), "experience")?,
                None => {
                    warn!(experience = %exp_id, "recency index entry without a row");
                    continue;
                }
            };
            if !filter.matches(&experience) {
                continue;
            }
            if let Some(guard) = embeddings.get(exp_id.as_bytes())? {
                experience.embedding = embedding_from_bytes(guard.value())?;
            }
            out.push(experience);
        }
        Ok(out)
    }

    fn relations_for(
        &self,
        id: ExperienceId,
        direction: RelationDirection,
    ) -> Result<Vec<ExperienceRelation>> {
        let relations = self.txn.open_table(RELATIONS)?;
        let mut ids = Vec::new();
        if matches!(direction, RelationDirection::Out | RelationDirection::Both) {
            let by_source = self.txn.open_table(RELATIONS_BY_SOURCE)?;
            ids.extend(RedbStorage::relation_ids_in_txn(&by_source, id)?);
        }
        if matches!(direction, RelationDirection::In | RelationDirection::Both) {
            let by_target = self.txn.open_table(RELATIONS_BY_TARGET)?;
            ids.extend(RedbStorage::relation_ids_in_txn(&by_target, id)?);
        }
        let mut out = Vec::with_capacity(ids.len());
        for rel_id in ids {
            if let Some(guard) = relations.get(rel_id.as_bytes())? {
                out.push(de::<ExperienceRelation>(guard.value(), "relation")?);
            }
        }
        Ok(out)
    }

    fn get_insight(&self, id: InsightId) -> Result<Option<DerivedInsight>> {
        let table = self.txn.open_table(INSIGHTS)?;
        match table.get(id.as_bytes())? {
            Some(guard) => Ok(Some(de(guard.value(), "insight")?)),
            None => Ok(None),
        }
    }

    fn activities(&self, collective: CollectiveId) -> Result<Vec<Activity>> {
        let table = self.txn.open_table(ACTIVITIES)?;
        let low = activity_key(&collective, "");
        let high = activity_prefix_end(&collective);
        let mut out = Vec::new();
        for item in table.range(low.as_slice()..high.as_slice())? {
            let (_, value) = item?;
            out.push(de::<Activity>(value.value(), "activity")?);
        }
        Ok(out)
    }
}
