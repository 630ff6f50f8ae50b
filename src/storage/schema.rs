//! Table definitions, key encodings and schema versioning.
//!
//! Compound key layouts are part of the on-disk contract and must stay
//! bit-compatible within a major release:
//!
//! ```text
//! exp_by_collective   [collective: 16][created_at BE: 8][experience: 16] = 40
//! exp_by_type         [collective: 16][type tag: 1][experience: 16]     = 33
//! relations_by_*      [experience: 16][relation: 16]                    = 32
//! insights_by_coll.   [collective: 16][insight: 16]                     = 32
//! activities          [collective: 16][agent id bytes]                  = var
//! changes             [csn BE: 8]                                       = 8
//! ```
//!
//! Big-endian timestamps and CSNs make lexicographic key order equal
//! numeric order, so reverse range scans walk newest-first.

use redb::TableDefinition;
use serde::{Deserialize, Serialize};

use crate::config::EmbeddingDimension;
use crate::error::{Result, StorageError};
use crate::types::{CollectiveId, ExperienceId, InsightId, Timestamp};

/// Current schema version. Bump on breaking layout changes and register a
/// migration for the old version.
pub const SCHEMA_VERSION: u32 = 1;

/// Metadata table key holding the serialized [`DatabaseMetadata`].
pub(crate) const META_KEY_DATABASE: &str = "db_metadata";

/// Metadata table key holding the current CSN as big-endian u64 bytes.
pub(crate) const META_KEY_CSN: &str = "csn";

/// Metadata table key holding the approximate stored payload bytes.
pub(crate) const META_KEY_TOTAL_BYTES: &str = "total_bytes";

/// How many changelog rows are retained; older rows are pruned on write.
pub(crate) const CHANGELOG_WINDOW: u64 = 16_384;

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

/// Database-wide metadata: version, CSN, byte accounting.
pub(crate) const METADATA: TableDefinition<&str, &[u8]> = TableDefinition::new("metadata");

/// Collective rows keyed by id.
pub(crate) const COLLECTIVES: TableDefinition<&[u8; 16], &[u8]> =
    TableDefinition::new("collectives");

/// Experience rows (without embeddings) keyed by id.
pub(crate) const EXPERIENCES: TableDefinition<&[u8; 16], &[u8]> =
    TableDefinition::new("experiences");

/// Raw little-endian f32 embedding bytes keyed by experience id.
pub(crate) const EMBEDDINGS: TableDefinition<&[u8; 16], &[u8]> = TableDefinition::new("embeddings");

/// Recency index: `(collective, created_at BE, experience)` with unit value.
pub(crate) const EXP_BY_COLLECTIVE: TableDefinition<&[u8; 40], ()> =
    TableDefinition::new("exp_by_collective");

/// Type index: `(collective, type tag, experience)` with unit value.
pub(crate) const EXP_BY_TYPE: TableDefinition<&[u8; 33], ()> = TableDefinition::new("exp_by_type");

/// Relation rows keyed by id.
pub(crate) const RELATIONS: TableDefinition<&[u8; 16], &[u8]> = TableDefinition::new("relations");

/// Relation index by source experience.
pub(crate) const RELATIONS_BY_SOURCE: TableDefinition<&[u8; 32], ()> =
    TableDefinition::new("relations_by_source");

/// Relation index by target experience.
pub(crate) const RELATIONS_BY_TARGET: TableDefinition<&[u8; 32], ()> =
    TableDefinition::new("relations_by_target");

/// Insight rows (embedding inline) keyed by id.
pub(crate) const INSIGHTS: TableDefinition<&[u8; 16], &[u8]> = TableDefinition::new("insights");

/// Insight index by collective.
pub(crate) const INSIGHTS_BY_COLLECTIVE: TableDefinition<&[u8; 32], ()> =
    TableDefinition::new("insights_by_collective");

/// Activity rows keyed by `(collective, agent id bytes)`.
pub(crate) const ACTIVITIES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("activities");

/// Changelog rows keyed by big-endian CSN.
pub(crate) const CHANGES: TableDefinition<&[u8; 8], &[u8]> = TableDefinition::new("changes");

// ---------------------------------------------------------------------------
// Database metadata
// ---------------------------------------------------------------------------

/// Database-wide metadata stored under [`META_KEY_DATABASE`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseMetadata {
    /// Schema version of the on-disk layout.
    pub schema_version: u32,

    /// Default embedding dimension the database was created with.
    pub default_dimension: EmbeddingDimension,

    /// When the database file was created.
    pub created_at: Timestamp,

    /// When the database was last opened.
    pub last_opened_at: Timestamp,
}

impl DatabaseMetadata {
    /// Metadata for a freshly initialized database.
    pub fn new(default_dimension: EmbeddingDimension) -> Self {
        let now = Timestamp::now();
        Self {
            schema_version: SCHEMA_VERSION,
            default_dimension,
            created_at: now,
            last_opened_at: now,
        }
    }

    /// Refreshes the last-opened timestamp.
    pub fn touch(&mut self) {
        self.last_opened_at = Timestamp::now();
    }
}

// ---------------------------------------------------------------------------
// Changelog
// ---------------------------------------------------------------------------

/// What a committed change did, recorded in the changelog.
///
/// The changelog serves two consumers: vector-index catch-up after a crash
/// (`built_at_csn` replay) and `poll_changes`. Entries for relation and
/// activity writes are not recorded; their CSNs appear as gaps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Experience recorded.
    Created,
    /// Mutable experience fields changed (includes reinforce).
    Updated,
    /// Experience archived (left the vector index).
    Archived,
    /// Experience unarchived (re-entered the vector index).
    Unarchived,
    /// Experience deleted.
    Deleted,
    /// Insight stored.
    InsightStored,
    /// Insight deleted.
    InsightDeleted,
}

/// Which entity a changelog row concerns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeEntity {
    /// An experience.
    Experience(ExperienceId),
    /// An insight.
    Insight(InsightId),
}

/// A committed logical change, keyed by its CSN.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Collective the change happened in.
    pub collective_id: CollectiveId,

    /// Affected entity.
    pub entity: ChangeEntity,

    /// What happened.
    pub kind: ChangeKind,

    /// Commit wall-clock time.
    pub timestamp: Timestamp,
}

// ---------------------------------------------------------------------------
// Key encoding helpers
// ---------------------------------------------------------------------------

/// Encodes an `exp_by_collective` key.
#[inline]
pub(crate) fn recency_key(
    collective: &CollectiveId,
    created_at: Timestamp,
    experience: &ExperienceId,
) -> [u8; 40] {
    let mut key = [0u8; 40];
    key[..16].copy_from_slice(collective.as_bytes());
    key[16..24].copy_from_slice(&created_at.to_be_bytes());
    key[24..].copy_from_slice(experience.as_bytes());
    key
}

/// Inclusive bounds covering every recency key of a collective.
#[inline]
pub(crate) fn recency_bounds(collective: &CollectiveId) -> ([u8; 40], [u8; 40]) {
    let mut low = [0u8; 40];
    let mut high = [0xFFu8; 40];
    low[..16].copy_from_slice(collective.as_bytes());
    high[..16].copy_from_slice(collective.as_bytes());
    (low, high)
}

/// Decodes the experience id out of a recency key.
#[inline]
pub(crate) fn recency_key_experience(key: &[u8; 40]) -> ExperienceId {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&key[24..]);
    ExperienceId::from_bytes(bytes)
}

/// Encodes an `exp_by_type` key.
#[inline]
pub(crate) fn type_key(
    collective: &CollectiveId,
    tag: u8,
    experience: &ExperienceId,
) -> [u8; 33] {
    let mut key = [0u8; 33];
    key[..16].copy_from_slice(collective.as_bytes());
    key[16] = tag;
    key[17..].copy_from_slice(experience.as_bytes());
    key
}

/// Encodes a two-id index key (relations and insight indexes).
#[inline]
pub(crate) fn pair_key(first: &[u8; 16], second: &[u8; 16]) -> [u8; 32] {
    let mut key = [0u8; 32];
    key[..16].copy_from_slice(first);
    key[16..].copy_from_slice(second);
    key
}

/// Inclusive bounds covering every pair key with the given prefix.
#[inline]
pub(crate) fn pair_bounds(prefix: &[u8; 16]) -> ([u8; 32], [u8; 32]) {
    let mut low = [0u8; 32];
    let mut high = [0xFFu8; 32];
    low[..16].copy_from_slice(prefix);
    high[..16].copy_from_slice(prefix);
    (low, high)
}

/// Decodes the second id out of a pair key.
#[inline]
pub(crate) fn pair_key_second(key: &[u8; 32]) -> [u8; 16] {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&key[16..]);
    bytes
}

/// Encodes an activity key: collective bytes followed by the agent id.
#[inline]
pub(crate) fn activity_key(collective: &CollectiveId, agent_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(16 + agent_id.len());
    key.extend_from_slice(collective.as_bytes());
    key.extend_from_slice(agent_id.as_bytes());
    key
}

/// Exclusive upper bound for an activity prefix scan: the collective id
/// treated as a 128-bit big-endian integer, plus one.
#[inline]
pub(crate) fn activity_prefix_end(collective: &CollectiveId) -> Vec<u8> {
    let mut end = *collective.as_bytes();
    for byte in end.iter_mut().rev() {
        if *byte < 0xFF {
            *byte += 1;
            return end.to_vec();
        }
        *byte = 0;
    }
    // All-0xFF collective id: unbounded above, cover everything after it.
    vec![0xFFu8; 17]
}

// ---------------------------------------------------------------------------
// Migrations
// ---------------------------------------------------------------------------

/// A forward schema migration, run inside a single write transaction.
pub(crate) struct Migration {
    /// Version this migration upgrades from.
    pub from: u32,
    /// Version it leaves the database at.
    pub to: u32,
    /// Human-readable name for logs.
    pub name: &'static str,
    /// The migration body.
    pub run: fn(&redb::WriteTransaction) -> Result<()>,
}

/// The ordered migration registry. Empty at schema version 1; future
/// versions append here.
pub(crate) fn migrations() -> &'static [Migration] {
    &[]
}

/// Finds the migration stepping forward from `version`.
pub(crate) fn migration_from(version: u32) -> Result<&'static Migration> {
    migrations()
        .iter()
        .find(|m| m.from == version)
        .ok_or_else(|| {
            StorageError::corrupted(format!(
                "no migration path from schema version {version} to {SCHEMA_VERSION}"
            ))
            .into()
        })
}
