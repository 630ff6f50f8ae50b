//! Typed, directed edges between experiences.
//!
//! Relations connect two experiences in the same collective. The triple
//! `(source, target, type)` is unique; self-relations and cross-collective
//! relations are rejected. Deleting either endpoint cascades to the
//! relation.

use serde::{Deserialize, Serialize};

use crate::error::{PulseError, ValidationError};
use crate::types::{ExperienceId, RelationId, Timestamp};

/// Maximum relation metadata size in bytes (10 KiB).
pub const MAX_RELATION_METADATA_SIZE: usize = 10 * 1024;

/// Semantics of a directed relation, read source → target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationType {
    /// Source supports or reinforces the target.
    Supports,
    /// Source contradicts the target.
    Contradicts,
    /// Source elaborates on the target.
    Elaborates,
    /// Source supersedes the target.
    Supersedes,
    /// Source implies the target.
    Implies,
    /// Generic association.
    RelatedTo,
}

/// Which edges to follow when querying relations of an experience.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelationDirection {
    /// Edges where the experience is the source.
    Out,
    /// Edges where the experience is the target.
    In,
    /// Both directions.
    Both,
}

/// A stored relation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExperienceRelation {
    /// Unique identifier (UUID v7).
    pub id: RelationId,

    /// Origin experience.
    pub source_id: ExperienceId,

    /// Destination experience. Same collective as the source, never equal
    /// to it.
    pub target_id: ExperienceId,

    /// Relationship semantics.
    pub relation_type: RelationType,

    /// Strength of the connection, 0.0-1.0.
    pub strength: f32,

    /// Optional free-form metadata (JSON string, ≤ 10 KiB).
    pub metadata: Option<String>,

    /// When the relation was created.
    pub created_at: Timestamp,
}

/// Input for [`store_relation`](crate::PulseDb::store_relation).
#[derive(Clone, Debug)]
pub struct NewRelation {
    /// Origin experience.
    pub source_id: ExperienceId,

    /// Destination experience.
    pub target_id: ExperienceId,

    /// Relationship semantics.
    pub relation_type: RelationType,

    /// Strength of the connection, 0.0-1.0.
    pub strength: f32,

    /// Optional free-form metadata (JSON string, ≤ 10 KiB).
    pub metadata: Option<String>,
}

/// Structural validation; existence and collective checks need storage and
/// happen in the facade.
pub(crate) fn validate_new_relation(rel: &NewRelation) -> Result<(), PulseError> {
    if rel.source_id == rel.target_id {
        return Err(ValidationError::invalid_field(
            "target_id",
            "self-relations are not allowed",
        )
        .into());
    }
    if !rel.strength.is_finite() {
        return Err(ValidationError::non_finite("strength").into());
    }
    if !(0.0..=1.0).contains(&rel.strength) {
        return Err(ValidationError::invalid_field(
            "strength",
            format!("must be between 0.0 and 1.0, got {}", rel.strength),
        )
        .into());
    }
    if let Some(ref metadata) = rel.metadata {
        if metadata.len() > MAX_RELATION_METADATA_SIZE {
            return Err(ValidationError::content_too_large(
                metadata.len(),
                MAX_RELATION_METADATA_SIZE,
            )
            .into());
        }
    }
    Ok(())
}
