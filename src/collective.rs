//! Collectives: the isolation boundary for experiences.
//!
//! Every experience, relation, insight and activity belongs to exactly one
//! collective. The embedding dimension is frozen when the collective is
//! created; all vectors stored under it must match.

use serde::{Deserialize, Serialize};

use crate::error::{PulseError, ValidationError};
use crate::types::{CollectiveId, Timestamp};

/// Maximum collective name length in bytes.
pub const MAX_NAME_LENGTH: usize = 255;

/// A collective row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Collective {
    /// Unique identifier (UUID v7).
    pub id: CollectiveId,

    /// Human-readable name.
    pub name: String,

    /// Optional owner for multi-tenant filtering.
    pub owner_id: Option<String>,

    /// Embedding dimension frozen at creation.
    pub embedding_dimension: u16,

    /// Number of experiences currently stored, maintained by the write path.
    pub experience_count: u64,

    /// When the collective was created.
    pub created_at: Timestamp,

    /// When the collective row last changed.
    pub updated_at: Timestamp,
}

impl Collective {
    /// Builds a fresh collective with a frozen dimension.
    pub fn new(name: impl Into<String>, embedding_dimension: u16) -> Self {
        let now = Timestamp::now();
        Self {
            id: CollectiveId::new(),
            name: name.into(),
            owner_id: None,
            embedding_dimension,
            experience_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builds a fresh collective with an owner.
    pub fn with_owner(
        name: impl Into<String>,
        owner_id: impl Into<String>,
        embedding_dimension: u16,
    ) -> Self {
        let mut collective = Self::new(name, embedding_dimension);
        collective.owner_id = Some(owner_id.into());
        collective
    }

    /// The frozen dimension as a plain number.
    #[inline]
    pub fn dimension(&self) -> usize {
        self.embedding_dimension as usize
    }
}

/// Aggregate statistics for a collective.
#[derive(Clone, Debug, Default)]
pub struct CollectiveStats {
    /// Number of stored experiences (archived included).
    pub experience_count: u64,

    /// Number of stored insights.
    pub insight_count: u64,

    /// Number of agents whose heartbeat is within the stale threshold.
    pub active_agent_count: u64,
}

/// Validates a collective name: non-empty, not whitespace-only, ≤ 255 bytes.
pub(crate) fn validate_collective_name(name: &str) -> Result<(), PulseError> {
    if name.is_empty() || name.trim().is_empty() {
        return Err(ValidationError::required_field("name").into());
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(ValidationError::invalid_field(
            "name",
            format!(
                "exceeds max length of {MAX_NAME_LENGTH} bytes (got {})",
                name.len()
            ),
        )
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_collective() {
        let c = Collective::new("my-project", 384);
        assert_eq!(c.name, "my-project");
        assert_eq!(c.dimension(), 384);
        assert_eq!(c.experience_count, 0);
        assert!(c.owner_id.is_none());
        assert_eq!(c.created_at, c.updated_at);
    }

    #[test]
    fn test_with_owner() {
        let c = Collective::with_owner("team-db", "tenant-9", 768);
        assert_eq!(c.owner_id.as_deref(), Some("tenant-9"));
        assert_eq!(c.dimension(), 768);
    }

    #[test]
    fn test_bincode_roundtrip() {
        let c = Collective::with_owner("roundtrip", "o", 384);
        let bytes = bincode::serialize(&c).unwrap();
        let back: Collective = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.id, c.id);
        assert_eq!(back.name, c.name);
        assert_eq!(back.owner_id, c.owner_id);
        assert_eq!(back.embedding_dimension, c.embedding_dimension);
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_collective_name("ok").is_ok());
        assert!(validate_collective_name(&"n".repeat(MAX_NAME_LENGTH)).is_ok());

        assert!(validate_collective_name("").is_err());
        assert!(validate_collective_name("   ").is_err());
        assert!(validate_collective_name(&"n".repeat(MAX_NAME_LENGTH + 1)).is_err());
    }
}
