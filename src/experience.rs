//! Experiences: the unit of learned knowledge.
//!
//! An experience pairs text content with a semantic embedding and typed
//! metadata. Content and embedding are immutable after recording; scores,
//! tags and the archived flag are mutable through
//! [`ExperienceUpdate`].
//!
//! The rich [`ExperienceType`] enum carries variant-specific data. For the
//! type index key, [`ExperienceType::tag`] compresses each variant to a
//! 1-byte discriminant (0-8).

use serde::{Deserialize, Serialize};

use crate::error::{PulseError, ValidationError};
use crate::types::{AgentId, CollectiveId, Embedding, ExperienceId, TaskId, Timestamp};

/// Maximum content size in bytes (100 KiB).
pub const MAX_CONTENT_SIZE: usize = 100 * 1024;

/// Maximum number of domain tags per experience.
pub const MAX_DOMAIN_TAGS: usize = 10;

/// Maximum length of a single domain tag in bytes.
pub const MAX_TAG_LENGTH: usize = 100;

/// Maximum number of source file paths per experience.
pub const MAX_SOURCE_FILES: usize = 10;

/// Maximum length of a single source file path in bytes.
pub const MAX_FILE_PATH_LENGTH: usize = 500;

/// Maximum length of an agent id in bytes.
pub const MAX_AGENT_ID_LENGTH: usize = 255;

/// Severity of a [`ExperienceType::Difficulty`] experience.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    /// Minor impact, easily worked around.
    Low,
    /// Noticeable impact, workaround available.
    Medium,
    /// Significant impact, blocks progress.
    High,
    /// Showstopper.
    Critical,
}

/// Rich experience type with per-variant associated data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ExperienceType {
    /// A problem the agent ran into.
    Difficulty {
        /// What the problem is.
        description: String,
        /// How badly it hurt.
        severity: Severity,
    },

    /// A fix, optionally linked to the difficulty it resolves.
    Solution {
        /// The difficulty this solves, if recorded.
        problem_ref: Option<ExperienceId>,
        /// The approach taken.
        approach: String,
        /// Whether it actually worked.
        worked: bool,
    },

    /// A reusable error signature with fix and prevention.
    ErrorPattern {
        /// Error signature (code, message pattern).
        signature: String,
        /// How to fix occurrences.
        fix: String,
        /// How to avoid it next time.
        prevention: String,
    },

    /// A proven approach with a quality rating.
    SuccessPattern {
        /// Kind of task the pattern applies to.
        task_type: String,
        /// The approach that works.
        approach: String,
        /// Outcome quality, 0.0-1.0.
        quality: f32,
    },

    /// A user preference with strength.
    UserPreference {
        /// Preference category ("style", "tooling").
        category: String,
        /// The preference itself.
        preference: String,
        /// How strongly the user holds it, 0.0-1.0.
        strength: f32,
    },

    /// A design decision with rationale.
    ArchitecturalDecision {
        /// The decision made.
        decision: String,
        /// Why it was made.
        rationale: String,
    },

    /// Technical knowledge about a specific technology.
    TechInsight {
        /// The technology concerned.
        technology: String,
        /// The insight.
        insight: String,
    },

    /// A verified factual statement with its source.
    Fact {
        /// The statement.
        statement: String,
        /// Where it was verified.
        source: String,
    },

    /// Catch-all for uncategorized experiences.
    Generic {
        /// Optional free-form category label.
        category: Option<String>,
    },
}

impl ExperienceType {
    /// The 1-byte discriminant used in `exp_by_type` index keys.
    pub fn tag(&self) -> u8 {
        match self {
            Self::Difficulty { .. } => 0,
            Self::Solution { .. } => 1,
            Self::ErrorPattern { .. } => 2,
            Self::SuccessPattern { .. } => 3,
            Self::UserPreference { .. } => 4,
            Self::ArchitecturalDecision { .. } => 5,
            Self::TechInsight { .. } => 6,
            Self::Fact { .. } => 7,
            Self::Generic { .. } => 8,
        }
    }
}

impl Default for ExperienceType {
    fn default() -> Self {
        Self::Generic { category: None }
    }
}

/// A stored experience.
///
/// The embedding is persisted in its own table as raw f32 bytes and skipped
/// during row serialization; the storage layer reconstitutes it on read.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Experience {
    /// Unique identifier (UUID v7).
    pub id: ExperienceId,

    /// Owning collective.
    pub collective_id: CollectiveId,

    /// Text content. Immutable.
    pub content: String,

    /// Embedding vector, length equal to the collective's frozen dimension.
    /// Immutable. Stored separately; empty after bare row deserialization.
    #[serde(skip)]
    pub embedding: Embedding,

    /// Rich experience type.
    pub experience_type: ExperienceType,

    /// Importance score, 0.0-1.0.
    pub importance: f32,

    /// Confidence score, 0.0-1.0.
    pub confidence: f32,

    /// How many times this experience has been applied.
    pub application_count: u32,

    /// Domain tags for categorical filtering.
    pub domain_tags: Vec<String>,

    /// Related source file paths.
    pub source_files: Vec<String>,

    /// The agent that recorded this experience, if known.
    pub source_agent: Option<AgentId>,

    /// Task context the experience came from, if any.
    pub source_task: Option<TaskId>,

    /// When the experience was recorded.
    pub created_at: Timestamp,

    /// When a mutable field last changed.
    pub updated_at: Timestamp,

    /// Soft-delete flag; archived experiences leave the vector index.
    pub archived: bool,
}

/// Input for [`record_experience`](crate::PulseDb::record_experience).
///
/// `id`, timestamps, `application_count` and `archived` are assigned by the
/// engine. With the `External` provider the embedding is required; with
/// `Builtin` it may be omitted and is generated from the content.
#[derive(Clone, Debug)]
pub struct NewExperience {
    /// Target collective.
    pub collective_id: CollectiveId,

    /// Text content.
    pub content: String,

    /// Rich experience type.
    pub experience_type: ExperienceType,

    /// Pre-computed embedding (required for the External provider).
    pub embedding: Option<Embedding>,

    /// Importance score, 0.0-1.0.
    pub importance: f32,

    /// Confidence score, 0.0-1.0.
    pub confidence: f32,

    /// Domain tags.
    pub domain_tags: Vec<String>,

    /// Related source file paths.
    pub source_files: Vec<String>,

    /// Recording agent, if known.
    pub source_agent: Option<AgentId>,

    /// Task context, if any.
    pub source_task: Option<TaskId>,
}

impl Default for NewExperience {
    fn default() -> Self {
        Self {
            collective_id: CollectiveId::nil(),
            content: String::new(),
            experience_type: ExperienceType::default(),
            embedding: None,
            importance: 0.5,
            confidence: 0.5,
            domain_tags: Vec::new(),
            source_files: Vec::new(),
            source_agent: None,
            source_task: None,
        }
    }
}

/// Partial update of an experience's mutable fields.
///
/// Only `Some(..)` fields change. Content and embedding are immutable;
/// record a new experience instead of editing them.
#[derive(Clone, Debug, Default)]
pub struct ExperienceUpdate {
    /// New importance score.
    pub importance: Option<f32>,

    /// New confidence score.
    pub confidence: Option<f32>,

    /// Replacement domain tags.
    pub domain_tags: Option<Vec<String>>,

    /// Replacement source file paths.
    pub source_files: Option<Vec<String>>,

    /// New archived state (used by archive/unarchive).
    pub archived: Option<bool>,
}

impl ExperienceUpdate {
    /// True when no field is set.
    pub fn is_empty(&self) -> bool {
        self.importance.is_none()
            && self.confidence.is_none()
            && self.domain_tags.is_none()
            && self.source_files.is_none()
            && self.archived.is_none()
    }
}

fn check_unit_score(field: &'static str, value: f32) -> Result<(), PulseError> {
    if !value.is_finite() {
        return Err(ValidationError::non_finite(field).into());
    }
    if !(0.0..=1.0).contains(&value) {
        return Err(ValidationError::invalid_field(
            field,
            format!("must be between 0.0 and 1.0, got {value}"),
        )
        .into());
    }
    Ok(())
}

fn check_tags(
    field: &'static str,
    items: &[String],
    max_items: usize,
    max_len: usize,
) -> Result<(), PulseError> {
    if items.len() > max_items {
        return Err(ValidationError::too_many_items(field, items.len(), max_items).into());
    }
    for (i, item) in items.iter().enumerate() {
        if item.len() > max_len {
            return Err(ValidationError::invalid_field(
                field,
                format!(
                    "item {i} exceeds max length of {max_len} bytes (got {})",
                    item.len()
                ),
            )
            .into());
        }
    }
    Ok(())
}

/// Rejects embeddings containing NaN or infinite components.
pub(crate) fn check_finite_vector(field: &'static str, vector: &[f32]) -> Result<(), PulseError> {
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(ValidationError::non_finite(field).into());
    }
    Ok(())
}

/// Validates a [`NewExperience`] against the collective's frozen dimension.
pub(crate) fn validate_new_experience(
    exp: &NewExperience,
    collective_dimension: usize,
    embedding_required: bool,
) -> Result<(), PulseError> {
    if exp.content.is_empty() {
        return Err(ValidationError::required_field("content").into());
    }
    if exp.content.len() > MAX_CONTENT_SIZE {
        return Err(ValidationError::content_too_large(exp.content.len(), MAX_CONTENT_SIZE).into());
    }

    check_unit_score("importance", exp.importance)?;
    check_unit_score("confidence", exp.confidence)?;
    check_tags("domain_tags", &exp.domain_tags, MAX_DOMAIN_TAGS, MAX_TAG_LENGTH)?;
    check_tags(
        "source_files",
        &exp.source_files,
        MAX_SOURCE_FILES,
        MAX_FILE_PATH_LENGTH,
    )?;

    if embedding_required && exp.embedding.is_none() {
        return Err(ValidationError::required_field("embedding").into());
    }
    if let Some(ref emb) = exp.embedding {
        if emb.len() != collective_dimension {
            return Err(
                ValidationError::dimension_mismatch(collective_dimension, emb.len()).into(),
            );
        }
        check_finite_vector("embedding", emb)?;
    }

    if let Some(ref agent) = exp.source_agent {
        if agent.as_str().is_empty() {
            return Err(ValidationError::invalid_field("source_agent", "must not be empty").into());
        }
        if agent.as_str().len() > MAX_AGENT_ID_LENGTH {
            return Err(ValidationError::invalid_field(
                "source_agent",
                format!(
                    "exceeds max length of {MAX_AGENT_ID_LENGTH} bytes (got {})",
                    agent.as_str().len()
                ),
            )
            .into());
        }
    }

    validate_experience_type(&exp.experience_type)
}

/// Validates an [`ExperienceUpdate`].
pub(crate) fn validate_experience_update(update: &ExperienceUpdate) -> Result<(), PulseError> {
    if let Some(importance) = update.importance {
        check_unit_score("importance", importance)?;
    }
    if let Some(confidence) = update.confidence {
        check_unit_score("confidence", confidence)?;
    }
    if let Some(ref tags) = update.domain_tags {
        check_tags("domain_tags", tags, MAX_DOMAIN_TAGS, MAX_TAG_LENGTH)?;
    }
    if let Some(ref files) = update.source_files {
        check_tags("source_files", files, MAX_SOURCE_FILES, MAX_FILE_PATH_LENGTH)?;
    }
    Ok(())
}

/// Variant-specific score validation.
fn validate_experience_type(et: &ExperienceType) -> Result<(), PulseError> {
    match et {
        ExperienceType::SuccessPattern { quality, .. } => {
            check_unit_score("experience_type.quality", *quality)
        }
        ExperienceType::UserPreference { strength, .. } => {
            check_unit_score("experience_type.strength", *strength)
        }
        _ => Ok(()),
    }
}
