//! Derived insights: synthesized knowledge over experiences.
//!
//! Insights are computed by consumers (synthesis itself is out of scope)
//! and stored with their own per-collective vector index, so they can be
//! searched like experiences without mixing into experience results.
//! Embeddings are kept inline in the row: insights are far fewer than
//! experiences and are always loaded with their embedding for rebuilds.

use serde::{Deserialize, Serialize};

use crate::error::{PulseError, ValidationError};
use crate::experience::check_finite_vector;
use crate::types::{CollectiveId, Embedding, ExperienceId, InsightId, Timestamp};

/// Maximum insight content size in bytes (50 KiB).
pub const MAX_INSIGHT_CONTENT_SIZE: usize = 50 * 1024;

/// Maximum number of source experiences per insight.
pub const MAX_INSIGHT_SOURCES: usize = 100;

/// Kind of synthesis that produced an insight.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InsightType {
    /// A recurring pattern across experiences.
    Pattern,
    /// A combination of knowledge from several experiences.
    Synthesis,
    /// A generalization of specific experiences.
    Abstraction,
    /// A detected correlation.
    Correlation,
}

/// A stored derived insight.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DerivedInsight {
    /// Unique identifier (UUID v7).
    pub id: InsightId,

    /// Owning collective.
    pub collective_id: CollectiveId,

    /// Insight content.
    pub content: String,

    /// Embedding vector, stored inline.
    pub embedding: Embedding,

    /// Experiences this insight was derived from.
    pub source_experience_ids: Vec<ExperienceId>,

    /// Kind of derivation.
    pub insight_type: InsightType,

    /// Confidence, 0.0-1.0.
    pub confidence: f32,

    /// Domain tags.
    pub domain_tags: Vec<String>,

    /// When the insight was stored.
    pub created_at: Timestamp,
}

/// Input for [`store_insight`](crate::PulseDb::store_insight).
#[derive(Clone, Debug)]
pub struct NewInsight {
    /// Target collective.
    pub collective_id: CollectiveId,

    /// Insight content.
    pub content: String,

    /// Pre-computed embedding (required for the External provider).
    pub embedding: Option<Embedding>,

    /// Experiences this insight was derived from (1-100).
    pub source_experience_ids: Vec<ExperienceId>,

    /// Kind of derivation.
    pub insight_type: InsightType,

    /// Confidence, 0.0-1.0.
    pub confidence: f32,

    /// Domain tags.
    pub domain_tags: Vec<String>,
}

/// Structural validation; collective and source existence checks happen in
/// the facade.
pub(crate) fn validate_new_insight(
    insight: &NewInsight,
    collective_dimension: usize,
    embedding_required: bool,
) -> Result<(), PulseError> {
    if insight.content.is_empty() {
        return Err(ValidationError::required_field("content").into());
    }
    if insight.content.len() > MAX_INSIGHT_CONTENT_SIZE {
        return Err(ValidationError::content_too_large(
            insight.content.len(),
            MAX_INSIGHT_CONTENT_SIZE,
        )
        .into());
    }
    if !insight.confidence.is_finite() {
        return Err(ValidationError::non_finite("confidence").into());
    }
    if !(0.0..=1.0).contains(&insight.confidence) {
        return Err(ValidationError::invalid_field(
            "confidence",
            format!("must be between 0.0 and 1.0, got {}", insight.confidence),
        )
        .into());
    }
    if insight.source_experience_ids.is_empty() {
        return Err(ValidationError::required_field("source_experience_ids").into());
    }
    if insight.source_experience_ids.len() > MAX_INSIGHT_SOURCES {
        return Err(ValidationError::too_many_items(
            "source_experience_ids",
            insight.source_experience_ids.len(),
            MAX_INSIGHT_SOURCES,
        )
        .into());
    }
    if embedding_required && insight.embedding.is_none() {
        return Err(ValidationError::required_field("embedding").into());
    }
    if let Some(ref emb) = insight.embedding {
        if emb.len() != collective_dimension {
            return Err(
                ValidationError::dimension_mismatch(collective_dimension, emb.len()).into(),
            );
        }
        check_finite_vector("embedding", emb)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_insight() -> NewInsight {
        NewInsight {
            collective_id: CollectiveId::new(),
            content: "error handling converges on early return".into(),
            embedding: Some(vec![0.2; 384]),
            source_experience_ids: vec![ExperienceId::new(), ExperienceId::new()],
            insight_type: InsightType::Pattern,
            confidence: 0.85,
            domain_tags: vec!["rust".into()],
        }
    }

    #[test]
    fn test_valid_insight_passes() {
        assert!(validate_new_insight(&valid_insight(), 384, true).is_ok());
    }

    #[test]
    fn test_empty_content_rejected() {
        let mut ins = valid_insight();
        ins.content = String::new();
        assert!(validate_new_insight(&ins, 384, true).is_err());
    }

    #[test]
    fn test_content_size_boundary() {
        let mut ins = valid_insight();
        ins.content = "x".repeat(MAX_INSIGHT_CONTENT_SIZE);
        assert!(validate_new_insight(&ins, 384, true).is_ok());
        ins.content = "x".repeat(MAX_INSIGHT_CONTENT_SIZE + 1);
        assert!(validate_new_insight(&ins, 384, true).is_err());
    }

    #[test]
    fn test_confidence_bounds() {
        let mut ins = valid_insight();
        for v in [0.0, 1.0] {
            ins.confidence = v;
            assert!(validate_new_insight(&ins, 384, true).is_ok());
        }
        for v in [-0.1, 1.01, f32::NAN] {
            ins.confidence = v;
            assert!(validate_new_insight(&ins, 384, true).is_err());
        }
    }

    #[test]
    fn test_source_count_bounds() {
        let mut ins = valid_insight();
        ins.source_experience_ids = vec![];
        assert!(validate_new_insight(&ins, 384, true).is_err());

        ins.source_experience_ids = (0..MAX_INSIGHT_SOURCES).map(|_| ExperienceId::new()).collect();
        assert!(validate_new_insight(&ins, 384, true).is_ok());

        ins.source_experience_ids.push(ExperienceId::new());
        assert!(validate_new_insight(&ins, 384, true).is_err());
    }

    #[test]
    fn test_embedding_rules() {
        let mut ins = valid_insight();
        ins.embedding = None;
        assert!(validate_new_insight(&ins, 384, true).is_err());
        assert!(validate_new_insight(&ins, 384, false).is_ok());

        ins.embedding = Some(vec![0.2; 100]);
        assert!(validate_new_insight(&ins, 384, true).is_err());

        let mut emb = vec![0.2; 384];
        emb[0] = f32::NEG_INFINITY;
        ins.embedding = Some(emb);
        assert!(validate_new_insight(&ins, 384, true).is_err());
    }

    #[test]
    fn test_insight_bincode_roundtrip() {
        let ins = DerivedInsight {
            id: InsightId::new(),
            collective_id: CollectiveId::new(),
            content: "c".into(),
            embedding: vec![0.1, 0.2, 0.3],
            source_experience_ids: vec![ExperienceId::new()],
            insight_type: InsightType::Correlation,
            confidence: 0.7,
            domain_tags: vec!["x".into()],
            created_at: Timestamp::now(),
        };
        let bytes = bincode::serialize(&ins).unwrap();
        let back: DerivedInsight = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.id, ins.id);
        assert_eq!(back.embedding, ins.embedding);
        assert_eq!(back.insight_type, ins.insight_type);
    }
}
