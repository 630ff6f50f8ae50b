//! Blended context retrieval types.
//!
//! [`ContextRequest`] configures the composite
//! [`get_context_candidates`](crate::PulseDb::get_context_candidates) query;
//! [`ContextCandidates`] bundles its five sub-results. All sub-results come
//! from one read snapshot, identified by `snapshot_csn`.

use crate::activity::Activity;
use crate::experience::Experience;
use crate::filter::SearchFilter;
use crate::insight::DerivedInsight;
use crate::relation::ExperienceRelation;
use crate::types::{CollectiveId, Csn, Embedding};

/// Parameters for the composite context query.
#[derive(Clone, Debug)]
pub struct ContextRequest {
    /// Collective to query.
    pub collective_id: CollectiveId,

    /// Query embedding; length must equal the collective's dimension.
    pub query: Embedding,

    /// Maximum similarity hits (1-1000).
    pub max_similar: usize,

    /// Maximum recency hits.
    pub max_recent: usize,

    /// Filter applied to both the similarity and the recency legs.
    pub filter: SearchFilter,

    /// Run a k-NN over the collective's insight index with the same query.
    pub include_insights: bool,

    /// Maximum insight hits.
    pub max_insights: usize,

    /// Include agents with a fresh heartbeat.
    pub include_active_agents: bool,

    /// Include relations whose source or target is in `similar ∪ recent`.
    pub include_relations: bool,
}

impl ContextRequest {
    /// A request with typical defaults for the given collective and query.
    pub fn new(collective_id: CollectiveId, query: Embedding) -> Self {
        Self {
            collective_id,
            query,
            max_similar: 10,
            max_recent: 5,
            filter: SearchFilter::default(),
            include_insights: false,
            max_insights: 5,
            include_active_agents: false,
            include_relations: false,
        }
    }
}

/// The snapshot-consistent result bundle.
#[derive(Clone, Debug, Default)]
pub struct ContextCandidates {
    /// Similarity leg: `(experience, similarity)` with similarity
    /// non-increasing.
    pub similar: Vec<(Experience, f32)>,

    /// Recency leg, newest first.
    pub recent: Vec<Experience>,

    /// Insight leg: `(insight, similarity)`, empty unless requested.
    pub insights: Vec<(DerivedInsight, f32)>,

    /// Agents with a heartbeat inside the stale threshold, empty unless
    /// requested.
    pub active_agents: Vec<Activity>,

    /// Relations touching `similar ∪ recent`, empty unless requested.
    pub relations: Vec<ExperienceRelation>,

    /// CSN of the read snapshot every sub-result was taken from.
    pub snapshot_csn: Csn,
}

impl ContextCandidates {
    /// Total number of entries across all five legs.
    pub fn len(&self) -> usize {
        self.similar.len()
            + self.recent.len()
            + self.insights.len()
            + self.active_agents.len()
            + self.relations.len()
    }

    /// True when every leg is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
