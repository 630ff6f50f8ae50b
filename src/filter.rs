//! Search filters.
//!
//! [`SearchFilter`] narrows recency scans and similarity searches. During
//! vector search it is evaluated inside the graph traversal (so `k` results
//! survive aggressive filtering); during recency scans it is applied per
//! row. All set conditions must match.

use crate::experience::Experience;
use crate::types::Timestamp;

/// Filter criteria for experience queries.
///
/// Unset fields do not filter. `exclude_archived` defaults to `true`;
/// set it to `false` to opt archived experiences back into results.
///
/// ```rust
/// use pulsedb::SearchFilter;
///
/// let filter = SearchFilter {
///     domains: Some(vec!["rust".into()]),
///     min_importance: Some(0.5),
///     ..SearchFilter::default()
/// };
/// ```
#[derive(Clone, Debug)]
pub struct SearchFilter {
    /// Keep experiences sharing at least one of these domain tags.
    /// `Some(vec![])` matches nothing.
    pub domains: Option<Vec<String>>,

    /// Keep experiences whose type tag is in this set (associated data is
    /// ignored; any `Solution { .. }` matches a `Solution` entry).
    pub type_tags: Option<Vec<u8>>,

    /// Keep experiences with `importance >= min_importance`.
    pub min_importance: Option<f32>,

    /// Keep experiences with `confidence >= min_confidence`.
    pub min_confidence: Option<f32>,

    /// Keep experiences created at or after this timestamp.
    pub since: Option<Timestamp>,

    /// Drop archived experiences (default `true`).
    pub exclude_archived: bool,
}

impl Default for SearchFilter {
    fn default() -> Self {
        Self {
            domains: None,
            type_tags: None,
            min_importance: None,
            min_confidence: None,
            since: None,
            exclude_archived: true,
        }
    }
}

impl SearchFilter {
    /// True when the experience passes every set condition.
    pub fn matches(&self, experience: &Experience) -> bool {
        if self.exclude_archived && experience.archived {
            return false;
        }
        if let Some(ref domains) = self.domains {
            let overlap = experience
                .domain_tags
                .iter()
                .any(|tag| domains.iter().any(|d| d == tag));
            if !overlap {
                return false;
            }
        }
        if let Some(ref tags) = self.type_tags {
            if !tags.contains(&experience.experience_type.tag()) {
                return false;
            }
        }
        if let Some(min) = self.min_importance {
            if experience.importance < min {
                return false;
            }
        }
        if let Some(min) = self.min_confidence {
            if experience.confidence < min {
                return false;
            }
        }
        if let Some(since) = self.since {
            if experience.created_at < since {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experience::ExperienceType;
    use crate::types::{CollectiveId, ExperienceId};

    fn sample() -> Experience {
        Experience {
            id: ExperienceId::new(),
            collective_id: CollectiveId::new(),
            content: "test".into(),
            embedding: vec![0.1; 8],
            experience_type: ExperienceType::Fact {
                statement: "s".into(),
                source: "docs".into(),
            },
            importance: 0.5,
            confidence: 0.8,
            application_count: 0,
            domain_tags: vec!["rust".into(), "testing".into()],
            source_files: vec![],
            source_agent: None,
            source_task: None,
            created_at: Timestamp::from_millis(10_000),
            updated_at: Timestamp::from_millis(10_000),
            archived: false,
        }
    }

    #[test]
    fn test_default_filter_excludes_archived() {
        let filter = SearchFilter::default();
        let mut exp = sample();
        assert!(filter.matches(&exp));
        exp.archived = true;
        assert!(!filter.matches(&exp));
    }

    #[test]
    fn test_opt_in_archived() {
        let filter = SearchFilter {
            exclude_archived: false,
            ..Default::default()
        };
        let mut exp = sample();
        exp.archived = true;
        assert!(filter.matches(&exp));
    }

    #[test]
    fn test_domain_overlap() {
        let exp = sample();
        let hit = SearchFilter {
            domains: Some(vec!["rust".into()]),
            ..Default::default()
        };
        assert!(hit.matches(&exp));

        let miss = SearchFilter {
            domains: Some(vec!["python".into()]),
            ..Default::default()
        };
        assert!(!miss.matches(&exp));

        let empty = SearchFilter {
            domains: Some(vec![]),
            ..Default::default()
        };
        assert!(!empty.matches(&exp), "empty domain set matches nothing");
    }

    #[test]
    fn test_type_tag_filter() {
        let exp = sample(); // Fact => tag 7
        let hit = SearchFilter {
            type_tags: Some(vec![7]),
            ..Default::default()
        };
        assert!(hit.matches(&exp));

        let miss = SearchFilter {
            type_tags: Some(vec![8]),
            ..Default::default()
        };
        assert!(!miss.matches(&exp));
    }

    #[test]
    fn test_thresholds() {
        let exp = sample();
        let filter = SearchFilter {
            min_importance: Some(0.5),
            min_confidence: Some(0.8),
            ..Default::default()
        };
        assert!(filter.matches(&exp), "thresholds are inclusive");

        let filter = SearchFilter {
            min_importance: Some(0.6),
            ..Default::default()
        };
        assert!(!filter.matches(&exp));
    }

    #[test]
    fn test_since() {
        let exp = sample();
        let at = SearchFilter {
            since: Some(Timestamp::from_millis(10_000)),
            ..Default::default()
        };
        assert!(at.matches(&exp));

        let after = SearchFilter {
            since: Some(Timestamp::from_millis(10_001)),
            ..Default::default()
        };
        assert!(!after.matches(&exp));
    }

    #[test]
    fn test_combined() {
        let exp = sample();
        let filter = SearchFilter {
            domains: Some(vec!["testing".into()]),
            type_tags: Some(vec![7]),
            min_importance: Some(0.3),
            min_confidence: Some(0.5),
            since: Some(Timestamp::from_millis(1)),
            exclude_archived: true,
        };
        assert!(filter.matches(&exp));
    }
}
