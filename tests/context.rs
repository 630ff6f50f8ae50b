//! The composite context query: five legs under one snapshot.

mod common;

use common::{embed, new_experience, open_db};
use pulsedb::{
    AgentId, ContextRequest, InsightType, NewActivity, NewInsight, NewRelation, RelationType,
};

#[test]
fn test_context_blend() {
    let (_dir, db) = open_db();
    let coll = db.create_collective("c").unwrap();

    // 90 older experiences, then 10 recent ones.
    let mut older = Vec::new();
    for i in 0..90 {
        older.push(
            db.record_experience(new_experience(coll, &format!("background fact {i}")))
                .unwrap(),
        );
    }
    std::thread::sleep(std::time::Duration::from_millis(3));
    let mut recent_ids = Vec::new();
    for i in 0..10 {
        recent_ids.push(
            db.record_experience(new_experience(coll, &format!("fresh event {i}")))
                .unwrap(),
        );
        std::thread::sleep(std::time::Duration::from_millis(3));
    }

    // A relation between two of the newest five, so both endpoints are
    // guaranteed members of the recent leg.
    db.store_relation(NewRelation {
        source_id: recent_ids[8],
        target_id: recent_ids[9],
        relation_type: RelationType::Supports,
        strength: 0.9,
        metadata: None,
    })
    .unwrap();

    let mut request = ContextRequest::new(coll, embed("fresh event 3"));
    request.max_recent = 5;
    request.max_similar = 10;
    request.include_relations = true;
    let context = db.get_context_candidates(request).unwrap();

    // Exactly 5 recent, newest first.
    assert_eq!(context.recent.len(), 5);
    let got: Vec<_> = context.recent.iter().map(|e| e.id).collect();
    let expected: Vec<_> = recent_ids.iter().rev().take(5).copied().collect();
    assert_eq!(got, expected);

    // At most 10 similar, scores non-increasing.
    assert!(context.similar.len() <= 10);
    assert!(!context.similar.is_empty());
    for pair in context.similar.windows(2) {
        assert!(pair[0].1 >= pair[1].1);
    }

    // Every relation endpoint is in similar ∪ recent.
    let members: std::collections::HashSet<_> = context
        .similar
        .iter()
        .map(|(e, _)| e.id)
        .chain(context.recent.iter().map(|e| e.id))
        .collect();
    assert!(!context.relations.is_empty());
    for relation in &context.relations {
        assert!(
            members.contains(&relation.source_id) || members.contains(&relation.target_id),
            "relation touches no returned member"
        );
    }

    // Legs not requested stay empty.
    assert!(context.insights.is_empty());
    assert!(context.active_agents.is_empty());
}

#[test]
fn test_all_legs_populated() {
    let (_dir, db) = open_db();
    let coll = db.create_collective("c").unwrap();

    let exp = db.record_experience(new_experience(coll, "observed behavior")).unwrap();
    db.store_insight(NewInsight {
        collective_id: coll,
        content: "observed behavior generalizes".into(),
        embedding: Some(embed("observed behavior generalizes")),
        source_experience_ids: vec![exp],
        insight_type: InsightType::Abstraction,
        confidence: 0.7,
        domain_tags: vec![],
    })
    .unwrap();
    db.register_activity(NewActivity {
        agent_id: AgentId::new("live-agent"),
        collective_id: coll,
        current_task: Some("watching".into()),
        context_summary: None,
    })
    .unwrap();

    let mut request = ContextRequest::new(coll, embed("observed behavior"));
    request.include_insights = true;
    request.include_active_agents = true;
    request.include_relations = true;
    let context = db.get_context_candidates(request).unwrap();

    assert_eq!(context.similar.len(), 1);
    assert_eq!(context.recent.len(), 1);
    assert_eq!(context.insights.len(), 1);
    assert_eq!(context.active_agents.len(), 1);
    assert_eq!(context.active_agents[0].agent_id.as_str(), "live-agent");
    assert!(context.relations.is_empty());
    assert!(!context.is_empty());
}

#[test]
fn test_snapshot_csn_reported() {
    let (_dir, db) = open_db();
    let coll = db.create_collective("c").unwrap();
    db.record_experience(new_experience(coll, "anchor")).unwrap();

    let context = db
        .get_context_candidates(ContextRequest::new(coll, embed("anchor")))
        .unwrap();
    assert_eq!(context.snapshot_csn, db.csn());
}

#[test]
fn test_filter_applies_to_both_legs() {
    let (_dir, db) = open_db();
    let coll = db.create_collective("c").unwrap();

    let mut tagged = new_experience(coll, "tagged entry");
    tagged.domain_tags = vec!["wanted".into()];
    let tagged_id = db.record_experience(tagged).unwrap();

    let mut untagged = new_experience(coll, "untagged entry");
    untagged.domain_tags = vec!["other".into()];
    db.record_experience(untagged).unwrap();

    let mut request = ContextRequest::new(coll, embed("entry"));
    request.filter.domains = Some(vec!["wanted".into()]);
    let context = db.get_context_candidates(request).unwrap();

    assert_eq!(context.similar.len(), 1);
    assert_eq!(context.similar[0].0.id, tagged_id);
    assert_eq!(context.recent.len(), 1);
    assert_eq!(context.recent[0].id, tagged_id);
}

#[test]
fn test_stale_agents_excluded() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = common::test_config();
    config.limits.stale_agent_threshold_ms = 40;
    let db = pulsedb::PulseDb::open(dir.path().join("pulse.db"), config).unwrap();
    let coll = db.create_collective("c").unwrap();

    db.register_activity(NewActivity {
        agent_id: AgentId::new("fading"),
        collective_id: coll,
        current_task: None,
        context_summary: None,
    })
    .unwrap();
    db.record_experience(new_experience(coll, "anchor")).unwrap();

    std::thread::sleep(std::time::Duration::from_millis(70));

    let mut request = ContextRequest::new(coll, embed("anchor"));
    request.include_active_agents = true;
    let context = db.get_context_candidates(request).unwrap();
    assert!(context.active_agents.is_empty());
}

#[test]
fn test_missing_collective_and_bad_query() {
    let (_dir, db) = open_db();
    let coll = db.create_collective("c").unwrap();

    assert!(db
        .get_context_candidates(ContextRequest::new(pulsedb::CollectiveId::new(), embed("q")))
        .unwrap_err()
        .is_not_found());

    let request = ContextRequest::new(coll, vec![0.1; 3]);
    assert!(db.get_context_candidates(request).unwrap_err().is_validation());
}
