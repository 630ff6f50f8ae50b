//! Derived insights: storage and the separate insight vector index.

mod common;

use common::{embed, new_experience, open_db, DIM};
use pulsedb::{InsightType, NewInsight};

fn insight(
    collective: pulsedb::CollectiveId,
    content: &str,
    sources: Vec<pulsedb::ExperienceId>,
) -> NewInsight {
    NewInsight {
        collective_id: collective,
        content: content.to_string(),
        embedding: Some(embed(content)),
        source_experience_ids: sources,
        insight_type: InsightType::Pattern,
        confidence: 0.85,
        domain_tags: vec![],
    }
}

#[test]
fn test_store_and_get() {
    let (_dir, db) = open_db();
    let coll = db.create_collective("c").unwrap();
    let exp = db.record_experience(new_experience(coll, "observation")).unwrap();

    let id = db.store_insight(insight(coll, "pattern over observations", vec![exp])).unwrap();

    let stored = db.get_insight(id).unwrap().unwrap();
    assert_eq!(stored.content, "pattern over observations");
    assert_eq!(stored.source_experience_ids, vec![exp]);
    assert_eq!(stored.insight_type, InsightType::Pattern);
    assert_eq!(stored.embedding.len(), DIM);
}

#[test]
fn test_validation() {
    let (_dir, db) = open_db();
    let coll = db.create_collective("c").unwrap();
    let exp = db.record_experience(new_experience(coll, "obs")).unwrap();

    // Empty content.
    let mut bad = insight(coll, "", vec![exp]);
    bad.embedding = Some(embed("x"));
    assert!(db.store_insight(bad).unwrap_err().is_validation());

    // No sources.
    assert!(db
        .store_insight(insight(coll, "sourceless", vec![]))
        .unwrap_err()
        .is_validation());

    // Bad confidence.
    let mut bad = insight(coll, "overconfident", vec![exp]);
    bad.confidence = 1.2;
    assert!(db.store_insight(bad).unwrap_err().is_validation());

    // Wrong embedding dimension.
    let mut bad = insight(coll, "short vector", vec![exp]);
    bad.embedding = Some(vec![0.1; DIM - 1]);
    assert!(db.store_insight(bad).unwrap_err().is_validation());

    // Missing collective.
    assert!(db
        .store_insight(insight(pulsedb::CollectiveId::new(), "orphan", vec![exp]))
        .unwrap_err()
        .is_not_found());
}

#[test]
fn test_knn_over_insight_index() {
    let (_dir, db) = open_db();
    let coll = db.create_collective("c").unwrap();
    let exp = db.record_experience(new_experience(coll, "obs")).unwrap();

    for i in 0..10 {
        db.store_insight(insight(coll, &format!("derived rule {i}"), vec![exp])).unwrap();
    }

    let hits = db.get_insights(coll, &embed("derived rule 4"), 3).unwrap();
    assert_eq!(hits.len(), 3);
    assert_eq!(hits[0].0.content, "derived rule 4");
    assert!(hits[0].1 > 0.999);
    for pair in hits.windows(2) {
        assert!(pair[0].1 >= pair[1].1);
    }
}

#[test]
fn test_insights_do_not_mix_with_experience_search() {
    let (_dir, db) = open_db();
    let coll = db.create_collective("c").unwrap();
    let exp = db
        .record_experience(new_experience(coll, "shared wording"))
        .unwrap();
    db.store_insight(insight(coll, "shared wording", vec![exp])).unwrap();

    // Experience search returns only the experience, insight search only
    // the insight, even with identical embeddings.
    let exp_hits = db.search_similar(coll, &embed("shared wording"), 10).unwrap();
    assert_eq!(exp_hits.len(), 1);
    assert_eq!(exp_hits[0].0.id, exp);

    let insight_hits = db.get_insights(coll, &embed("shared wording"), 10).unwrap();
    assert_eq!(insight_hits.len(), 1);
    assert_eq!(insight_hits[0].0.content, "shared wording");
}

#[test]
fn test_delete_insight() {
    let (_dir, db) = open_db();
    let coll = db.create_collective("c").unwrap();
    let exp = db.record_experience(new_experience(coll, "obs")).unwrap();

    let id = db.store_insight(insight(coll, "ephemeral", vec![exp])).unwrap();
    db.delete_insight(id).unwrap();

    assert!(db.get_insight(id).unwrap().is_none());
    assert!(db.get_insights(coll, &embed("ephemeral"), 10).unwrap().is_empty());
    assert!(db.delete_insight(id).unwrap_err().is_not_found());
}

#[test]
fn test_insight_survives_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("pulse.db");

    let coll;
    let id;
    {
        let db = pulsedb::PulseDb::open(&path, common::test_config()).unwrap();
        coll = db.create_collective("c").unwrap();
        let exp = db.record_experience(new_experience(coll, "obs")).unwrap();
        id = db.store_insight(insight(coll, "durable rule", vec![exp])).unwrap();
        db.close().unwrap();
    }

    let db = pulsedb::PulseDb::open(&path, common::test_config()).unwrap();
    assert!(db.get_insight(id).unwrap().is_some());
    let hits = db.get_insights(coll, &embed("durable rule"), 1).unwrap();
    assert_eq!(hits[0].0.id, id);
}

#[test]
fn test_all_insight_types() {
    let (_dir, db) = open_db();
    let coll = db.create_collective("c").unwrap();
    let exp = db.record_experience(new_experience(coll, "obs")).unwrap();

    for (i, insight_type) in [
        InsightType::Pattern,
        InsightType::Synthesis,
        InsightType::Abstraction,
        InsightType::Correlation,
    ]
    .into_iter()
    .enumerate()
    {
        let mut new = insight(coll, &format!("typed {i}"), vec![exp]);
        new.insight_type = insight_type;
        let id = db.store_insight(new).unwrap();
        assert_eq!(db.get_insight(id).unwrap().unwrap().insight_type, insight_type);
    }
}
