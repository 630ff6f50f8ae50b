//! Relation graph: storage, traversal, cascade deletion.

mod common;

use common::{new_experience, open_db};
use pulsedb::{NewRelation, RelationDirection, RelationType};

fn triple(db: &pulsedb::PulseDb) -> (pulsedb::CollectiveId, [pulsedb::ExperienceId; 3]) {
    let coll = db.create_collective("c").unwrap();
    let e1 = db.record_experience(new_experience(coll, "e1")).unwrap();
    let e2 = db.record_experience(new_experience(coll, "e2")).unwrap();
    let e3 = db.record_experience(new_experience(coll, "e3")).unwrap();
    (coll, [e1, e2, e3])
}

fn relation(source: pulsedb::ExperienceId, target: pulsedb::ExperienceId) -> NewRelation {
    NewRelation {
        source_id: source,
        target_id: target,
        relation_type: RelationType::Supports,
        strength: 0.8,
        metadata: None,
    }
}

#[test]
fn test_store_and_get() {
    let (_dir, db) = open_db();
    let (_, [e1, e2, _]) = triple(&db);

    let id = db.store_relation(relation(e1, e2)).unwrap();
    let rel = db.get_relation(id).unwrap().unwrap();
    assert_eq!(rel.source_id, e1);
    assert_eq!(rel.target_id, e2);
    assert_eq!(rel.relation_type, RelationType::Supports);
    assert!((rel.strength - 0.8).abs() < f32::EPSILON);
}

#[test]
fn test_self_relation_rejected() {
    let (_dir, db) = open_db();
    let (_, [e1, _, _]) = triple(&db);
    assert!(db.store_relation(relation(e1, e1)).unwrap_err().is_validation());
}

#[test]
fn test_cross_collective_rejected() {
    let (_dir, db) = open_db();
    let c1 = db.create_collective("c1").unwrap();
    let c2 = db.create_collective("c2").unwrap();
    let a = db.record_experience(new_experience(c1, "a")).unwrap();
    let b = db.record_experience(new_experience(c2, "b")).unwrap();

    let err = db.store_relation(relation(a, b)).unwrap_err();
    assert!(err.is_validation());
    assert!(err.to_string().contains("span"));
}

#[test]
fn test_missing_endpoint_rejected() {
    let (_dir, db) = open_db();
    let (_, [e1, _, _]) = triple(&db);
    let ghost = pulsedb::ExperienceId::new();

    assert!(db.store_relation(relation(e1, ghost)).unwrap_err().is_not_found());
    assert!(db.store_relation(relation(ghost, e1)).unwrap_err().is_not_found());
}

#[test]
fn test_duplicate_triple_rejected() {
    let (_dir, db) = open_db();
    let (_, [e1, e2, _]) = triple(&db);

    db.store_relation(relation(e1, e2)).unwrap();
    assert!(db.store_relation(relation(e1, e2)).unwrap_err().is_validation());

    // Different type between the same pair is fine.
    let mut other = relation(e1, e2);
    other.relation_type = RelationType::Elaborates;
    assert!(db.store_relation(other).is_ok());

    // Reverse direction is a different edge.
    assert!(db.store_relation(relation(e2, e1)).is_ok());
}

#[test]
fn test_direction_queries() {
    let (_dir, db) = open_db();
    let (_, [e1, e2, e3]) = triple(&db);

    db.store_relation(relation(e1, e2)).unwrap();
    let mut elaborates = relation(e2, e3);
    elaborates.relation_type = RelationType::Elaborates;
    db.store_relation(elaborates).unwrap();

    // e2 has one incoming (from e1) and one outgoing (to e3).
    let out = db.get_related_experiences(e2, RelationDirection::Out).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].1.id, e3);

    let incoming = db.get_related_experiences(e2, RelationDirection::In).unwrap();
    assert_eq!(incoming.len(), 1);
    assert_eq!(incoming[0].1.id, e1);

    let both = db.get_related_experiences(e2, RelationDirection::Both).unwrap();
    assert_eq!(both.len(), 2);

    assert!(db
        .get_related_experiences(pulsedb::ExperienceId::new(), RelationDirection::Both)
        .unwrap_err()
        .is_not_found());
}

#[test]
fn test_delete_relation() {
    let (_dir, db) = open_db();
    let (_, [e1, e2, _]) = triple(&db);

    let id = db.store_relation(relation(e1, e2)).unwrap();
    db.delete_relation(id).unwrap();

    assert!(db.get_relation(id).unwrap().is_none());
    assert!(db.get_related_experiences(e1, RelationDirection::Out).unwrap().is_empty());
    assert!(db.delete_relation(id).unwrap_err().is_not_found());

    // The triple can be stored again after deletion.
    assert!(db.store_relation(relation(e1, e2)).is_ok());
}

#[test]
fn test_experience_delete_cascades_relations() {
    let (_dir, db) = open_db();
    let (_, [e1, e2, e3]) = triple(&db);

    let r1 = db.store_relation(relation(e1, e2)).unwrap();
    let mut elaborates = relation(e2, e3);
    elaborates.relation_type = RelationType::Elaborates;
    let r2 = db.store_relation(elaborates).unwrap();

    // Deleting the shared endpoint removes both relations.
    db.delete_experience(e2).unwrap();

    assert!(db.get_relation(r1).unwrap().is_none());
    assert!(db.get_relation(r2).unwrap().is_none());
    assert!(db.get_related_experiences(e1, RelationDirection::Out).unwrap().is_empty());
    assert!(db.get_related_experiences(e3, RelationDirection::In).unwrap().is_empty());

    // Unrelated endpoints survive.
    assert!(db.get_experience(e1).unwrap().is_some());
    assert!(db.get_experience(e3).unwrap().is_some());
}

#[test]
fn test_strength_and_metadata_validation() {
    let (_dir, db) = open_db();
    let (_, [e1, e2, _]) = triple(&db);

    let mut bad = relation(e1, e2);
    bad.strength = 1.5;
    assert!(db.store_relation(bad).unwrap_err().is_validation());

    let mut oversized = relation(e1, e2);
    oversized.metadata = Some("m".repeat(10 * 1024 + 1));
    assert!(db.store_relation(oversized).unwrap_err().is_validation());

    let mut ok = relation(e1, e2);
    ok.metadata = Some(r#"{"why":"observed twice"}"#.into());
    assert!(db.store_relation(ok).is_ok());
}

#[test]
fn test_all_relation_types_roundtrip() {
    let (_dir, db) = open_db();
    let coll = db.create_collective("c").unwrap();
    let a = db.record_experience(new_experience(coll, "a")).unwrap();
    let b = db.record_experience(new_experience(coll, "b")).unwrap();

    for relation_type in [
        RelationType::Supports,
        RelationType::Contradicts,
        RelationType::Elaborates,
        RelationType::Supersedes,
        RelationType::Implies,
        RelationType::RelatedTo,
    ] {
        let mut new = relation(a, b);
        new.relation_type = relation_type;
        let id = db.store_relation(new).unwrap();
        assert_eq!(
            db.get_relation(id).unwrap().unwrap().relation_type,
            relation_type
        );
    }
}
