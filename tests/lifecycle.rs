//! Full experience lifecycle: record, read, update, archive, unarchive,
//! delete, plus durability across close/open.

mod common;

use common::{embed, new_experience, open_db, test_config, DIM};
use pulsedb::{ExperienceUpdate, PulseDb, SearchFilter};

#[test]
fn test_full_lifecycle() {
    let (_dir, db) = open_db();
    let c1 = db.create_collective("c1").unwrap();

    // Record.
    let mut new = new_experience(c1, "hello");
    new.importance = 0.5;
    new.confidence = 0.9;
    let id = db.record_experience(new).unwrap();

    // Read back.
    let exp = db.get_experience(id).unwrap().unwrap();
    assert_eq!(exp.content, "hello");
    assert_eq!(exp.collective_id, c1);
    assert_eq!(exp.embedding.len(), DIM);
    assert!((exp.importance - 0.5).abs() < f32::EPSILON);
    assert!(!exp.archived);
    assert_eq!(exp.application_count, 0);

    // Update mutable fields.
    db.update_experience(
        id,
        ExperienceUpdate {
            importance: Some(0.9),
            ..Default::default()
        },
    )
    .unwrap();
    let exp = db.get_experience(id).unwrap().unwrap();
    assert!((exp.importance - 0.9).abs() < f32::EPSILON);
    assert!(exp.updated_at >= exp.created_at);

    // Archive: gone from search.
    db.archive_experience(id).unwrap();
    let hits = db.search_similar(c1, &embed("hello"), 10).unwrap();
    assert!(hits.is_empty(), "archived experience must leave search");
    assert!(db.get_experience(id).unwrap().unwrap().archived);

    // Unarchive: back in search with ~identical similarity.
    db.unarchive_experience(id).unwrap();
    let hits = db.search_similar(c1, &embed("hello"), 10).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].0.id, id);
    assert!(hits[0].1 > 0.999, "self-similarity should be ~1.0, got {}", hits[0].1);

    // Delete is terminal.
    db.delete_experience(id).unwrap();
    assert!(db.get_experience(id).unwrap().is_none());
    let err = db.delete_experience(id).unwrap_err();
    assert!(err.is_not_found(), "second delete must report NotFound");

    db.close().unwrap();
}

#[test]
fn test_record_then_get_roundtrip_fields() {
    let (_dir, db) = open_db();
    let c1 = db.create_collective("c1").unwrap();

    let mut new = new_experience(c1, "structured knowledge");
    new.domain_tags = vec!["rust".into(), "storage".into()];
    new.source_files = vec!["src/db.rs".into()];
    new.source_agent = Some(pulsedb::AgentId::new("agent-7"));
    new.source_task = Some(pulsedb::TaskId::new("task-3"));
    let embedding = new.embedding.clone().unwrap();

    let id = db.record_experience(new).unwrap();
    let exp = db.get_experience(id).unwrap().unwrap();

    assert_eq!(exp.content, "structured knowledge");
    assert_eq!(exp.embedding, embedding);
    assert_eq!(exp.domain_tags, vec!["rust", "storage"]);
    assert_eq!(exp.source_files, vec!["src/db.rs"]);
    assert_eq!(exp.source_agent.as_ref().unwrap().as_str(), "agent-7");
    assert_eq!(exp.source_task.as_ref().unwrap().as_str(), "task-3");
}

#[test]
fn test_archive_is_idempotent() {
    let (_dir, db) = open_db();
    let c1 = db.create_collective("c1").unwrap();
    let id = db.record_experience(new_experience(c1, "idem")).unwrap();

    db.archive_experience(id).unwrap();
    db.archive_experience(id).unwrap();
    assert!(db.get_experience(id).unwrap().unwrap().archived);

    db.unarchive_experience(id).unwrap();
    db.unarchive_experience(id).unwrap();
    assert!(!db.get_experience(id).unwrap().unwrap().archived);

    // Still exactly one hit after double unarchive.
    let hits = db.search_similar(c1, &embed("idem"), 10).unwrap();
    assert_eq!(hits.len(), 1);
}

#[test]
fn test_reinforce_increments_and_persists() {
    let (dir, db) = open_db();
    let c1 = db.create_collective("c1").unwrap();
    let id = db.record_experience(new_experience(c1, "useful")).unwrap();

    assert_eq!(db.reinforce_experience(id).unwrap(), 1);
    assert_eq!(db.reinforce_experience(id).unwrap(), 2);
    assert_eq!(db.reinforce_experience(id).unwrap(), 3);
    db.close().unwrap();

    let db = PulseDb::open(dir.path().join("pulse.db"), test_config()).unwrap();
    assert_eq!(
        db.get_experience(id).unwrap().unwrap().application_count,
        3
    );
}

#[test]
fn test_close_open_preserves_query_results() {
    let (dir, db) = open_db();
    let c1 = db.create_collective("c1").unwrap();

    let mut ids = Vec::new();
    for i in 0..20 {
        ids.push(
            db.record_experience(new_experience(c1, &format!("item number {i}")))
                .unwrap(),
        );
    }

    let before_search = db.search_similar(c1, &embed("item number 7"), 5).unwrap();
    let before_recent = db.get_recent_experiences(c1, 5).unwrap();
    db.close().unwrap();

    let db = PulseDb::open(dir.path().join("pulse.db"), test_config()).unwrap();
    let after_search = db.search_similar(c1, &embed("item number 7"), 5).unwrap();
    let after_recent = db.get_recent_experiences(c1, 5).unwrap();

    assert_eq!(before_search[0].0.id, after_search[0].0.id);
    assert_eq!(
        before_recent.iter().map(|e| e.id).collect::<Vec<_>>(),
        after_recent.iter().map(|e| e.id).collect::<Vec<_>>()
    );
}

#[test]
fn test_committed_writes_survive_drop_without_close() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("pulse.db");

    let collective;
    let mut ids = Vec::new();
    {
        let db = PulseDb::open(&path, test_config()).unwrap();
        collective = db.create_collective("c1").unwrap();
        for i in 0..50 {
            ids.push(
                db.record_experience(new_experience(collective, &format!("survivor {i}")))
                    .unwrap(),
            );
        }
        // Simulated crash: no close(), no index save.
        drop(db);
    }

    let db = PulseDb::open(&path, test_config()).unwrap();
    for id in &ids {
        assert!(
            db.get_experience(*id).unwrap().is_some(),
            "committed experience lost after crash"
        );
    }
    // Vector index rebuilt from stored embeddings answers consistently.
    let hits = db.search_similar(collective, &embed("survivor 13"), 3).unwrap();
    assert_eq!(hits[0].0.content, "survivor 13");
}

#[test]
fn test_state_machine_deleted_is_terminal() {
    let (_dir, db) = open_db();
    let c1 = db.create_collective("c1").unwrap();
    let id = db.record_experience(new_experience(c1, "gone")).unwrap();

    db.archive_experience(id).unwrap();
    db.delete_experience(id).unwrap();

    assert!(db.get_experience(id).unwrap().is_none());
    assert!(db.archive_experience(id).unwrap_err().is_not_found());
    assert!(db.unarchive_experience(id).unwrap_err().is_not_found());
    assert!(db.reinforce_experience(id).unwrap_err().is_not_found());
}

#[test]
fn test_archived_visible_when_filter_opts_in() {
    let (_dir, db) = open_db();
    let c1 = db.create_collective("c1").unwrap();
    let id = db.record_experience(new_experience(c1, "shadow")).unwrap();
    db.archive_experience(id).unwrap();

    let opt_in = SearchFilter {
        exclude_archived: false,
        ..Default::default()
    };
    let recent = db
        .get_recent_experiences_filtered(c1, 10, &opt_in)
        .unwrap();
    assert_eq!(recent.len(), 1);
    assert!(recent[0].archived);
}
