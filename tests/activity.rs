//! Agent presence: registration, heartbeats, staleness.

mod common;

use common::test_config;
use pulsedb::{AgentId, NewActivity, PulseDb};
use tempfile::TempDir;

/// A database whose stale threshold is short enough to cross in a test.
fn open_with_threshold(threshold_ms: u64) -> (TempDir, PulseDb) {
    let dir = TempDir::new().unwrap();
    let mut config = test_config();
    config.limits.stale_agent_threshold_ms = threshold_ms;
    let db = PulseDb::open(dir.path().join("pulse.db"), config).unwrap();
    (dir, db)
}

fn activity(collective: pulsedb::CollectiveId, agent: &str) -> NewActivity {
    NewActivity {
        agent_id: AgentId::new(agent),
        collective_id: collective,
        current_task: Some("indexing".into()),
        context_summary: None,
    }
}

#[test]
fn test_register_and_list() {
    let (_dir, db) = open_with_threshold(60_000);
    let coll = db.create_collective("c").unwrap();

    db.register_activity(activity(coll, "scout")).unwrap();
    db.register_activity(activity(coll, "builder")).unwrap();

    let mut agents: Vec<String> = db
        .get_active_agents(coll)
        .unwrap()
        .into_iter()
        .map(|a| a.agent_id.as_str().to_string())
        .collect();
    agents.sort();
    assert_eq!(agents, vec!["builder", "scout"]);
}

#[test]
fn test_register_is_upsert() {
    let (_dir, db) = open_with_threshold(60_000);
    let coll = db.create_collective("c").unwrap();

    db.register_activity(activity(coll, "scout")).unwrap();
    let mut replacement = activity(coll, "scout");
    replacement.current_task = Some("searching".into());
    db.register_activity(replacement).unwrap();

    let agents = db.get_active_agents(coll).unwrap();
    assert_eq!(agents.len(), 1, "re-registration must replace, not add");
    assert_eq!(agents[0].current_task.as_deref(), Some("searching"));
}

#[test]
fn test_stale_agents_age_out() {
    let (_dir, db) = open_with_threshold(50);
    let coll = db.create_collective("c").unwrap();

    db.register_activity(activity(coll, "sleepy")).unwrap();
    assert_eq!(db.get_active_agents(coll).unwrap().len(), 1);

    std::thread::sleep(std::time::Duration::from_millis(80));
    assert!(
        db.get_active_agents(coll).unwrap().is_empty(),
        "agent past the stale threshold still listed"
    );
}

#[test]
fn test_heartbeat_keeps_agent_live() {
    let (_dir, db) = open_with_threshold(80);
    let coll = db.create_collective("c").unwrap();
    let agent = AgentId::new("steady");

    db.register_activity(activity(coll, "steady")).unwrap();
    for _ in 0..3 {
        std::thread::sleep(std::time::Duration::from_millis(40));
        db.update_heartbeat(coll, &agent).unwrap();
    }
    // Total elapsed well past the threshold, but heartbeats kept it fresh.
    assert_eq!(db.get_active_agents(coll).unwrap().len(), 1);
}

#[test]
fn test_heartbeat_preserves_started_at() {
    let (_dir, db) = open_with_threshold(60_000);
    let coll = db.create_collective("c").unwrap();
    let agent = AgentId::new("scout");

    db.register_activity(activity(coll, "scout")).unwrap();
    let before = db.get_active_agents(coll).unwrap()[0].clone();

    std::thread::sleep(std::time::Duration::from_millis(5));
    db.update_heartbeat(coll, &agent).unwrap();
    let after = db.get_active_agents(coll).unwrap()[0].clone();

    assert_eq!(after.started_at, before.started_at);
    assert!(after.last_heartbeat > before.last_heartbeat);
}

#[test]
fn test_end_activity() {
    let (_dir, db) = open_with_threshold(60_000);
    let coll = db.create_collective("c").unwrap();
    let agent = AgentId::new("done");

    db.register_activity(activity(coll, "done")).unwrap();
    db.end_activity(coll, &agent).unwrap();
    assert!(db.get_active_agents(coll).unwrap().is_empty());

    assert!(db.end_activity(coll, &agent).unwrap_err().is_not_found());
    assert!(db.update_heartbeat(coll, &agent).unwrap_err().is_not_found());
}

#[test]
fn test_validation_and_missing_collective() {
    let (_dir, db) = open_with_threshold(60_000);
    let coll = db.create_collective("c").unwrap();

    let mut empty = activity(coll, "");
    empty.agent_id = AgentId::new("");
    assert!(db.register_activity(empty).unwrap_err().is_validation());

    let mut oversized = activity(coll, "agent");
    oversized.current_task = Some("t".repeat(1025));
    assert!(db.register_activity(oversized).unwrap_err().is_validation());

    assert!(db
        .register_activity(activity(pulsedb::CollectiveId::new(), "ghost"))
        .unwrap_err()
        .is_not_found());
}

#[test]
fn test_collectives_isolate_agents() {
    let (_dir, db) = open_with_threshold(60_000);
    let c1 = db.create_collective("c1").unwrap();
    let c2 = db.create_collective("c2").unwrap();

    db.register_activity(activity(c1, "shared-name")).unwrap();
    db.register_activity(activity(c2, "shared-name")).unwrap();
    db.register_activity(activity(c2, "only-c2")).unwrap();

    assert_eq!(db.get_active_agents(c1).unwrap().len(), 1);
    assert_eq!(db.get_active_agents(c2).unwrap().len(), 2);

    db.end_activity(c1, &AgentId::new("shared-name")).unwrap();
    assert!(db.get_active_agents(c1).unwrap().is_empty());
    assert_eq!(db.get_active_agents(c2).unwrap().len(), 2);
}
