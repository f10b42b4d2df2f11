//! Recovery Integration Tests
//!
//! Snapshot retention, discovery of damaged files, and the startup
//! announcement of interrupted runs.

use std::fs;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use filetime::FileTime;
use tempfile::TempDir;
use uuid::Uuid;

use chronicle::core::{RecoveryManager, RunRegistry};
use chronicle::domain::{EventType, GenerationState, PhaseName};
use chronicle::stream::{
    EventGateway, EventPublisher, GatewaySettings, LogStore, MemoryLogStore, PublisherSettings,
};

fn state_at(scene: u32, phase: PhaseName) -> GenerationState {
    let mut state = GenerationState::new(Uuid::new_v4(), "saga", 5);
    state.current_scene = scene;
    state.phase = phase;
    state
}

fn backdate(path: &std::path::Path, days: u64) {
    let then = SystemTime::now() - Duration::from_secs(days * 24 * 3600);
    filetime::set_file_mtime(path, FileTime::from_system_time(then)).unwrap();
}

#[test]
fn test_expired_snapshots_are_pruned() {
    let temp = TempDir::new().unwrap();
    let manager = RecoveryManager::new(temp.path(), 7);

    let old = state_at(2, PhaseName::Revision);
    let fresh = state_at(1, PhaseName::Drafting);
    let old_path = manager.save(&old).unwrap();
    manager.save(&fresh).unwrap();
    backdate(&old_path, 8);

    let pruned = manager.prune_expired().unwrap();
    assert_eq!(pruned, vec![old.run_id]);
    assert!(!old_path.exists());

    let remaining: Vec<Uuid> = manager.discover().unwrap().iter().map(|s| s.run_id).collect();
    assert_eq!(remaining, vec![fresh.run_id]);
}

#[test]
fn test_zero_retention_keeps_everything() {
    let temp = TempDir::new().unwrap();
    let manager = RecoveryManager::new(temp.path(), 0);

    let state = state_at(3, PhaseName::Continuity);
    let path = manager.save(&state).unwrap();
    backdate(&path, 365);

    assert!(manager.prune_expired().unwrap().is_empty());
    assert!(manager.load(state.run_id).is_ok());
}

#[test]
fn test_damaged_snapshots_are_skipped() {
    let temp = TempDir::new().unwrap();
    let manager = RecoveryManager::new(temp.path(), 14);

    let good = state_at(1, PhaseName::Outline);
    manager.save(&good).unwrap();

    let broken = state_at(2, PhaseName::Drafting);
    let broken_path = manager.save(&broken).unwrap();
    fs::write(&broken_path, "{ not json").unwrap();

    // A snapshot copied under another run's directory fails the id check
    let moved = state_at(1, PhaseName::Premise);
    let moved_path = manager.save(&moved).unwrap();
    let foreign = manager.snapshot_path(Uuid::new_v4());
    fs::create_dir_all(foreign.parent().unwrap()).unwrap();
    fs::rename(&moved_path, &foreign).unwrap();

    let found = manager.discover().unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].run_id, good.run_id);
    assert_eq!(found[0].phase, PhaseName::Outline);
    assert_eq!(found[0].total_scenes, 5);
}

#[test]
fn test_resave_replaces_snapshot() {
    let temp = TempDir::new().unwrap();
    let manager = RecoveryManager::new(temp.path(), 14);

    let mut state = state_at(1, PhaseName::Drafting);
    manager.save(&state).unwrap();
    state.current_scene = 2;
    state.phase = PhaseName::Revision;
    manager.save(&state).unwrap();

    let snapshot = manager.load(state.run_id).unwrap();
    assert_eq!(snapshot.checkpoint(), (2, PhaseName::Revision));
    assert_eq!(manager.discover().unwrap().len(), 1);
}

#[tokio::test]
async fn test_startup_announces_interrupted_runs() {
    let temp = TempDir::new().unwrap();
    let manager = RecoveryManager::new(temp.path(), 7);

    let live = state_at(2, PhaseName::Drafting);
    manager.save(&live).unwrap();
    let mut failed = state_at(1, PhaseName::Revision);
    failed.mark_failed("critic timed out");
    manager.save(&failed).unwrap();
    let expired = state_at(4, PhaseName::Continuity);
    let expired_path = manager.save(&expired).unwrap();
    backdate(&expired_path, 30);

    let store: Arc<dyn LogStore> = Arc::new(MemoryLogStore::new());
    let publisher = EventPublisher::new(Some(store.clone()), PublisherSettings::default());
    let gateway = EventGateway::new(Some(store), GatewaySettings::default());

    let announced = manager.announce_interrupted(&publisher).await.unwrap();
    assert_eq!(announced.len(), 2);
    assert!(!expired_path.exists());

    let events = gateway.get_history(live.run_id, 10).await.unwrap();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.event_type, EventType::GenerationInterrupted);
    assert_eq!(event.payload["resumable"], true);
    assert_eq!(event.payload["checkpointScene"], 2);
    assert_eq!(event.payload["phase"], "drafting");
    assert_eq!(event.payload["totalScenes"], 5);

    let events = gateway.get_history(failed.run_id, 10).await.unwrap();
    assert_eq!(events[0].payload["resumable"], false);

    assert!(gateway.get_history(expired.run_id, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_snapshot_all_skips_runs_without_checkpoint() {
    let temp = TempDir::new().unwrap();
    let manager = RecoveryManager::new(temp.path(), 14);
    let registry = RunRegistry::new();

    let checkpointed = registry.create(Uuid::new_v4(), "saga").await.unwrap();
    let state = GenerationState::new(checkpointed.run_id, "saga", 2);
    checkpointed.control.save_checkpoint(&state).await;

    let fresh = registry.create(Uuid::new_v4(), "saga").await.unwrap();

    let mut finished_state = GenerationState::new(Uuid::new_v4(), "saga", 2);
    let finished = registry.create(finished_state.run_id, "saga").await.unwrap();
    finished_state.mark_completed();
    finished.control.save_checkpoint(&finished_state).await;

    let saved = manager.snapshot_all(&registry).await;
    assert_eq!(saved, vec![checkpointed.run_id]);
    assert!(manager.load(fresh.run_id).is_err());
    assert!(manager.load(finished.run_id).is_err());
}
