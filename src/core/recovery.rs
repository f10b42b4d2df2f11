//! Recovery manager: snapshots of in-flight runs.
//!
//! On graceful shutdown every registered run's last checkpointed state is
//! written to `<runs>/<runId>/artifacts/run_state_snapshot.json`. On startup
//! the snapshots are discovered, announced with a `generation_interrupted`
//! event and offered for resume. A snapshot is deleted once the resumed run
//! passes a later checkpoint or completes.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{ArtifactKind, EventType, GenerationState, PhaseName};
use crate::stream::EventPublisher;

use super::registry::RunRegistry;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("No snapshot for run {0}")]
    NotFound(Uuid),

    #[error("Snapshot for run {run_id} is corrupt: {reason}")]
    Corrupt { run_id: Uuid, reason: String },

    #[error("Snapshot I/O failed for {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize snapshot: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid snapshot search pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> RecoveryError + '_ {
    move |source| RecoveryError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Persisted form of an interrupted run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub version: u32,
    pub run_id: Uuid,
    pub phase: PhaseName,
    pub checkpoint_scene: u32,
    pub saved_at: DateTime<Utc>,
    /// SHA-256 of the serialized state, hex encoded
    pub checksum: String,
    pub state: GenerationState,
}

impl RunSnapshot {
    pub fn checkpoint(&self) -> (u32, PhaseName) {
        (self.checkpoint_scene, self.phase)
    }

    pub fn is_resumable(&self) -> bool {
        !self.state.is_completed && self.state.error.is_none()
    }
}

/// Listing entry for a discovered snapshot
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotInfo {
    pub run_id: Uuid,
    pub project_id: String,
    pub phase: PhaseName,
    pub checkpoint_scene: u32,
    pub total_scenes: u32,
    pub saved_at: DateTime<Utc>,
    pub resumable: bool,
    pub path: PathBuf,
}

impl SnapshotInfo {
    fn from_snapshot(snapshot: &RunSnapshot, path: PathBuf) -> Self {
        Self {
            run_id: snapshot.run_id,
            project_id: snapshot.state.project_id.clone(),
            phase: snapshot.phase,
            checkpoint_scene: snapshot.checkpoint_scene,
            total_scenes: snapshot.state.total_scenes,
            saved_at: snapshot.saved_at,
            resumable: snapshot.is_resumable(),
            path,
        }
    }
}

fn checksum(state: &GenerationState) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(state)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Writes, finds and deletes run snapshots under a runs directory
#[derive(Debug, Clone)]
pub struct RecoveryManager {
    runs_dir: PathBuf,
    /// `None` keeps snapshots forever
    retention: Option<Duration>,
}

impl RecoveryManager {
    /// `retention_days == 0` disables pruning
    pub fn new(runs_dir: impl Into<PathBuf>, retention_days: u32) -> Self {
        let retention = (retention_days > 0)
            .then(|| Duration::from_secs(u64::from(retention_days) * 24 * 3600));
        Self {
            runs_dir: runs_dir.into(),
            retention,
        }
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    pub fn snapshot_path(&self, run_id: Uuid) -> PathBuf {
        self.runs_dir
            .join(run_id.to_string())
            .join("artifacts")
            .join(format!("{}.json", ArtifactKind::RunStateSnapshot.file_stem()))
    }

    fn lock_path(&self, run_id: Uuid) -> PathBuf {
        self.snapshot_path(run_id).with_extension("lock")
    }

    /// Hold the per-run snapshot lock for the duration of `f`
    fn with_lock<T>(
        &self,
        run_id: Uuid,
        f: impl FnOnce() -> Result<T, RecoveryError>,
    ) -> Result<T, RecoveryError> {
        let lock_path = self.lock_path(run_id);
        if let Some(dir) = lock_path.parent() {
            fs::create_dir_all(dir).map_err(io_error(dir))?;
        }
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(io_error(&lock_path))?;
        lock.lock_exclusive().map_err(io_error(&lock_path))?;

        // Lock is released when `lock` is dropped
        f()
    }

    /// Atomically write a snapshot of `state`
    pub fn save(&self, state: &GenerationState) -> Result<PathBuf, RecoveryError> {
        let path = self.snapshot_path(state.run_id);
        let (scene, phase) = state.checkpoint();
        let snapshot = RunSnapshot {
            version: SNAPSHOT_VERSION,
            run_id: state.run_id,
            phase,
            checkpoint_scene: scene,
            saved_at: Utc::now(),
            checksum: checksum(state)?,
            state: state.clone(),
        };
        let body = serde_json::to_vec_pretty(&snapshot)?;

        self.with_lock(state.run_id, || {
            let dir = path.parent().unwrap_or(&self.runs_dir);
            let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(io_error(dir))?;
            temp.write_all(&body).map_err(io_error(temp.path()))?;
            temp.as_file().sync_all().map_err(io_error(&path))?;
            temp.persist(&path).map_err(|e| RecoveryError::Io {
                path: path.clone(),
                source: e.error,
            })?;
            Ok(())
        })?;

        debug!(run_id = %state.run_id, scene, %phase, path = %path.display(), "Saved run snapshot");
        Ok(path)
    }

    /// Load and verify a snapshot
    pub fn load(&self, run_id: Uuid) -> Result<RunSnapshot, RecoveryError> {
        let path = self.snapshot_path(run_id);
        if !path.exists() {
            return Err(RecoveryError::NotFound(run_id));
        }
        self.read_snapshot(&path, run_id)
    }

    /// Listing entry for one run's snapshot
    pub fn info(&self, run_id: Uuid) -> Result<SnapshotInfo, RecoveryError> {
        let snapshot = self.load(run_id)?;
        Ok(SnapshotInfo::from_snapshot(&snapshot, self.snapshot_path(run_id)))
    }

    fn read_snapshot(&self, path: &Path, run_id: Uuid) -> Result<RunSnapshot, RecoveryError> {
        let content = fs::read_to_string(path).map_err(io_error(path))?;
        let corrupt = |reason: String| RecoveryError::Corrupt { run_id, reason };

        let snapshot: RunSnapshot =
            serde_json::from_str(&content).map_err(|e| corrupt(e.to_string()))?;

        if snapshot.run_id != run_id || snapshot.state.run_id != run_id {
            return Err(corrupt("run id does not match its location".to_string()));
        }
        if checksum(&snapshot.state)? != snapshot.checksum {
            return Err(corrupt("checksum mismatch".to_string()));
        }
        Ok(snapshot)
    }

    /// Every readable snapshot, oldest first. Unreadable ones are skipped.
    pub fn discover(&self) -> Result<Vec<SnapshotInfo>, RecoveryError> {
        let pattern = self
            .runs_dir
            .join("*")
            .join("artifacts")
            .join(format!("{}.json", ArtifactKind::RunStateSnapshot.file_stem()));

        let mut found = Vec::new();
        for entry in glob::glob(&pattern.to_string_lossy())? {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable snapshot path");
                    continue;
                }
            };
            let Some(run_id) = run_id_of(&path) else {
                warn!(path = %path.display(), "Skipping snapshot outside a run directory");
                continue;
            };

            match self.read_snapshot(&path, run_id) {
                Ok(snapshot) => found.push(SnapshotInfo::from_snapshot(&snapshot, path)),
                Err(e) => warn!(%run_id, error = %e, "Skipping invalid snapshot"),
            }
        }

        found.sort_by_key(|s| s.saved_at);
        Ok(found)
    }

    /// Delete a run's snapshot. Returns whether one existed.
    pub fn delete(&self, run_id: Uuid) -> Result<bool, RecoveryError> {
        let path = self.snapshot_path(run_id);
        if !path.exists() {
            return Ok(false);
        }

        self.with_lock(run_id, || match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(&path)(e)),
        })?;
        let _ = fs::remove_file(self.lock_path(run_id));

        debug!(%run_id, "Deleted run snapshot");
        Ok(true)
    }

    /// Delete snapshots whose file is older than the retention period
    pub fn prune_expired(&self) -> Result<Vec<Uuid>, RecoveryError> {
        let Some(retention) = self.retention else {
            return Ok(Vec::new());
        };

        let mut pruned = Vec::new();
        for info in self.discover()? {
            let modified = fs::metadata(&info.path)
                .and_then(|m| m.modified())
                .map_err(io_error(&info.path))?;
            let age = SystemTime::now()
                .duration_since(modified)
                .unwrap_or_default();

            if age > retention && self.delete(info.run_id)? {
                info!(run_id = %info.run_id, age_days = age.as_secs() / 86_400, "Pruned expired snapshot");
                pruned.push(info.run_id);
            }
        }
        Ok(pruned)
    }

    /// Startup pass: prune expired snapshots, then announce the rest as
    /// interrupted runs on their own logs.
    pub async fn announce_interrupted(
        &self,
        publisher: &EventPublisher,
    ) -> Result<Vec<SnapshotInfo>, RecoveryError> {
        self.prune_expired()?;
        let snapshots = self.discover()?;

        for info in &snapshots {
            let payload = json!({
                "resumable": info.resumable,
                "checkpointScene": info.checkpoint_scene,
                "phase": info.phase,
                "totalScenes": info.total_scenes,
                "savedAt": info.saved_at,
            });
            match publisher
                .publish(info.run_id, EventType::GenerationInterrupted, payload)
                .await
            {
                Ok(_) => info!(run_id = %info.run_id, phase = %info.phase, "Announced interrupted run"),
                Err(e) => warn!(run_id = %info.run_id, error = %e, "Could not announce interrupted run"),
            }
        }

        Ok(snapshots)
    }

    /// Graceful shutdown: snapshot every registered run's last checkpoint
    pub async fn snapshot_all(&self, registry: &RunRegistry) -> Vec<Uuid> {
        let mut saved = Vec::new();
        for handle in registry.handles().await {
            let Some(state) = handle.control.last_checkpoint().await else {
                continue;
            };
            if state.is_completed {
                continue;
            }
            match self.save(&state) {
                Ok(_) => saved.push(handle.run_id),
                Err(e) => warn!(run_id = %handle.run_id, error = %e, "Failed to snapshot run"),
            }
        }
        info!(count = saved.len(), "Snapshotted in-flight runs");
        saved
    }
}

/// `<runs>/<runId>/artifacts/<file>` -> runId
fn run_id_of(path: &Path) -> Option<Uuid> {
    let run_dir = path.parent()?.parent()?;
    run_dir.file_name()?.to_str()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn state_at(scene: u32, phase: PhaseName) -> GenerationState {
        let mut state = GenerationState::new(Uuid::new_v4(), "project", 4);
        state.current_scene = scene;
        state.phase = phase;
        state
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let manager = RecoveryManager::new(temp.path(), 14);
        let state = state_at(2, PhaseName::Revision);

        let path = manager.save(&state).unwrap();
        assert!(path.ends_with("artifacts/run_state_snapshot.json"));

        let snapshot = manager.load(state.run_id).unwrap();
        assert_eq!(snapshot.checkpoint(), (2, PhaseName::Revision));
        assert_eq!(snapshot.state, state);
        assert!(snapshot.is_resumable());
    }

    #[test]
    fn test_tampered_snapshot_is_rejected() {
        let temp = TempDir::new().unwrap();
        let manager = RecoveryManager::new(temp.path(), 14);
        let state = state_at(1, PhaseName::Drafting);
        let path = manager.save(&state).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        fs::write(&path, content.replace("\"project\"", "\"other\"")).unwrap();

        assert!(matches!(
            manager.load(state.run_id),
            Err(RecoveryError::Corrupt { .. })
        ));
        assert!(manager.discover().unwrap().is_empty());
    }

    #[test]
    fn test_discover_and_delete() {
        let temp = TempDir::new().unwrap();
        let manager = RecoveryManager::new(temp.path(), 14);
        let a = state_at(1, PhaseName::Outline);
        let b = state_at(3, PhaseName::Continuity);
        manager.save(&a).unwrap();
        manager.save(&b).unwrap();

        let found = manager.discover().unwrap();
        assert_eq!(found.len(), 2);

        assert!(manager.delete(a.run_id).unwrap());
        assert!(!manager.delete(a.run_id).unwrap());
        let found = manager.discover().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].run_id, b.run_id);
        assert!(matches!(manager.load(a.run_id), Err(RecoveryError::NotFound(_))));
    }

    #[test]
    fn test_failed_run_is_not_resumable() {
        let temp = TempDir::new().unwrap();
        let manager = RecoveryManager::new(temp.path(), 0);
        let mut state = state_at(1, PhaseName::Drafting);
        state.mark_failed("writer crashed");
        manager.save(&state).unwrap();

        let found = manager.discover().unwrap();
        assert!(!found[0].resumable);
        // Retention disabled: nothing is pruned
        assert!(manager.prune_expired().unwrap().is_empty());
    }
}
